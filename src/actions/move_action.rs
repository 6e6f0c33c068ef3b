//! Move a control to a setpoint.

use crate::action::{ActionContext, LeafAction, LeafMessage, Ticker};
use crate::control::{Control, ControlEvent, MoveFailureCode, SubscriptionId};
use crate::error::ActionFailure;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How the setpoint of a [`MoveAction`] is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveMode {
    /// Move to the setpoint.
    #[default]
    Absolute,
    /// Move by the setpoint from wherever the control is at start.
    Relative,
}

struct MoveRun {
    start_value: f64,
    target: f64,
    subscription: SubscriptionId,
    started: Option<Instant>,
    ticker: Option<Ticker>,
}

/// Leaf action that moves one [`Control`] and waits for it to report back.
///
/// Preconditions are checked on start in this order: the control is
/// connected, it can move, the target is in range. A failed precondition
/// fails the action without issuing any command.
///
/// While the control moves, progress is re-estimated periodically from
/// `(current - start) / (target - start)` and the expected duration is
/// extrapolated from the time spent so far. Moves cannot be paused.
///
/// # Example
///
/// ```rust,no_run
/// use daq_actions::action::{ActionInfo, ActionTree};
/// use daq_actions::actions::{MoveAction, MoveMode};
/// use daq_actions::control::{SimulatedControl, SimulatedControlConfig};
/// use std::sync::Arc;
///
/// let stage = Arc::new(SimulatedControl::new(SimulatedControlConfig::new("x")));
/// let mut tree = ActionTree::new();
/// let id = tree.add_leaf(
///     ActionInfo::new("Move x to 10 mm"),
///     MoveAction::new(stage, 10.0, MoveMode::Absolute),
/// );
/// tree.start(id);
/// ```
pub struct MoveAction {
    control: Arc<dyn Control>,
    setpoint: f64,
    mode: MoveMode,
    tolerance: Option<f64>,
    progress_interval: Option<Duration>,
    run: Option<MoveRun>,
}

impl fmt::Debug for MoveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoveAction")
            .field("control", &self.control.name())
            .field("setpoint", &self.setpoint)
            .field("mode", &self.mode)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl MoveAction {
    /// Move `control` to `setpoint`, interpreted according to `mode`.
    pub fn new(control: Arc<dyn Control>, setpoint: f64, mode: MoveMode) -> Self {
        Self {
            control,
            setpoint,
            mode,
            tolerance: None,
            progress_interval: None,
            run: None,
        }
    }

    /// Fail with `ToleranceExceeded` if the final value is further than `tolerance` from the target.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance.abs());
        self
    }

    /// Override the tree's progress re-estimation period.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// The driven control.
    pub fn control(&self) -> &Arc<dyn Control> {
        &self.control
    }

    /// Setpoint as configured.
    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// How the setpoint is interpreted.
    pub fn mode(&self) -> MoveMode {
        self.mode
    }

    /// Absolute target of the running move.
    pub fn target(&self) -> Option<f64> {
        self.run.as_ref().map(|r| r.target)
    }

    fn check_preconditions(&self) -> Result<f64, String> {
        let name = self.control.name();
        if !self.control.is_connected() {
            return Err(format!("control '{name}' is not connected"));
        }
        if !self.control.can_move() {
            return Err(format!("control '{name}' cannot move right now"));
        }
        let target = match self.mode {
            MoveMode::Absolute => self.setpoint,
            MoveMode::Relative => self.control.current_value() + self.setpoint,
        };
        if self.control.value_out_of_range(target) {
            return Err(format!("target {target} is out of range for control '{name}'"));
        }
        Ok(target)
    }

    /// Stop listening and stop re-estimating progress.
    fn finish(&mut self) {
        if let Some(run) = self.run.take() {
            self.control.unsubscribe(run.subscription);
        }
    }

    fn on_started(&mut self, ctx: &mut ActionContext<'_>) {
        let interval = self.progress_interval.unwrap_or_else(|| ctx.progress_interval());
        if let Some(run) = self.run.as_mut() {
            if run.started.is_none() {
                run.started = Some(Instant::now());
                run.ticker = ctx.mailbox().start_ticker(interval);
            }
        }
        if ctx.set_started() {
            debug!(action = %ctx.id(), control = %self.control.name(), "move started");
        }
        self.update_progress(ctx);
    }

    fn update_progress(&self, ctx: &mut ActionContext<'_>) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        let current = self.control.current_value();
        ctx.set_status_text(format!(
            "{} at {:.3}{} (target {:.3})",
            self.control.name(),
            current,
            units_suffix(self.control.units()),
            run.target
        ));

        let Some(started) = run.started else {
            return;
        };
        let elapsed = started.elapsed().as_secs_f64();
        let span = run.target - run.start_value;
        let fraction = if span.abs() <= f64::EPSILON {
            1.0
        } else {
            ((current - run.start_value) / span).clamp(0.0, 1.0)
        };

        if fraction > 0.0 {
            let total = elapsed / fraction;
            ctx.set_expected_duration(Some(Duration::from_secs_f64(total)));
            ctx.set_progress(elapsed, total);
        } else if let Some(expected) = ctx.info().expected_duration() {
            ctx.set_progress(elapsed, expected.as_secs_f64().max(elapsed));
        } else {
            ctx.set_progress(0.0, 0.0);
        }
    }

    fn on_succeeded(&mut self, ctx: &mut ActionContext<'_>) {
        let target = self.target();
        self.finish();
        ctx.set_started();

        let final_value = self.control.current_value();
        if let (Some(tolerance), Some(target)) = (self.tolerance, target) {
            if (final_value - target).abs() > tolerance {
                ctx.set_failed(ActionFailure::runtime(
                    MoveFailureCode::ToleranceExceeded.code(),
                    format!(
                        "{} stopped at {final_value:.3}, more than {tolerance} from {target:.3}",
                        self.control.name()
                    ),
                ));
                return;
            }
        }
        ctx.set_progress(100.0, 100.0);
        ctx.set_status_text(format!(
            "{} at {final_value:.3}{}",
            self.control.name(),
            units_suffix(self.control.units())
        ));
        ctx.set_succeeded();
    }
}

fn units_suffix(units: &str) -> String {
    if units.is_empty() {
        String::new()
    } else {
        format!(" {units}")
    }
}

impl LeafAction for MoveAction {
    fn start_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        let target = match self.check_preconditions() {
            Ok(target) => target,
            Err(message) => {
                ctx.set_failed(ActionFailure::precondition(message));
                return;
            }
        };

        let mailbox = ctx.mailbox();
        let subscription = self.control.subscribe(Arc::new(move |event: &ControlEvent| {
            mailbox.post(LeafMessage::Control(event.clone()));
        }));
        self.run = Some(MoveRun {
            start_value: self.control.current_value(),
            target,
            subscription,
            started: None,
            ticker: None,
        });
        self.update_progress(ctx);

        let issued = match self.mode {
            MoveMode::Absolute => self.control.move_to(target),
            MoveMode::Relative => self.control.move_relative(self.setpoint),
        };
        if let Err(e) = issued {
            self.finish();
            ctx.set_failed(ActionFailure::runtime(MoveFailureCode::Other.code(), e.to_string()));
        }
    }

    fn cancel_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        let moving = self.run.as_ref().is_some_and(|r| r.started.is_some());
        if moving && !(self.control.can_stop() && self.control.stop()) {
            warn!(
                action = %ctx.id(),
                control = %self.control.name(),
                "control could not stop; cancelling anyway"
            );
        }
        self.finish();
        ctx.set_cancelled();
    }

    fn handle_message(&mut self, ctx: &mut ActionContext<'_>, message: LeafMessage) {
        if self.run.is_none() {
            return;
        }
        match message {
            LeafMessage::Control(ControlEvent::MoveStarted) => self.on_started(ctx),
            LeafMessage::Control(ControlEvent::MoveSucceeded) => self.on_succeeded(ctx),
            LeafMessage::Control(ControlEvent::MoveFailed(failure)) => {
                self.finish();
                ctx.set_failed(ActionFailure::runtime(failure.code.code(), failure.message));
            }
            LeafMessage::Tick => self.update_progress(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionInfo, ActionState, ActionTree, Progress};
    use crate::testing::ManualControl;
    use tracing_test::traced_test;

    fn setup(setpoint: f64, mode: MoveMode) -> (ActionTree, crate::action::ActionId, Arc<ManualControl>) {
        let control = Arc::new(ManualControl::new("x", -10.0, 10.0));
        let mut tree = ActionTree::new();
        let id = tree.add_leaf(
            ActionInfo::new("move x"),
            MoveAction::new(control.clone(), setpoint, mode),
        );
        (tree, id, control)
    }

    #[test]
    fn test_out_of_range_target_fails_before_moving() {
        let (mut tree, id, control) = setup(25.0, MoveMode::Absolute);

        assert!(tree.start(id));
        assert_eq!(tree.state(id), Some(ActionState::Failed));
        assert!(tree.failure(id).is_some_and(ActionFailure::is_precondition));
        assert!(control.moves().is_empty());
        assert_eq!(control.listener_count(), 0);
    }

    #[test]
    fn test_disconnected_control_fails_precondition() {
        let (mut tree, id, control) = setup(1.0, MoveMode::Absolute);
        control.set_connected(false);

        tree.start(id);
        let failure = tree.failure(id).cloned();
        assert!(matches!(failure, Some(ActionFailure::Precondition { ref message }) if message.contains("not connected")));
    }

    #[test]
    fn test_successful_move() {
        let (mut tree, id, control) = setup(5.0, MoveMode::Absolute);

        tree.start(id);
        assert_eq!(tree.state(id), Some(ActionState::Starting));
        assert_eq!(control.moves(), vec![5.0]);

        control.emit_started();
        tree.process_pending();
        assert_eq!(tree.state(id), Some(ActionState::Running));

        control.emit_succeeded(5.0);
        tree.process_pending();
        assert_eq!(tree.state(id), Some(ActionState::Succeeded));
        assert_eq!(tree.progress(id), Some(Progress::new(100.0, 100.0)));
        assert_eq!(control.listener_count(), 0);
    }

    #[test]
    fn test_relative_move_targets_offset() {
        let (mut tree, id, control) = setup(2.0, MoveMode::Relative);
        control.set_value(5.0);

        tree.start(id);
        assert_eq!(control.moves(), vec![7.0]);
    }

    #[test]
    fn test_device_failure_carries_reason_code() {
        let (mut tree, id, control) = setup(5.0, MoveMode::Absolute);

        tree.start(id);
        control.emit_started();
        control.emit_failed(MoveFailureCode::Limit, "limit switch");
        tree.process_pending();

        assert_eq!(tree.state(id), Some(ActionState::Failed));
        assert_eq!(
            tree.failure(id).and_then(ActionFailure::code),
            Some(MoveFailureCode::Limit.code())
        );
    }

    #[test]
    fn test_tolerance_exceeded() {
        let control = Arc::new(ManualControl::new("x", -10.0, 10.0));
        let mut tree = ActionTree::new();
        let id = tree.add_leaf(
            ActionInfo::new("move x"),
            MoveAction::new(control.clone(), 5.0, MoveMode::Absolute).with_tolerance(0.1),
        );

        tree.start(id);
        control.emit_started();
        control.emit_succeeded(4.5);
        tree.process_pending();

        assert_eq!(
            tree.failure(id).and_then(ActionFailure::code),
            Some(MoveFailureCode::ToleranceExceeded.code())
        );
    }

    #[test]
    fn test_cancel_before_device_started() {
        let (mut tree, id, control) = setup(5.0, MoveMode::Absolute);

        tree.start(id);
        assert!(tree.cancel(id));
        assert_eq!(tree.state(id), Some(ActionState::Cancelled));
        assert_eq!(control.stop_count(), 0);
    }

    #[traced_test]
    #[test]
    fn test_cancel_completes_when_stop_fails() {
        let (mut tree, id, control) = setup(5.0, MoveMode::Absolute);
        control.set_stoppable(false);

        tree.start(id);
        control.emit_started();
        tree.process_pending();

        assert!(tree.cancel(id));
        assert_eq!(tree.state(id), Some(ActionState::Cancelled));
        assert!(logs_contain("control could not stop"));

        // Late report from the device is ignored.
        control.emit_succeeded(5.0);
        tree.process_pending();
        assert_eq!(tree.state(id), Some(ActionState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_extrapolates_duration() {
        let (mut tree, id, control) = setup(10.0, MoveMode::Absolute);

        tree.start(id);
        control.emit_started();
        tree.process_pending();

        tokio::time::advance(Duration::from_secs(1)).await;
        control.set_value(2.5);
        tree.post(id, LeafMessage::Tick);
        tree.process_pending();

        let progress = tree.progress(id).unwrap();
        assert!((progress.fraction().unwrap() - 0.25).abs() < 1e-6);
        let expected = tree.info(id).and_then(|i| i.expected_duration()).unwrap();
        assert!((expected.as_secs_f64() - 4.0).abs() < 1e-3);
        assert_eq!(tree.status_text(id), Some("x at 2.500 (target 10.000)"));
    }
}
