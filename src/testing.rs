//! Test doubles for action trees.
//!
//! [`ScriptedAction`] is a leaf whose behaviour is chosen up front and that is
//! driven by the same [`LeafMessage`]s real leaves receive. [`ManualControl`]
//! is a [`Control`] whose events are fired by the test instead of a device.
//! The free functions post a message and process it, so a test can drive a
//! tree one step at a time without a timer.

use crate::action::{ActionContext, ActionId, ActionTree, LeafAction, LeafMessage};
use crate::control::{
    Control, ControlError, ControlEvent, ControlListener, ControlListeners, MoveFailure,
    MoveFailureCode, SubscriptionId,
};
use crate::error::ActionFailure;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared record of implementation calls, e.g. `"start:a"`.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Number of entries starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Progress a [`ScriptedAction`] reports on its next tick.
#[derive(Debug, Clone, Default)]
pub struct ProgressCell(Arc<Mutex<Option<(f64, f64)>>>);

impl ProgressCell {
    pub fn set(&self, numerator: f64, denominator: f64) {
        *self.0.lock() = Some((numerator, denominator));
    }

    fn get(&self) -> Option<(f64, f64)> {
        *self.0.lock()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StartBehavior {
    Immediate,
    Deferred,
    FailPrecondition(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelBehavior {
    Immediate,
    Deferred,
    Ignore,
}

/// Leaf with scripted behaviour.
///
/// - `MoveStarted` confirms a deferred start.
/// - `MoveSucceeded` succeeds (confirming the start first if needed).
/// - `MoveFailed` with `WasStopped` confirms a deferred cancel; any other
///   failure fails the action.
/// - `Tick` reports the value stored in the [`ProgressCell`].
#[derive(Debug)]
pub struct ScriptedAction {
    name: String,
    calls: CallLog,
    start: StartBehavior,
    cancel: CancelBehavior,
    pausable: bool,
    progress: ProgressCell,
}

impl ScriptedAction {
    /// Starts immediately, cancels immediately, cannot pause.
    pub fn new(name: impl Into<String>, calls: CallLog) -> Self {
        Self {
            name: name.into(),
            calls,
            start: StartBehavior::Immediate,
            cancel: CancelBehavior::Immediate,
            pausable: false,
            progress: ProgressCell::default(),
        }
    }

    /// Stay in `Starting` until `MoveStarted` arrives.
    pub fn deferred(mut self) -> Self {
        self.start = StartBehavior::Deferred;
        self
    }

    /// Fail the precondition check on start.
    pub fn failing_precondition(mut self, message: impl Into<String>) -> Self {
        self.start = StartBehavior::FailPrecondition(message.into());
        self
    }

    /// Stay in `Cancelling` until a `WasStopped` failure arrives.
    pub fn deferred_cancel(mut self) -> Self {
        self.cancel = CancelBehavior::Deferred;
        self
    }

    /// Never acknowledge a cancel request.
    pub fn ignoring_cancel(mut self) -> Self {
        self.cancel = CancelBehavior::Ignore;
        self
    }

    /// Allow pause and resume; both complete immediately.
    pub fn pausable(mut self) -> Self {
        self.pausable = true;
        self
    }

    /// Cell whose value is reported on the next tick.
    pub fn progress_cell(&self) -> ProgressCell {
        self.progress.clone()
    }

    fn record(&self, call: &str) {
        self.calls.push(format!("{call}:{}", self.name));
    }

    fn started(ctx: &mut ActionContext<'_>) {
        ctx.set_started();
        ctx.set_status_text("running");
    }
}

impl LeafAction for ScriptedAction {
    fn start_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.record("start");
        match &self.start {
            StartBehavior::Immediate => Self::started(ctx),
            StartBehavior::Deferred => ctx.set_status_text("waiting"),
            StartBehavior::FailPrecondition(message) => {
                ctx.set_failed(ActionFailure::precondition(message.clone()));
            }
        }
    }

    fn cancel_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.record("cancel");
        if self.cancel == CancelBehavior::Immediate {
            ctx.set_cancelled();
        }
    }

    fn can_pause(&self) -> bool {
        self.pausable
    }

    fn pause_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.record("pause");
        ctx.set_paused();
    }

    fn resume_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.record("resume");
        ctx.set_resumed();
    }

    fn handle_message(&mut self, ctx: &mut ActionContext<'_>, message: LeafMessage) {
        match message {
            LeafMessage::Control(ControlEvent::MoveStarted) => Self::started(ctx),
            LeafMessage::Control(ControlEvent::MoveSucceeded) => {
                Self::started(ctx);
                ctx.set_succeeded();
            }
            LeafMessage::Control(ControlEvent::MoveFailed(failure)) => {
                let acknowledged = failure.code == MoveFailureCode::WasStopped
                    && self.cancel == CancelBehavior::Deferred;
                if acknowledged && ctx.set_cancelled() {
                    return;
                }
                ctx.set_failed(ActionFailure::runtime(failure.code.code(), failure.message));
            }
            LeafMessage::Tick => {
                if let Some((numerator, denominator)) = self.progress.get() {
                    ctx.set_progress(numerator, denominator);
                }
            }
        }
    }
}

fn deliver(tree: &mut ActionTree, id: ActionId, message: LeafMessage) {
    tree.post(id, message);
    tree.process_pending();
}

/// Confirm a deferred start.
pub fn confirm_start(tree: &mut ActionTree, id: ActionId) {
    deliver(tree, id, LeafMessage::Control(ControlEvent::MoveStarted));
}

/// Report success.
pub fn succeed(tree: &mut ActionTree, id: ActionId) {
    deliver(tree, id, LeafMessage::Control(ControlEvent::MoveSucceeded));
}

/// Report a runtime failure.
pub fn fail(tree: &mut ActionTree, id: ActionId, message: &str) {
    let failure = MoveFailure::new(MoveFailureCode::Other, message);
    deliver(tree, id, LeafMessage::Control(ControlEvent::MoveFailed(failure)));
}

/// Acknowledge a deferred cancel.
pub fn confirm_cancel(tree: &mut ActionTree, id: ActionId) {
    let failure = MoveFailure::new(MoveFailureCode::WasStopped, "stopped");
    deliver(tree, id, LeafMessage::Control(ControlEvent::MoveFailed(failure)));
}

/// Store a progress value and report it.
pub fn report_progress(
    tree: &mut ActionTree,
    id: ActionId,
    cell: &ProgressCell,
    numerator: f64,
    denominator: f64,
) {
    cell.set(numerator, denominator);
    deliver(tree, id, LeafMessage::Tick);
}

/// Control whose move events are fired by the test.
#[derive(Debug)]
pub struct ManualControl {
    name: String,
    min: f64,
    max: f64,
    value: Mutex<f64>,
    connected: AtomicBool,
    ready: AtomicBool,
    stoppable: AtomicBool,
    moves: Mutex<Vec<f64>>,
    stops: AtomicUsize,
    listeners: ControlListeners,
}

impl ManualControl {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            value: Mutex::new(0.0),
            connected: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            stoppable: AtomicBool::new(true),
            moves: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            listeners: ControlListeners::new(),
        }
    }

    pub fn set_value(&self, value: f64) {
        *self.value.lock() = value;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_stoppable(&self, stoppable: bool) {
        self.stoppable.store(stoppable, Ordering::SeqCst);
    }

    /// Targets of every accepted move command.
    pub fn moves(&self) -> Vec<f64> {
        self.moves.lock().clone()
    }

    /// Number of `stop()` calls.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn emit(&self, event: ControlEvent) {
        self.listeners.emit(&event);
    }

    pub fn emit_started(&self) {
        self.emit(ControlEvent::MoveStarted);
    }

    /// Jump to `value` and report success.
    pub fn emit_succeeded(&self, value: f64) {
        self.set_value(value);
        self.emit(ControlEvent::MoveSucceeded);
    }

    pub fn emit_failed(&self, code: MoveFailureCode, message: &str) {
        self.emit(ControlEvent::MoveFailed(MoveFailure::new(code, message)));
    }
}

impl Control for ManualControl {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn can_move(&self) -> bool {
        self.is_connected() && self.ready.load(Ordering::SeqCst)
    }

    fn can_stop(&self) -> bool {
        self.stoppable.load(Ordering::SeqCst)
    }

    fn value_out_of_range(&self, value: f64) -> bool {
        value < self.min || value > self.max
    }

    fn current_value(&self) -> f64 {
        *self.value.lock()
    }

    fn move_to(&self, target: f64) -> Result<(), ControlError> {
        if !self.is_connected() {
            return Err(ControlError::NotConnected(self.name.clone()));
        }
        self.moves.lock().push(target);
        Ok(())
    }

    fn stop(&self) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.can_stop()
    }

    fn subscribe(&self, listener: ControlListener) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }
}
