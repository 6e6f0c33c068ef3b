//! Simulated motion axis.
//!
//! Moves at a constant speed on the tokio clock, so tests running with a
//! paused clock see deterministic timing. Uses `tokio::time::sleep`, never
//! `std::thread::sleep`.

use super::{
    Control, ControlError, ControlEvent, ControlListener, ControlListeners, MoveFailure,
    MoveFailureCode, SubscriptionId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

fn default_min() -> f64 {
    -100.0
}

fn default_max() -> f64 {
    100.0
}

fn default_speed() -> f64 {
    10.0
}

fn default_can_stop() -> bool {
    true
}

fn default_units() -> String {
    "mm".to_string()
}

/// Configuration of one simulated axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedControlConfig {
    /// Unique name.
    pub name: String,
    /// Initial position.
    #[serde(default)]
    pub position: f64,
    /// Lower limit.
    #[serde(default = "default_min")]
    pub min: f64,
    /// Upper limit.
    #[serde(default = "default_max")]
    pub max: f64,
    /// Speed in units per second.
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Whether a move can be interrupted.
    #[serde(default = "default_can_stop")]
    pub can_stop: bool,
    /// Engineering units.
    #[serde(default = "default_units")]
    pub units: String,
}

impl SimulatedControlConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: 0.0,
            min: default_min(),
            max: default_max(),
            speed: default_speed(),
            can_stop: default_can_stop(),
            units: default_units(),
        }
    }
}

struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
    task: Option<JoinHandle<()>>,
}

impl Motion {
    fn position_now(&self) -> f64 {
        if self.duration.is_zero() {
            return self.to;
        }
        let fraction =
            (self.started.elapsed().as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0);
        self.from + (self.to - self.from) * fraction
    }
}

struct AxisState {
    position: f64,
    connected: bool,
    enabled: bool,
    motion: Option<Motion>,
    fault: Option<MoveFailure>,
    generation: u64,
}

struct Shared {
    config: SimulatedControlConfig,
    state: Mutex<AxisState>,
    listeners: ControlListeners,
}

/// Software axis implementing [`Control`].
///
/// # Example
///
/// ```rust,no_run
/// use daq_actions::control::{Control, SimulatedControl, SimulatedControlConfig};
///
/// # async fn demo() {
/// let stage = SimulatedControl::new(SimulatedControlConfig::new("x"));
/// stage.move_to(10.0).unwrap(); // Takes ~1 second at 10 mm/s
/// # }
/// ```
#[derive(Clone)]
pub struct SimulatedControl {
    shared: Arc<Shared>,
}

impl fmt::Debug for SimulatedControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedControl")
            .field("name", &self.shared.config.name)
            .field("position", &self.current_value())
            .field("moving", &self.is_moving())
            .finish()
    }
}

impl SimulatedControl {
    pub fn new(config: SimulatedControlConfig) -> Self {
        let state = AxisState {
            position: config.position,
            connected: true,
            enabled: true,
            motion: None,
            fault: None,
            generation: 0,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                listeners: ControlListeners::new(),
            }),
        }
    }

    pub fn config(&self) -> &SimulatedControlConfig {
        &self.shared.config
    }

    /// Simulate the device going away or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.shared.state.lock().connected = connected;
    }

    /// Simulate an interlock that blocks new moves.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.state.lock().enabled = enabled;
    }

    /// Make the next move fail halfway with `failure`.
    pub fn inject_fault(&self, failure: MoveFailure) {
        self.shared.state.lock().fault = Some(failure);
    }

    pub fn is_moving(&self) -> bool {
        self.shared.state.lock().motion.is_some()
    }

    fn travel_time(&self, distance: f64) -> Duration {
        let speed = self.shared.config.speed;
        if speed <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(distance.abs() / speed)
    }
}

impl Control for SimulatedControl {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn units(&self) -> &str {
        &self.shared.config.units
    }

    fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    fn can_move(&self) -> bool {
        let state = self.shared.state.lock();
        state.connected && state.enabled && state.motion.is_none()
    }

    fn can_stop(&self) -> bool {
        self.shared.config.can_stop
    }

    fn value_out_of_range(&self, value: f64) -> bool {
        !value.is_finite() || value < self.shared.config.min || value > self.shared.config.max
    }

    fn current_value(&self) -> f64 {
        let state = self.shared.state.lock();
        state
            .motion
            .as_ref()
            .map_or(state.position, Motion::position_now)
    }

    fn move_to(&self, target: f64) -> Result<(), ControlError> {
        let name = self.shared.config.name.clone();
        if self.value_out_of_range(target) {
            return Err(ControlError::OutOfRange {
                name,
                value: target,
                min: self.shared.config.min,
                max: self.shared.config.max,
            });
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ControlError::NotReady(name.clone()))?;

        let (generation, from, duration, fault) = {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return Err(ControlError::NotConnected(name));
            }
            if !state.enabled {
                return Err(ControlError::NotReady(name));
            }
            if state.motion.is_some() {
                return Err(ControlError::AlreadyMoving(name));
            }

            state.generation += 1;
            let from = state.position;
            let duration = self.travel_time(target - from);
            state.motion = Some(Motion {
                from,
                to: target,
                started: Instant::now(),
                duration,
                task: None,
            });
            (state.generation, from, duration, state.fault.take())
        };

        info!(control = %name, from, to = target, ?duration, "moving");
        self.shared.listeners.emit(&ControlEvent::MoveStarted);

        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(async move {
            let travel = if fault.is_some() { duration / 2 } else { duration };
            tokio::time::sleep(travel).await;

            let event = {
                let mut state = shared.state.lock();
                if state.generation != generation {
                    return;
                }
                let Some(motion) = state.motion.take() else {
                    return;
                };
                match fault {
                    Some(failure) => {
                        state.position = motion.position_now();
                        ControlEvent::MoveFailed(failure)
                    }
                    None => {
                        state.position = motion.to;
                        ControlEvent::MoveSucceeded
                    }
                }
            };
            debug!(control = %shared.config.name, ?event, "move finished");
            shared.listeners.emit(&event);
        });

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        match state.motion.as_mut() {
            Some(motion) if state.generation == generation => motion.task = Some(task),
            // Already finished.
            _ => {}
        }
        Ok(())
    }

    fn stop(&self) -> bool {
        if !self.shared.config.can_stop {
            return false;
        }
        let stopped = {
            let mut state = self.shared.state.lock();
            match state.motion.take() {
                Some(motion) => {
                    if let Some(task) = &motion.task {
                        task.abort();
                    }
                    state.position = motion.position_now();
                    state.generation += 1;
                    Some(state.position)
                }
                None => None,
            }
        };

        if let Some(position) = stopped {
            info!(control = %self.shared.config.name, position, "move stopped");
            self.shared
                .listeners
                .emit(&ControlEvent::MoveFailed(MoveFailure::new(
                    MoveFailureCode::WasStopped,
                    format!("stopped at {position:.3}"),
                )));
        }
        true
    }

    fn subscribe(&self, listener: ControlListener) -> SubscriptionId {
        self.shared.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recording(control: &SimulatedControl) -> mpsc::UnboundedReceiver<ControlEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        control.subscribe(Arc::new(move |event: &ControlEvent| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_takes_distance_over_speed() {
        let stage = SimulatedControl::new(SimulatedControlConfig::new("x"));
        let mut events = recording(&stage);

        stage.move_to(10.0).unwrap();
        assert_eq!(events.recv().await, Some(ControlEvent::MoveStarted));
        assert!(!stage.can_move());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let halfway = stage.current_value();
        assert!((halfway - 5.0).abs() < 0.5, "position was {halfway}");

        assert_eq!(events.recv().await, Some(ControlEvent::MoveSucceeded));
        assert_eq!(stage.current_value(), 10.0);
        assert!(stage.can_move());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_was_stopped() {
        let stage = SimulatedControl::new(SimulatedControlConfig::new("x"));
        let mut events = recording(&stage);

        stage.move_to(50.0).unwrap();
        assert_eq!(events.recv().await, Some(ControlEvent::MoveStarted));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(stage.stop());
        match events.recv().await {
            Some(ControlEvent::MoveFailed(failure)) => {
                assert_eq!(failure.code, MoveFailureCode::WasStopped)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!stage.is_moving());
        assert!(stage.current_value() < 50.0);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_and_busy() {
        let stage = SimulatedControl::new(SimulatedControlConfig::new("x"));
        assert!(matches!(
            stage.move_to(1000.0),
            Err(ControlError::OutOfRange { .. })
        ));

        stage.move_to(20.0).unwrap();
        assert!(matches!(
            stage.move_to(30.0),
            Err(ControlError::AlreadyMoving(_))
        ));

        stage.set_connected(false);
        assert!(!stage.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_fault_fails_move() {
        let stage = SimulatedControl::new(SimulatedControlConfig::new("x"));
        let mut events = recording(&stage);
        stage.inject_fault(MoveFailure::new(MoveFailureCode::Limit, "limit switch"));

        stage.move_to(10.0).unwrap();
        assert_eq!(events.recv().await, Some(ControlEvent::MoveStarted));
        match events.recv().await {
            Some(ControlEvent::MoveFailed(failure)) => assert_eq!(failure.code, MoveFailureCode::Limit),
            other => panic!("unexpected event {other:?}"),
        }
        assert!((stage.current_value() - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_cannot_stop_when_configured() {
        let mut config = SimulatedControlConfig::new("x");
        config.can_stop = false;
        let stage = SimulatedControl::new(config);
        assert!(!stage.can_stop());
        assert!(!stage.stop());
    }
}
