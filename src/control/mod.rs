//! Controls: the settable hardware values leaf actions operate on.
//!
//! A [`Control`] is one axis, setpoint or similar quantity that can be moved
//! to a value. Moves are asynchronous: `move_to` only issues the command and
//! the control later reports [`ControlEvent::MoveStarted`] followed by either
//! [`ControlEvent::MoveSucceeded`] or [`ControlEvent::MoveFailed`] to every
//! subscribed listener.
//!
//! Listeners are plain closures (`Arc<dyn Fn(&ControlEvent) + Send + Sync>`)
//! and may be called from any thread, so they should do nothing more than
//! forward the event, usually to an action's [`Mailbox`](crate::action::Mailbox).

pub mod simulated;

pub use simulated::{SimulatedControl, SimulatedControlConfig};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why a move did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveFailureCode {
    /// Unspecified device fault.
    Other,
    /// A move was requested while another one was in progress.
    AlreadyMoving,
    /// The device did not reach the target in time.
    Timeout,
    /// The move was stopped before reaching the target.
    WasStopped,
    /// A limit switch was hit.
    Limit,
    /// Another move request replaced this one.
    Redirected,
    /// The move finished outside the requested tolerance.
    ToleranceExceeded,
}

impl MoveFailureCode {
    /// Numeric reason code carried by runtime failures.
    pub fn code(self) -> i32 {
        match self {
            Self::Other => 1,
            Self::AlreadyMoving => 2,
            Self::Timeout => 3,
            Self::WasStopped => 4,
            Self::Limit => 5,
            Self::Redirected => 6,
            Self::ToleranceExceeded => 7,
        }
    }
}

/// Failure report of a move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveFailure {
    /// Reason code.
    pub code: MoveFailureCode,
    /// Human readable explanation.
    pub message: String,
}

impl MoveFailure {
    pub fn new(code: MoveFailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for MoveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.code)
    }
}

/// Notification emitted by a control while it executes a move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    /// The device accepted the command and began moving.
    MoveStarted,
    /// The device reached its target.
    MoveSucceeded,
    /// The move ended without reaching its target.
    MoveFailed(MoveFailure),
}

/// Errors returned synchronously when a command cannot be issued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("Control '{0}' is not connected")]
    NotConnected(String),

    #[error("Control '{0}' cannot move right now")]
    NotReady(String),

    #[error("Value {value} is outside the range [{min}, {max}] of control '{name}'")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Control '{0}' is already moving")]
    AlreadyMoving(String),
}

/// Callback invoked for every event of a control.
pub type ControlListener = Arc<dyn Fn(&ControlEvent) + Send + Sync>;

/// Handle returned by [`Control::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A settable hardware value.
pub trait Control: Send + Sync + fmt::Debug {
    /// Unique name, used by workflow documents.
    fn name(&self) -> &str;

    /// Engineering units of the value.
    fn units(&self) -> &str {
        ""
    }

    /// Whether the device is reachable.
    fn is_connected(&self) -> bool;

    /// Whether a move command would be accepted now.
    fn can_move(&self) -> bool;

    /// Whether a move in progress can be interrupted.
    fn can_stop(&self) -> bool;

    /// Whether `value` lies outside the valid range.
    fn value_out_of_range(&self, value: f64) -> bool;

    /// Current value as last read from the device.
    fn current_value(&self) -> f64;

    /// Issue a move to an absolute value.
    fn move_to(&self, target: f64) -> Result<(), ControlError>;

    /// Issue a move by `delta` from the current value.
    fn move_relative(&self, delta: f64) -> Result<(), ControlError> {
        self.move_to(self.current_value() + delta)
    }

    /// Interrupt the current move. Returns false if the device could not stop.
    fn stop(&self) -> bool;

    /// Register a listener for move events.
    fn subscribe(&self, listener: ControlListener) -> SubscriptionId;

    /// Remove a listener. Returns false if it was not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Listener registry shared by control implementations.
#[derive(Default)]
pub struct ControlListeners {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, ControlListener)>>,
}

impl fmt::Debug for ControlListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlListeners")
            .field("count", &self.len())
            .finish()
    }
}

impl ControlListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: ControlListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener with `event`.
    pub fn emit(&self, event: &ControlEvent) {
        // Snapshot first so a listener may unsubscribe itself.
        let listeners: Vec<ControlListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_receive_events_until_removed() {
        let listeners = ControlListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = listeners.add(Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&ControlEvent::MoveStarted);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&ControlEvent::MoveSucceeded);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_failure_codes_are_distinct() {
        let codes = [
            MoveFailureCode::Other,
            MoveFailureCode::AlreadyMoving,
            MoveFailureCode::Timeout,
            MoveFailureCode::WasStopped,
            MoveFailureCode::Limit,
            MoveFailureCode::Redirected,
            MoveFailureCode::ToleranceExceeded,
        ];
        let mut values: Vec<i32> = codes.iter().map(|c| c.code()).collect();
        values.dedup();
        assert_eq!(values.len(), codes.len());
    }

    #[test]
    fn test_event_json_shape() {
        let event = ControlEvent::MoveFailed(MoveFailure::new(MoveFailureCode::Limit, "hit +limit"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "move_failed");
        assert_eq!(json["code"], "limit");
    }
}
