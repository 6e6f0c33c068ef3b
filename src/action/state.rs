//! Action lifecycle states.
//!
//! Every action, leaf or composite, moves through the same state machine:
//!
//! ```text
//! Constructed ─► Starting ─► Running ─► Succeeded
//!                              │  ▲
//!                              ▼  │
//!                          Pausing ─► Paused ─► Resuming
//!
//! any non-terminal ─► Cancelling ─► Cancelled
//! any non-terminal ─► Failed
//! ```
//!
//! `Succeeded`, `Failed` and `Cancelled` are terminal. The ordering of the enum
//! carries no meaning beyond declaration order; use [`ActionState::can_transition_to`]
//! to reason about reachability.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionState {
    /// Built but never started. The only initial state.
    Constructed,
    /// `start()` accepted, waiting for the implementation to report it is running.
    Starting,
    /// Running normally.
    Running,
    /// `pause()` accepted, waiting for the implementation to report it is paused.
    Pausing,
    /// Paused.
    Paused,
    /// `resume()` accepted, waiting for the implementation to report it is running again.
    Resuming,
    /// `cancel()` accepted, waiting for the implementation to report it stopped.
    Cancelling,
    /// Terminal: cancelled on request.
    Cancelled,
    /// Terminal: finished successfully.
    Succeeded,
    /// Terminal: finished with a failure.
    Failed,
}

impl ActionState {
    /// All states in declaration order.
    pub const ALL: [ActionState; 10] = [
        ActionState::Constructed,
        ActionState::Starting,
        ActionState::Running,
        ActionState::Pausing,
        ActionState::Paused,
        ActionState::Resuming,
        ActionState::Cancelling,
        ActionState::Cancelled,
        ActionState::Succeeded,
        ActionState::Failed,
    ];

    /// True for `Succeeded`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Succeeded | ActionState::Failed | ActionState::Cancelled
        )
    }

    /// True once the action has been started and has not yet finished.
    pub fn is_active(self) -> bool {
        self != ActionState::Constructed && !self.is_terminal()
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ActionState) -> bool {
        use ActionState::*;

        match (self, next) {
            (Constructed, Starting) => true,
            (Starting, Running) => true,
            (Running, Pausing) => true,
            (Pausing, Paused) => true,
            (Paused, Resuming) => true,
            (Resuming, Running) => true,
            // An operation may complete while a pause request is still in flight.
            (Running | Pausing, Succeeded) => true,
            (Cancelling, Cancelled) => true,
            (from, Cancelling) => !from.is_terminal() && from != Cancelling,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Stable name used in logs and status snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionState::Constructed => "Constructed",
            ActionState::Starting => "Starting",
            ActionState::Running => "Running",
            ActionState::Pausing => "Pausing",
            ActionState::Paused => "Paused",
            ActionState::Resuming => "Resuming",
            ActionState::Cancelling => "Cancelling",
            ActionState::Cancelled => "Cancelled",
            ActionState::Succeeded => "Succeeded",
            ActionState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActionState::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = ActionState::ALL
            .iter()
            .copied()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![Cancelled, Succeeded, Failed]);
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for from in [Cancelled, Succeeded, Failed] {
            for to in ActionState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(Constructed.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(!Constructed.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Succeeded));
    }

    #[test]
    fn test_pause_cycle() {
        assert!(Running.can_transition_to(Pausing));
        assert!(Pausing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Resuming));
        assert!(Resuming.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Pausing));
    }

    #[test]
    fn test_cancel_and_fail_from_any_active_state() {
        for from in [Starting, Running, Pausing, Paused, Resuming] {
            assert!(from.can_transition_to(Cancelling), "{from} -> Cancelling");
            assert!(from.can_transition_to(Failed), "{from} -> Failed");
            assert!(!from.can_transition_to(Cancelled), "{from} -> Cancelled");
        }
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(Cancelling.can_transition_to(Failed));
        assert!(!Cancelling.can_transition_to(Cancelling));
    }
}
