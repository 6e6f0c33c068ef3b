//! Notifications published by actions.

use super::{ActionId, ActionState, Progress};
use serde::{Deserialize, Serialize};

/// What changed on an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionEventKind {
    /// The action moved from `old` to `new`.
    StateChanged {
        /// Previous state.
        old: ActionState,
        /// New state.
        new: ActionState,
    },
    /// New progress value.
    ProgressChanged {
        /// Current progress.
        progress: Progress,
    },
    /// New status text.
    StatusTextChanged {
        /// Current status text.
        text: String,
    },
}

/// A notification about one action of a tree.
///
/// Events are delivered in the order the changes happened. External observers
/// receive them through [`ActionTree::subscribe`](super::ActionTree::subscribe);
/// the attached parent composite receives the same sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    /// The action that changed.
    pub id: ActionId,
    /// What changed.
    pub kind: ActionEventKind,
}

impl ActionEvent {
    pub(crate) fn state(id: ActionId, old: ActionState, new: ActionState) -> Self {
        Self {
            id,
            kind: ActionEventKind::StateChanged { old, new },
        }
    }

    pub(crate) fn progress(id: ActionId, progress: Progress) -> Self {
        Self {
            id,
            kind: ActionEventKind::ProgressChanged { progress },
        }
    }

    pub(crate) fn status(id: ActionId, text: String) -> Self {
        Self {
            id,
            kind: ActionEventKind::StatusTextChanged { text },
        }
    }

    /// The new state, if this is a state change.
    pub fn new_state(&self) -> Option<ActionState> {
        match self.kind {
            ActionEventKind::StateChanged { new, .. } => Some(new),
            _ => None,
        }
    }
}
