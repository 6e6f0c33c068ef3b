//! Error types for the action engine.
//!
//! Three kinds of problems show up in this crate and each has its own type:
//!
//! - **`ActionError`**: structural misuse of an [`ActionTree`](crate::action::ActionTree),
//!   such as inserting a child into a composite that is already running or
//!   creating a cycle. These are programming errors. They are returned to the
//!   caller and never turn an action into `Failed`.
//! - **`ActionFailure`**: the reason an action ended in `Failed`. A failure is
//!   either a precondition failure (nothing was ever issued to the hardware), a
//!   runtime failure reported by the device after the operation started, or the
//!   failure of a child inside a composite.
//! - **`EngineError`**: everything around the engine: configuration, workflow
//!   documents, the supervisor and I/O. `#[from]` conversions let the `?`
//!   operator lift the lower-level errors into it.
//!
//! Cancellation is not an error. An action that honoured `cancel()` ends in
//! `Cancelled` and carries no failure.

use crate::action::{ActionId, ActionState};
use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Structural misuse of an action tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("No action with id {0}")]
    UnknownAction(ActionId),

    #[error("Action {0} is not a composite action")]
    NotComposite(ActionId),

    #[error("Cannot change the children of action {id} while it is {state}")]
    StructureLocked { id: ActionId, state: ActionState },

    #[error("Action {child} already belongs to composite {parent}")]
    AlreadyParented { child: ActionId, parent: ActionId },

    #[error("Action {0} has already been started and cannot be inserted")]
    AlreadyStarted(ActionId),

    #[error("Inserting {child} into {parent} would create a cycle")]
    Cycle { parent: ActionId, child: ActionId },

    #[error("Child index {index} out of range for a composite with {len} children")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Action {0} still belongs to a composite and cannot be discarded")]
    StillParented(ActionId),
}

/// Why an action ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionFailure {
    /// The action found its target unreachable or invalid before issuing anything.
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    /// The external operation started and then reported a fault.
    #[error("{message} (code {code})")]
    Runtime { code: i32, message: String },

    /// A child of a composite failed.
    #[error("Step '{child}' failed: {reason}")]
    Child { child: String, reason: String },
}

impl ActionFailure {
    /// Build a precondition failure.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Build a runtime failure carrying a device reason code.
    pub fn runtime(code: i32, message: impl Into<String>) -> Self {
        Self::Runtime {
            code,
            message: message.into(),
        }
    }

    /// True for failures detected before any external operation was issued.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }

    /// Device reason code, if this failure carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Runtime { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Top-level error for the engine and everything built around it.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Unknown control '{0}'")]
    UnknownControl(String),

    #[error("Supervisor is busy with run {0}")]
    Busy(Uuid),

    #[error("Supervisor is no longer running")]
    SupervisorGone,

    #[error("Run {0} is not the supervisor's current run")]
    UnknownRun(Uuid),

    #[error("Failed to initialise tracing: {0}")]
    Tracing(String),
}
