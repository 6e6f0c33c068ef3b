//! Composable action trees for automating instrument procedures.
//!
//! An [`ActionTree`] owns a set of actions. Leaves ([`LeafAction`]) talk to
//! hardware through a [`Control`](control::Control); composites run their
//! children one after another or all at once. Every action follows the same
//! [`ActionState`] machine and reports progress, status text and a failure
//! reason while it runs.
//!
//! ```
//! use daq_actions::prelude::*;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let mut tree = ActionTree::new();
//! let root = tree.add_composite(ActionInfo::new("Settle twice"), ExecutionMode::Sequential);
//! for step in ["first", "second"] {
//!     let wait = tree.add_leaf(
//!         ActionInfo::new(format!("Wait ({step})")),
//!         WaitAction::new(Duration::from_millis(100)),
//!     );
//!     tree.add_child(root, wait).ok();
//! }
//!
//! tree.start(root);
//! while !tree.state(root).is_some_and(|s| s.is_terminal()) {
//!     let Some(envelope) = tree.next_envelope().await else { break };
//!     tree.dispatch(envelope);
//! }
//! assert_eq!(tree.state(root), Some(ActionState::Succeeded));
//! # });
//! ```
//!
//! For long-lived processes, hand trees to a [`Supervisor`](supervisor::Supervisor)
//! which drives them on its own task.

pub mod action;
pub mod action_log;
pub mod actions;
pub mod config;
pub mod control;
pub mod error;
pub mod supervisor;
pub mod testing;
pub mod tracing_setup;
pub mod workflow;

pub use action::{
    ActionContext, ActionEvent, ActionEventKind, ActionId, ActionInfo, ActionSnapshot, ActionState,
    ActionTree, ExecutionMode, LeafAction, LeafMessage, Progress,
};
pub use error::{ActionError, ActionFailure, EngineError, EngineResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::action::{
        ActionContext, ActionEvent, ActionId, ActionInfo, ActionState, ActionTree, ExecutionMode,
        LeafAction, LeafMessage, Progress,
    };
    pub use crate::action_log::{ActionLog, CompletedAction};
    pub use crate::actions::{MoveAction, MoveMode, WaitAction};
    pub use crate::control::{Control, ControlEvent, SimulatedControl};
    pub use crate::error::{ActionFailure, EngineError, EngineResult};
    pub use crate::supervisor::{Supervisor, SupervisorHandle};
}
