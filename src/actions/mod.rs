//! Concrete leaf actions.

pub mod move_action;
pub mod wait;

pub use move_action::{MoveAction, MoveMode};
pub use wait::WaitAction;
