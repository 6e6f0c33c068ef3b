//! Actions: the units of work of an instrument workflow.
//!
//! Every action moves through the same [`ActionState`] machine. Leaf actions
//! ([`LeafAction`]) drive one external operation; composite actions
//! ([`CompositeAction`]) run child actions sequentially or in parallel and
//! derive their own state from them. All actions of one tree live in an
//! [`ActionTree`], which also delivers their notifications.

mod composite;
mod context;
mod core;
mod event;
mod info;
mod leaf;
mod progress;
mod state;
mod tree;

pub use self::core::ActionId;
pub use composite::{CompositeAction, ExecutionMode};
pub use context::{ActionContext, Envelope, LeafMessage, Mailbox, Ticker};
pub use event::{ActionEvent, ActionEventKind};
pub use info::{ActionInfo, NO_EXPECTED_DURATION};
pub use leaf::LeafAction;
pub use progress::Progress;
pub use state::ActionState;
pub use tree::{
    ActionSnapshot, ActionTree, TreeSettings, DEFAULT_EVENT_CAPACITY, DEFAULT_PROGRESS_INTERVAL,
};
