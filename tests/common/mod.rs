//! Shared helpers for daq-actions integration tests
//!
//! - building composites out of scripted leaves
//! - driving a tree's mailbox until its root finishes
//! - draining broadcast event receivers

#![allow(dead_code)] // Not every test file uses every helper

use daq_actions::action::{
    ActionEvent, ActionId, ActionInfo, ActionState, ActionTree, ExecutionMode,
};
use daq_actions::testing::{CallLog, ScriptedAction};
use tokio::sync::broadcast;

/// Add a composite with one scripted leaf per name, in order.
///
/// `configure` can adjust each leaf before it is added.
pub fn composite_of(
    tree: &mut ActionTree,
    mode: ExecutionMode,
    names: &[&str],
    calls: &CallLog,
    configure: impl Fn(ScriptedAction) -> ScriptedAction,
) -> (ActionId, Vec<ActionId>) {
    let root = tree.add_composite(ActionInfo::new(format!("{} root", mode.as_str())), mode);
    let children = names
        .iter()
        .map(|name| {
            let leaf = configure(ScriptedAction::new(*name, calls.clone()));
            let id = tree.add_leaf(ActionInfo::new(*name), leaf);
            tree.add_child(root, id).expect("fresh child attaches");
            id
        })
        .collect();
    (root, children)
}

/// True once `id` reached a terminal state (or does not exist).
pub fn is_finished(tree: &ActionTree, id: ActionId) -> bool {
    tree.state(id).map_or(true, ActionState::is_terminal)
}

/// Dispatch mailbox messages until `root` finishes.
///
/// Only use with trees that keep a timer or device task alive, otherwise the
/// mailbox never yields.
pub async fn drive(tree: &mut ActionTree, root: ActionId) {
    while !is_finished(tree, root) {
        let Some(envelope) = tree.next_envelope().await else {
            break;
        };
        tree.dispatch(envelope);
    }
}

/// Everything currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<ActionEvent>) -> Vec<ActionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// State changes of `id` in `events`, in order.
pub fn states_of(events: &[ActionEvent], id: ActionId) -> Vec<ActionState> {
    events
        .iter()
        .filter(|e| e.id == id)
        .filter_map(ActionEvent::new_state)
        .collect()
}
