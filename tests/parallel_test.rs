//! Parallel composites: fan-out, aggregation of outcomes, cancellation.

mod common;

use common::{composite_of, drain, states_of};
use daq_actions::action::{ActionInfo, ActionState, ActionTree, ExecutionMode, Progress};
use daq_actions::error::ActionFailure;
use daq_actions::testing::{self, CallLog, ScriptedAction};

#[test]
fn test_every_child_starts_before_any_completes() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let mut events = tree.subscribe();
    let (root, children) = composite_of(
        &mut tree,
        ExecutionMode::Parallel,
        &["x", "y", "z"],
        &calls,
        ScriptedAction::deferred,
    );

    tree.start(root);
    assert_eq!(calls.entries(), vec!["start:x", "start:y", "start:z"]);
    for &child in &children {
        assert_eq!(tree.state(child), Some(ActionState::Starting));
    }

    testing::confirm_start(&mut tree, children[2]);
    testing::succeed(&mut tree, children[2]);
    assert_eq!(tree.state(root), Some(ActionState::Starting));
    testing::succeed(&mut tree, children[0]);
    testing::succeed(&mut tree, children[1]);

    assert_eq!(tree.state(root), Some(ActionState::Succeeded));
    assert_eq!(calls.count("start"), 3);
    assert_eq!(
        states_of(&drain(&mut events), root),
        vec![ActionState::Starting, ActionState::Running, ActionState::Succeeded]
    );
}

#[test]
fn test_failure_waits_for_siblings() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let (root, children) = composite_of(
        &mut tree,
        ExecutionMode::Parallel,
        &["x", "y"],
        &calls,
        |leaf| leaf,
    );

    tree.start(root);
    testing::fail(&mut tree, children[0], "interlock open");
    assert_eq!(tree.state(root), Some(ActionState::Running));
    assert_eq!(tree.state(children[1]), Some(ActionState::Running));
    assert_eq!(calls.count("cancel"), 0, "siblings keep running");

    testing::succeed(&mut tree, children[1]);
    assert_eq!(tree.state(root), Some(ActionState::Failed));
    match tree.failure(root) {
        Some(ActionFailure::Child { child, reason }) => {
            assert_eq!(child, "x");
            assert!(reason.contains("interlock open"));
        }
        other => panic!("unexpected failure {other:?}"),
    }
}

#[test]
fn test_failure_outranks_cancellation() {
    for fail_first in [true, false] {
        let calls = CallLog::default();
        let mut tree = ActionTree::new();
        let (root, children) = composite_of(
            &mut tree,
            ExecutionMode::Parallel,
            &["x", "y"],
            &calls,
            |leaf| leaf,
        );
        tree.start(root);

        if fail_first {
            testing::fail(&mut tree, children[0], "lost sync");
            tree.cancel(children[1]);
        } else {
            tree.cancel(children[1]);
            testing::fail(&mut tree, children[0], "lost sync");
        }

        assert_eq!(tree.state(children[1]), Some(ActionState::Cancelled));
        assert_eq!(
            tree.state(root),
            Some(ActionState::Failed),
            "fail_first = {fail_first}"
        );
    }
}

#[test]
fn test_cancelled_child_without_failure_cancels_group() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let (root, children) = composite_of(
        &mut tree,
        ExecutionMode::Parallel,
        &["x", "y"],
        &calls,
        |leaf| leaf,
    );

    tree.start(root);
    tree.cancel(children[0]);
    assert_eq!(tree.state(root), Some(ActionState::Running));
    testing::succeed(&mut tree, children[1]);
    assert_eq!(tree.state(root), Some(ActionState::Cancelled));
}

#[test]
fn test_cancel_reaches_every_active_child() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let (root, children) = composite_of(
        &mut tree,
        ExecutionMode::Parallel,
        &["x", "y", "z"],
        &calls,
        ScriptedAction::deferred_cancel,
    );

    tree.start(root);
    testing::succeed(&mut tree, children[1]);
    assert!(tree.cancel(root));
    assert_eq!(calls.count("cancel"), 2, "finished child is left alone");

    testing::confirm_cancel(&mut tree, children[0]);
    assert_eq!(tree.state(root), Some(ActionState::Cancelling));
    testing::confirm_cancel(&mut tree, children[2]);
    assert_eq!(tree.state(root), Some(ActionState::Cancelled));
}

#[test]
fn test_cancel_of_nested_tree_terminates() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let root = tree.add_composite(ActionInfo::new("root"), ExecutionMode::Sequential);
    let (group, children) = composite_of(
        &mut tree,
        ExecutionMode::Parallel,
        &["x", "y"],
        &calls,
        ScriptedAction::deferred_cancel,
    );
    let after = tree.add_leaf(ActionInfo::new("after"), ScriptedAction::new("after", calls.clone()));
    tree.add_child(root, group).unwrap();
    tree.add_child(root, after).unwrap();

    tree.start(root);
    assert_eq!(tree.state(root), Some(ActionState::Running));
    assert!(tree.cancel(root));
    assert_eq!(tree.state(group), Some(ActionState::Cancelling));

    // One child reports an error while stopping instead of acknowledging.
    testing::fail(&mut tree, children[0], "stop timed out");
    testing::confirm_cancel(&mut tree, children[1]);

    assert_eq!(tree.state(group), Some(ActionState::Failed));
    let state = tree.state(root).unwrap();
    assert!(state.is_terminal(), "{state}");
    assert_eq!(state, ActionState::Failed);
    assert_eq!(tree.state(after), Some(ActionState::Constructed));
}

#[test]
fn test_pause_when_every_child_can_pause() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let (root, children) = composite_of(
        &mut tree,
        ExecutionMode::Parallel,
        &["x", "y"],
        &calls,
        ScriptedAction::pausable,
    );

    tree.start(root);
    assert!(tree.can_pause(root));
    assert!(tree.pause(root));
    assert_eq!(tree.state(root), Some(ActionState::Paused));
    assert!(children
        .iter()
        .all(|&c| tree.state(c) == Some(ActionState::Paused)));

    assert!(tree.resume(root));
    assert_eq!(tree.state(root), Some(ActionState::Running));
    assert_eq!(calls.count("resume"), 2);
}

#[test]
fn test_pause_rejected_when_a_child_cannot_pause() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let root = tree.add_composite(ActionInfo::new("root"), ExecutionMode::Parallel);
    let x = tree.add_leaf(
        ActionInfo::new("x"),
        ScriptedAction::new("x", calls.clone()).pausable(),
    );
    let y = tree.add_leaf(ActionInfo::new("y"), ScriptedAction::new("y", calls.clone()));
    tree.add_child(root, x).unwrap();
    tree.add_child(root, y).unwrap();

    tree.start(root);
    assert!(!tree.can_pause(root));
    assert!(!tree.pause(root));
    assert_eq!(tree.state(root), Some(ActionState::Running));
    assert_eq!(calls.count("pause"), 0);
}

#[test]
fn test_progress_averages_children() {
    let calls = CallLog::default();
    let mut tree = ActionTree::new();
    let root = tree.add_composite(ActionInfo::new("root"), ExecutionMode::Parallel);
    let mut cells = Vec::new();
    for name in ["x", "y"] {
        let leaf = ScriptedAction::new(name, calls.clone());
        let cell = leaf.progress_cell();
        let id = tree.add_leaf(ActionInfo::new(name), leaf);
        tree.add_child(root, id).unwrap();
        cells.push((id, cell));
    }

    tree.start(root);
    testing::report_progress(&mut tree, cells[0].0, &cells[0].1, 2.0, 4.0);
    testing::report_progress(&mut tree, cells[1].0, &cells[1].1, 1.0, 4.0);
    assert_eq!(tree.progress(root), Some(Progress::new(0.75, 2.0)));

    testing::succeed(&mut tree, cells[0].0);
    assert_eq!(tree.progress(root), Some(Progress::new(1.25, 2.0)));
}
