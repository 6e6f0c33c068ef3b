//! Composite actions: ordered children run one after another or all at once.
//!
//! A composite never talks to hardware. It translates requests into requests
//! on its children and derives its own state, progress and status text from
//! the notifications its attached children publish.
//!
//! # Sequential
//!
//! Children run in insertion order; at most one is attached at a time. The
//! composite is `Running` as soon as the first child is. A pause request
//! pauses the current child when that child can pause, otherwise the pause
//! takes effect between two children. Any child failure fails the composite
//! and later children never start.
//!
//! # Parallel
//!
//! Every child is started in insertion order. The composite becomes `Running`
//! once all children are running (or already finished), `Paused` once all are
//! paused (or finished), and ends when the last child ends: `Failed` if any
//! child failed, `Cancelled` if any was cancelled, `Succeeded` otherwise. A
//! failing child does not stop its siblings.

use super::tree::ActionTree;
use super::{ActionId, ActionState, Progress};
use crate::error::ActionFailure;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How a composite runs its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One child at a time, in order.
    Sequential,
    /// All children at once.
    Parallel,
}

impl ExecutionMode {
    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

/// Bookkeeping of one composite action.
#[derive(Debug, Clone)]
pub struct CompositeAction {
    mode: ExecutionMode,
    pub(crate) children: Vec<ActionId>,
    current: Option<usize>,
    pub(crate) log_sub_actions: bool,
    /// Expected seconds per child, fixed at start when every child has one.
    weights: Option<Vec<f64>>,
}

impl CompositeAction {
    pub(crate) fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            children: Vec::new(),
            current: None,
            log_sub_actions: true,
            weights: None,
        }
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Children in insertion order.
    pub fn children(&self) -> &[ActionId] {
        &self.children
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Index of the child being run by a sequential composite; -1 before the first child starts.
    pub fn current_child_index(&self) -> i64 {
        self.current.map_or(-1, |i| i as i64)
    }

    /// The child being run by a sequential composite.
    pub fn current_child(&self) -> Option<ActionId> {
        self.current.and_then(|i| self.children.get(i).copied())
    }

    /// Whether finished children are recorded in the action log.
    pub fn logs_sub_actions(&self) -> bool {
        self.log_sub_actions
    }

    /// Whether progress is weighted by the children's expected durations.
    ///
    /// Decided once when the composite starts, so the aggregation never
    /// switches branches mid-run.
    pub fn is_duration_weighted(&self) -> bool {
        self.weights.is_some()
    }
}

impl ActionTree {
    pub(crate) fn composite(&self, id: ActionId) -> Option<&CompositeAction> {
        self.as_composite(id)
    }

    fn mode_and_children(&self, id: ActionId) -> Option<(ExecutionMode, Vec<ActionId>)> {
        self.composite(id).map(|c| (c.mode, c.children.clone()))
    }

    fn set_current(&mut self, id: ActionId, index: usize) {
        if let Some(composite) = self.composite_mut(id) {
            composite.current = Some(index);
        }
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    pub(crate) fn composite_start(&mut self, id: ActionId) {
        let Some((mode, children)) = self.mode_and_children(id) else {
            return;
        };

        let weights: Option<Vec<f64>> = children
            .iter()
            .map(|&c| self.effective_expected_duration(c).map(|d| d.as_secs_f64()))
            .collect();
        if let Some(composite) = self.composite_mut(id) {
            composite.weights = weights;
        }

        if children.is_empty() {
            debug!(action = %id, "composite has no children");
            self.composite_succeed(id);
        } else {
            match mode {
                ExecutionMode::Sequential => {
                    self.set_current(id, 0);
                    self.start_child(id, children[0]);
                }
                ExecutionMode::Parallel => {
                    for child in children {
                        self.start_child(id, child);
                    }
                }
            }
        }
        self.refresh_progress(id);
        self.refresh_status_text(id);
    }

    fn start_child(&mut self, parent: ActionId, child: ActionId) {
        self.set_attached(child, true);
        if !self.request_start(child) {
            let state = self.state_of(child);
            let failure = ActionFailure::Child {
                child: self.short_name(child),
                reason: format!("could not be started from state {state}"),
            };
            self.set_attached(child, false);
            self.fail(parent, failure);
        }
    }

    fn current_child_of(&self, id: ActionId) -> Option<ActionId> {
        self.composite(id).and_then(CompositeAction::current_child)
    }

    pub(crate) fn composite_pause(&mut self, id: ActionId) {
        let Some((mode, children)) = self.mode_and_children(id) else {
            return;
        };
        match mode {
            ExecutionMode::Sequential => {
                // Otherwise the pause lands when the current child finishes.
                if let Some(child) = self.current_child_of(id) {
                    if self.state_of(child) == ActionState::Running && self.can_pause(child) {
                        self.request_pause(child);
                    }
                }
            }
            ExecutionMode::Parallel => {
                for child in children {
                    if self.state_of(child) == ActionState::Running {
                        self.request_pause(child);
                    }
                }
            }
        }
    }

    pub(crate) fn composite_resume(&mut self, id: ActionId) {
        let Some((mode, children)) = self.mode_and_children(id) else {
            return;
        };
        match mode {
            ExecutionMode::Sequential => {
                let Some(child) = self.current_child_of(id) else {
                    return;
                };
                match self.state_of(child) {
                    ActionState::Paused => {
                        self.request_resume(child);
                    }
                    ActionState::Constructed => {
                        // Paused between two children.
                        self.set_state(id, ActionState::Running);
                        self.start_child(id, child);
                    }
                    _ => {}
                }
            }
            ExecutionMode::Parallel => {
                for child in children {
                    if self.state_of(child) == ActionState::Paused {
                        self.request_resume(child);
                    }
                }
            }
        }
    }

    pub(crate) fn composite_cancel(&mut self, id: ActionId) {
        let Some((mode, children)) = self.mode_and_children(id) else {
            return;
        };
        match mode {
            ExecutionMode::Sequential => match self.current_child_of(id) {
                Some(child) if self.state_of(child).is_active() => {
                    self.request_cancel(child);
                }
                _ => self.composite_cancelled(id),
            },
            ExecutionMode::Parallel => {
                let mut waiting = false;
                for child in children {
                    if self.state_of(child).is_active() {
                        self.request_cancel(child);
                        waiting = true;
                    }
                }
                if !waiting {
                    self.parallel_settle(id);
                }
            }
        }
    }

    fn composite_succeed(&mut self, id: ActionId) {
        if matches!(
            self.state_of(id),
            ActionState::Starting | ActionState::Resuming
        ) {
            self.set_state(id, ActionState::Running);
        }
        self.set_state(id, ActionState::Succeeded);
    }

    fn composite_cancelled(&mut self, id: ActionId) {
        if self.state_of(id) != ActionState::Cancelling {
            self.set_state(id, ActionState::Cancelling);
        }
        self.set_state(id, ActionState::Cancelled);
    }

    pub(crate) fn composite_can_pause(&self, id: ActionId) -> bool {
        let Some(composite) = self.composite(id) else {
            return false;
        };
        let children = &composite.children;
        match composite.mode {
            ExecutionMode::Sequential => match children.len() {
                0 => false,
                1 => self.can_pause(children[0]),
                n => {
                    let index = composite.current.unwrap_or(0);
                    if index + 1 >= n {
                        self.can_pause(children[n - 1])
                    } else {
                        // There is always a boundary before the next child.
                        true
                    }
                }
            },
            ExecutionMode::Parallel => {
                !children.is_empty() && children.iter().all(|&child| self.can_pause(child))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Child notifications
    // -------------------------------------------------------------------------

    pub(crate) fn on_child_state_changed(
        &mut self,
        parent: ActionId,
        child: ActionId,
        new: ActionState,
    ) {
        if self.state_of(parent).is_terminal() {
            if new.is_terminal() {
                self.finish_child(parent, child);
            }
            return;
        }

        match self.composite(parent).map(|c| c.mode) {
            Some(ExecutionMode::Sequential) => self.sequential_child_changed(parent, child, new),
            Some(ExecutionMode::Parallel) => self.parallel_child_changed(parent, child, new),
            None => return,
        }
        self.refresh_progress(parent);
        self.refresh_status_text(parent);
    }

    fn sequential_child_changed(&mut self, parent: ActionId, child: ActionId, new: ActionState) {
        let state = self.state_of(parent);
        match new {
            ActionState::Running => match state {
                ActionState::Starting | ActionState::Resuming => {
                    self.set_state(parent, ActionState::Running);
                }
                ActionState::Pausing if self.can_pause(child) => {
                    self.request_pause(child);
                }
                _ => {}
            },
            ActionState::Paused => {
                if state == ActionState::Pausing {
                    self.set_state(parent, ActionState::Paused);
                }
            }
            ActionState::Succeeded => {
                self.finish_child(parent, child);
                let Some((_, children)) = self.mode_and_children(parent) else {
                    return;
                };
                let index = children.iter().position(|&c| c == child).unwrap_or(0);
                let next = index + 1;
                if next >= children.len() {
                    self.composite_succeed(parent);
                    return;
                }

                self.set_current(parent, next);
                match state {
                    ActionState::Pausing => {
                        self.set_state(parent, ActionState::Paused);
                    }
                    ActionState::Cancelling => self.composite_cancelled(parent),
                    _ => self.start_child(parent, children[next]),
                }
            }
            ActionState::Failed => {
                self.finish_child(parent, child);
                let failure = self.child_failure(child);
                self.fail(parent, failure);
            }
            ActionState::Cancelled => {
                self.finish_child(parent, child);
                self.composite_cancelled(parent);
            }
            _ => {}
        }
    }

    fn parallel_child_changed(&mut self, parent: ActionId, child: ActionId, new: ActionState) {
        if new.is_terminal() {
            self.finish_child(parent, child);
        }
        if new == ActionState::Running
            && self.state_of(parent) == ActionState::Pausing
            && self.can_pause(child)
        {
            // Reached Running after the pause was requested.
            self.request_pause(child);
            return;
        }
        self.parallel_settle(parent);
    }

    fn parallel_settle(&mut self, id: ActionId) {
        let Some((_, children)) = self.mode_and_children(id) else {
            return;
        };
        let state = self.state_of(id);
        let states: Vec<ActionState> = children.iter().map(|&c| self.state_of(c)).collect();
        let settled = |target: ActionState| states.iter().all(|&s| s.is_terminal() || s == target);

        if states.iter().all(|s| s.is_terminal()) {
            if let Some(&failed) = children
                .iter()
                .find(|&&c| self.state_of(c) == ActionState::Failed)
            {
                let failure = self.child_failure(failed);
                self.fail(id, failure);
            } else if state == ActionState::Cancelling || states.contains(&ActionState::Cancelled)
            {
                self.composite_cancelled(id);
            } else {
                self.composite_succeed(id);
            }
            return;
        }

        match state {
            ActionState::Starting | ActionState::Resuming if settled(ActionState::Running) => {
                self.set_state(id, ActionState::Running);
            }
            ActionState::Pausing if settled(ActionState::Paused) => {
                self.set_state(id, ActionState::Paused);
            }
            _ => {}
        }
    }

    /// Stop observing a finished child and record it.
    fn finish_child(&mut self, parent: ActionId, child: ActionId) {
        match self.core(child) {
            Some(core) if core.attached => {}
            _ => return,
        }
        self.set_attached(child, false);

        if self.composite(parent).is_some_and(|c| c.log_sub_actions) {
            if let Some(record) = self.completed_record(child) {
                self.log.log_completed_action(&record);
            }
        }
    }

    fn child_failure(&self, child: ActionId) -> ActionFailure {
        ActionFailure::Child {
            child: self.short_name(child),
            reason: self
                .failure(child)
                .map_or_else(|| "failed".to_string(), ToString::to_string),
        }
    }

    fn short_name(&self, id: ActionId) -> String {
        self.info(id)
            .map(|i| i.short_description().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    // -------------------------------------------------------------------------
    // Derived progress and status
    // -------------------------------------------------------------------------

    /// Declared expected duration, or for a composite without one, the
    /// duration derived from its children.
    pub fn effective_expected_duration(&self, id: ActionId) -> Option<Duration> {
        let declared = self.info(id)?.expected_duration();
        if declared.is_some() {
            return declared;
        }
        let composite = self.composite(id)?;
        let mut durations = composite
            .children
            .iter()
            .map(|&c| self.effective_expected_duration(c));
        match composite.mode {
            ExecutionMode::Sequential => durations.try_fold(Duration::ZERO, |acc, d| Some(acc + d?)),
            ExecutionMode::Parallel => durations.try_fold(Duration::ZERO, |acc, d| Some(acc.max(d?))),
        }
    }

    pub(crate) fn refresh_progress(&mut self, id: ActionId) {
        if let Some(progress) = self.composite_progress(id) {
            self.set_progress(id, progress);
        }
    }

    pub(crate) fn refresh_status_text(&mut self, id: ActionId) {
        if let Some(text) = self.composite_status_text(id) {
            self.set_status_text(id, text);
        }
    }

    fn composite_progress(&self, id: ActionId) -> Option<Progress> {
        let composite = self.composite(id)?;
        let state = self.state_of(id);
        if state == ActionState::Constructed {
            return Some(Progress::NOT_STARTED);
        }
        let children = &composite.children;
        if children.is_empty() {
            return Some(if state == ActionState::Succeeded {
                Progress::new(1.0, 1.0)
            } else {
                Progress::UNKNOWN
            });
        }

        if let Some(weights) = &composite.weights {
            let (mut done, mut total) = (0.0, 0.0);
            for (&child, &weight) in children.iter().zip(weights) {
                let Some(core) = self.core(child) else {
                    continue;
                };
                let expected = self
                    .effective_expected_duration(child)
                    .map_or(weight, |d| d.as_secs_f64());
                if core.state.is_terminal() {
                    let actual = core.run_time().map_or(0.0, |d| d.as_secs_f64());
                    done += actual;
                    total += actual;
                } else if core.state == ActionState::Constructed {
                    total += expected;
                } else {
                    done += core.progress.fraction().unwrap_or(0.0) * expected;
                    total += expected;
                }
            }
            return Some(Progress::new(done, total));
        }

        let count = children.len() as f64;
        match composite.mode {
            ExecutionMode::Sequential => {
                let index = composite.current.unwrap_or(0);
                let fraction = children
                    .get(index)
                    .map_or(0.0, |&child| self.child_fraction(child));
                Some(Progress::new(index as f64 + fraction, count))
            }
            ExecutionMode::Parallel => {
                let mut done = 0.0;
                for &child in children {
                    let Some(core) = self.core(child) else {
                        continue;
                    };
                    if core.state.is_active() && core.progress.is_unknown() {
                        return Some(Progress::UNKNOWN);
                    }
                    done += self.child_fraction(child);
                }
                Some(Progress::new(done, count))
            }
        }
    }

    fn child_fraction(&self, child: ActionId) -> f64 {
        match self.core(child) {
            Some(core) if core.state.is_terminal() => 1.0,
            Some(core) if core.state.is_active() => core.progress.fraction().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn composite_status_text(&self, id: ActionId) -> Option<String> {
        let composite = self.composite(id)?;
        if self.state_of(id) == ActionState::Constructed {
            return Some(String::new());
        }
        let line = |child: ActionId| -> (String, String) {
            (
                self.short_name(child),
                self.status_text(child).unwrap_or_default().to_string(),
            )
        };

        let text = match composite.mode {
            ExecutionMode::Sequential => match composite.current {
                Some(index) => {
                    let (short, status) = line(composite.children[index]);
                    format!(
                        "Step {} of {} ({}): {}",
                        index + 1,
                        composite.children.len(),
                        short,
                        status
                    )
                }
                None => String::new(),
            },
            ExecutionMode::Parallel => composite
                .children
                .iter()
                .enumerate()
                .map(|(i, &child)| {
                    let (short, status) = line(child);
                    format!("Step {} ({}): {}", i + 1, short, status)
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        Some(text)
    }
}
