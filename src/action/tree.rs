//! Ownership and execution of one tree of actions.
//!
//! An [`ActionTree`] owns every action of a tree in an arena and hands out
//! copyable [`ActionId`]s. It is the single place where requests enter
//! (`start`, `pause`, `resume`, `cancel`), where asynchronous completions are
//! fed back (`dispatch`, `process_pending`), and where notifications leave
//! (`subscribe`).
//!
//! # Event flow
//!
//! ```text
//!  caller ──start()──► tree ──start_implementation()──► leaf
//!                        ▲                                │
//!                        │                      Mailbox::post(LeafMessage)
//!                        │                                │
//!                 dispatch(Envelope) ◄────────────────────┘
//!                        │
//!                 pending queue (FIFO)
//!                        │
//!           ┌────────────┴─────────────┐
//!           ▼                          ▼
//!   broadcast::Sender<ActionEvent>   attached parent composite
//! ```
//!
//! Notifiers write state immediately but their notifications are queued and
//! delivered after the current request returns, so a handler never runs
//! inside another handler and every composite sees its children's changes in
//! the order they happened.

use super::composite::{CompositeAction, ExecutionMode};
use super::context::{apply_failure, apply_progress, apply_status, apply_transition};
use super::core::ActionCore;
use super::{
    ActionContext, ActionEvent, ActionEventKind, ActionId, ActionInfo, ActionState, Envelope,
    LeafAction, LeafMessage, Progress,
};
use crate::action_log::{ActionLog, CompletedAction, TracingActionLog};
use crate::error::{ActionError, ActionFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, trace};

/// Default period between progress re-estimations of running leaves.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Tunables shared by every action of a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSettings {
    /// Period between progress re-estimations of running leaves.
    pub progress_interval: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

pub(crate) enum ActionKind {
    Leaf(Box<dyn LeafAction>),
    Composite(CompositeAction),
}

pub(crate) struct ActionNode {
    pub(crate) core: ActionCore,
    pub(crate) kind: ActionKind,
}

/// Point-in-time view of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSnapshot {
    /// The action.
    pub id: ActionId,
    /// Full description.
    pub description: String,
    /// Short description.
    pub short_description: String,
    /// Current state.
    pub state: ActionState,
    /// Current progress.
    pub progress: Progress,
    /// Current status text.
    pub status_text: String,
    /// Failure reason once `Failed`.
    pub failure: Option<ActionFailure>,
    /// When the action was started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the action reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Arena owning one tree of actions.
///
/// # Example
///
/// ```rust
/// use daq_actions::action::{ActionInfo, ActionState, ActionTree, ExecutionMode};
///
/// let mut tree = ActionTree::new();
/// let root = tree.add_composite(ActionInfo::new("Nothing to do"), ExecutionMode::Sequential);
///
/// assert!(tree.start(root));
/// assert_eq!(tree.state(root), Some(ActionState::Succeeded));
/// ```
pub struct ActionTree {
    nodes: Vec<Option<ActionNode>>,
    pending: VecDeque<ActionEvent>,
    mailbox_tx: mpsc::UnboundedSender<Envelope>,
    mailbox_rx: mpsc::UnboundedReceiver<Envelope>,
    events: broadcast::Sender<ActionEvent>,
    pub(crate) log: Arc<dyn ActionLog>,
    settings: TreeSettings,
}

impl fmt::Debug for ActionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTree")
            .field("actions", &self.len())
            .field("pending", &self.pending.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Default for ActionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionTree {
    /// Create an empty tree with default settings that logs completed children through `tracing`.
    pub fn new() -> Self {
        Self::with_settings(TreeSettings::default(), Arc::new(TracingActionLog))
    }

    /// Create an empty tree.
    pub fn with_settings(settings: TreeSettings, log: Arc<dyn ActionLog>) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            nodes: Vec::new(),
            pending: VecDeque::new(),
            mailbox_tx,
            mailbox_rx,
            events,
            log,
            settings,
        }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &TreeSettings {
        &self.settings
    }

    /// Replace the sink that records completed children.
    pub fn set_action_log(&mut self, log: Arc<dyn ActionLog>) {
        self.log = log;
    }

    /// Number of live actions.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// True when the tree holds no actions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Building
    // =========================================================================

    /// Add a detached leaf action.
    pub fn add_leaf(&mut self, info: ActionInfo, leaf: impl LeafAction + 'static) -> ActionId {
        self.add_boxed_leaf(info, Box::new(leaf))
    }

    /// Add a detached, already boxed leaf action.
    ///
    /// An info without an expected duration takes the one the leaf reports.
    pub fn add_boxed_leaf(&mut self, mut info: ActionInfo, leaf: Box<dyn LeafAction>) -> ActionId {
        if info.expected_duration().is_none() {
            info.set_expected_duration(leaf.expected_duration());
        }
        self.push(ActionNode {
            core: ActionCore::new(info),
            kind: ActionKind::Leaf(leaf),
        })
    }

    /// Add a detached, empty composite action.
    pub fn add_composite(&mut self, info: ActionInfo, mode: ExecutionMode) -> ActionId {
        self.push(ActionNode {
            core: ActionCore::new(info),
            kind: ActionKind::Composite(CompositeAction::new(mode)),
        })
    }

    fn push(&mut self, node: ActionNode) -> ActionId {
        let id = ActionId::from_index(self.nodes.len());
        self.nodes.push(Some(node));
        id
    }

    /// Insert `child` into composite `parent` at `index`.
    ///
    /// Rejected once `parent` has left `Constructed`, when `child` already has a
    /// parent or has been started, and when the insertion would create a cycle.
    pub fn insert_child(
        &mut self,
        parent: ActionId,
        child: ActionId,
        index: usize,
    ) -> Result<(), ActionError> {
        let parent_state = self.require(parent)?.state;
        let child_core = self.require(child)?;
        let len = self
            .as_composite(parent)
            .ok_or(ActionError::NotComposite(parent))?
            .children()
            .len();

        if parent_state != ActionState::Constructed {
            return Err(ActionError::StructureLocked {
                id: parent,
                state: parent_state,
            });
        }
        if let Some(existing) = child_core.parent {
            return Err(ActionError::AlreadyParented {
                child,
                parent: existing,
            });
        }
        if child_core.state != ActionState::Constructed {
            return Err(ActionError::AlreadyStarted(child));
        }
        if self.ancestors(parent).any(|a| a == child) {
            return Err(ActionError::Cycle { parent, child });
        }
        if index > len {
            return Err(ActionError::IndexOutOfRange { index, len });
        }

        if let Some(composite) = self.composite_mut(parent) {
            composite.children.insert(index, child);
        }
        if let Some(core) = self.core_mut(child) {
            core.parent = Some(parent);
        }
        Ok(())
    }

    /// Append `child` to composite `parent`.
    pub fn add_child(&mut self, parent: ActionId, child: ActionId) -> Result<(), ActionError> {
        let len = self.children(parent).len();
        self.insert_child(parent, child, len)
    }

    /// Detach and return the child at `index`. The child stays in the arena
    /// until [`discard`](Self::discard) is called or the tree is dropped.
    pub fn remove_child_at(
        &mut self,
        parent: ActionId,
        index: usize,
    ) -> Result<ActionId, ActionError> {
        let state = self.require(parent)?.state;
        let len = self
            .as_composite(parent)
            .ok_or(ActionError::NotComposite(parent))?
            .children()
            .len();

        if state != ActionState::Constructed {
            return Err(ActionError::StructureLocked { id: parent, state });
        }
        if index >= len {
            return Err(ActionError::IndexOutOfRange { index, len });
        }

        let child = match self.composite_mut(parent) {
            Some(composite) => composite.children.remove(index),
            None => return Err(ActionError::NotComposite(parent)),
        };
        if let Some(core) = self.core_mut(child) {
            core.parent = None;
            core.attached = false;
        }
        Ok(child)
    }

    /// Destroy a detached action together with all of its descendants.
    pub fn discard(&mut self, id: ActionId) -> Result<(), ActionError> {
        if self.require(id)?.parent.is_some() {
            return Err(ActionError::StillParented(id));
        }
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            stack.extend_from_slice(self.children(next));
            if let Some(slot) = self.nodes.get_mut(next.index()) {
                *slot = None;
            }
        }
        Ok(())
    }

    /// Mutable access to the info of an action that has not started.
    pub fn info_mut(&mut self, id: ActionId) -> Result<&mut ActionInfo, ActionError> {
        let core = self.core_mut(id).ok_or(ActionError::UnknownAction(id))?;
        if core.state != ActionState::Constructed {
            return Err(ActionError::StructureLocked {
                id,
                state: core.state,
            });
        }
        Ok(&mut core.info)
    }

    /// Choose whether a composite records its children in the action log.
    pub fn set_log_sub_actions(&mut self, id: ActionId, enabled: bool) -> Result<(), ActionError> {
        let composite = self.composite_mut(id).ok_or(ActionError::NotComposite(id))?;
        composite.log_sub_actions = enabled;
        Ok(())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Request `Constructed -> Starting`. Returns false if the action is not `Constructed`.
    pub fn start(&mut self, id: ActionId) -> bool {
        let accepted = self.request_start(id);
        self.deliver();
        accepted
    }

    /// Request `Running -> Pausing`. Returns false unless the action is
    /// `Running` and can pause.
    pub fn pause(&mut self, id: ActionId) -> bool {
        let accepted = self.request_pause(id);
        self.deliver();
        accepted
    }

    /// Request `Paused -> Resuming`. Returns false unless the action is `Paused`.
    pub fn resume(&mut self, id: ActionId) -> bool {
        let accepted = self.request_resume(id);
        self.deliver();
        accepted
    }

    /// Request cancellation.
    ///
    /// A `Constructed` action is cancelled on the spot. An active action enters
    /// `Cancelling` and finishes when its implementation reports back. Returns
    /// false only for terminal or unknown actions.
    pub fn cancel(&mut self, id: ActionId) -> bool {
        let accepted = self.request_cancel(id);
        self.deliver();
        accepted
    }

    pub(crate) fn request_start(&mut self, id: ActionId) -> bool {
        if !self.set_state(id, ActionState::Starting) {
            return false;
        }
        if let Some(core) = self.core(id) {
            info!(action = %id, description = %core.info.description(), "starting action");
        }

        if self.as_composite(id).is_some() {
            self.composite_start(id);
        } else {
            self.with_leaf(id, |leaf, ctx| leaf.start_implementation(ctx));
        }
        true
    }

    pub(crate) fn request_pause(&mut self, id: ActionId) -> bool {
        if self.state(id) != Some(ActionState::Running) || !self.can_pause(id) {
            return false;
        }
        if !self.set_state(id, ActionState::Pausing) {
            return false;
        }

        if self.as_composite(id).is_some() {
            self.composite_pause(id);
        } else {
            self.with_leaf(id, |leaf, ctx| leaf.pause_implementation(ctx));
        }
        true
    }

    pub(crate) fn request_resume(&mut self, id: ActionId) -> bool {
        if !self.set_state(id, ActionState::Resuming) {
            return false;
        }

        if self.as_composite(id).is_some() {
            self.composite_resume(id);
        } else {
            self.with_leaf(id, |leaf, ctx| leaf.resume_implementation(ctx));
        }
        true
    }

    pub(crate) fn request_cancel(&mut self, id: ActionId) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };

        match state {
            s if s.is_terminal() => false,
            ActionState::Cancelling => true,
            ActionState::Constructed => {
                self.set_state(id, ActionState::Cancelling);
                self.set_state(id, ActionState::Cancelled);
                true
            }
            _ => {
                self.set_state(id, ActionState::Cancelling);
                info!(action = %id, "cancelling action");
                if self.as_composite(id).is_some() {
                    self.composite_cancel(id);
                } else {
                    self.with_leaf(id, |leaf, ctx| leaf.cancel_implementation(ctx));
                }
                true
            }
        }
    }

    // =========================================================================
    // Asynchronous completion
    // =========================================================================

    /// Queue a message for `target` as if its own mailbox had posted it.
    pub fn post(&self, target: ActionId, message: LeafMessage) -> bool {
        self.mailbox_tx.send(Envelope { target, message }).is_ok()
    }

    /// Handle every message already waiting in the mailbox. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.mailbox_rx.try_recv() {
            self.dispatch(envelope);
            handled += 1;
        }
        handled
    }

    /// Wait for the next mailbox message.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        self.mailbox_rx.recv().await
    }

    /// Hand one message to its leaf and deliver the resulting notifications.
    ///
    /// Messages for actions that are not active any more are dropped.
    pub fn dispatch(&mut self, envelope: Envelope) {
        let Envelope { target, message } = envelope;
        match self.state(target) {
            Some(state) if state.is_active() => {
                self.with_leaf(target, |leaf, ctx| leaf.handle_message(ctx, message));
                self.deliver();
            }
            state => {
                trace!(action = %target, ?state, ?message, "dropping message for inactive action");
            }
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Receive every notification of this tree from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.events.subscribe()
    }

    /// Publish notifications on an externally owned channel instead.
    pub fn attach_event_sender(&mut self, sender: broadcast::Sender<ActionEvent>) {
        self.events = sender;
    }

    /// Current state.
    pub fn state(&self, id: ActionId) -> Option<ActionState> {
        self.core(id).map(|c| c.state)
    }

    /// The action's info.
    pub fn info(&self, id: ActionId) -> Option<&ActionInfo> {
        self.core(id).map(|c| &c.info)
    }

    /// Last reported progress.
    pub fn progress(&self, id: ActionId) -> Option<Progress> {
        self.core(id).map(|c| c.progress)
    }

    /// Last reported status text.
    pub fn status_text(&self, id: ActionId) -> Option<&str> {
        self.core(id).map(|c| c.status_text.as_str())
    }

    /// Failure reason once `Failed`.
    pub fn failure(&self, id: ActionId) -> Option<&ActionFailure> {
        self.core(id).and_then(|c| c.failure.as_ref())
    }

    /// Owning composite, if any.
    pub fn parent(&self, id: ActionId) -> Option<ActionId> {
        self.core(id).and_then(|c| c.parent)
    }

    /// Children of a composite; empty for leaves.
    pub fn children(&self, id: ActionId) -> &[ActionId] {
        self.as_composite(id).map_or(&[], |c| c.children())
    }

    /// The action as a composite, if it is one.
    pub fn as_composite(&self, id: ActionId) -> Option<&CompositeAction> {
        match &self.node(id)?.kind {
            ActionKind::Composite(composite) => Some(composite),
            ActionKind::Leaf(_) => None,
        }
    }

    /// Whether the action could accept `pause()` right now, state permitting.
    pub fn can_pause(&self, id: ActionId) -> bool {
        match self.node(id).map(|n| &n.kind) {
            Some(ActionKind::Leaf(leaf)) => leaf.can_pause(),
            Some(ActionKind::Composite(_)) => self.composite_can_pause(id),
            None => false,
        }
    }

    /// Time spent between start and end (or now, while still running).
    pub fn run_time(&self, id: ActionId) -> Option<Duration> {
        self.core(id).and_then(|c| c.run_time())
    }

    /// When the action was started.
    pub fn start_time(&self, id: ActionId) -> Option<DateTime<Utc>> {
        self.core(id).and_then(|c| c.started_at)
    }

    /// When the action reached a terminal state.
    pub fn end_time(&self, id: ActionId) -> Option<DateTime<Utc>> {
        self.core(id).and_then(|c| c.ended_at)
    }

    /// Point-in-time view of an action.
    pub fn snapshot(&self, id: ActionId) -> Option<ActionSnapshot> {
        let core = self.core(id)?;
        Some(ActionSnapshot {
            id,
            description: core.info.description().to_string(),
            short_description: core.info.short_description().to_string(),
            state: core.state,
            progress: core.progress,
            status_text: core.status_text.clone(),
            failure: core.failure.clone(),
            started_at: core.started_at,
            ended_at: core.ended_at,
        })
    }

    /// Record describing a finished (or abandoned) action.
    pub fn completed_record(&self, id: ActionId) -> Option<CompletedAction> {
        let node = self.node(id)?;
        let core = &node.core;
        let kind = match &node.kind {
            ActionKind::Leaf(leaf) => leaf.kind().to_string(),
            ActionKind::Composite(composite) => composite.mode().as_str().to_string(),
        };
        Some(CompletedAction {
            id,
            kind,
            description: core.info.description().to_string(),
            short_description: core.info.short_description().to_string(),
            state: core.state,
            parent: core.parent,
            started_at: core.started_at,
            ended_at: core.ended_at,
            run_time: core.run_time(),
            failure: core.failure.clone(),
        })
    }

    /// Indented one-line-per-action rendering of the subtree at `root`.
    pub fn outline(&self, root: ActionId) -> String {
        let mut out = String::new();
        self.outline_into(root, 0, &mut out);
        out
    }

    fn outline_into(&self, id: ActionId, depth: usize, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        let kind = match &node.kind {
            ActionKind::Leaf(leaf) => leaf.kind(),
            ActionKind::Composite(composite) => composite.mode().as_str(),
        };
        let duration = self
            .effective_expected_duration(id)
            .map(|d| format!(" ~{:.1}s", d.as_secs_f64()))
            .unwrap_or_default();
        out.push_str(&format!(
            "{}{} [{}] {} ({}){}\n",
            "  ".repeat(depth),
            id,
            kind,
            node.core.info.short_description(),
            node.core.state,
            duration
        ));
        for &child in self.children(id) {
            self.outline_into(child, depth + 1, out);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    pub(crate) fn node(&self, id: ActionId) -> Option<&ActionNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn core(&self, id: ActionId) -> Option<&ActionCore> {
        self.node(id).map(|n| &n.core)
    }

    pub(crate) fn core_mut(&mut self, id: ActionId) -> Option<&mut ActionCore> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .map(|n| &mut n.core)
    }

    pub(crate) fn composite_mut(&mut self, id: ActionId) -> Option<&mut CompositeAction> {
        match &mut self.nodes.get_mut(id.index())?.as_mut()?.kind {
            ActionKind::Composite(composite) => Some(composite),
            ActionKind::Leaf(_) => None,
        }
    }

    fn require(&self, id: ActionId) -> Result<&ActionCore, ActionError> {
        self.core(id).ok_or(ActionError::UnknownAction(id))
    }

    fn ancestors(&self, id: ActionId) -> impl Iterator<Item = ActionId> + '_ {
        std::iter::successors(Some(id), move |&current| self.parent(current))
    }

    /// State of an action known to exist; missing actions read as `Failed`.
    pub(crate) fn state_of(&self, id: ActionId) -> ActionState {
        self.state(id).unwrap_or(ActionState::Failed)
    }

    pub(crate) fn set_state(&mut self, id: ActionId, next: ActionState) -> bool {
        let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        apply_transition(id, &mut node.core, &mut self.pending, next)
    }

    pub(crate) fn fail(&mut self, id: ActionId, failure: ActionFailure) -> bool {
        let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        apply_failure(id, &mut node.core, &mut self.pending, failure)
    }

    pub(crate) fn set_progress(&mut self, id: ActionId, progress: Progress) {
        if let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::as_mut) {
            apply_progress(id, &mut node.core, &mut self.pending, progress);
        }
    }

    pub(crate) fn set_status_text(&mut self, id: ActionId, text: String) {
        if let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::as_mut) {
            apply_status(id, &mut node.core, &mut self.pending, text);
        }
    }

    pub(crate) fn set_attached(&mut self, id: ActionId, attached: bool) {
        if let Some(core) = self.core_mut(id) {
            core.attached = attached;
        }
    }

    fn with_leaf<R>(
        &mut self,
        id: ActionId,
        f: impl FnOnce(&mut dyn LeafAction, &mut ActionContext<'_>) -> R,
    ) -> Option<R> {
        let node = self.nodes.get_mut(id.index())?.as_mut()?;
        let ActionNode { core, kind } = node;
        let ActionKind::Leaf(leaf) = kind else {
            return None;
        };
        let mut ctx = ActionContext::new(
            id,
            core,
            &mut self.pending,
            &self.mailbox_tx,
            &self.settings,
        );
        Some(f(leaf.as_mut(), &mut ctx))
    }

    /// The parent observing `id`, if any.
    fn observing_parent(&self, id: ActionId) -> Option<ActionId> {
        let core = self.core(id)?;
        if core.attached {
            core.parent
        } else {
            None
        }
    }

    /// Drain the notification queue, publishing each event and routing it to
    /// the attached parent.
    pub(crate) fn deliver(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            // Having no subscribers is fine.
            let _ = self.events.send(event.clone());

            let Some(parent) = self.observing_parent(event.id) else {
                continue;
            };
            match event.kind {
                ActionEventKind::StateChanged { new, .. } => {
                    self.on_child_state_changed(parent, event.id, new);
                }
                ActionEventKind::ProgressChanged { .. } => self.refresh_progress(parent),
                ActionEventKind::StatusTextChanged { .. } => self.refresh_status_text(parent),
            }
        }
    }
}
