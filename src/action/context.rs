//! The implementation side of the action contract.
//!
//! Public callers request transitions through [`ActionTree`](super::ActionTree)
//! (`start`, `pause`, `resume`, `cancel`). Implementations answer through an
//! [`ActionContext`], whose notifiers (`set_started`, `set_paused`, ...) are the
//! only code paths that write an action's state. An implementation that
//! completes later, for example when hardware reports back, posts a
//! [`LeafMessage`] to its [`Mailbox`]; the tree hands the message back to the
//! implementation together with a fresh context.

use super::core::ActionCore;
use super::tree::TreeSettings;
use super::{ActionEvent, ActionId, ActionInfo, ActionState, Progress};
use crate::control::ControlEvent;
use crate::error::ActionFailure;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Asynchronous input for a leaf action.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafMessage {
    /// A notification from a subscribed control.
    Control(ControlEvent),
    /// A periodic timer tick requested with [`Mailbox::start_ticker`].
    Tick,
}

/// A [`LeafMessage`] addressed to one action.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Receiving action.
    pub target: ActionId,
    /// Payload.
    pub message: LeafMessage,
}

/// Posts messages back to one action of a tree.
///
/// Cheap to clone and `Send`, so it can be moved into device callbacks and
/// timer tasks.
#[derive(Debug, Clone)]
pub struct Mailbox {
    target: ActionId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Mailbox {
    pub(crate) fn new(target: ActionId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { target, tx }
    }

    /// Action that receives the messages.
    pub fn target(&self) -> ActionId {
        self.target
    }

    /// Queue a message. Returns false once the tree is gone.
    pub fn post(&self, message: LeafMessage) -> bool {
        self.tx
            .send(Envelope {
                target: self.target,
                message,
            })
            .is_ok()
    }

    /// Post [`LeafMessage::Tick`] every `period` until the returned ticker is dropped.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn start_ticker(&self, period: Duration) -> Option<Ticker> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!(action = %self.target, "no tokio runtime, progress ticks disabled");
                return None;
            }
        };

        let period = period.max(Duration::from_millis(1));
        let mailbox = self.clone();
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if !mailbox.post(LeafMessage::Tick) {
                    break;
                }
            }
        });
        Some(Ticker { handle })
    }

    /// Post `message` once after `delay` unless the returned ticker is dropped first.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn post_after(&self, delay: Duration, message: LeafMessage) -> Option<Ticker> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let mailbox = self.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            mailbox.post(message);
        });
        Some(Ticker { handle })
    }
}

/// Periodic tick source. Stops when dropped.
#[derive(Debug)]
pub struct Ticker {
    handle: JoinHandle<()>,
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) fn apply_transition(
    id: ActionId,
    core: &mut ActionCore,
    pending: &mut VecDeque<ActionEvent>,
    next: ActionState,
) -> bool {
    match core.transition(next) {
        Some(old) => {
            debug!(action = %id, %old, new = %next, "state changed");
            pending.push_back(ActionEvent::state(id, old, next));
            true
        }
        None => {
            trace!(action = %id, from = %core.state, to = %next, "transition rejected");
            false
        }
    }
}

pub(crate) fn apply_failure(
    id: ActionId,
    core: &mut ActionCore,
    pending: &mut VecDeque<ActionEvent>,
    failure: ActionFailure,
) -> bool {
    if core.state.is_terminal() {
        return false;
    }
    warn!(action = %id, description = %core.info.short_description(), %failure, "action failed");
    core.failure = Some(failure);
    apply_transition(id, core, pending, ActionState::Failed)
}

pub(crate) fn apply_progress(
    id: ActionId,
    core: &mut ActionCore,
    pending: &mut VecDeque<ActionEvent>,
    progress: Progress,
) {
    if core.progress != progress {
        core.progress = progress;
        pending.push_back(ActionEvent::progress(id, progress));
    }
}

pub(crate) fn apply_status(
    id: ActionId,
    core: &mut ActionCore,
    pending: &mut VecDeque<ActionEvent>,
    text: String,
) {
    if core.status_text != text {
        core.status_text = text.clone();
        pending.push_back(ActionEvent::status(id, text));
    }
}

/// Notifiers and accessors handed to a leaf implementation.
///
/// A context is only valid for the duration of one call into the
/// implementation. Each notifier returns whether the transition was legal.
pub struct ActionContext<'a> {
    id: ActionId,
    core: &'a mut ActionCore,
    pending: &'a mut VecDeque<ActionEvent>,
    mailbox: &'a mpsc::UnboundedSender<Envelope>,
    settings: &'a TreeSettings,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        id: ActionId,
        core: &'a mut ActionCore,
        pending: &'a mut VecDeque<ActionEvent>,
        mailbox: &'a mpsc::UnboundedSender<Envelope>,
        settings: &'a TreeSettings,
    ) -> Self {
        Self {
            id,
            core,
            pending,
            mailbox,
            settings,
        }
    }

    /// Id of the action being driven.
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ActionState {
        self.core.state
    }

    /// The action's info.
    pub fn info(&self) -> &ActionInfo {
        &self.core.info
    }

    /// Last reported progress.
    pub fn progress(&self) -> Progress {
        self.core.progress
    }

    /// Default period for progress re-estimation.
    pub fn progress_interval(&self) -> Duration {
        self.settings.progress_interval
    }

    /// Mailbox for asynchronous completion.
    pub fn mailbox(&self) -> Mailbox {
        Mailbox::new(self.id, self.mailbox.clone())
    }

    /// `Starting -> Running`.
    pub fn set_started(&mut self) -> bool {
        self.core.state == ActionState::Starting && self.transition(ActionState::Running)
    }

    /// `Pausing -> Paused`.
    pub fn set_paused(&mut self) -> bool {
        self.transition(ActionState::Paused)
    }

    /// `Resuming -> Running`.
    pub fn set_resumed(&mut self) -> bool {
        self.core.state == ActionState::Resuming && self.transition(ActionState::Running)
    }

    /// `Cancelling -> Cancelled`.
    pub fn set_cancelled(&mut self) -> bool {
        self.transition(ActionState::Cancelled)
    }

    /// `Running | Pausing -> Succeeded`.
    pub fn set_succeeded(&mut self) -> bool {
        self.transition(ActionState::Succeeded)
    }

    /// Any non-terminal state `-> Failed`, recording why.
    pub fn set_failed(&mut self, failure: ActionFailure) -> bool {
        apply_failure(self.id, self.core, self.pending, failure)
    }

    /// Report progress; unchanged values are not re-published.
    pub fn set_progress(&mut self, numerator: f64, denominator: f64) {
        apply_progress(
            self.id,
            self.core,
            self.pending,
            Progress::new(numerator, denominator),
        );
    }

    /// Report status text; unchanged values are not re-published.
    pub fn set_status_text(&mut self, text: impl Into<String>) {
        apply_status(self.id, self.core, self.pending, text.into());
    }

    /// Refine the expected duration while running.
    pub fn set_expected_duration(&mut self, duration: Option<Duration>) {
        self.core.info.set_expected_duration(duration);
    }

    fn transition(&mut self, next: ActionState) -> bool {
        apply_transition(self.id, self.core, self.pending, next)
    }
}
