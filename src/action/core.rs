//! Per-action bookkeeping shared by leaves and composites.

use super::{ActionInfo, ActionState, Progress};
use crate::error::ActionFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Handle to one action inside an [`ActionTree`](super::ActionTree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(usize);

impl ActionId {
    /// Wrap a raw arena index.
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Raw arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mutable record of one action.
///
/// Only the transition helpers in [`context`](super::context) write `state`;
/// everything else reads it.
#[derive(Debug)]
pub(crate) struct ActionCore {
    pub(crate) info: ActionInfo,
    pub(crate) state: ActionState,
    pub(crate) parent: Option<ActionId>,
    /// Whether the parent currently observes this action.
    pub(crate) attached: bool,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    ended: Option<Instant>,
    pub(crate) progress: Progress,
    pub(crate) status_text: String,
    pub(crate) failure: Option<ActionFailure>,
}

impl ActionCore {
    pub(crate) fn new(info: ActionInfo) -> Self {
        Self {
            info,
            state: ActionState::Constructed,
            parent: None,
            attached: false,
            started_at: None,
            ended_at: None,
            started: None,
            ended: None,
            progress: Progress::NOT_STARTED,
            status_text: String::new(),
            failure: None,
        }
    }

    /// Write `next` if legal, returning the previous state.
    pub(crate) fn transition(&mut self, next: ActionState) -> Option<ActionState> {
        let old = self.state;
        if !old.can_transition_to(next) {
            return None;
        }
        self.state = next;

        if next == ActionState::Starting {
            self.started_at = Some(Utc::now());
            self.started = Some(Instant::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.ended = Some(Instant::now());
        }
        Some(old)
    }

    /// Wall time between start and end (or now, while still running).
    pub(crate) fn run_time(&self) -> Option<Duration> {
        let started = self.started?;
        let end = self.ended.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_records_timestamps() {
        let mut core = ActionCore::new(ActionInfo::new("test"));
        assert!(core.run_time().is_none());

        assert_eq!(
            core.transition(ActionState::Starting),
            Some(ActionState::Constructed)
        );
        assert!(core.started_at.is_some());
        assert!(core.ended_at.is_none());

        assert!(core.transition(ActionState::Running).is_some());
        assert!(core.transition(ActionState::Succeeded).is_some());
        assert!(core.ended_at.is_some());
        assert!(core.run_time().is_some());
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut core = ActionCore::new(ActionInfo::new("test"));
        assert_eq!(core.transition(ActionState::Succeeded), None);
        assert_eq!(core.state, ActionState::Constructed);
    }
}
