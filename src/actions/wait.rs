//! Wait for a fixed time.

use crate::action::{ActionContext, LeafAction, LeafMessage, Ticker};
use std::time::Duration;
use tokio::time::Instant;

/// Leaf action that succeeds after a fixed duration.
///
/// Progress is reported as `(elapsed, duration)` in seconds. The wait can be
/// paused; time spent paused does not count.
#[derive(Debug)]
pub struct WaitAction {
    duration: Duration,
    waited: Duration,
    resumed_at: Option<Instant>,
    ticker: Option<Ticker>,
    deadline: Option<Ticker>,
}

impl WaitAction {
    /// Wait for `duration` once started.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            waited: Duration::ZERO,
            resumed_at: None,
            ticker: None,
            deadline: None,
        }
    }

    /// Time to wait, not counting pauses.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn elapsed(&self) -> Duration {
        let running = self.resumed_at.map_or(Duration::ZERO, |t| t.elapsed());
        (self.waited + running).min(self.duration)
    }

    fn arm(&mut self, ctx: &ActionContext<'_>) {
        let mailbox = ctx.mailbox();
        let remaining = self.duration.saturating_sub(self.waited);
        self.resumed_at = Some(Instant::now());
        self.ticker = mailbox.start_ticker(ctx.progress_interval());
        self.deadline = mailbox.post_after(remaining, LeafMessage::Tick);
    }

    fn disarm(&mut self) {
        self.waited = self.elapsed();
        self.resumed_at = None;
        self.ticker = None;
        self.deadline = None;
    }

    fn report(&self, ctx: &mut ActionContext<'_>) {
        let elapsed = self.elapsed();
        ctx.set_progress(elapsed.as_secs_f64(), self.duration.as_secs_f64());
        let remaining = self.duration.saturating_sub(elapsed);
        ctx.set_status_text(format!("{:.1} s remaining", remaining.as_secs_f64()));
    }
}

impl LeafAction for WaitAction {
    fn start_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.waited = Duration::ZERO;
        ctx.set_started();

        if self.duration.is_zero() {
            ctx.set_progress(100.0, 100.0);
            ctx.set_succeeded();
            return;
        }
        self.arm(ctx);
        self.report(ctx);
    }

    fn cancel_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.disarm();
        ctx.set_cancelled();
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn expected_duration(&self) -> Option<Duration> {
        Some(self.duration)
    }

    fn pause_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.disarm();
        self.report(ctx);
        ctx.set_paused();
    }

    fn resume_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        self.arm(ctx);
        ctx.set_resumed();
    }

    fn handle_message(&mut self, ctx: &mut ActionContext<'_>, message: LeafMessage) {
        if message != LeafMessage::Tick || self.resumed_at.is_none() {
            return;
        }
        self.report(ctx);
        if self.elapsed() >= self.duration {
            self.disarm();
            ctx.set_succeeded();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionEventKind, ActionInfo, ActionState, ActionTree};

    async fn run_until(tree: &mut ActionTree, id: crate::action::ActionId, state: ActionState) {
        while tree.state(id) != Some(state) {
            let Some(envelope) = tree.next_envelope().await else {
                break;
            };
            tree.dispatch(envelope);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_succeeds_after_duration() {
        let mut tree = ActionTree::new();
        let id = tree.add_leaf(ActionInfo::new("wait"), WaitAction::new(Duration::from_secs(2)));

        let began = Instant::now();
        tree.start(id);
        assert_eq!(tree.state(id), Some(ActionState::Running));
        assert_eq!(
            tree.info(id).and_then(|i| i.expected_duration()),
            Some(Duration::from_secs(2))
        );

        run_until(&mut tree, id, ActionState::Succeeded).await;
        assert_eq!(began.elapsed(), Duration::from_secs(2));
        let progress = tree.progress(id).unwrap();
        assert_eq!(progress.fraction(), Some(1.0));
    }

    #[test]
    fn test_expected_duration_is_known_before_start() {
        let mut tree = ActionTree::new();
        let id = tree.add_leaf(ActionInfo::new("wait"), WaitAction::new(Duration::from_secs(3)));
        assert_eq!(
            tree.info(id).and_then(|i| i.expected_duration()),
            Some(Duration::from_secs(3))
        );

        let declared = tree.add_leaf(
            ActionInfo::new("declared").with_expected_duration(Duration::from_secs(5)),
            WaitAction::new(Duration::from_secs(3)),
        );
        assert_eq!(
            tree.info(declared).and_then(|i| i.expected_duration()),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_zero_wait_reports_complete_progress() {
        let mut tree = ActionTree::new();
        let mut events = tree.subscribe();
        let id = tree.add_leaf(ActionInfo::new("wait"), WaitAction::new(Duration::ZERO));

        tree.start(id);
        assert_eq!(tree.state(id), Some(ActionState::Succeeded));
        assert_eq!(tree.progress(id).and_then(|p| p.fraction()), Some(1.0));
        while let Ok(event) = events.try_recv() {
            if let ActionEventKind::ProgressChanged { progress } = event.kind {
                assert!(!progress.is_unknown(), "{progress:?}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_time_does_not_count() {
        let mut tree = ActionTree::new();
        let id = tree.add_leaf(ActionInfo::new("wait"), WaitAction::new(Duration::from_secs(2)));
        let began = Instant::now();

        tree.start(id);
        tokio::time::sleep(Duration::from_secs(1)).await;
        tree.process_pending();
        assert!(tree.pause(id));
        assert_eq!(tree.state(id), Some(ActionState::Paused));

        tokio::time::sleep(Duration::from_secs(10)).await;
        tree.process_pending();
        assert_eq!(tree.state(id), Some(ActionState::Paused));

        assert!(tree.resume(id));
        run_until(&mut tree, id, ActionState::Succeeded).await;
        assert_eq!(began.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_timers() {
        let mut tree = ActionTree::new();
        let id = tree.add_leaf(ActionInfo::new("wait"), WaitAction::new(Duration::from_secs(5)));

        tree.start(id);
        assert!(tree.cancel(id));
        assert_eq!(tree.state(id), Some(ActionState::Cancelled));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tree.process_pending();
        assert_eq!(tree.state(id), Some(ActionState::Cancelled));
    }
}
