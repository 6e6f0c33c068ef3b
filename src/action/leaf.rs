//! The leaf side of the action contract.

use super::{ActionContext, LeafMessage};
use std::time::Duration;

/// An action that drives one external operation directly.
///
/// The tree calls the `*_implementation` hooks after it has accepted the
/// corresponding request, so the action is already in `Starting`, `Pausing`,
/// `Resuming` or `Cancelling` when the hook runs. The hook (or a later
/// [`handle_message`](LeafAction::handle_message) call) must eventually report
/// back through the matching notifier on the [`ActionContext`]:
///
/// | request  | state on entry | must eventually call                 |
/// |----------|----------------|--------------------------------------|
/// | start    | `Starting`     | `set_started` (or `set_failed`)      |
/// | pause    | `Pausing`      | `set_paused`                         |
/// | resume   | `Resuming`     | `set_resumed`                        |
/// | cancel   | `Cancelling`   | `set_cancelled` (or `set_failed`)    |
///
/// Synchronous implementations may report before returning.
pub trait LeafAction: Send {
    /// Begin the operation.
    fn start_implementation(&mut self, ctx: &mut ActionContext<'_>);

    /// Stop the operation. Called for any active state.
    fn cancel_implementation(&mut self, ctx: &mut ActionContext<'_>);

    /// Whether `pause()` is currently allowed.
    fn can_pause(&self) -> bool {
        false
    }

    /// Pause the operation. Only called when [`can_pause`](LeafAction::can_pause) is true.
    fn pause_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        ctx.set_paused();
    }

    /// Resume after a pause.
    fn resume_implementation(&mut self, ctx: &mut ActionContext<'_>) {
        ctx.set_resumed();
    }

    /// Duration the operation is known to take before it starts.
    ///
    /// Copied into the action's info when it is added to a tree without one.
    fn expected_duration(&self) -> Option<Duration> {
        None
    }

    /// React to a message posted to this action's mailbox.
    fn handle_message(&mut self, ctx: &mut ActionContext<'_>, message: LeafMessage) {
        let _ = (ctx, message);
    }

    /// Short type name used in completion records.
    fn kind(&self) -> &'static str {
        let name = std::any::type_name::<Self>();
        name.rsplit("::").next().unwrap_or(name)
    }
}
