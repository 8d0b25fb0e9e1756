//! Actors, their behaviors and the handles used to reach them.

mod actor_ref;
mod behavior;
pub(crate) mod cell;
mod context;
mod exit;
mod scheduled;

pub(crate) use actor_ref::{AbstractActor, Attachable};
pub use actor_ref::{ActorRef, Ask, WeakActorRef};
pub use behavior::Behavior;
pub use context::{Context, RequestBuilder, ResponsePromise};
pub use exit::{DownMsg, ExitMsg, ExitReason};

use crate::message::Message;

/// What to do with a message no active handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultAction {
    /// Keep it; it is retried after the next behavior change or completed
    /// request.
    #[default]
    Skip,
    /// Discard it. Requests are answered with `RequestError::Unhandled`.
    Drop,
}

/// Core actor trait.
///
/// An actor is plain state plus the [`Behavior`] it answers with. The runtime
/// runs at most one handler of an actor at a time, so handlers take
/// `&mut self` without any locking on the user side.
///
/// # Lifecycle
///
/// ```text
/// [spawned] → behavior() → handlers … → quit / panic / exit signal / unreachable → on_exit()
/// ```
///
/// # Example
///
/// ```rust
/// use tidepool::actor::{Actor, Behavior, Context, ExitReason};
///
/// struct Greeter;
///
/// impl Actor for Greeter {
///     fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
///         Behavior::new().on(|_: &mut Greeter, ctx: &mut Context<Greeter>, name: String| {
///             if name.is_empty() {
///                 ctx.quit(ExitReason::Normal);
///             }
///             format!("hello {name}")
///         })
///     }
/// }
/// ```
pub trait Actor: Send + Sized + 'static {
    /// Initial behavior, called once when the actor is spawned.
    fn behavior(&mut self, ctx: &mut Context<Self>) -> Behavior<Self>;

    /// Called exactly once on termination, before monitors and links are
    /// notified.
    fn on_exit(&mut self, _ctx: &mut Context<Self>, _reason: &ExitReason) {}

    /// Decide the fate of a message without handler in the active behavior.
    fn default_handler(&mut self, _ctx: &mut Context<Self>, _message: &Message) -> DefaultAction {
        DefaultAction::Skip
    }
}
