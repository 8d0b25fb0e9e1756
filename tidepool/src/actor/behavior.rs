//! Handler tables and the behavior stack.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::time::Duration;

use super::{Actor, Context};
use crate::message::Message;

pub(crate) type Handler<A> = Box<dyn FnMut(&mut A, &mut Context<A>, Message) -> Message + Send>;
pub(crate) type TimeoutHandler<A> = Box<dyn FnMut(&mut A, &mut Context<A>) + Send>;

/// The set of message handlers an actor currently answers with.
///
/// Handlers are keyed by message type. The value a handler returns is sent
/// back automatically when the message was a request; for plain messages it
/// is discarded.
///
/// ```rust
/// use tidepool::actor::{Actor, Behavior, Context};
///
/// struct Counter { value: u64 }
/// struct Increment;
/// struct Get;
///
/// impl Actor for Counter {
///     fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
///         Behavior::new()
///             .on(|this: &mut Counter, _ctx, _: Increment| this.value += 1)
///             .on(|this: &mut Counter, _ctx, _: Get| this.value)
///     }
/// }
/// ```
pub struct Behavior<A: Actor> {
    handlers: HashMap<TypeId, Handler<A>>,
    timeout: Option<(Duration, TimeoutHandler<A>)>,
}

impl<A: Actor> Default for Behavior<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Actor> Behavior<A> {
    /// Behavior without handlers.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: None,
        }
    }

    /// Handle messages of type `M`. A later registration for the same type
    /// replaces the earlier one.
    pub fn on<M, R, F>(mut self, mut handler: F) -> Self
    where
        M: Any + Send,
        R: Any + Send,
        F: FnMut(&mut A, &mut Context<A>, M) -> R + Send + 'static,
    {
        let erased: Handler<A> = Box::new(move |actor, ctx, message| {
            match message.downcast::<M>() {
                Ok(message) => Message::new(handler(actor, ctx, message)),
                // The table is keyed by type id, so this cannot happen.
                Err(message) => message,
            }
        });
        self.handlers.insert(TypeId::of::<M>(), erased);
        self
    }

    /// Run `handler` when no message arrived for `after`. The timer restarts
    /// after every handled message and after each timeout.
    pub fn after<F>(mut self, after: Duration, handler: F) -> Self
    where
        F: FnMut(&mut A, &mut Context<A>) + Send + 'static,
    {
        self.timeout = Some((after, Box::new(handler)));
        self
    }

    /// Whether a handler for `M` is registered.
    pub fn handles<M: Any>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<M>())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler and no timeout is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.timeout.is_none()
    }

    /// Idle timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_ref().map(|(after, _)| *after)
    }

    pub(crate) fn handler_mut(&mut self, type_id: TypeId) -> Option<&mut Handler<A>> {
        self.handlers.get_mut(&type_id)
    }

    pub(crate) fn timeout_handler_mut(&mut self) -> Option<&mut TimeoutHandler<A>> {
        self.timeout.as_mut().map(|(_, handler)| handler)
    }
}

impl<A: Actor> std::fmt::Debug for Behavior<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("handlers", &self.handlers.len())
            .field("timeout", &self.timeout())
            .finish()
    }
}

/// LIFO stack of behaviors; only the top one is active.
pub(crate) struct BehaviorStack<A: Actor> {
    stack: Vec<Behavior<A>>,
}

impl<A: Actor> BehaviorStack<A> {
    pub(crate) fn new() -> Self {
        Self { stack: Vec::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn push(&mut self, behavior: Behavior<A>) {
        self.stack.push(behavior);
    }

    /// Swap the top for `behavior`, returning the erased one.
    pub(crate) fn replace(&mut self, behavior: Behavior<A>) -> Option<Behavior<A>> {
        let erased = self.stack.pop();
        self.stack.push(behavior);
        erased
    }

    pub(crate) fn pop(&mut self) -> Option<Behavior<A>> {
        self.stack.pop()
    }

    pub(crate) fn active_timeout(&self) -> Option<Duration> {
        self.stack.last().and_then(Behavior::timeout)
    }

    pub(crate) fn handler_mut(&mut self, type_id: TypeId) -> Option<&mut Handler<A>> {
        self.stack.last_mut()?.handler_mut(type_id)
    }

    pub(crate) fn timeout_handler_mut(&mut self) -> Option<&mut TimeoutHandler<A>> {
        self.stack.last_mut()?.timeout_handler_mut()
    }
}

/// Deferred change to the behavior stack, applied after the running handler
/// returns.
pub(crate) enum BehaviorCommand<A: Actor> {
    Replace(Behavior<A>),
    Push(Behavior<A>),
    Pop,
}
