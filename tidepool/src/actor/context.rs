//! Per-actor execution context handed to every handler.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::time::Duration;

use tidepool_core::ActorId;

use super::actor_ref::{ActorRef, Attachable, WeakActorRef};
use super::behavior::{Behavior, BehaviorCommand};
use super::exit::{DownMsg, ExitMsg, ExitReason};
use super::Actor;
use crate::error::{RequestError, SendError};
use crate::message::{MailboxElement, Message, MessageId, Payload, ReplyTarget, Sender, SystemMessage};
use crate::scheduler::TimerId;
use crate::system::ActorSystem;

pub(crate) type Continuation<A> =
    Box<dyn FnOnce(&mut A, &mut Context<A>, Result<Message, RequestError>) + Send>;

pub(crate) struct PendingRequest<A: Actor> {
    pub(crate) id: MessageId,
    pub(crate) timer: Option<TimerId>,
    pub(crate) continuation: Continuation<A>,
}

/// Handle through which a running actor talks to the runtime.
///
/// Behavior changes requested through the context take effect after the
/// current handler returns.
pub struct Context<A: Actor> {
    id: ActorId,
    myself: WeakActorRef,
    system: ActorSystem,
    shard: Option<usize>,
    next_request: u64,
    pub(crate) awaited: VecDeque<PendingRequest<A>>,
    pub(crate) multiplexed: HashMap<MessageId, PendingRequest<A>>,
    current: Option<ReplyTarget>,
    current_sender: Option<ActorRef>,
    pub(crate) commands: Vec<BehaviorCommand<A>>,
    pub(crate) quit: Option<ExitReason>,
    trap_exit: bool,
    timeout_seq: u64,
    pub(crate) armed_timeout: Option<(u64, TimerId)>,
}

impl<A: Actor> Context<A> {
    pub(crate) fn new(
        id: ActorId,
        myself: WeakActorRef,
        system: ActorSystem,
        shard: Option<usize>,
    ) -> Self {
        Self {
            id,
            myself,
            system,
            shard,
            next_request: 0,
            awaited: VecDeque::new(),
            multiplexed: HashMap::new(),
            current: None,
            current_sender: None,
            commands: Vec::new(),
            quit: None,
            trap_exit: false,
            timeout_seq: 0,
            armed_timeout: None,
        }
    }

    /// This actor's id.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Strong reference to this actor. `None` only while it is being torn
    /// down after becoming unreachable.
    pub fn myself(&self) -> Option<ActorRef> {
        self.myself.upgrade()
    }

    /// The actor system this actor runs in.
    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Shard the actor is pinned to, if any.
    pub fn shard(&self) -> Option<usize> {
        self.shard
    }

    /// Sender of the message being handled, when it came from an actor.
    pub fn sender(&self) -> Option<&ActorRef> {
        self.current_sender
            .as_ref()
            .or_else(|| self.current.as_ref().and_then(|target| target.sender.actor()))
    }

    /// Spawn a new actor in the same system.
    pub fn spawn<B: Actor>(&self, actor: B) -> ActorRef {
        self.system.spawn(actor)
    }

    /// Send `message` to `target` with this actor as sender.
    ///
    /// # Errors
    ///
    /// See [`ActorRef::tell`].
    pub fn send<M: Any + Send>(&self, target: &ActorRef, message: M) -> Result<(), SendError> {
        let sender = self.myself().map(Sender::Actor);
        target.enqueue(MailboxElement::user(sender, Message::new(message)))
    }

    /// Send `message` to `target` once `delay` elapsed.
    pub fn delayed_send<M: Any + Send>(
        &self,
        target: &ActorRef,
        delay: Duration,
        message: M,
    ) -> TimerId {
        let target = target.clone();
        let sender = self.myself.clone();
        self.system.clock().schedule_after(delay, move || {
            let sender = sender.upgrade().map(Sender::Actor);
            if let Err(err) = target.enqueue(MailboxElement::user(sender, Message::new(message))) {
                tracing::debug!(target = %target.id(), error = %err, "delayed message dropped");
            }
        })
    }

    /// Start a request to `target`; finish it with
    /// [`then`](RequestBuilder::then) or [`awaited`](RequestBuilder::awaited).
    pub fn request<M: Any + Send>(&mut self, target: &ActorRef, message: M) -> RequestBuilder<'_, A> {
        RequestBuilder {
            ctx: self,
            target: target.clone(),
            message: Message::new(message),
            timeout: None,
            stages: Vec::new(),
        }
    }

    /// Forward `message` to `target`, handing over the current sender and
    /// request id; `target` answers the original requester.
    ///
    /// # Errors
    ///
    /// See [`ActorRef::tell`]. A failed delegation answers the requester with
    /// [`RequestError::ReceiverDown`].
    pub fn delegate<M: Any + Send>(&mut self, target: &ActorRef, message: M) -> Result<(), SendError> {
        let element = match self.current.take() {
            Some(reply) => MailboxElement {
                sender: Some(reply.sender),
                message_id: reply.id,
                stages: reply.stages,
                payload: Payload::User(Message::new(message)),
            },
            None => MailboxElement::user(
                self.current_sender.clone().map(Sender::Actor),
                Message::new(message),
            ),
        };
        target.enqueue(element)
    }

    /// Take over the response to the current request.
    ///
    /// The handler's return value is then ignored; the response is whatever
    /// is passed to [`ResponsePromise::deliver`]. For plain messages the
    /// promise is inert.
    pub fn response_promise<R: Any + Send>(&mut self) -> ResponsePromise<R> {
        ResponsePromise {
            target: self.current.take(),
            _response: PhantomData,
        }
    }

    /// Replace the active behavior.
    pub fn set_behavior(&mut self, behavior: Behavior<A>) {
        self.commands.push(BehaviorCommand::Replace(behavior));
    }

    /// Push a behavior, keeping the current one underneath.
    pub fn push_behavior(&mut self, behavior: Behavior<A>) {
        self.commands.push(BehaviorCommand::Push(behavior));
    }

    /// Return to the previous behavior. An actor whose stack runs empty with
    /// no request outstanding terminates normally.
    pub fn unbecome(&mut self) {
        self.commands.push(BehaviorCommand::Pop);
    }

    /// Terminate after the current handler returns.
    pub fn quit(&mut self, reason: ExitReason) {
        self.quit.get_or_insert(reason);
    }

    /// Receive [`ExitMsg`] as a regular message instead of dying with abnormal
    /// peers.
    pub fn trap_exit(&mut self, trap: bool) {
        self.trap_exit = trap;
    }

    pub(crate) fn traps_exit(&self) -> bool {
        self.trap_exit
    }

    /// Get a [`DownMsg`] when `target` terminates. Monitoring an actor that
    /// is already gone, or a proxy for a virtual actor on another node,
    /// delivers the message right away.
    pub fn monitor(&self, target: &ActorRef) {
        if let Err(attachable) = target.attach(Attachable::Monitor(self.myself.clone())) {
            let reason = target.exit_reason().unwrap_or(ExitReason::Unreachable);
            attachable.notify(target.id(), &reason);
        }
    }

    /// Stop monitoring `target`.
    pub fn demonitor(&self, target: &ActorRef) {
        target.detach(self.id);
    }

    /// Link with `target`: whichever terminates first sends an [`ExitMsg`] to
    /// the other.
    pub fn link(&self, target: &ActorRef) {
        if let Err(attachable) = target.attach(Attachable::Link(self.myself.clone())) {
            let reason = target.exit_reason().unwrap_or(ExitReason::Unreachable);
            attachable.notify(target.id(), &reason);
            return;
        }
        if let Some(me) = self.myself()
            && me.attach(Attachable::Link(target.downgrade())).is_err()
        {
            tracing::debug!(actor = %self.id, "linking while terminating");
        }
    }

    /// Remove a link in both directions.
    pub fn unlink(&self, target: &ActorRef) {
        target.detach(self.id);
        if let Some(me) = self.myself() {
            me.detach(target.id());
        }
    }

    /// Requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.awaited.len() + self.multiplexed.len()
    }

    /// Whether an awaited request blocks regular messages.
    pub fn is_awaiting(&self) -> bool {
        !self.awaited.is_empty()
    }

    fn next_request_id(&mut self) -> MessageId {
        self.next_request += 1;
        MessageId::request(self.next_request)
    }

    pub(crate) fn begin(&mut self, reply: Option<ReplyTarget>, sender: Option<Sender>) {
        self.current = reply;
        self.current_sender = match sender {
            Some(Sender::Actor(actor)) => Some(actor),
            _ => None,
        };
    }

    /// Answer the current request with `reply` unless someone took over.
    pub(crate) fn finish(&mut self, reply: Message) {
        self.current_sender = None;
        if let Some(target) = self.current.take() {
            target.deliver(Ok(reply));
        }
    }

    /// Arm the behavior timeout, replacing any armed one.
    pub(crate) fn arm_timeout(&mut self, after: Option<Duration>) {
        if let Some((_, timer)) = self.armed_timeout.take() {
            self.system.clock().cancel(timer);
        }
        let Some(after) = after else {
            return;
        };
        self.timeout_seq += 1;
        let seq = self.timeout_seq;
        let myself = self.myself.clone();
        let timer = self.system.clock().schedule_after(after, move || {
            if let Some(me) = myself.upgrade() {
                let _ = me.enqueue(MailboxElement::system(SystemMessage::BehaviorTimeout(seq)));
            }
        });
        self.armed_timeout = Some((seq, timer));
    }

    pub(crate) fn cancel_timer(&self, timer: Option<TimerId>) {
        if let Some(timer) = timer {
            self.system.clock().cancel(timer);
        }
    }

    /// Cancel every timer and forget pending requests.
    pub(crate) fn reset(&mut self) {
        self.arm_timeout(None);
        let pending: Vec<_> = self
            .awaited
            .drain(..)
            .chain(self.multiplexed.drain().map(|(_, pending)| pending))
            .collect();
        for request in pending {
            self.cancel_timer(request.timer);
        }
        self.commands.clear();
        if let Some(target) = self.current.take() {
            target.deliver(Err(RequestError::ReceiverDown));
        }
        self.current_sender = None;
    }
}

impl<A: Actor> std::fmt::Debug for Context<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("shard", &self.shard)
            .field("awaited", &self.awaited.len())
            .field("multiplexed", &self.multiplexed.len())
            .finish()
    }
}

/// A request being configured; see [`Context::request`].
#[must_use = "the request is only sent by `then` or `awaited`"]
pub struct RequestBuilder<'a, A: Actor> {
    ctx: &'a mut Context<A>,
    target: ActorRef,
    message: Message,
    timeout: Option<Duration>,
    stages: Vec<ActorRef>,
}

impl<A: Actor> RequestBuilder<'_, A> {
    /// Fail with [`RequestError::Timeout`] if no response arrives in time.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Route the result through `stages` before it returns: the target's
    /// response becomes a request to the first stage, whose response goes to
    /// the next one, and the last stage answers this actor.
    pub fn through(mut self, stages: Vec<ActorRef>) -> Self {
        self.stages = stages;
        self.stages.reverse();
        self
    }

    /// Multiplexed: `handler` runs when the response arrives, in any order
    /// relative to other requests, while regular messages keep flowing.
    pub fn then<R, F>(self, handler: F) -> MessageId
    where
        R: Any + Send,
        F: FnOnce(&mut A, &mut Context<A>, Result<R, RequestError>) + Send + 'static,
    {
        self.send(false, handler)
    }

    /// Awaited: regular messages are deferred until the response arrives,
    /// and awaited responses complete strictly in issue order.
    pub fn awaited<R, F>(self, handler: F) -> MessageId
    where
        R: Any + Send,
        F: FnOnce(&mut A, &mut Context<A>, Result<R, RequestError>) + Send + 'static,
    {
        self.send(true, handler)
    }

    fn send<R, F>(self, awaited: bool, handler: F) -> MessageId
    where
        R: Any + Send,
        F: FnOnce(&mut A, &mut Context<A>, Result<R, RequestError>) + Send + 'static,
    {
        let RequestBuilder {
            ctx,
            target,
            message,
            timeout,
            stages,
        } = self;
        let id = ctx.next_request_id();
        let continuation: Continuation<A> = Box::new(move |actor, ctx, result| {
            handler(actor, ctx, result.and_then(Message::into_response::<R>));
        });

        let timer = timeout.map(|after| {
            let myself = ctx.myself.clone();
            ctx.system.clock().schedule_after(after, move || {
                if let Some(me) = myself.upgrade() {
                    let _ = me.enqueue(MailboxElement::system(SystemMessage::RequestTimeout(id)));
                }
            })
        });
        let pending = PendingRequest {
            id,
            timer,
            continuation,
        };
        if awaited {
            ctx.awaited.push_back(pending);
        } else {
            ctx.multiplexed.insert(id, pending);
        }

        let Some(me) = ctx.myself() else {
            return id;
        };
        let element = MailboxElement {
            sender: Some(Sender::Actor(me)),
            message_id: id,
            stages,
            payload: Payload::User(message),
        };
        // On failure the target already bounced a ReceiverDown response to us.
        if let Err(err) = target.enqueue(element) {
            tracing::debug!(actor = %ctx.id, target = %target.id(), error = %err, "request not delivered");
        }
        id
    }
}

/// Deferred response to a request; see [`Context::response_promise`].
///
/// Dropping an undelivered promise answers [`RequestError::BrokenPromise`].
#[must_use = "dropping a promise answers the request with BrokenPromise"]
pub struct ResponsePromise<R> {
    target: Option<ReplyTarget>,
    _response: PhantomData<fn(R)>,
}

impl<R: Any + Send> ResponsePromise<R> {
    /// Whether a requester is still waiting on this promise.
    pub fn is_pending(&self) -> bool {
        self.target.is_some()
    }

    /// Answer with `value`.
    pub fn deliver(mut self, value: R) {
        if let Some(target) = self.target.take() {
            target.deliver(Ok(Message::new(value)));
        }
    }

    /// Answer with an error.
    pub fn fail(mut self, error: RequestError) {
        if let Some(target) = self.target.take() {
            target.deliver(Err(error));
        }
    }
}

impl<R> Drop for ResponsePromise<R> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.deliver(Err(RequestError::BrokenPromise));
        }
    }
}

impl<R> std::fmt::Debug for ResponsePromise<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsePromise")
            .field("pending", &self.target.is_some())
            .finish()
    }
}

/// Whether `message` is one of the runtime's lifecycle signals.
pub(crate) fn is_lifecycle_signal(message: &Message) -> bool {
    message.is::<DownMsg>() || message.is::<ExitMsg>()
}
