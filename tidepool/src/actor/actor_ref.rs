//! Strong and weak actor handles.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use tidepool_core::{ActorId, NodeId};
use tokio::sync::oneshot;

use super::exit::{DownMsg, ExitMsg, ExitReason};
use crate::error::{RequestError, SendError};
use crate::message::{MailboxElement, Message, Sender, next_external_request};

/// Anything a reference can point at: local cells and remote proxies.
pub(crate) trait AbstractActor: Send + Sync + 'static {
    fn id(&self) -> ActorId;

    /// Hosting node for proxies, `None` for local actors.
    fn node(&self) -> Option<NodeId> {
        None
    }

    fn type_name(&self) -> &'static str;

    /// Deliver an element. On failure the implementation has already answered
    /// a request element with an error.
    fn enqueue(&self, element: MailboxElement) -> Result<(), SendError>;

    /// Register an observer. Returns it back when already terminated.
    fn attach(&self, attachable: Attachable) -> Result<(), Attachable>;

    /// Remove every observer registered by `observer`.
    fn detach(&self, observer: ActorId);

    fn exit_reason(&self) -> Option<ExitReason>;
}

/// Observer notified once when an actor terminates.
pub(crate) enum Attachable {
    Monitor(WeakActorRef),
    Link(WeakActorRef),
}

impl Attachable {
    pub(crate) fn observer(&self) -> ActorId {
        match self {
            Attachable::Monitor(observer) | Attachable::Link(observer) => observer.id(),
        }
    }

    pub(crate) fn notify(self, source: ActorId, reason: &ExitReason) {
        let (observer, message) = match self {
            Attachable::Monitor(observer) => (
                observer,
                Message::new(DownMsg {
                    source,
                    reason: reason.clone(),
                }),
            ),
            Attachable::Link(observer) => (
                observer,
                Message::new(ExitMsg {
                    source,
                    reason: reason.clone(),
                }),
            ),
        };
        if let Some(observer) = observer.upgrade() {
            let _ = observer.enqueue(MailboxElement::user(None, message));
        }
    }
}

/// Strong, cloneable handle to an actor.
///
/// Local actors stay alive while a strong reference exists; once the last
/// one is dropped an idle actor terminates with [`ExitReason::Unreachable`].
/// References to remote actors are backed by proxies.
#[derive(Clone)]
pub struct ActorRef {
    inner: Arc<dyn AbstractActor>,
}

impl ActorRef {
    pub(crate) fn from_arc(inner: Arc<dyn AbstractActor>) -> Self {
        Self { inner }
    }

    pub(crate) fn enqueue(&self, element: MailboxElement) -> Result<(), SendError> {
        self.inner.enqueue(element)
    }

    pub(crate) fn attach(&self, attachable: Attachable) -> Result<(), Attachable> {
        self.inner.attach(attachable)
    }

    pub(crate) fn detach(&self, observer: ActorId) {
        self.inner.detach(observer);
    }

    /// Process-unique id on the hosting node.
    pub fn id(&self) -> ActorId {
        self.inner.id()
    }

    /// Hosting node when this refers to a remote actor.
    pub fn node(&self) -> Option<NodeId> {
        self.inner.node()
    }

    /// Whether this refers to a remote actor.
    pub fn is_remote(&self) -> bool {
        self.node().is_some()
    }

    /// Rust type name of the actor, or the proxy kind for remote actors.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name()
    }

    /// Exit reason once terminated.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.inner.exit_reason()
    }

    /// Whether the actor has terminated.
    pub fn is_terminated(&self) -> bool {
        self.exit_reason().is_some()
    }

    /// Send a message without sender.
    ///
    /// # Errors
    ///
    /// [`SendError::QueueClosed`] when the actor terminated; remote
    /// references may also fail with routing or serialization errors.
    pub fn tell<M: Any + Send>(&self, message: M) -> Result<(), SendError> {
        self.enqueue(MailboxElement::user(None, Message::new(message)))
    }

    /// Send a request from outside the actor system.
    ///
    /// The returned [`Ask`] resolves with the handler's return value. A send
    /// failure resolves it with [`RequestError::ReceiverDown`] or
    /// [`RequestError::Remote`].
    pub fn ask<R: Any + Send, M: Any + Send>(&self, message: M) -> Ask<R> {
        let (tx, rx) = oneshot::channel();
        let element =
            MailboxElement::request(Sender::Promise(tx), next_external_request(), Message::new(message));
        if let Err(err) = self.enqueue(element) {
            tracing::debug!(actor = %self.id(), error = %err, "ask not delivered");
        }
        Ask::new(rx)
    }

    /// Ask the actor to terminate with `reason`, as if a linked peer died.
    ///
    /// # Errors
    ///
    /// [`SendError::QueueClosed`] when it already terminated.
    pub fn send_exit(&self, reason: ExitReason) -> Result<(), SendError> {
        self.tell(ExitMsg {
            source: self.id(),
            reason,
        })
    }

    /// Weak handle that does not keep the actor alive.
    pub fn downgrade(&self) -> WeakActorRef {
        WeakActorRef {
            id: self.id(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn key(&self) -> (Option<NodeId>, ActorId) {
        (self.node(), self.id())
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ActorRef {}

impl std::hash::Hash for ActorRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl std::fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ActorRef");
        debug.field("id", &self.id()).field("type", &self.type_name());
        if let Some(node) = self.node() {
            debug.field("node", &node);
        }
        debug.finish()
    }
}

/// Weak actor handle, used by observers and timers.
#[derive(Clone)]
pub struct WeakActorRef {
    id: ActorId,
    inner: Weak<dyn AbstractActor>,
}

impl WeakActorRef {
    pub(crate) fn new(id: ActorId, inner: Weak<dyn AbstractActor>) -> Self {
        Self { id, inner }
    }

    /// Id of the referenced actor, available even after it is gone.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Strong handle, if the actor is still referenced elsewhere.
    pub fn upgrade(&self) -> Option<ActorRef> {
        self.inner.upgrade().map(ActorRef::from_arc)
    }

    /// Whether the actor is still referenced and has not terminated.
    pub fn is_alive(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|actor| actor.exit_reason().is_none())
    }
}

impl std::fmt::Debug for WeakActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakActorRef").field(&self.id).finish()
    }
}

/// Pending response to [`ActorRef::ask`].
///
/// Await it from async code or call [`blocking`](Self::blocking) from a plain
/// thread.
#[must_use = "an ask does nothing unless its response is awaited"]
pub struct Ask<R> {
    rx: oneshot::Receiver<Result<Message, RequestError>>,
    _response: PhantomData<fn() -> R>,
}

impl<R: Any + Send> Ask<R> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Message, RequestError>>) -> Self {
        Self {
            rx,
            _response: PhantomData,
        }
    }

    /// An ask that already failed before anything was sent.
    pub(crate) fn failed(error: RequestError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::new(rx)
    }

    /// Wait on the current thread. Must not be called from async code.
    ///
    /// # Errors
    ///
    /// The request's [`RequestError`].
    pub fn blocking(self) -> Result<R, RequestError> {
        Self::finish(self.rx.blocking_recv())
    }

    /// Wait with a deadline.
    ///
    /// # Errors
    ///
    /// [`RequestError::Timeout`] when `timeout` elapses first.
    pub async fn timeout(self, timeout: std::time::Duration) -> Result<R, RequestError> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Timeout),
        }
    }

    fn finish(
        received: Result<Result<Message, RequestError>, oneshot::error::RecvError>,
    ) -> Result<R, RequestError> {
        match received {
            Ok(result) => result.and_then(Message::into_response::<R>),
            // The element was dropped without being answered.
            Err(_) => Err(RequestError::BrokenPromise),
        }
    }
}

impl<R: Any + Send> Future for Ask<R> {
    type Output = Result<R, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Self::finish)
    }
}
