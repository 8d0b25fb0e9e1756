//! Type-erased messages and mailbox elements.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::actor::{ActorRef, ExitReason};
use crate::error::RequestError;

/// A type-erased message body.
pub struct Message {
    body: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl Message {
    /// Erase a value.
    pub fn new<M: Any + Send>(value: M) -> Self {
        Self {
            body: Box::new(value),
            type_name: std::any::type_name::<M>(),
        }
    }

    /// Id of the erased type, used as the handler key.
    pub fn type_id(&self) -> TypeId {
        (*self.body).type_id()
    }

    /// Rust type name of the erased value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the erased value is an `M`.
    pub fn is<M: Any>(&self) -> bool {
        self.body.is::<M>()
    }

    /// Borrow the value as an `M`.
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }

    /// Recover the value, or get the message back if it is not an `M`.
    pub fn downcast<M: Any>(self) -> Result<M, Message> {
        let type_name = self.type_name;
        match self.body.downcast::<M>() {
            Ok(value) => Ok(*value),
            Err(body) => Err(Message { body, type_name }),
        }
    }

    /// Recover the value or report the mismatch as a request error.
    pub(crate) fn into_response<M: Any>(self) -> Result<M, RequestError> {
        self.downcast::<M>()
            .map_err(|message| RequestError::UnexpectedResponse {
                expected: std::any::type_name::<M>(),
                actual: message.type_name().to_string(),
            })
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Message").field(&self.type_name).finish()
    }
}

const RESPONSE_FLAG: u64 = 1 << 63;

/// Correlation id of a mailbox element.
///
/// `0` marks an asynchronous message. Requests carry a per-actor increasing
/// id; the matching response carries the same id with bit 63 set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    /// Id of a fire-and-forget message.
    pub const ASYNC: MessageId = MessageId(0);

    /// Request id from a sequence number (`seq` must be non-zero).
    pub const fn request(seq: u64) -> Self {
        Self(seq & !RESPONSE_FLAG)
    }

    /// Raw value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is a fire-and-forget message.
    pub const fn is_async(self) -> bool {
        self.0 == 0
    }

    /// Whether this id expects a response.
    pub const fn is_request(self) -> bool {
        self.0 != 0 && self.0 & RESPONSE_FLAG == 0
    }

    /// Whether this id belongs to a response.
    pub const fn is_response(self) -> bool {
        self.0 & RESPONSE_FLAG != 0
    }

    /// Id the response to this request carries.
    pub const fn response_id(self) -> Self {
        Self(self.0 | RESPONSE_FLAG)
    }

    /// Id of the request a response answers.
    pub const fn request_id(self) -> Self {
        Self(self.0 & !RESPONSE_FLAG)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_response() {
            write!(f, "response-{}", self.request_id().0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

static EXTERNAL_REQUESTS: AtomicU64 = AtomicU64::new(1);

/// Request id for asks issued from outside any actor.
pub(crate) fn next_external_request() -> MessageId {
    MessageId::request(EXTERNAL_REQUESTS.fetch_add(1, Ordering::Relaxed))
}

/// One-shot slot answering an ask issued from outside the actor system.
pub(crate) type ReplySlot = oneshot::Sender<Result<Message, RequestError>>;

/// Who receives the response to an element.
pub enum Sender {
    /// Another actor; responses go into its mailbox.
    Actor(ActorRef),
    /// Code outside the actor system waiting on a future.
    Promise(ReplySlot),
}

impl Sender {
    /// The sending actor, if any.
    pub fn actor(&self) -> Option<&ActorRef> {
        match self {
            Sender::Actor(actor) => Some(actor),
            Sender::Promise(_) => None,
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sender::Actor(actor) => f.debug_tuple("Actor").field(&actor.id()).finish(),
            Sender::Promise(_) => f.write_str("Promise"),
        }
    }
}

/// Signals produced by the runtime itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    /// The deadline of the request with this id passed.
    RequestTimeout(MessageId),
    /// The behavior timeout armed with this sequence number fired.
    BehaviorTimeout(u64),
    /// Terminate right away, even while trapping exits or awaiting.
    Kill(ExitReason),
}

/// What an element carries.
#[derive(Debug)]
pub enum Payload {
    /// A user message.
    User(Message),
    /// The outcome of an earlier request.
    Response(Result<Message, RequestError>),
    /// A runtime signal.
    System(SystemMessage),
}

/// Unit of delivery into a mailbox.
#[derive(Debug)]
pub struct MailboxElement {
    /// Who gets the response, if anyone.
    pub sender: Option<Sender>,
    /// Correlation id.
    pub message_id: MessageId,
    /// Remaining forwarding stages; the last entry is the next one.
    pub stages: Vec<ActorRef>,
    /// Contents.
    pub payload: Payload,
}

impl MailboxElement {
    /// Fire-and-forget user message.
    pub fn user(sender: Option<Sender>, message: Message) -> Self {
        Self {
            sender,
            message_id: MessageId::ASYNC,
            stages: Vec::new(),
            payload: Payload::User(message),
        }
    }

    /// User message expecting a response.
    pub fn request(sender: Sender, id: MessageId, message: Message) -> Self {
        Self {
            sender: Some(sender),
            message_id: id,
            stages: Vec::new(),
            payload: Payload::User(message),
        }
    }

    /// Response to the request `request_id`.
    pub fn response(request_id: MessageId, result: Result<Message, RequestError>) -> Self {
        Self {
            sender: None,
            message_id: request_id.response_id(),
            stages: Vec::new(),
            payload: Payload::Response(result),
        }
    }

    /// Runtime signal.
    pub fn system(signal: SystemMessage) -> Self {
        Self {
            sender: None,
            message_id: MessageId::ASYNC,
            stages: Vec::new(),
            payload: Payload::System(signal),
        }
    }

    /// Type name of a user payload, for logs.
    pub fn describe(&self) -> &'static str {
        match &self.payload {
            Payload::User(message) => message.type_name(),
            Payload::Response(_) => "response",
            Payload::System(_) => "system",
        }
    }

    /// Split off where the answer to this element goes.
    ///
    /// Returns `None` for anything but a request with a sender.
    pub(crate) fn take_reply_target(&mut self) -> Option<ReplyTarget> {
        if !self.message_id.is_request() {
            return None;
        }
        let sender = self.sender.take()?;
        Some(ReplyTarget {
            sender,
            id: self.message_id,
            stages: std::mem::take(&mut self.stages),
        })
    }
}

/// Where and how to answer one request.
#[derive(Debug)]
pub(crate) struct ReplyTarget {
    pub(crate) sender: Sender,
    pub(crate) id: MessageId,
    pub(crate) stages: Vec<ActorRef>,
}

impl ReplyTarget {
    /// Deliver `result`.
    ///
    /// A successful result goes to the next stage as a new request carrying
    /// the original sender; with no stages left it goes back to the sender.
    pub(crate) fn deliver(mut self, result: Result<Message, RequestError>) {
        match (result, self.stages.pop()) {
            (Ok(message), Some(next)) => {
                let element = MailboxElement {
                    sender: Some(self.sender),
                    message_id: self.id,
                    stages: self.stages,
                    payload: Payload::User(message),
                };
                // A closed stage bounces the request back to the sender.
                let _ = next.enqueue(element);
            }
            (result, _) => self.respond(result),
        }
    }

    fn respond(self, result: Result<Message, RequestError>) {
        match self.sender {
            Sender::Actor(actor) => {
                if actor.enqueue(MailboxElement::response(self.id, result)).is_err() {
                    tracing::debug!(requester = %actor.id(), "requester gone, response dropped");
                }
            }
            Sender::Promise(slot) => {
                if slot.send(result).is_err() {
                    tracing::debug!(id = %self.id, "ask dropped before the response arrived");
                }
            }
        }
    }
}

/// Answer an undeliverable element: requests get `error`, everything else is
/// dropped.
pub(crate) fn bounce(mut element: MailboxElement, error: RequestError) {
    if let Some(target) = element.take_reply_target() {
        target.respond(Err(error));
    }
}
