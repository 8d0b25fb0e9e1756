//! Delivery of inbound envelopes into the local actor system.

use tidepool_core::{ActorId, JsonCodec, MessageCodec};
use tidepool_transport::ReplyError;
use tokio::sync::oneshot;

use super::messages::{MessageRegistry, WireMessage};
use super::protocol::{ActorEnvelope, Args, DispatchEnvelope};
use crate::actor::ActorRef;
use crate::error::{RequestError, SendError};
use crate::message::{MailboxElement, Message, Sender, next_external_request};
use crate::system::ActorSystem;

type Target = (ActorRef, std::sync::Arc<WireMessage>);

fn resolve_virtual(system: &ActorSystem, envelope: &DispatchEnvelope) -> Result<Target, SendError> {
    let vtype = system
        .virtual_type_by_name(&envelope.actor_type)
        .ok_or_else(|| SendError::UnknownActorType {
            type_name: envelope.actor_type.clone(),
        })?;
    let wire = vtype
        .handlers
        .by_id(&envelope.handler_id)
        .cloned()
        .ok_or_else(|| SendError::UnknownHandler {
            actor_type: envelope.actor_type.clone(),
            message_type: envelope.handler_id.clone(),
        })?;
    let actor = vtype.local_instance(system, &envelope.actor_key)?;
    Ok((actor, wire))
}

fn resolve_published(
    system: &ActorSystem,
    messages: &MessageRegistry,
    envelope: &ActorEnvelope,
) -> Result<Target, SendError> {
    let wire = messages
        .by_tag(&envelope.tag)
        .cloned()
        .ok_or_else(|| SendError::UnknownHandler {
            actor_type: format!("actor {}", envelope.actor),
            message_type: envelope.tag.clone(),
        })?;
    let actor = system
        .registry()
        .get(envelope.actor)
        .ok_or(SendError::QueueClosed)?;
    Ok((actor, wire))
}

/// Deliver every call of a one-way dispatch, in order.
pub(crate) fn dispatch(system: &ActorSystem, payload: &[u8]) -> Result<usize, SendError> {
    let envelope: DispatchEnvelope = JsonCodec.decode(payload)?;
    let (actor, wire) = resolve_virtual(system, &envelope)?;
    for call in envelope.args.calls() {
        let message = (wire.decode)(call)?;
        actor.enqueue(MailboxElement::user(None, message))?;
    }
    Ok(envelope.args.len())
}

/// Run a dispatched request and encode its response.
pub(crate) async fn dispatch_ask(system: &ActorSystem, payload: &[u8]) -> Result<Vec<u8>, ReplyError> {
    let envelope: DispatchEnvelope = JsonCodec.decode(payload)?;
    let Args::Single(call) = &envelope.args else {
        return Err(ReplyError::Serialization {
            message: "requests carry exactly one argument".to_string(),
        });
    };
    let (actor, wire) = resolve_virtual(system, &envelope).map_err(reply_error)?;
    ask(&actor, &wire, call).await
}

/// Deliver a message for a published actor.
pub(crate) fn actor_message(
    system: &ActorSystem,
    messages: &MessageRegistry,
    payload: &[u8],
) -> Result<(), SendError> {
    let envelope: ActorEnvelope = JsonCodec.decode(payload)?;
    let (actor, wire) = resolve_published(system, messages, &envelope)?;
    let message = (wire.decode)(&envelope.payload)?;
    actor.enqueue(MailboxElement::user(None, message))
}

/// Run a request for a published actor and encode its response.
pub(crate) async fn actor_ask(
    system: &ActorSystem,
    messages: &MessageRegistry,
    payload: &[u8],
) -> Result<Vec<u8>, ReplyError> {
    let envelope: ActorEnvelope = JsonCodec.decode(payload)?;
    let (actor, wire) = resolve_published(system, messages, &envelope).map_err(reply_error)?;
    ask(&actor, &wire, &envelope.payload).await
}

/// Id of the actor published under the requested name.
pub(crate) fn whereis(system: &ActorSystem, payload: &[u8]) -> Result<Vec<u8>, ReplyError> {
    let name: String = JsonCodec.decode(payload)?;
    let id: Option<ActorId> = system.whereis(&name).map(|actor| actor.id());
    Ok(JsonCodec.encode(&id)?)
}

async fn ask(actor: &ActorRef, wire: &WireMessage, call: &[u8]) -> Result<Vec<u8>, ReplyError> {
    let message = (wire.decode)(call)?;
    let response = request(actor, message).await.map_err(ReplyError::from)?;
    Ok((wire.encode_response)(response)?)
}

async fn request(actor: &ActorRef, message: Message) -> Result<Message, RequestError> {
    let (tx, rx) = oneshot::channel();
    let element = MailboxElement::request(Sender::Promise(tx), next_external_request(), message);
    // A failed enqueue has already answered the promise.
    let _ = actor.enqueue(element);
    rx.await.unwrap_or(Err(RequestError::BrokenPromise))
}

fn reply_error(err: SendError) -> ReplyError {
    ReplyError::from(RequestError::from(err))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::actor::{Actor, Behavior, Context};
    use crate::directory::{HandlerTable, VirtualActor};
    use crate::scheduler::SchedulerConfig;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Append(u32);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Read;

    struct Log {
        entries: Vec<u32>,
    }

    impl Actor for Log {
        fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
            Behavior::new()
                .on(|this: &mut Log, _ctx, Append(value): Append| this.entries.push(value))
                .on(|this: &mut Log, _ctx, _: Read| this.entries.clone())
        }
    }

    impl VirtualActor for Log {
        type Key = String;
        const TYPE_NAME: &'static str = "log";

        fn activate(_key: &String) -> Self {
            Log { entries: Vec::new() }
        }

        fn register(handlers: &mut HandlerTable<Self>) {
            handlers.tell::<Append>("append").ask::<Read, Vec<u32>>("read");
        }
    }

    fn system() -> ActorSystem {
        let config = SchedulerConfig::builder()
            .worker_count(2)
            .build()
            .expect("valid config");
        let system = ActorSystem::new(config).expect("system starts");
        system.register_virtual::<Log>();
        system
    }

    fn envelope(handler: &str, args: Args) -> Vec<u8> {
        JsonCodec
            .encode(&DispatchEnvelope {
                actor_type: "log".to_string(),
                actor_key: JsonCodec.encode(&"a".to_string()).expect("key"),
                handler_id: handler.to_string(),
                args,
            })
            .expect("envelope")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_packed_dispatch_delivers_in_order() {
        let system = system();
        let calls = (0..5)
            .map(|i| JsonCodec.encode(&Append(i)).expect("arg"))
            .collect();
        let delivered = dispatch(&system, &envelope("append", Args::Packed(calls))).expect("dispatched");
        assert_eq!(delivered, 5);

        let read = JsonCodec.encode(&Read).expect("arg");
        let reply = dispatch_ask(&system, &envelope("read", Args::Single(read)))
            .await
            .expect("reply");
        let entries: Vec<u32> = JsonCodec.decode(&reply).expect("decode");
        assert_eq!(entries, vec![0, 1, 2, 3, 4]);
        system.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_type_and_handler() {
        let system = system();
        let mut unknown = DispatchEnvelope {
            actor_type: "nope".to_string(),
            actor_key: Vec::new(),
            handler_id: "append".to_string(),
            args: Args::Single(Vec::new()),
        };
        let err = dispatch(&system, &JsonCodec.encode(&unknown).expect("encode"))
            .expect_err("unknown type");
        assert!(matches!(err, SendError::UnknownActorType { .. }));

        unknown.actor_type = "log".to_string();
        unknown.handler_id = "truncate".to_string();
        let err = dispatch(&system, &JsonCodec.encode(&unknown).expect("encode"))
            .expect_err("unknown handler");
        assert!(matches!(err, SendError::UnknownHandler { .. }));
        system.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_whereis_reports_published_id() {
        let system = system();
        let actor = system.local_actor::<Log>(&"b".to_string()).expect("actor");
        system.register_named("log-b", &actor);
        let reply = whereis(&system, &JsonCodec.encode(&"log-b").expect("name")).expect("reply");
        let id: Option<ActorId> = JsonCodec.decode(&reply).expect("decode");
        assert_eq!(id, Some(actor.id()));
        system.shutdown();
    }
}
