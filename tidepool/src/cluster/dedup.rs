//! Batching of one-way calls to a single virtual actor.

use std::any::{Any, TypeId};

use tidepool_core::{JsonCodec, MessageCodec};

use super::protocol::{Args, DISPATCH, DispatchEnvelope};
use crate::directory::{Location, VirtualActor, VirtualRef};
use crate::error::SendError;
use crate::message::Message;

/// Calls collected by [`deduplicate`].
#[derive(Debug)]
pub struct Batch<M> {
    calls: Vec<M>,
}

impl<M> Batch<M> {
    /// Queue `message`; nothing is sent before the batch closes.
    pub fn tell(&mut self, message: M) -> &mut Self {
        self.calls.push(message);
        self
    }

    /// Number of queued calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether nothing was queued.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Collect the messages `fill` queues for `target` and deliver them together.
///
/// When the key is owned by another node the whole batch travels as one
/// packed dispatch frame and is delivered in order on arrival. Locally it
/// is the same as one tell per message. Returns the number of messages
/// sent; an empty batch sends nothing.
///
/// ```rust,no_run
/// # use tidepool::cluster::deduplicate;
/// # use tidepool::directory::VirtualRef;
/// # fn run<A: tidepool::directory::VirtualActor>(counter: VirtualRef<A>) -> Result<(), tidepool::SendError> {
/// let sent = deduplicate(&counter, |batch| {
///     for step in 1..=5u64 {
///         batch.tell(step);
///     }
/// })?;
/// assert_eq!(sent, 5);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Any error of the underlying tells. Remote batches also fail with
/// [`SendError::UnknownHandler`] when `A` has no handler for `M` and with
/// [`SendError::NoRoute`] when the owner is unreachable.
pub fn deduplicate<A, M, F>(target: &VirtualRef<A>, fill: F) -> Result<usize, SendError>
where
    A: VirtualActor,
    M: Any + Send,
    F: FnOnce(&mut Batch<M>),
{
    let mut batch = Batch { calls: Vec::new() };
    fill(&mut batch);
    if batch.is_empty() {
        return Ok(0);
    }
    let count = batch.len();

    match target.locate()? {
        Location::Local(actor) => {
            for message in batch.calls {
                actor.tell(message)?;
            }
        }
        Location::Remote {
            router,
            node,
            vtype,
            key_bytes,
            ..
        } => {
            let wire = vtype
                .handlers
                .by_type(TypeId::of::<M>())
                .ok_or_else(|| SendError::UnknownHandler {
                    actor_type: vtype.name.to_string(),
                    message_type: std::any::type_name::<M>().to_string(),
                })?;
            let calls = batch
                .calls
                .into_iter()
                .map(|message| (wire.encode)(&Message::new(message)))
                .collect::<Result<Vec<_>, _>>()?;
            let envelope = DispatchEnvelope {
                actor_type: vtype.name.to_string(),
                actor_key: key_bytes,
                handler_id: wire.name.to_string(),
                args: Args::Packed(calls),
            };
            router.send(node, DISPATCH, JsonCodec.encode(&envelope)?)?;
            tracing::trace!(actor_type = vtype.name, %node, count, "batch dispatched");
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use tidepool_core::{NetworkAddress, NodeId};

    use super::*;
    use crate::actor::{Actor, Behavior, Context};
    use crate::directory::HandlerTable;
    use crate::scheduler::SchedulerConfig;
    use crate::system::{ActorSystem, RemoteRouter, ReplyCallback};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Add(u64);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct History;

    struct Counter {
        seen: Vec<u64>,
    }

    impl Actor for Counter {
        fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
            Behavior::new()
                .on(|this: &mut Counter, _ctx, Add(value): Add| this.seen.push(value))
                .on(|this: &mut Counter, _ctx, _: History| this.seen.clone())
        }
    }

    impl VirtualActor for Counter {
        type Key = String;
        const TYPE_NAME: &'static str = "counter";

        fn activate(_key: &String) -> Self {
            Counter { seen: Vec::new() }
        }

        fn register(handlers: &mut HandlerTable<Self>) {
            handlers.tell::<Add>("add").ask::<History, Vec<u64>>("history");
        }
    }

    /// Owns every key and records what would go on the wire.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    fn remote() -> NodeId {
        NodeId::new(NetworkAddress::localhost(7100), 1)
    }

    impl RemoteRouter for Recorder {
        fn local_node(&self) -> NodeId {
            NodeId::new(NetworkAddress::localhost(7000), 1)
        }

        fn owner_of(&self, _key_hash: u64) -> Option<NodeId> {
            Some(remote())
        }

        fn send(&self, _node: NodeId, method: u32, payload: Vec<u8>) -> Result<(), SendError> {
            self.sent.lock().push((method, payload));
            Ok(())
        }

        fn call(&self, node: NodeId, _method: u32, _payload: Vec<u8>, on_reply: ReplyCallback) -> Result<(), SendError> {
            let err = SendError::NoRoute { node };
            on_reply(Err(crate::error::RequestError::from(err.clone()).into()));
            Err(err)
        }
    }

    fn system() -> ActorSystem {
        let config = SchedulerConfig::builder()
            .worker_count(2)
            .build()
            .expect("valid config");
        ActorSystem::new(config).expect("system starts")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_batch_is_ordered_tells() {
        let system = system();
        let counter = system.virtual_ref::<Counter>("c".to_string());
        let sent = deduplicate(&counter, |batch| {
            for i in 1..=5 {
                batch.tell(Add(i));
            }
        })
        .expect("batch sent");
        assert_eq!(sent, 5);

        let seen: Vec<u64> = tokio::time::timeout(Duration::from_secs(5), counter.ask(History))
            .await
            .expect("in time")
            .expect("reply");
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        system.shutdown();
    }

    #[test]
    fn test_remote_batch_is_one_packed_frame() {
        let system = system();
        let recorder = Arc::new(Recorder::default());
        let router: Arc<dyn RemoteRouter> = recorder.clone();
        system.set_router(Some(router));

        let counter = system.virtual_ref::<Counter>("c".to_string());
        let sent = deduplicate(&counter, |batch| {
            batch.tell(Add(1)).tell(Add(2)).tell(Add(3));
        })
        .expect("batch sent");
        assert_eq!(sent, 3);

        let frames = recorder.sent.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, DISPATCH);
        let envelope: DispatchEnvelope = JsonCodec.decode(&frames[0].1).expect("envelope");
        assert_eq!(envelope.actor_type, "counter");
        assert_eq!(envelope.handler_id, "add");
        let values: Vec<u64> = envelope
            .args
            .calls()
            .map(|call| JsonCodec.decode::<Add>(call).expect("arg").0)
            .collect();
        assert_eq!(values, vec![1, 2, 3]);

        system.set_router(None);
        system.shutdown();
    }

    #[test]
    fn test_remote_batch_needs_a_handler() {
        let system = system();
        let router: Arc<dyn RemoteRouter> = Arc::new(Recorder::default());
        system.set_router(Some(router));

        let counter = system.virtual_ref::<Counter>("c".to_string());
        let err = deduplicate(&counter, |batch| {
            batch.tell(7u8);
        })
        .expect_err("no handler for u8");
        assert!(matches!(err, SendError::UnknownHandler { .. }));

        assert_eq!(deduplicate(&counter, |_: &mut Batch<Add>| {}), Ok(0));
        system.set_router(None);
        system.shutdown();
    }
}
