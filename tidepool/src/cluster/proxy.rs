//! Local stand-ins for actors living on other nodes.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tidepool_core::{ActorId, JsonCodec, MessageCodec, NodeId};
use tidepool_transport::ReplyError;

use super::messages::{MessageRegistry, WireMessage};
use super::protocol::{
    ACTOR_ASK, ACTOR_MESSAGE, ActorEnvelope, Args, DISPATCH, DISPATCH_ASK, DispatchEnvelope,
};
use crate::actor::{AbstractActor, ActorRef, Attachable, ExitReason};
use crate::directory::VirtualType;
use crate::error::{RequestError, SendError};
use crate::message::{MailboxElement, Message, Payload, bounce};
use crate::registry::ProxyRegistry;
use crate::system::RemoteRouter;

/// Serialize one element and hand it to the router.
///
/// Requests become calls whose reply is decoded with `wire` and delivered to
/// the requester; everything else becomes a one-way frame. On failure a
/// request has already been answered with the error.
fn forward(
    router: &dyn RemoteRouter,
    node: NodeId,
    mut element: MailboxElement,
    wire: &Arc<WireMessage>,
    oneway: u32,
    call: u32,
    envelope: impl FnOnce(Vec<u8>) -> Result<Vec<u8>, SendError>,
) -> Result<(), SendError> {
    let reply = element.take_reply_target();
    let encoded = match &element.payload {
        Payload::User(message) => (wire.encode)(message)
            .map_err(SendError::from)
            .and_then(envelope),
        _ => return Ok(()),
    };
    let payload = match encoded {
        Ok(payload) => payload,
        Err(err) => {
            if let Some(target) = reply {
                target.deliver(Err(err.clone().into()));
            }
            return Err(err);
        }
    };
    match reply {
        None => router.send(node, oneway, payload),
        Some(target) => {
            let wire = wire.clone();
            router.call(
                node,
                call,
                payload,
                Box::new(move |result| target.deliver(decode_reply(&wire, result))),
            )
        }
    }
}

fn decode_reply(wire: &WireMessage, result: Result<Vec<u8>, ReplyError>) -> Result<Message, RequestError> {
    let bytes = result?;
    (wire.decode_response)(&bytes).map_err(|err| RequestError::Remote(err.into()))
}

fn user_message(element: &MailboxElement) -> Option<&Message> {
    match &element.payload {
        Payload::User(message) => Some(message),
        _ => None,
    }
}

/// Proxy for a published actor on another node.
///
/// Messages of types registered in the node's [`MessageRegistry`] are
/// serialized and shipped; anything else is rejected. Observers are notified
/// only when the proxy is killed, which happens when the hosting node
/// disconnects.
pub(crate) struct ActorProxy {
    node: NodeId,
    id: ActorId,
    router: Weak<dyn RemoteRouter>,
    registry: Weak<ProxyRegistry>,
    messages: Arc<MessageRegistry>,
    state: Mutex<ProxyState>,
}

#[derive(Default)]
struct ProxyState {
    exit_reason: Option<ExitReason>,
    attachables: Vec<Attachable>,
}

impl std::fmt::Debug for ActorProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorProxy")
            .field("node", &self.node)
            .field("id", &self.id)
            .finish()
    }
}

impl ActorProxy {
    pub(crate) fn new(
        node: NodeId,
        id: ActorId,
        router: Weak<dyn RemoteRouter>,
        registry: Weak<ProxyRegistry>,
        messages: Arc<MessageRegistry>,
    ) -> Self {
        Self {
            node,
            id,
            router,
            registry,
            messages,
            state: Mutex::new(ProxyState::default()),
        }
    }

    /// Terminate the proxy and notify its observers. Runs once.
    pub(crate) fn kill(&self, reason: ExitReason) {
        let attachables = {
            let mut state = self.state.lock();
            if state.exit_reason.is_some() {
                return;
            }
            state.exit_reason = Some(reason.clone());
            std::mem::take(&mut state.attachables)
        };
        tracing::debug!(node = %self.node, actor = %self.id, %reason, "proxy killed");
        for attachable in attachables {
            attachable.notify(self.id, &reason);
        }
    }
}

impl AbstractActor for ActorProxy {
    fn id(&self) -> ActorId {
        self.id
    }

    fn node(&self) -> Option<NodeId> {
        Some(self.node)
    }

    fn type_name(&self) -> &'static str {
        "ActorProxy"
    }

    fn enqueue(&self, element: MailboxElement) -> Result<(), SendError> {
        if self.state.lock().exit_reason.is_some() {
            bounce(element, RequestError::ReceiverDown);
            return Err(SendError::QueueClosed);
        }
        let Some(router) = self.router.upgrade() else {
            bounce(element, SendError::NoRoute { node: self.node }.into());
            return Err(SendError::NoRoute { node: self.node });
        };
        let Some(message) = user_message(&element) else {
            tracing::debug!(node = %self.node, actor = %self.id, "non-user element not forwarded");
            return Ok(());
        };
        let Some(wire) = self.messages.by_type(message.type_id()).cloned() else {
            let err = SendError::UnknownHandler {
                actor_type: self.type_name().to_string(),
                message_type: message.type_name().to_string(),
            };
            bounce(element, err.clone().into());
            return Err(err);
        };
        let actor = self.id;
        forward(&*router, self.node, element, &wire, ACTOR_MESSAGE, ACTOR_ASK, |payload| {
            let envelope = ActorEnvelope {
                actor,
                tag: wire.name.to_string(),
                payload,
            };
            Ok(JsonCodec.encode(&envelope)?)
        })
    }

    fn attach(&self, attachable: Attachable) -> Result<(), Attachable> {
        let mut state = self.state.lock();
        if state.exit_reason.is_some() {
            return Err(attachable);
        }
        state.attachables.push(attachable);
        Ok(())
    }

    fn detach(&self, observer: ActorId) {
        self.state
            .lock()
            .attachables
            .retain(|attachable| attachable.observer() != observer);
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        self.state.lock().exit_reason.clone()
    }
}

impl Drop for ActorProxy {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_dead(self.node, self.id);
        }
    }
}

/// Proxy for the instance of a virtual actor owned by another node.
///
/// Built on each resolution and never registered: ownership of a key can
/// move, so the proxy only lives as long as the caller keeps it.
pub(crate) struct VirtualProxy {
    router: Arc<dyn RemoteRouter>,
    node: NodeId,
    vtype: Arc<VirtualType>,
    key_bytes: Vec<u8>,
    id: ActorId,
}

impl VirtualProxy {
    pub(crate) fn spawn(
        router: Arc<dyn RemoteRouter>,
        node: NodeId,
        vtype: Arc<VirtualType>,
        key_bytes: Vec<u8>,
        hash: u64,
    ) -> ActorRef {
        ActorRef::from_arc(Arc::new(Self {
            router,
            node,
            vtype,
            key_bytes,
            id: ActorId(hash),
        }))
    }
}

impl AbstractActor for VirtualProxy {
    fn id(&self) -> ActorId {
        self.id
    }

    fn node(&self) -> Option<NodeId> {
        Some(self.node)
    }

    fn type_name(&self) -> &'static str {
        self.vtype.name
    }

    fn enqueue(&self, element: MailboxElement) -> Result<(), SendError> {
        let Some(message) = user_message(&element) else {
            return Ok(());
        };
        let Some(wire) = self.vtype.handlers.by_type(message.type_id()).cloned() else {
            let err = SendError::UnknownHandler {
                actor_type: self.vtype.name.to_string(),
                message_type: message.type_name().to_string(),
            };
            bounce(element, err.clone().into());
            return Err(err);
        };
        forward(&*self.router, self.node, element, &wire, DISPATCH, DISPATCH_ASK, |args| {
            let envelope = DispatchEnvelope {
                actor_type: self.vtype.name.to_string(),
                actor_key: self.key_bytes.clone(),
                handler_id: wire.name.to_string(),
                args: Args::Single(args),
            };
            Ok(JsonCodec.encode(&envelope)?)
        })
    }

    // Virtual actors are reactivated on demand, so there is no termination
    // to observe from here. Refusing makes observers hear about it at once.
    fn attach(&self, attachable: Attachable) -> Result<(), Attachable> {
        Err(attachable)
    }

    fn detach(&self, _observer: ActorId) {}

    fn exit_reason(&self) -> Option<ExitReason> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};
    use tidepool_core::NetworkAddress;
    use tokio::sync::oneshot;

    use super::*;
    use crate::cluster::RemoteMessage;
    use crate::message::{Sender, next_external_request};
    use crate::system::ReplyCallback;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping(u32);

    impl RemoteMessage for Ping {
        const TAG: &'static str = "ping";
        type Response = u32;
    }

    /// Records frames and answers every call with `41 + 1`.
    #[derive(Default)]
    struct Loopback {
        sent: Mutex<Vec<(u32, Vec<u8>)>>,
        calls: AtomicUsize,
    }

    impl RemoteRouter for Loopback {
        fn local_node(&self) -> NodeId {
            node()
        }

        fn owner_of(&self, _key_hash: u64) -> Option<NodeId> {
            None
        }

        fn send(&self, _node: NodeId, method: u32, payload: Vec<u8>) -> Result<(), SendError> {
            self.sent.lock().push((method, payload));
            Ok(())
        }

        fn call(
            &self,
            _node: NodeId,
            _method: u32,
            _payload: Vec<u8>,
            on_reply: ReplyCallback,
        ) -> Result<(), SendError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            on_reply(JsonCodec.encode(&42u32).map_err(ReplyError::from));
            Ok(())
        }
    }

    fn node() -> NodeId {
        NodeId::new(NetworkAddress::localhost(7000), 7)
    }

    fn proxy(router: &Arc<Loopback>, registry: &Arc<ProxyRegistry>) -> ActorRef {
        let mut messages = MessageRegistry::new();
        messages.register::<Ping>();
        let router: Arc<dyn RemoteRouter> = router.clone();
        registry.get_or_put(node(), ActorId(3), || {
            Arc::new(ActorProxy::new(
                node(),
                ActorId(3),
                Arc::downgrade(&router),
                Arc::downgrade(registry),
                Arc::new(messages),
            ))
        })
    }

    #[test]
    fn test_tell_ships_registered_messages_only() {
        let router = Arc::new(Loopback::default());
        let registry = Arc::new(ProxyRegistry::new());
        let actor = proxy(&router, &registry);
        assert!(actor.is_remote());

        actor.tell(Ping(5)).expect("registered type");
        let sent = router.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ACTOR_MESSAGE);
        let envelope: ActorEnvelope = JsonCodec.decode(&sent[0].1).expect("envelope");
        assert_eq!(envelope.actor, ActorId(3));
        assert_eq!(envelope.tag, "ping");

        let err = actor.tell("unregistered").expect_err("unknown type");
        assert!(matches!(err, SendError::UnknownHandler { .. }));
    }

    #[test]
    fn test_ask_decodes_reply() {
        let router = Arc::new(Loopback::default());
        let registry = Arc::new(ProxyRegistry::new());
        let actor = proxy(&router, &registry);
        let (tx, mut rx) = oneshot::channel();
        actor
            .enqueue(MailboxElement::request(
                Sender::Promise(tx),
                next_external_request(),
                Message::new(Ping(1)),
            ))
            .expect("sent");
        let reply = rx.try_recv().expect("answered").expect("ok");
        assert_eq!(reply.downcast_ref::<u32>(), Some(&42));
        assert_eq!(router.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_kill_notifies_and_rejects() {
        let router = Arc::new(Loopback::default());
        let registry = Arc::new(ProxyRegistry::new());
        let actor = proxy(&router, &registry);
        assert_eq!(registry.count(node()), 1);

        registry.erase(node(), ExitReason::RemoteLinkUnreachable);
        assert_eq!(actor.exit_reason(), Some(ExitReason::RemoteLinkUnreachable));
        assert_eq!(actor.tell(Ping(1)), Err(SendError::QueueClosed));
        assert!(registry.is_empty());
    }

    struct Cart;

    impl crate::actor::Actor for Cart {
        fn behavior(&mut self, _ctx: &mut crate::actor::Context<Self>) -> crate::actor::Behavior<Self> {
            crate::actor::Behavior::new()
        }
    }

    impl crate::directory::VirtualActor for Cart {
        type Key = String;
        const TYPE_NAME: &'static str = "cart";

        fn activate(_key: &String) -> Self {
            Cart
        }
    }

    #[test]
    fn test_virtual_proxy_refuses_observers() {
        let router = Arc::new(Loopback::default());
        let registry = Arc::new(ProxyRegistry::new());
        let observer = proxy(&router, &registry);
        let cart = VirtualProxy::spawn(
            router,
            node(),
            Arc::new(VirtualType::new::<Cart>()),
            JsonCodec.encode(&"cart-1".to_string()).expect("key"),
            11,
        );
        let refused = cart.attach(Attachable::Monitor(observer.downgrade()));
        assert!(refused.is_err());
        assert_eq!(cart.exit_reason(), None);
    }

    #[test]
    fn test_get_all_lists_live_proxies() {
        let router = Arc::new(Loopback::default());
        let registry = Arc::new(ProxyRegistry::new());
        let actor = proxy(&router, &registry);
        assert_eq!(registry.get_all(node()), vec![actor.clone()]);
        let elsewhere = NodeId::new(NetworkAddress::localhost(7001), 1);
        assert!(registry.get_all(elsewhere).is_empty());
        drop(actor);
        assert!(registry.get_all(node()).is_empty());
    }

    #[test]
    fn test_drop_removes_registry_entry() {
        let router = Arc::new(Loopback::default());
        let registry = Arc::new(ProxyRegistry::new());
        let actor = proxy(&router, &registry);
        assert_eq!(registry.get(node(), ActorId(3)), Some(actor.clone()));
        drop(actor);
        assert!(registry.is_empty());
    }
}
