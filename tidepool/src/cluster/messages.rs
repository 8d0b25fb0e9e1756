//! Wire encodings of user messages.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tidepool_core::{CodecError, JsonCodec, MessageCodec};

use crate::message::Message;

type EncodeFn = Box<dyn Fn(&Message) -> Result<Vec<u8>, CodecError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Message, CodecError> + Send + Sync>;
type EncodeOwnedFn = Box<dyn Fn(Message) -> Result<Vec<u8>, CodecError> + Send + Sync>;

/// How one message type and its response cross the wire.
pub(crate) struct WireMessage {
    pub(crate) name: &'static str,
    pub(crate) message_type: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) encode: EncodeFn,
    pub(crate) decode: DecodeFn,
    pub(crate) encode_response: EncodeOwnedFn,
    pub(crate) decode_response: DecodeFn,
}

impl WireMessage {
    pub(crate) fn of<M, R>(name: &'static str) -> Self
    where
        M: Serialize + DeserializeOwned + Any + Send,
        R: Serialize + DeserializeOwned + Any + Send,
    {
        Self {
            name,
            message_type: std::any::type_name::<M>(),
            type_id: TypeId::of::<M>(),
            encode: Box::new(|message| match message.downcast_ref::<M>() {
                Some(value) => JsonCodec.encode(value),
                None => Err(type_mismatch::<M>(message)),
            }),
            decode: Box::new(|bytes| JsonCodec.decode::<M>(bytes).map(Message::new)),
            encode_response: Box::new(|message| match message.downcast::<R>() {
                Ok(value) => JsonCodec.encode(&value),
                Err(message) => Err(type_mismatch::<R>(&message)),
            }),
            decode_response: Box::new(|bytes| JsonCodec.decode::<R>(bytes).map(Message::new)),
        }
    }
}

impl std::fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireMessage")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .finish()
    }
}

fn type_mismatch<M>(message: &Message) -> CodecError {
    CodecError::Encode(
        format!(
            "expected {}, got {}",
            std::any::type_name::<M>(),
            message.type_name()
        )
        .into(),
    )
}

/// A message that can be sent to actors on other nodes through an
/// [`ActorRef`](crate::actor::ActorRef) obtained from
/// [`ClusterNode::remote_actor`](super::ClusterNode::remote_actor).
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use tidepool::cluster::RemoteMessage;
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping(u32);
///
/// impl RemoteMessage for Ping {
///     const TAG: &'static str = "ping";
///     type Response = u32;
/// }
/// ```
pub trait RemoteMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Name identifying the type on the wire; must match on every node.
    const TAG: &'static str;
    /// What the receiving handler returns. Use `()` for plain messages.
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Message types a node can send to and receive from remote actor proxies.
#[derive(Debug, Default, Clone)]
pub struct MessageRegistry {
    by_type: HashMap<TypeId, Arc<WireMessage>>,
    by_tag: HashMap<&'static str, Arc<WireMessage>>,
}

impl MessageRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M`. Registering a second type with the same tag replaces
    /// the first.
    pub fn register<M: RemoteMessage>(&mut self) -> &mut Self {
        let wire = Arc::new(WireMessage::of::<M, M::Response>(M::TAG));
        if let Some(previous) = self.by_tag.insert(M::TAG, wire.clone()) {
            self.by_type.remove(&previous.type_id);
        }
        self.by_type.insert(TypeId::of::<M>(), wire);
        self
    }

    /// Whether `M` is registered.
    pub fn contains<M: Any>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<M>())
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub(crate) fn by_type(&self, type_id: TypeId) -> Option<&Arc<WireMessage>> {
        self.by_type.get(&type_id)
    }

    pub(crate) fn by_tag(&self, tag: &str) -> Option<&Arc<WireMessage>> {
        self.by_tag.get(tag)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    impl RemoteMessage for Ping {
        const TAG: &'static str = "ping";
        type Response = u32;
    }

    #[test]
    fn test_registry_encodes_by_type_and_decodes_by_tag() {
        let mut registry = MessageRegistry::new();
        registry.register::<Ping>();
        assert!(registry.contains::<Ping>());

        let wire = registry.by_type(TypeId::of::<Ping>()).expect("registered");
        let bytes = (wire.encode)(&Message::new(Ping(7))).expect("encode");
        let decoded = (registry.by_tag("ping").expect("tag").decode)(&bytes).expect("decode");
        assert_eq!(decoded.downcast::<Ping>().expect("ping"), Ping(7));

        let response = (wire.encode_response)(Message::new(9u32)).expect("encode response");
        let response = (wire.decode_response)(&response).expect("decode response");
        assert_eq!(response.downcast_ref::<u32>(), Some(&9));
    }

    #[test]
    fn test_encode_rejects_other_types() {
        let wire = WireMessage::of::<Ping, u32>("ping");
        assert!((wire.encode)(&Message::new("not a ping")).is_err());
    }
}
