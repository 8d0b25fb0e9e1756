//! Node-to-node messages and the RPC methods carrying them.
//!
//! Every body is encoded with the node codec ([`JsonCodec`](tidepool_core::JsonCodec)).
//!
//! | method          | kind     | body                  |
//! |-----------------|----------|-----------------------|
//! | `HANDSHAKE`     | call     | [`HandshakeRequest`] → [`HandshakeResponse`] |
//! | `DISPATCH`      | one-way  | [`DispatchEnvelope`]  |
//! | `DISPATCH_ASK`  | call     | [`DispatchEnvelope`] → encoded response |
//! | `ACTOR_MESSAGE` | one-way  | [`ActorEnvelope`]     |
//! | `ACTOR_ASK`     | call     | [`ActorEnvelope`] → encoded response |
//! | `WHEREIS`       | call     | name → `Option<ActorId>` |
//! | `FORWARD`       | either   | [`ForwardEnvelope`], relayed one hop |

use serde::{Deserialize, Serialize};
use tidepool_core::{ActorId, NodeId};

pub(crate) const HANDSHAKE: u32 = 1;
pub(crate) const DISPATCH: u32 = 2;
pub(crate) const DISPATCH_ASK: u32 = 3;
pub(crate) const ACTOR_MESSAGE: u32 = 4;
pub(crate) const ACTOR_ASK: u32 = 5;
pub(crate) const WHEREIS: u32 = 6;
pub(crate) const FORWARD: u32 = 7;

/// Sent by the dialing node right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Nodes the initiator has joined.
    pub known_nodes: Vec<NodeId>,
    /// The initiator.
    pub origin: NodeId,
}

/// The accepting node's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Nodes the responder has joined, the initiator excluded.
    pub known_nodes: Vec<NodeId>,
    /// Shards on the responder.
    pub shard_count: usize,
    /// The responder.
    pub responder: NodeId,
}

/// Encoded arguments of one or more calls to the same handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Args {
    /// One call.
    Single(Vec<u8>),
    /// Several calls, delivered in order.
    Packed(Vec<Vec<u8>>),
}

impl Args {
    /// Calls carried, in delivery order.
    pub fn calls(&self) -> impl Iterator<Item = &[u8]> {
        let calls: &[Vec<u8>] = match self {
            Args::Single(call) => std::slice::from_ref(call),
            Args::Packed(calls) => calls,
        };
        calls.iter().map(Vec::as_slice)
    }

    /// Number of calls.
    pub fn len(&self) -> usize {
        match self {
            Args::Single(_) => 1,
            Args::Packed(calls) => calls.len(),
        }
    }

    /// Whether no call is carried.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Messages for a virtual actor hosted by the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    /// Registered type name of the actor.
    pub actor_type: String,
    /// Codec encoding of the actor's key.
    pub actor_key: Vec<u8>,
    /// Handler id the arguments are for.
    pub handler_id: String,
    /// Encoded message(s).
    pub args: Args,
}

/// Message for a published actor on the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ActorEnvelope {
    pub(crate) actor: ActorId,
    pub(crate) tag: String,
    pub(crate) payload: Vec<u8>,
}

/// Frame for a node the sender has no direct connection to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ForwardEnvelope {
    pub(crate) destination: NodeId,
    pub(crate) method: u32,
    pub(crate) payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_iterate_in_order() {
        let packed = Args::Packed(vec![vec![1], vec![2], vec![3]]);
        assert_eq!(packed.len(), 3);
        assert_eq!(packed.calls().collect::<Vec<_>>(), vec![&[1][..], &[2], &[3]]);
        let single = Args::Single(vec![9]);
        assert_eq!(single.calls().collect::<Vec<_>>(), vec![&[9][..]]);
        assert!(Args::Packed(Vec::new()).is_empty());
    }
}
