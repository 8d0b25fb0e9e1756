//! The exchange that turns a connection into a member.

use std::time::Duration;

use tidepool_core::{JsonCodec, MessageCodec, NetworkAddress, NodeId};
use tidepool_transport::RpcChannel;

use super::error::HandshakeError;
use super::protocol::{HANDSHAKE, HandshakeRequest, HandshakeResponse};

/// Run the initiator side over a fresh `channel` to `dialed`.
pub(crate) async fn initiate(
    channel: &RpcChannel,
    dialed: NetworkAddress,
    request: &HandshakeRequest,
    local_shards: usize,
    strict_shard_count: bool,
    timeout: Duration,
) -> Result<HandshakeResponse, HandshakeError> {
    let payload = JsonCodec.encode(request)?;
    let reply = channel.call_with_timeout(HANDSHAKE, payload, timeout).await?;
    let response: HandshakeResponse = JsonCodec.decode(&reply)?;
    validate(&response, dialed, local_shards, strict_shard_count)?;
    Ok(response)
}

fn validate(
    response: &HandshakeResponse,
    dialed: NetworkAddress,
    local_shards: usize,
    strict_shard_count: bool,
) -> Result<(), HandshakeError> {
    if response.responder.address != dialed {
        return Err(HandshakeError::WrongPeer {
            expected: dialed,
            actual: response.responder,
        });
    }
    if response.shard_count != local_shards {
        if strict_shard_count {
            return Err(HandshakeError::ShardCountMismatch {
                local: local_shards,
                remote: response.shard_count,
            });
        }
        tracing::warn!(
            peer = %response.responder,
            local = local_shards,
            remote = response.shard_count,
            "peer runs with a different shard count"
        );
    }
    Ok(())
}

/// Decode an inbound request.
pub(crate) fn accept(payload: &[u8]) -> Result<HandshakeRequest, HandshakeError> {
    Ok(JsonCodec.decode(payload)?)
}

/// Encode the responder's answer; `origin` is left out of `known_nodes`.
pub(crate) fn respond(
    origin: NodeId,
    known_nodes: Vec<NodeId>,
    shard_count: usize,
    responder: NodeId,
) -> Result<Vec<u8>, HandshakeError> {
    let response = HandshakeResponse {
        known_nodes: known_nodes.into_iter().filter(|node| *node != origin).collect(),
        shard_count,
        responder,
    };
    Ok(JsonCodec.encode(&response)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId::new(NetworkAddress::localhost(port), 1)
    }

    #[test]
    fn test_validate_rejects_wrong_peer() {
        let response = HandshakeResponse {
            known_nodes: Vec::new(),
            shard_count: 2,
            responder: node(2),
        };
        let err = validate(&response, NetworkAddress::localhost(3), 2, false)
            .expect_err("wrong peer");
        assert!(matches!(err, HandshakeError::WrongPeer { .. }));
        validate(&response, NetworkAddress::localhost(2), 2, true).expect("matching peer");
    }

    #[test]
    fn test_shard_mismatch_only_fails_when_strict() {
        let response = HandshakeResponse {
            known_nodes: Vec::new(),
            shard_count: 4,
            responder: node(2),
        };
        validate(&response, NetworkAddress::localhost(2), 2, false).expect("lenient");
        assert_eq!(
            validate(&response, NetworkAddress::localhost(2), 2, true),
            Err(HandshakeError::ShardCountMismatch { local: 2, remote: 4 })
        );
    }

    #[test]
    fn test_response_excludes_origin() {
        let bytes = respond(node(1), vec![node(1), node(3)], 2, node(2)).expect("encode");
        let response: HandshakeResponse = JsonCodec.decode(&bytes).expect("decode");
        assert_eq!(response.known_nodes, vec![node(3)]);
        assert_eq!(response.responder, node(2));
    }
}
