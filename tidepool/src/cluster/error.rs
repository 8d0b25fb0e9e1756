//! Cluster-level errors.

use tidepool_core::{CodecError, NetworkAddress, NodeId};
use tidepool_transport::{ReplyError, TransportError};

use super::config::ClusterConfigError;

/// Why a handshake with a peer was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// The exchange itself failed.
    #[error("handshake exchange failed: {0}")]
    Reply(#[from] ReplyError),

    /// The peer answered with something that is not a handshake.
    #[error("malformed handshake: {message}")]
    Malformed {
        /// Codec error rendered for display.
        message: String,
    },

    /// Someone else answered on the dialed address.
    #[error("dialed {expected} but {actual} answered")]
    WrongPeer {
        /// Address that was dialed.
        expected: NetworkAddress,
        /// Node that answered.
        actual: NodeId,
    },

    /// The peer runs with a different shard count while strict checking is on.
    #[error("shard count mismatch: local {local}, remote {remote}")]
    ShardCountMismatch {
        /// Our shard count.
        local: usize,
        /// Theirs.
        remote: usize,
    },
}

impl From<CodecError> for HandshakeError {
    fn from(err: CodecError) -> Self {
        HandshakeError::Malformed {
            message: err.to_string(),
        }
    }
}

/// Errors from starting, joining or running a cluster node.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The RPC server could not bind.
    #[error("bind {address} failed: {source}")]
    Bind {
        /// Requested address.
        address: NetworkAddress,
        /// Transport failure.
        #[source]
        source: TransportError,
    },

    /// Seeds were configured but none could be joined.
    #[error("could not join any of {} seed(s)", seeds.len())]
    JoinFailed {
        /// Seeds that were tried.
        seeds: Vec<NetworkAddress>,
    },

    /// Fewer members than required joined in time.
    #[error("{joined} of {expected} required members joined in time")]
    MembersTimeout {
        /// Required member count.
        expected: usize,
        /// Members at the deadline.
        joined: usize,
    },

    /// A handshake was rejected.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A request to a peer failed.
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// The configuration is invalid.
    #[error(transparent)]
    InvalidConfig(#[from] ClusterConfigError),

    /// The node was shut down.
    #[error("cluster node stopped")]
    Stopped,
}
