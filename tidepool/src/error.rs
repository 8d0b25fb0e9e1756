//! Error types for sending and requests.

use tidepool_core::{CodecError, NodeId};
use tidepool_transport::ReplyError;

/// Why a message could not be handed to its receiver.
///
/// Returned synchronously by `tell`, `send` and friends. A failed request is
/// additionally answered with a [`RequestError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The receiver terminated and closed its mailbox.
    #[error("receiver mailbox is closed")]
    QueueClosed,

    /// Neither a direct nor an indirect route leads to the node.
    #[error("no route to {node}")]
    NoRoute {
        /// Unreachable node.
        node: NodeId,
    },

    /// The message or its key could not be encoded.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Codec error rendered for display.
        message: String,
    },

    /// The virtual actor type is not registered on this node.
    #[error("unknown actor type {type_name}")]
    UnknownActorType {
        /// Registered type name that was looked up.
        type_name: String,
    },

    /// No remote handler is registered for the message type.
    #[error("no handler registered for {message_type} on {actor_type}")]
    UnknownHandler {
        /// Target actor type.
        actor_type: String,
        /// Rust type name of the message.
        message_type: String,
    },
}

impl From<CodecError> for SendError {
    fn from(err: CodecError) -> Self {
        SendError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Why a request did not produce the expected response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// No response before the deadline.
    #[error("request timed out")]
    Timeout,

    /// The receiver terminated before answering.
    #[error("receiver is down")]
    ReceiverDown,

    /// The receiver dropped its response promise without delivering.
    #[error("response promise dropped without reply")]
    BrokenPromise,

    /// A response arrived but had a different type.
    #[error("expected response of type {expected}, got {actual}")]
    UnexpectedResponse {
        /// Type the requester asked for.
        expected: &'static str,
        /// Type that arrived.
        actual: String,
    },

    /// The receiver had no handler for the request and dropped it.
    #[error("receiver has no handler for {type_name}")]
    Unhandled {
        /// Type name of the request message.
        type_name: String,
    },

    /// The request crossed the network and failed there.
    #[error("remote request failed: {0}")]
    Remote(ReplyError),
}

impl From<ReplyError> for RequestError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::Timeout => RequestError::Timeout,
            ReplyError::BrokenPromise => RequestError::BrokenPromise,
            other => RequestError::Remote(other),
        }
    }
}

impl From<SendError> for RequestError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::QueueClosed => RequestError::ReceiverDown,
            SendError::NoRoute { node } => RequestError::Remote(ReplyError::NoRoute {
                destination: node.to_string(),
            }),
            SendError::Serialization { message } => {
                RequestError::Remote(ReplyError::Serialization { message })
            }
            SendError::UnknownHandler { message_type, .. } => RequestError::Unhandled {
                type_name: message_type,
            },
            other @ SendError::UnknownActorType { .. } => RequestError::Remote(ReplyError::Remote {
                message: other.to_string(),
            }),
        }
    }
}

impl From<RequestError> for ReplyError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Timeout => ReplyError::Timeout,
            RequestError::BrokenPromise => ReplyError::BrokenPromise,
            RequestError::Remote(inner) => inner,
            other => ReplyError::Remote {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_error_conversion_keeps_timeouts() {
        assert_eq!(RequestError::from(ReplyError::Timeout), RequestError::Timeout);
        assert_eq!(
            RequestError::from(ReplyError::ConnectionFailed),
            RequestError::Remote(ReplyError::ConnectionFailed)
        );
        assert_eq!(
            ReplyError::from(RequestError::ReceiverDown),
            ReplyError::Remote {
                message: "receiver is down".to_string()
            }
        );
    }
}
