//! Error types for request-response calls.
//!
//! A call can fail on either side of the wire: locally (timeout, broken
//! connection) or remotely (no handler, handler error). Remote failures are
//! shipped back inside an error frame, which is why the enum is serializable.

use serde::{Deserialize, Serialize};

/// Errors that can occur during a request-response call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ReplyError {
    /// The responder dropped the request without answering.
    #[error("responder dropped the request without reply")]
    BrokenPromise,

    /// The connection failed before the response arrived.
    ///
    /// The request may or may not have been processed.
    #[error("connection failed")]
    ConnectionFailed,

    /// No response arrived in time. The responder may still be working on it.
    #[error("request timed out")]
    Timeout,

    /// Encoding or decoding failed on one side.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable error message.
        message: String,
    },

    /// Nothing on the remote side handles the method.
    #[error("no handler for method {method}")]
    HandlerNotFound {
        /// The method that was called.
        method: u32,
    },

    /// A relay could not reach the final destination.
    #[error("no route to {destination}")]
    NoRoute {
        /// Destination that was unreachable, rendered for display.
        destination: String,
    },

    /// The remote handler failed.
    #[error("remote error: {message}")]
    Remote {
        /// Error reported by the remote handler.
        message: String,
    },
}

impl From<serde_json::Error> for ReplyError {
    fn from(err: serde_json::Error) -> Self {
        ReplyError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tidepool_core::CodecError> for ReplyError {
    fn from(err: tidepool_core::CodecError) -> Self {
        ReplyError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_error_display() {
        assert_eq!(ReplyError::Timeout.to_string(), "request timed out");
        assert_eq!(
            ReplyError::HandlerNotFound { method: 9 }.to_string(),
            "no handler for method 9"
        );
        assert_eq!(
            ReplyError::NoRoute {
                destination: "10.0.0.1:4500".to_string()
            }
            .to_string(),
            "no route to 10.0.0.1:4500"
        );
    }

    #[test]
    fn test_reply_error_travels_as_json() {
        let error = ReplyError::Remote {
            message: "actor type not registered".to_string(),
        };
        let json = serde_json::to_vec(&error).expect("serialize");
        let decoded: ReplyError = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(decoded, error);
    }
}
