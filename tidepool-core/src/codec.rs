//! Pluggable serialization for everything tidepool puts on the wire.
//!
//! Handshakes, dispatch envelopes and user arguments all go through a
//! [`MessageCodec`]. [`JsonCodec`] is the default: human readable, easy to
//! inspect in packet captures, and good enough until profiling says otherwise.
//!
//! # Example
//!
//! ```rust
//! use tidepool_core::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Increment { by: u32 }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Increment { by: 2 }).expect("encode");
//! let decoded: Increment = codec.decode(&bytes).expect("decode");
//! assert_eq!(decoded, Increment { by: 2 });
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Serialization format used by a node.
///
/// Codecs are shared between the RPC reader tasks and worker threads, hence
/// the `Send + Sync` bounds. Both sides of a connection must agree on the
/// codec; it is not negotiated during the handshake.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
