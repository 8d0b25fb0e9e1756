//! Error types for the tidepool transport layer.

use crate::wire::WireError;

/// Errors raised by connections and RPC channels.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying stream failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not parse as frames.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Connecting did not finish in time.
    #[error("connect to {address} timed out")]
    ConnectTimeout {
        /// Address that was being dialed.
        address: String,
    },

    /// The peer closed the stream cleanly.
    #[error("connection closed by peer")]
    Eof,

    /// The channel was closed locally or its writer task is gone.
    #[error("channel closed")]
    ChannelClosed,
}
