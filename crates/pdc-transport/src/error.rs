//! Transport error type.

use thiserror::Error;

/// Failures raised by the RPC channel and bulk-transfer substrate.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live exposure has this id.
    #[error("bulk handle {0} not found")]
    BulkNotFound(u64),

    /// The transfer did not complete.
    #[error("bulk transfer from {origin} failed: {reason}")]
    TransferFailed {
        /// Peer the transfer was issued for
        origin: String,
        /// What went wrong
        reason: String,
    },

    /// The transfer was canceled before completion.
    #[error("bulk transfer canceled")]
    Canceled,

    /// The requested range does not fit the exposed buffer.
    #[error("bulk range {offset}+{len} exceeds handle size {size}")]
    OutOfRange {
        /// Start of the range
        offset: u64,
        /// Length of the range
        len: u64,
        /// Size of the buffer
        size: u64,
    },

    /// The payload exceeds the inline message limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Inline limit
        max_size: usize,
    },

    /// No response arrived in time.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Id of the unanswered request
        request_id: u64,
        /// Timeout that expired
        timeout_ms: u64,
    },

    /// The other side of the channel is gone.
    #[error("endpoint closed")]
    EndpointClosed,

    /// Encoding or decoding failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::SerializationError(e.to_string())
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
