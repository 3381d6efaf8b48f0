#![warn(missing_docs)]

//! PDC transport subsystem: request/response channel and bulk data movement between peers

pub mod bulk;
pub mod error;
pub mod rpc;

pub use bulk::{BulkAccess, BulkHandle, BulkRef, BulkTransport, Fault, LocalTransport, PeerAddr, TransferStats};
pub use error::{Result, TransportError};
pub use rpc::{
    channel, check_inline_size, Envelope, Recv, Responder, RpcClient, RpcClientConfig, RpcEndpoint,
    MAX_INLINE_SIZE,
};
