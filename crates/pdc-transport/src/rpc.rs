//! Request/response channel between clients and a server endpoint.
//!
//! Each request travels in an [`Envelope`] that carries the caller's address and
//! a one-shot reply slot. The endpoint owner answers with [`Envelope::respond`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bulk::PeerAddr;
use crate::error::{Result, TransportError};

/// Largest payload carried inline in a response. Anything larger moves via bulk transfer.
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Returns an error when `size` does not fit inline.
pub fn check_inline_size(size: usize) -> Result<()> {
    if size > MAX_INLINE_SIZE {
        return Err(TransportError::PayloadTooLarge {
            size,
            max_size: MAX_INLINE_SIZE,
        });
    }
    Ok(())
}

/// Configuration for RPC clients.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Response timeout in milliseconds (default: 5000).
    pub response_timeout_ms: u64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
        }
    }
}

/// A request in flight together with the slot its response goes into.
pub struct Envelope<Req, Resp> {
    /// Per-client request id.
    pub request_id: u64,
    /// Address of the caller.
    pub origin: PeerAddr,
    /// Decoded request.
    pub request: Req,
    reply: oneshot::Sender<Resp>,
}

impl<Req, Resp> Envelope<Req, Resp> {
    /// Delivers the response. Returns false when the caller has gone away.
    pub fn respond(self, response: Resp) -> bool {
        let delivered = self.reply.send(response).is_ok();
        if !delivered {
            debug!(request_id = self.request_id, origin = %self.origin, "caller dropped before response");
        }
        delivered
    }

    /// Splits the envelope into its request and a detached responder.
    pub fn into_parts(self) -> (Req, Responder<Resp>) {
        (
            self.request,
            Responder {
                request_id: self.request_id,
                origin: self.origin,
                reply: self.reply,
            },
        )
    }
}

/// Reply slot detached from its request, for handlers that answer later.
pub struct Responder<Resp> {
    /// Per-client request id.
    pub request_id: u64,
    /// Address of the caller.
    pub origin: PeerAddr,
    reply: oneshot::Sender<Resp>,
}

impl<Resp> Responder<Resp> {
    /// Delivers the response. Returns false when the caller has gone away.
    pub fn respond(self, response: Resp) -> bool {
        self.reply.send(response).is_ok()
    }
}

/// Outcome of waiting on an endpoint for a bounded time.
pub enum Recv<Req, Resp> {
    /// A request arrived.
    Request(Envelope<Req, Resp>),
    /// Nothing arrived before the deadline.
    Idle,
    /// Every client handle has been dropped.
    Closed,
}

/// Receiving side of the channel, owned by the server.
pub struct RpcEndpoint<Req, Resp> {
    addr: PeerAddr,
    rx: mpsc::Receiver<Envelope<Req, Resp>>,
}

impl<Req, Resp> RpcEndpoint<Req, Resp> {
    /// Address clients use to reach this endpoint.
    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    /// Waits for the next request.
    pub async fn recv(&mut self) -> Option<Envelope<Req, Resp>> {
        self.rx.recv().await
    }

    /// Waits at most `timeout` for the next request.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Recv<Req, Resp> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(envelope)) => Recv::Request(envelope),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Idle,
        }
    }

    /// Stops accepting new requests. Requests already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Sending side of the channel. Cheap to clone; clones share the request id sequence.
pub struct RpcClient<Req, Resp> {
    origin: PeerAddr,
    server: PeerAddr,
    config: RpcClientConfig,
    next_id: Arc<AtomicU64>,
    tx: mpsc::Sender<Envelope<Req, Resp>>,
}

impl<Req, Resp> Clone for RpcClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            origin: self.origin.clone(),
            server: self.server.clone(),
            config: self.config.clone(),
            next_id: self.next_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Resp> RpcClient<Req, Resp> {
    /// Returns a client that identifies itself as `origin`.
    pub fn with_origin(&self, origin: PeerAddr) -> Self {
        let mut client = self.clone();
        client.origin = origin;
        client
    }

    /// Returns a client using `config`.
    pub fn with_config(&self, config: RpcClientConfig) -> Self {
        let mut client = self.clone();
        client.config = config;
        client
    }

    /// Address this client reports as the request origin.
    pub fn origin(&self) -> &PeerAddr {
        &self.origin
    }

    /// Address of the endpoint this client talks to.
    pub fn server(&self) -> &PeerAddr {
        &self.server
    }

    /// Sends a request and waits for the response.
    pub async fn call(&self, request: Req) -> Result<Resp> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            request_id,
            origin: self.origin.clone(),
            request,
            reply,
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|_| TransportError::EndpointClosed)?;

        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::EndpointClosed),
            Err(_) => {
                warn!(request_id, server = %self.server, "RPC timed out");
                Err(TransportError::RequestTimeout {
                    request_id,
                    timeout_ms: self.config.response_timeout_ms,
                })
            }
        }
    }
}

/// Creates a connected client/endpoint pair for the endpoint at `addr`.
pub fn channel<Req, Resp>(
    addr: PeerAddr,
    capacity: usize,
) -> (RpcClient<Req, Resp>, RpcEndpoint<Req, Resp>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let client = RpcClient {
        origin: PeerAddr::new("anonymous"),
        server: addr.clone(),
        config: RpcClientConfig::default(),
        next_id: Arc::new(AtomicU64::new(1)),
        tx,
    };
    (client, RpcEndpoint { addr, rx })
}
