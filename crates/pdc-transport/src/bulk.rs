//! Bulk (zero-copy) data movement.
//!
//! A peer exposes a memory buffer and hands out a [`BulkRef`] describing it.
//! The receiving side resolves the reference into a [`BulkHandle`] and then
//! pulls from or pushes into the exposed memory. Handles are reference counted:
//! every resolved clone keeps the exposure alive until it is dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// Owned address of a remote peer.
///
/// Addresses are duplicated, never borrowed, so a stored address outlives the
/// request it arrived on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr(String);

impl PeerAddr {
    /// Creates a peer address from its string form.
    pub fn new(addr: impl Into<String>) -> Self {
        PeerAddr(addr.into())
    }

    /// Returns the address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an independent copy of this address.
    pub fn dup(&self) -> Self {
        self.clone()
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permitted access to an exposed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkAccess {
    /// Remote side may only pull.
    ReadOnly,
    /// Remote side may pull and push.
    ReadWrite,
}

/// Serializable descriptor of an exposed buffer, carried inside requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRef {
    /// Exposure id on the owning transport.
    pub id: u64,
    /// Size of the exposed buffer in bytes.
    pub size: u64,
    /// Peer that owns the memory.
    pub owner: PeerAddr,
}

struct BulkBuffer {
    id: u64,
    owner: PeerAddr,
    access: BulkAccess,
    data: Mutex<Vec<u8>>,
}

/// Shared handle to an exposed buffer.
#[derive(Clone)]
pub struct BulkHandle {
    inner: Arc<BulkBuffer>,
}

impl BulkHandle {
    fn new(id: u64, owner: PeerAddr, access: BulkAccess, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BulkBuffer {
                id,
                owner,
                access,
                data: Mutex::new(data),
            }),
        }
    }

    /// Exposure id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Peer that owns the memory.
    pub fn owner(&self) -> &PeerAddr {
        &self.inner.owner
    }

    /// Access mode the owner granted.
    pub fn access(&self) -> BulkAccess {
        self.inner.access
    }

    /// Size of the exposed buffer in bytes.
    pub fn size(&self) -> u64 {
        self.inner.data.lock().map(|d| d.len() as u64).unwrap_or(0)
    }

    /// Number of live references to the exposed buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Builds the wire descriptor for this handle.
    pub fn to_ref(&self) -> BulkRef {
        BulkRef {
            id: self.id(),
            size: self.size(),
            owner: self.owner().clone(),
        }
    }

    /// Copies the whole buffer out. Used by the owner to inspect its own memory.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner
            .data
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let data = self
            .inner
            .data
            .lock()
            .map_err(|_| TransportError::BulkNotFound(self.id()))?;
        let size = data.len() as u64;
        let end = offset.checked_add(len).filter(|end| *end <= size).ok_or(
            TransportError::OutOfRange { offset, len, size },
        )?;
        Ok(Bytes::copy_from_slice(&data[offset as usize..end as usize]))
    }

    fn write_range(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut data = self
            .inner
            .data
            .lock()
            .map_err(|_| TransportError::BulkNotFound(self.id()))?;
        let size = data.len() as u64;
        let len = src.len() as u64;
        let end = offset.checked_add(len).filter(|end| *end <= size).ok_or(
            TransportError::OutOfRange { offset, len, size },
        )?;
        data[offset as usize..end as usize].copy_from_slice(src);
        Ok(())
    }
}

impl fmt::Debug for BulkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkHandle")
            .field("id", &self.id())
            .field("owner", self.owner())
            .field("access", &self.access())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Bulk data movement provided by the RPC substrate.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    /// Address other peers use to reach this transport.
    fn self_addr(&self) -> &PeerAddr;

    /// Exposes a buffer for remote access and returns a handle to it.
    fn expose(&self, data: Vec<u8>, access: BulkAccess) -> BulkHandle;

    /// Resolves a descriptor received in a request into a live handle.
    fn resolve(&self, bulk: &BulkRef) -> Result<BulkHandle>;

    /// Withdraws an exposure. Outstanding handles stay valid until dropped.
    fn revoke(&self, id: u64) -> Result<()>;

    /// Copies `len` bytes at `offset` of the remote buffer into local memory.
    async fn pull(
        &self,
        origin: &PeerAddr,
        remote: &BulkHandle,
        offset: u64,
        len: u64,
    ) -> Result<Bytes>;

    /// Copies `data` into the remote buffer at `offset`.
    async fn push(
        &self,
        origin: &PeerAddr,
        remote: &BulkHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()>;
}

/// Fault to inject into the next bulk transfer of a [`LocalTransport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The transfer fails with a protocol error.
    Fail,
    /// The transfer is canceled.
    Cancel,
}

/// Transfer counters of a [`LocalTransport`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    /// Completed pulls.
    pub pulls: u64,
    /// Completed pushes.
    pub pushes: u64,
    /// Bytes moved by completed pulls.
    pub bytes_pulled: u64,
    /// Bytes moved by completed pushes.
    pub bytes_pushed: u64,
    /// Transfers that ended in an error.
    pub failures: u64,
}

/// In-process bulk transport. Every peer in the process shares one exposure table.
pub struct LocalTransport {
    self_addr: PeerAddr,
    next_id: AtomicU64,
    exposed: Mutex<HashMap<u64, BulkHandle>>,
    faults: Mutex<VecDeque<Fault>>,
    pulls: AtomicU64,
    pushes: AtomicU64,
    bytes_pulled: AtomicU64,
    bytes_pushed: AtomicU64,
    failures: AtomicU64,
}

impl LocalTransport {
    /// Creates a transport reachable at `self_addr`.
    pub fn new(self_addr: PeerAddr) -> Self {
        Self {
            self_addr,
            next_id: AtomicU64::new(1),
            exposed: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            pulls: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            bytes_pulled: AtomicU64::new(0),
            bytes_pushed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Exposes a buffer on behalf of another peer sharing this process.
    pub fn expose_as(&self, owner: PeerAddr, data: Vec<u8>, access: BulkAccess) -> BulkHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = BulkHandle::new(id, owner, access, data);
        if let Ok(mut exposed) = self.exposed.lock() {
            exposed.insert(id, handle.clone());
        }
        debug!(bulk_id = id, "exposed bulk buffer");
        handle
    }

    /// Queues a fault for the next transfer.
    pub fn inject_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push_back(fault);
        }
    }

    /// Returns true while the exposure with this id is live.
    pub fn is_exposed(&self, id: u64) -> bool {
        self.exposed
            .lock()
            .map(|e| e.contains_key(&id))
            .unwrap_or(false)
    }

    /// Snapshot of the transfer counters.
    pub fn stats(&self) -> TransferStats {
        TransferStats {
            pulls: self.pulls.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            bytes_pulled: self.bytes_pulled.load(Ordering::Relaxed),
            bytes_pushed: self.bytes_pushed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn take_fault(&self, origin: &PeerAddr) -> Result<()> {
        let fault = self.faults.lock().ok().and_then(|mut f| f.pop_front());
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::TransferFailed {
                    origin: origin.to_string(),
                    reason: "injected failure".to_string(),
                })
            }
            Some(Fault::Cancel) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Canceled)
            }
        }
    }
}

#[async_trait]
impl BulkTransport for LocalTransport {
    fn self_addr(&self) -> &PeerAddr {
        &self.self_addr
    }

    fn expose(&self, data: Vec<u8>, access: BulkAccess) -> BulkHandle {
        self.expose_as(self.self_addr.dup(), data, access)
    }

    fn resolve(&self, bulk: &BulkRef) -> Result<BulkHandle> {
        let exposed = self
            .exposed
            .lock()
            .map_err(|_| TransportError::BulkNotFound(bulk.id))?;
        exposed
            .get(&bulk.id)
            .cloned()
            .ok_or(TransportError::BulkNotFound(bulk.id))
    }

    fn revoke(&self, id: u64) -> Result<()> {
        let mut exposed = self
            .exposed
            .lock()
            .map_err(|_| TransportError::BulkNotFound(id))?;
        match exposed.remove(&id) {
            Some(_) => {
                debug!(bulk_id = id, "revoked bulk buffer");
                Ok(())
            }
            None => Err(TransportError::BulkNotFound(id)),
        }
    }

    async fn pull(
        &self,
        origin: &PeerAddr,
        remote: &BulkHandle,
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        // Completion is always delivered asynchronously.
        tokio::task::yield_now().await;
        if let Err(e) = self.take_fault(origin) {
            warn!(bulk_id = remote.id(), error = %e, "bulk pull failed");
            return Err(e);
        }
        let data = remote.read_range(offset, len).inspect_err(|_| {
            self.failures.fetch_add(1, Ordering::Relaxed);
        })?;
        self.pulls.fetch_add(1, Ordering::Relaxed);
        self.bytes_pulled
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    async fn push(
        &self,
        origin: &PeerAddr,
        remote: &BulkHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        tokio::task::yield_now().await;
        self.take_fault(origin)?;
        if remote.access() == BulkAccess::ReadOnly {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::TransferFailed {
                origin: origin.to_string(),
                reason: format!("bulk handle {} is read-only", remote.id()),
            });
        }
        remote.write_range(offset, data)?;
        self.pushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_pushed
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
