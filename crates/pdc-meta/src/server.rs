//! Server context, lifecycle and progress loop.
//!
//! All server state lives in a [`ServerContext`] handed to every handler, so
//! several servers can run side by side in one process. The progress loop
//! pulls requests off the endpoint and either runs them inline or hands them
//! to the worker pool. Setting the shutdown flag moves the server into
//! draining: queued requests are rejected, in-flight ones complete.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pdc_transport::{BulkTransport, PeerAddr, Recv, RpcClient, RpcEndpoint};

use crate::config::ServerConfig;
use crate::datastore::{MemoryRegionStore, RegionStore};
use crate::locking::RegionLockManager;
use crate::mapping::RegionMapTable;
use crate::pool::WorkerPool;
use crate::registry::{Destructor, IdRegistry, ObjectRef};
use crate::rpc::{BulkExport, MetadataRequest, MetadataResponse, RpcDispatcher, TYPE_BULK_EXPORT};
use crate::store::{FilterStats, MetadataStore};
use crate::types::{MetaError, Result};

/// Client side of the metadata channel.
pub type MetaClient = RpcClient<MetadataRequest, MetadataResponse>;

/// Server side of the metadata channel.
pub type MetaEndpoint = RpcEndpoint<MetadataRequest, MetadataResponse>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Lifecycle of a server.
pub enum ServerState {
    /// Context built, nothing published yet.
    Uninitialized = 0,
    /// Table ready and address published.
    Initialized = 1,
    /// Progress loop running.
    Serving = 2,
    /// Shutdown requested; no new work accepted.
    Draining = 3,
    /// Resources freed.
    Terminated = 4,
}

impl From<u8> for ServerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ServerState::Uninitialized,
            1 => ServerState::Initialized,
            2 => ServerState::Serving,
            3 => ServerState::Draining,
            4 => ServerState::Terminated,
            _ => ServerState::Uninitialized,
        }
    }
}

/// What the server cleaned up on its way out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSummary {
    /// Records still in the table
    pub records: usize,
    /// Duplicate filter counters
    pub filter: FilterStats,
    /// Duplicate pairs found by the final audit
    pub audit_duplicates: usize,
    /// Exported buffers the clients never released
    pub exports_released: usize,
    /// Region-map records dropped
    pub maps_dropped: usize,
    /// Jobs run by the worker pool
    pub offloaded_jobs: u64,
}

/// Shared state of one metadata server.
pub struct ServerContext {
    /// Settings the server was started with
    pub config: ServerConfig,
    /// Metadata table
    pub store: MetadataStore,
    /// Identifier registry
    pub registry: IdRegistry,
    /// Region locks
    pub locks: RegionLockManager,
    /// Region maps
    pub maps: RegionMapTable,
    /// Region payloads
    pub data: Arc<dyn RegionStore>,
    /// Bulk transport
    pub transport: Arc<dyn BulkTransport>,
    shutdown: AtomicBool,
    state: AtomicU8,
}

impl ServerContext {
    /// Builds a context with an in-memory payload store.
    pub fn new(config: ServerConfig, transport: Arc<dyn BulkTransport>) -> Result<Self> {
        Self::with_region_store(config, transport, Arc::new(MemoryRegionStore::new()))
    }

    /// Builds a context over the given payload store.
    pub fn with_region_store(
        config: ServerConfig,
        transport: Arc<dyn BulkTransport>,
        data: Arc<dyn RegionStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = IdRegistry::new();
        let revoker = Arc::clone(&transport);
        let destructor: Destructor = Arc::new(move |obj: &ObjectRef| {
            let export = obj
                .downcast_ref::<BulkExport>()
                .ok_or_else(|| "entry is not a bulk export".to_string())?;
            revoker
                .revoke(export.handle().id())
                .map_err(|e| e.to_string())
        });
        registry.register_type(TYPE_BULK_EXPORT, Some(destructor))?;

        Ok(Self {
            store: MetadataStore::new(config.store_config()),
            config,
            registry,
            locks: RegionLockManager::new(),
            maps: RegionMapTable::new(),
            data,
            transport,
            shutdown: AtomicBool::new(false),
            state: AtomicU8::new(ServerState::Uninitialized as u8),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        ServerState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
        debug!(?state, "server state changed");
    }

    /// Sets the shutdown flag. Returns true only for the call that set it.
    pub fn request_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    /// True once shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Audits the table, releases outstanding exports and frees everything.
    pub fn finish(&self) -> Result<ShutdownSummary> {
        let filter = self.store.filter_stats();
        info!(
            "duplicate filter: maybe {} of {} checks, {} duplicates rejected, fullest filter {}/1000 set",
            filter.maybe, filter.total, filter.duplicates, filter.max_fill_permille
        );

        let audit = self.store.duplicate_audit()?;
        if audit.has_duplicates() {
            warn!(pairs = audit.duplicates.len(), "duplicate metadata found at shutdown");
        } else {
            info!(records = audit.records, buckets = audit.buckets, "no duplicate metadata");
        }

        let exports_released = match self.registry.clear_type(TYPE_BULK_EXPORT) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "some bulk exports could not be released");
                0
            }
        };
        let maps_dropped = self.maps.clear();
        let records = self.store.clear()?;

        Ok(ShutdownSummary {
            records,
            filter,
            audit_duplicates: audit.duplicates.len(),
            exports_released,
            maps_dropped,
            offloaded_jobs: 0,
        })
    }
}

/// Writes the address file: a count line followed by one address per line.
pub fn write_address_file(path: &Path, addrs: &[PeerAddr]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut contents = format!("{}\n", addrs.len());
    for addr in addrs {
        contents.push_str(addr.as_str());
        contents.push('\n');
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Reads the server addresses written by [`write_address_file`].
pub fn read_address_file(path: &Path) -> Result<Vec<PeerAddr>> {
    let contents = std::fs::read_to_string(path)?;
    let mut lines = contents.lines();
    let count: usize = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| MetaError::InvalidRequest(format!("{}: missing count line", path.display())))?;
    let addrs: Vec<PeerAddr> = lines
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(count)
        .map(PeerAddr::new)
        .collect();
    if addrs.len() != count {
        return Err(MetaError::InvalidRequest(format!(
            "{}: expected {} addresses, found {}",
            path.display(),
            count,
            addrs.len()
        )));
    }
    Ok(addrs)
}

/// A metadata server bound to one endpoint.
pub struct Server {
    ctx: Arc<ServerContext>,
    endpoint: MetaEndpoint,
}

impl Server {
    /// Builds the server state and publishes the address file (rank 0 only).
    pub fn init(
        config: ServerConfig,
        transport: Arc<dyn BulkTransport>,
        endpoint: MetaEndpoint,
    ) -> Result<Self> {
        let ctx = ServerContext::new(config, transport)?;
        if ctx.config.server_id == 0 {
            let path = ctx.config.addr_file_path();
            write_address_file(&path, &[endpoint.addr().dup()])?;
            info!(path = %path.display(), "address file written");
        }
        ctx.set_state(ServerState::Initialized);
        info!(
            server_id = ctx.config.server_id,
            num_servers = ctx.config.num_servers,
            addr = %endpoint.addr(),
            table_size = ctx.store.table_size(),
            "metadata server initialized"
        );
        Ok(Self {
            ctx: Arc::new(ctx),
            endpoint,
        })
    }

    /// Shared state of this server.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Runs the progress loop until shutdown, then drains and frees everything.
    pub async fn serve(mut self) -> Result<ShutdownSummary> {
        let ctx = Arc::clone(&self.ctx);
        let dispatcher = RpcDispatcher::new(Arc::clone(&ctx));
        let pool = ctx
            .config
            .offload
            .then(|| WorkerPool::new(ctx.config.worker_threads, ctx.config.queue_depth));
        let interval = Duration::from_millis(ctx.config.progress_interval_ms.max(1));
        ctx.set_state(ServerState::Serving);
        info!(
            offload = pool.is_some(),
            workers = pool.as_ref().map_or(0, WorkerPool::size),
            "serving"
        );

        while !ctx.is_shutting_down() {
            match self.endpoint.recv_timeout(interval).await {
                Recv::Request(envelope) => {
                    let (request, responder) = envelope.into_parts();
                    let dispatcher = dispatcher.clone();
                    match &pool {
                        Some(pool) => {
                            let job = async move {
                                let response = dispatcher.dispatch(&responder.origin, request).await;
                                responder.respond(response);
                            };
                            if let Err(e) = pool.submit(job).await {
                                warn!(error = %e, "could not queue request");
                            }
                        }
                        None => {
                            let response = dispatcher.dispatch(&responder.origin, request).await;
                            responder.respond(response);
                        }
                    }
                }
                Recv::Idle => {}
                Recv::Closed => {
                    info!("all clients disconnected");
                    ctx.request_shutdown();
                }
            }
        }

        ctx.set_state(ServerState::Draining);
        self.endpoint.close();
        let mut rejected = 0usize;
        while let Some(envelope) = self.endpoint.recv().await {
            envelope.respond(MetadataResponse::from_error(&MetaError::ShuttingDown));
            rejected += 1;
        }
        let offloaded_jobs = match pool {
            Some(pool) => pool.shutdown().await,
            None => 0,
        };
        info!(rejected, offloaded_jobs, "drained");

        let mut summary = ctx.finish()?;
        summary.offloaded_jobs = offloaded_jobs;
        ctx.set_state(ServerState::Terminated);
        info!(records = summary.records, "metadata server terminated");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::name_hash;
    use crate::types::Status;
    use pdc_transport::{channel, LocalTransport};

    fn config(dir: &Path, offload: bool) -> ServerConfig {
        ServerConfig {
            tmp_dir: dir.to_path_buf(),
            table_size: 8,
            offload,
            progress_interval_ms: 10,
            ..Default::default()
        }
    }

    fn start(cfg: ServerConfig) -> (Server, MetaClient) {
        let addr = PeerAddr::new("local://server-0");
        let transport = Arc::new(LocalTransport::new(addr.clone()));
        let (client, endpoint) = channel(addr, 64);
        let server = Server::init(cfg, transport, endpoint).unwrap();
        (server, client)
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(ServerState::from(2), ServerState::Serving);
        assert_eq!(ServerState::from(4), ServerState::Terminated);
        assert_eq!(ServerState::from(99), ServerState::Uninitialized);
    }

    #[test]
    fn test_address_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.cfg");
        let addrs = vec![PeerAddr::new("local://a"), PeerAddr::new("local://b")];
        write_address_file(&path, &addrs).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "2\nlocal://a\nlocal://b\n"
        );
        assert_eq!(read_address_file(&path).unwrap(), addrs);
    }

    #[test]
    fn test_address_file_short() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.cfg");
        std::fs::write(&path, "3\nlocal://a\n").unwrap();
        assert!(read_address_file(&path).is_err());
        std::fs::write(&path, "").unwrap();
        assert!(read_address_file(&path).is_err());
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        let transport = Arc::new(LocalTransport::new(PeerAddr::new("local://s")));
        let cfg = ServerConfig {
            table_size: 0,
            ..Default::default()
        };
        assert!(ServerContext::new(cfg, transport).is_err());
    }

    #[test]
    fn test_shutdown_flag_idempotent() {
        let transport = Arc::new(LocalTransport::new(PeerAddr::new("local://s")));
        let ctx = ServerContext::new(ServerConfig::default(), transport).unwrap();
        assert!(!ctx.is_shutting_down());
        assert!(ctx.request_shutdown());
        assert!(!ctx.request_shutdown());
        assert!(ctx.is_shutting_down());
    }

    #[tokio::test]
    async fn test_init_publishes_address() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _client) = start(config(dir.path(), false));
        assert_eq!(server.context().state(), ServerState::Initialized);
        let addrs = read_address_file(&dir.path().join("server.cfg")).unwrap();
        assert_eq!(addrs, vec![PeerAddr::new("local://server-0")]);
    }

    #[tokio::test]
    async fn test_serve_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = start(config(dir.path(), true));
        let ctx = server.context();
        let handle = tokio::spawn(server.serve());

        let resp = client
            .call(MetadataRequest::GenObjectId {
                user_id: 1,
                app_name: "app".into(),
                obj_name: "obj".into(),
                tags: String::new(),
                time_step: 0,
                dims: vec![],
                name_hash: name_hash("obj"),
            })
            .await
            .unwrap();
        assert!(matches!(resp, MetadataResponse::ObjectId { .. }));
        client.call(MetadataRequest::CloseServer).await.unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.offloaded_jobs, 2);
        assert_eq!(ctx.state(), ServerState::Terminated);
        assert!(ctx.store.is_empty());
    }

    #[tokio::test]
    async fn test_queued_request_rejected_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = start(config(dir.path(), false));
        server.context().request_shutdown();

        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call(MetadataRequest::GetById {
                        obj_id: crate::types::ObjectId::new(1),
                    })
                    .await
            }
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        server.serve().await.unwrap();
        let resp = pending.await.unwrap().unwrap();
        assert_eq!(resp.status(), Status::ShuttingDown);
    }

    #[tokio::test]
    async fn test_clients_gone_stops_server() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = start(config(dir.path(), false));
        drop(client);
        let summary = server.serve().await.unwrap();
        assert_eq!(summary.records, 0);
    }
}
