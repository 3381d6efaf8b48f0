//! Common test utilities: an in-process server driven through the RPC channel.

#![allow(dead_code)]

use std::sync::Arc;

use pdc_meta::server::{MetaClient, Server, ServerContext, ShutdownSummary};
use pdc_meta::{name_hash, MetaError, MetadataRequest, MetadataResponse, ObjectId, ServerConfig};
use pdc_transport::{channel, BulkAccess, BulkHandle, BulkRef, BulkTransport, LocalTransport, PeerAddr};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Address the test client identifies itself with.
pub const CLIENT_ADDR: &str = "local://client-7";

/// A running server plus a client connected to it.
pub struct TestServer {
    pub transport: Arc<LocalTransport>,
    pub client: MetaClient,
    pub ctx: Arc<ServerContext>,
    handle: JoinHandle<Result<ShutdownSummary, MetaError>>,
    _dir: TempDir,
}

impl TestServer {
    /// Starts a server with small tables and a fast progress loop.
    pub fn start(offload: bool) -> Self {
        Self::start_with(ServerConfig {
            table_size: 32,
            offload,
            progress_interval_ms: 10,
            ..Default::default()
        })
    }

    /// Starts a server with the given settings; `tmp_dir` is replaced with a temp dir.
    pub fn start_with(mut config: ServerConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        config.tmp_dir = dir.path().to_path_buf();
        let addr = PeerAddr::new(format!("local://server-{}", config.server_id));
        let transport = Arc::new(LocalTransport::new(addr.clone()));
        let (client, endpoint) = channel(addr, 256);
        let server = Server::init(config, transport.clone(), endpoint).expect("server init");
        let ctx = server.context();
        let handle = tokio::spawn(server.serve());
        Self {
            transport,
            client: client.with_origin(PeerAddr::new(CLIENT_ADDR)),
            ctx,
            handle,
            _dir: dir,
        }
    }

    /// Path of the temp dir holding the address file.
    pub fn tmp_dir(&self) -> &std::path::Path {
        self._dir.path()
    }

    pub async fn call(&self, request: MetadataRequest) -> MetadataResponse {
        self.client.call(request).await.expect("rpc call")
    }

    pub async fn generate(&self, user_id: u32, app: &str, name: &str, time_step: i32) -> MetadataResponse {
        self.call(MetadataRequest::GenObjectId {
            user_id,
            app_name: app.to_string(),
            obj_name: name.to_string(),
            tags: String::new(),
            time_step,
            dims: vec![],
            name_hash: name_hash(name),
        })
        .await
    }

    pub async fn generate_id(&self, user_id: u32, app: &str, name: &str, time_step: i32) -> ObjectId {
        match self.generate(user_id, app, name, time_step).await {
            MetadataResponse::ObjectId { obj_id } => obj_id,
            other => panic!("expected ObjectId, got {:?}", other),
        }
    }

    /// Exposes client memory the server can pull from.
    pub fn stage(&self, data: &[u8]) -> BulkHandle {
        self.transport
            .expose_as(PeerAddr::new(CLIENT_ADDR), data.to_vec(), BulkAccess::ReadWrite)
    }

    /// Pulls a buffer the server exported.
    pub async fn pull(&self, bulk: &BulkRef) -> Vec<u8> {
        let handle = self.transport.resolve(bulk).expect("exported buffer");
        self.transport
            .pull(&PeerAddr::new(CLIENT_ADDR), &handle, 0, handle.size())
            .await
            .expect("pull")
            .to_vec()
    }

    /// Asks the server to close and waits for it to finish.
    pub async fn shutdown(self) -> ShutdownSummary {
        let resp = self.call(MetadataRequest::CloseServer).await;
        assert!(matches!(resp, MetadataResponse::Ok));
        self.handle
            .await
            .expect("server task")
            .expect("server shutdown")
    }
}
