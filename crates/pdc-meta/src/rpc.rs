//! Metadata RPC protocol types and the request dispatcher.
//!
//! Requests and responses are serde enums so any transport can carry them.
//! Errors never cross the request boundary: every failure is answered with
//! `MetadataResponse::Error` carrying a [`Status`] code.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pdc_transport::{
    check_inline_size, BulkAccess, BulkHandle, BulkRef, BulkTransport, PeerAddr, MAX_INLINE_SIZE,
};

use crate::mapping::{MapRequest, MapTarget, UnmapOutcome};
use crate::metadata::{MetadataPatch, MetadataRecord, QueryFilter};
use crate::region::{Region, StorageRegion};
use crate::registry::ObjectRef;
use crate::server::ServerContext;
use crate::types::*;

/// Registry type under which exported bulk buffers are tracked.
pub const TYPE_BULK_EXPORT: u8 = 1;

/// Metadata operation request types.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MetadataRequest {
    /// Register a new object and obtain its id.
    GenObjectId {
        /// Owner; zero leaves it unset
        user_id: u32,
        /// Producing application
        app_name: String,
        /// Object name
        obj_name: String,
        /// Free-text tags
        tags: String,
        /// Time step, -1 when absent
        time_step: i32,
        /// Object shape
        dims: Vec<u64>,
        /// Hash of `obj_name` computed by the client
        name_hash: u32,
    },
    /// Look up the latest record with a name.
    QueryByName {
        /// Object name
        obj_name: String,
        /// Hash of `obj_name`
        name_hash: u32,
    },
    /// Look up a record by id.
    GetById {
        /// Target object
        obj_id: ObjectId,
    },
    /// Patch a record in place.
    Update {
        /// Target object
        obj_id: ObjectId,
        /// Fields to change
        patch: MetadataPatch,
    },
    /// Append a tag to a record.
    AddTag {
        /// Target object
        obj_id: ObjectId,
        /// Tag to append
        tag: String,
    },
    /// Delete a record by id.
    DeleteById {
        /// Target object
        obj_id: ObjectId,
    },
    /// Delete the latest record with a name.
    DeleteByName {
        /// Object name
        obj_name: String,
        /// Hash of `obj_name`
        name_hash: u32,
        /// Restrict to one version
        time_step: Option<i32>,
    },
    /// Return every record matching a filter.
    QueryPartial {
        /// Match criteria
        filter: QueryFilter,
    },
    /// Obtain or release a region lock.
    RegionLock {
        /// Locked object
        obj_id: ObjectId,
        /// Locked region
        region_id: RegionId,
        /// Region bounds
        region: Region,
        /// Read or write
        access: AccessType,
        /// Obtain or release
        op: LockOp,
        /// The region has a mapping whose data must be pulled on write release
        mapped: bool,
        /// Requesting client
        client_id: ClientId,
    },
    /// Map a local region onto a remote one.
    RegionMap {
        /// Local object
        local_obj: ObjectId,
        /// Local region
        local_region: RegionId,
        /// Dimensionality of the local region
        local_ndim: u32,
        /// Remote object
        remote_obj: ObjectId,
        /// Remote region
        remote_region: RegionId,
        /// Client owning the staged data
        remote_client: ClientId,
        /// Staged data buffer
        bulk: BulkRef,
    },
    /// Remove region mappings.
    RegionUnmap {
        /// Local object
        local_obj: ObjectId,
        /// One region, or every region of the object when absent
        local_region: Option<RegionId>,
        /// One remote target of `local_region`, or all of them when absent
        remote: Option<(ObjectId, RegionId)>,
    },
    /// Read a region payload into an exported buffer.
    DataRead {
        /// Target object
        obj_id: ObjectId,
        /// Region to read
        region: Region,
        /// Requesting client
        client_id: ClientId,
    },
    /// Store a region payload pulled from the client.
    DataWrite {
        /// Target object
        obj_id: ObjectId,
        /// Region to write
        region: Region,
        /// Requesting client
        client_id: ClientId,
        /// Buffer holding the payload
        bulk: BulkRef,
    },
    /// Attach a storage extent to a record.
    UpdateRegionLocation {
        /// Target object
        obj_id: ObjectId,
        /// Extent to record
        location: StorageRegion,
    },
    /// List storage extents overlapping a region.
    GetStorageInfo {
        /// Target object
        obj_id: ObjectId,
        /// Region of interest
        region: Region,
    },
    /// Release a buffer exported by a query or read.
    ReleaseBulk {
        /// Export id returned with the buffer
        export_id: u64,
    },
    /// Stop the server.
    CloseServer,
}

impl MetadataRequest {
    /// Returns the opcode for this request.
    pub fn opcode(&self) -> u16 {
        request_to_opcode(self)
    }
}

/// Maps a request to its opcode (0x0200-0x0210).
pub fn request_to_opcode(request: &MetadataRequest) -> u16 {
    match request {
        MetadataRequest::GenObjectId { .. } => 0x0200,
        MetadataRequest::QueryByName { .. } => 0x0201,
        MetadataRequest::GetById { .. } => 0x0202,
        MetadataRequest::Update { .. } => 0x0203,
        MetadataRequest::AddTag { .. } => 0x0204,
        MetadataRequest::DeleteById { .. } => 0x0205,
        MetadataRequest::DeleteByName { .. } => 0x0206,
        MetadataRequest::QueryPartial { .. } => 0x0207,
        MetadataRequest::RegionLock { .. } => 0x0208,
        MetadataRequest::RegionMap { .. } => 0x0209,
        MetadataRequest::RegionUnmap { .. } => 0x020A,
        MetadataRequest::DataRead { .. } => 0x020B,
        MetadataRequest::DataWrite { .. } => 0x020C,
        MetadataRequest::UpdateRegionLocation { .. } => 0x020D,
        MetadataRequest::GetStorageInfo { .. } => 0x020E,
        MetadataRequest::ReleaseBulk { .. } => 0x020F,
        MetadataRequest::CloseServer => 0x0210,
    }
}

/// Returns true if the request does not modify server state.
pub fn is_read_only(request: &MetadataRequest) -> bool {
    matches!(
        request,
        MetadataRequest::QueryByName { .. }
            | MetadataRequest::GetById { .. }
            | MetadataRequest::QueryPartial { .. }
            | MetadataRequest::GetStorageInfo { .. }
    )
}

/// Metadata operation response types.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MetadataResponse {
    /// Id assigned to a new object.
    ObjectId {
        /// New object id
        obj_id: ObjectId,
    },
    /// A single record.
    Record {
        /// The record
        record: MetadataRecord,
    },
    /// Nothing matched.
    NotFound,
    /// Success without payload.
    Ok,
    /// Lock granted.
    LockGranted {
        /// Lock instance id
        lock_id: u64,
    },
    /// Lock released.
    LockReleased {
        /// Mapped targets whose data was pulled before release
        transferred: usize,
    },
    /// Region mapped.
    Mapped {
        /// Targets of the local pair after this call
        mapping_count: usize,
    },
    /// Mappings removed.
    Unmapped {
        /// Records removed entirely
        records: usize,
        /// Targets dropped
        targets: usize,
    },
    /// Partial-query results small enough to travel inline.
    QueryInline {
        /// Matching records
        records: Vec<MetadataRecord>,
    },
    /// Partial-query results staged in an exported buffer.
    QueryBulk {
        /// Buffer holding the encoded records
        bulk: BulkRef,
        /// Number of records encoded
        count: usize,
        /// Id to pass to `ReleaseBulk` once the buffer was pulled
        export_id: u64,
    },
    /// Region payload staged in an exported buffer.
    Shm {
        /// Buffer holding the payload
        bulk: BulkRef,
        /// Payload size in bytes
        size: u64,
        /// Id to pass to `ReleaseBulk` once the buffer was pulled
        export_id: u64,
    },
    /// Region payload stored.
    Written {
        /// Bytes stored
        size: u64,
    },
    /// Storage extents.
    StorageRegions {
        /// Overlapping extents
        regions: Vec<StorageRegion>,
    },
    /// The request failed.
    Error {
        /// Status code
        status: Status,
        /// Human-readable message
        message: String,
    },
}

impl MetadataResponse {
    /// Builds an error response from a server error.
    pub fn from_error(err: &MetaError) -> Self {
        MetadataResponse::Error {
            status: err.status(),
            message: err.to_string(),
        }
    }

    /// Status code of the response.
    pub fn status(&self) -> Status {
        match self {
            MetadataResponse::Error { status, .. } => *status,
            MetadataResponse::NotFound => Status::NotFound,
            _ => Status::Ok,
        }
    }
}

/// Decodes the records staged by a `QueryBulk` response.
pub fn decode_query_results(data: &[u8]) -> Result<Vec<MetadataRecord>> {
    Ok(bincode::deserialize(data)?)
}

/// Exported buffer kept alive until the client releases it.
pub struct BulkExport {
    handle: BulkHandle,
}

impl BulkExport {
    /// The exported buffer.
    pub fn handle(&self) -> &BulkHandle {
        &self.handle
    }
}

/// Deferred tail of a write release on a mapped region.
///
/// The lock stays held until every target's staged data has been pulled and
/// stored under the locked object and bounds; only then is the release
/// recorded and the caller answered.
pub struct LockReleaseContinuation {
    obj_id: ObjectId,
    region_id: RegionId,
    region: Region,
    holder: ClientId,
    targets: Vec<MapTarget>,
}

impl LockReleaseContinuation {
    /// Captures the targets mapped to the pair, failing if there are none.
    pub fn prepare(
        ctx: &ServerContext,
        obj_id: ObjectId,
        region_id: RegionId,
        region: Region,
        holder: ClientId,
    ) -> Result<Self> {
        let targets = ctx
            .maps
            .targets(obj_id, region_id)
            .filter(|t| !t.is_empty())
            .ok_or(MetaError::RegionNotMapped {
                obj: obj_id,
                region: region_id,
            })?;
        Ok(Self {
            obj_id,
            region_id,
            region,
            holder,
            targets,
        })
    }

    /// Number of targets to pull.
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Pulls and stores each target's data, then releases the lock.
    /// Targets are written in map order, so the last one's payload is what a
    /// later read of the region returns. On a transfer failure the lock is
    /// left in place.
    pub async fn complete(self, ctx: &ServerContext) -> Result<usize> {
        for target in &self.targets {
            let data = ctx
                .transport
                .pull(&target.origin, &target.bulk, 0, target.bulk.size())
                .await
                .inspect_err(|e| {
                    warn!(obj = %self.obj_id, region = %self.region_id, origin = %target.origin, error = %e, "pull for write release failed");
                })?;
            debug!(obj = %self.obj_id, remote_obj = %target.remote_obj, remote_region = %target.remote_region, size = data.len(), "mapped data pulled");
            ctx.data.write(self.obj_id, &self.region, data)?;
        }
        ctx.locks
            .release(self.obj_id, self.region_id, AccessType::Write, self.holder)?;
        debug!(obj = %self.obj_id, region = %self.region_id, targets = self.targets.len(), "write release completed");
        Ok(self.targets.len())
    }
}

/// RPC dispatcher for metadata requests.
#[derive(Clone)]
pub struct RpcDispatcher {
    ctx: Arc<ServerContext>,
}

impl RpcDispatcher {
    /// Creates a dispatcher over a server context.
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// The server context requests operate on.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Handles one request from `origin`. Never fails; errors become `Error` responses.
    pub async fn dispatch(&self, origin: &PeerAddr, request: MetadataRequest) -> MetadataResponse {
        let opcode = request.opcode();
        match self.handle(origin, request).await {
            Ok(response) => response,
            Err(e) => {
                match e.status() {
                    Status::Duplicate | Status::NotFound | Status::AlreadyMapped => {
                        debug!(opcode, %origin, error = %e, "request rejected")
                    }
                    _ => warn!(opcode, %origin, error = %e, "request failed"),
                }
                MetadataResponse::from_error(&e)
            }
        }
    }

    async fn handle(&self, origin: &PeerAddr, request: MetadataRequest) -> Result<MetadataResponse> {
        let ctx = &self.ctx;
        match request {
            MetadataRequest::GenObjectId {
                user_id,
                app_name,
                obj_name,
                tags,
                time_step,
                dims,
                name_hash,
            } => {
                if obj_name.is_empty() {
                    return Err(MetaError::InvalidRequest("object name is empty".into()));
                }
                let mut record = MetadataRecord::new(user_id, app_name, obj_name, time_step)
                    .with_tags(tags);
                if !dims.is_empty() {
                    MetadataPatch {
                        dims: Some(dims),
                        ..Default::default()
                    }
                    .apply(&mut record)?;
                }
                let obj_id = ctx.store.insert(record, name_hash)?;
                Ok(MetadataResponse::ObjectId { obj_id })
            }
            MetadataRequest::QueryByName {
                obj_name,
                name_hash,
            } => Ok(ctx
                .store
                .query_by_name_hash(&obj_name, name_hash)?
                .map_or(MetadataResponse::NotFound, |record| {
                    MetadataResponse::Record { record }
                })),
            MetadataRequest::GetById { obj_id } => Ok(ctx
                .store
                .get_by_id(obj_id)?
                .map_or(MetadataResponse::NotFound, |record| {
                    MetadataResponse::Record { record }
                })),
            MetadataRequest::Update { obj_id, patch } => {
                let record = ctx.store.update(obj_id, &patch)?;
                Ok(MetadataResponse::Record { record })
            }
            MetadataRequest::AddTag { obj_id, tag } => {
                ctx.store.add_tag(obj_id, &tag)?;
                Ok(MetadataResponse::Ok)
            }
            MetadataRequest::DeleteById { obj_id } => {
                let record = ctx.store.delete_by_id(obj_id)?;
                self.teardown_object(record.obj_id);
                Ok(MetadataResponse::Ok)
            }
            MetadataRequest::DeleteByName {
                obj_name,
                name_hash,
                time_step,
            } => {
                let record = ctx.store.delete_by_name(&obj_name, name_hash, time_step)?;
                self.teardown_object(record.obj_id);
                Ok(MetadataResponse::Ok)
            }
            MetadataRequest::QueryPartial { filter } => {
                let records = ctx.store.query_partial(&filter)?;
                self.query_response(records)
            }
            MetadataRequest::RegionLock {
                obj_id,
                region_id,
                region,
                access,
                op,
                mapped,
                client_id,
            } => {
                region.validate()?;
                match op {
                    LockOp::Obtain => {
                        let lock_id = ctx
                            .locks
                            .acquire(obj_id, region_id, region, access, client_id)?;
                        Ok(MetadataResponse::LockGranted { lock_id })
                    }
                    LockOp::Release if mapped && access == AccessType::Write => {
                        let continuation =
                            LockReleaseContinuation::prepare(
                            ctx, obj_id, region_id, region, client_id,
                        )?;
                        let transferred = continuation.complete(ctx).await?;
                        Ok(MetadataResponse::LockReleased { transferred })
                    }
                    LockOp::Release => {
                        if !ctx.locks.release(obj_id, region_id, access, client_id)? {
                            debug!(obj = %obj_id, region = %region_id, client = %client_id, "release of unheld lock");
                        }
                        Ok(MetadataResponse::LockReleased { transferred: 0 })
                    }
                }
            }
            MetadataRequest::RegionMap {
                local_obj,
                local_region,
                local_ndim,
                remote_obj,
                remote_region,
                remote_client,
                bulk,
            } => {
                let bulk = ctx.transport.resolve(&bulk)?;
                let mapping_count = ctx.maps.map(MapRequest {
                    local_obj,
                    local_region,
                    local_ndim,
                    remote_obj,
                    remote_region,
                    remote_client,
                    origin: origin.dup(),
                    bulk,
                })?;
                Ok(MetadataResponse::Mapped { mapping_count })
            }
            MetadataRequest::RegionUnmap {
                local_obj,
                local_region,
                remote,
            } => {
                let outcome = match (local_region, remote) {
                    (Some(region), Some((remote_obj, remote_region))) => {
                        ctx.maps
                            .unmap_target(local_obj, region, remote_obj, remote_region)
                    }
                    (None, Some(_)) => {
                        return Err(MetaError::InvalidRequest(
                            "unmapping a single target requires a local region".into(),
                        ))
                    }
                    (region, None) => ctx.maps.unmap(local_obj, region),
                };
                Ok(match outcome {
                    UnmapOutcome::Removed { records, targets } => {
                        MetadataResponse::Unmapped { records, targets }
                    }
                    UnmapOutcome::NotMapped => MetadataResponse::NotFound,
                })
            }
            MetadataRequest::DataRead {
                obj_id,
                region,
                client_id,
            } => {
                region.validate()?;
                self.require_object(obj_id)?;
                let Some(data) = ctx.data.read(obj_id, &region)? else {
                    return Ok(MetadataResponse::NotFound);
                };
                let size = data.len() as u64;
                let (bulk, export_id) = self.export(data.to_vec())?;
                debug!(obj = %obj_id, client = %client_id, size, "region read exported");
                Ok(MetadataResponse::Shm {
                    bulk,
                    size,
                    export_id,
                })
            }
            MetadataRequest::DataWrite {
                obj_id,
                region,
                client_id,
                bulk,
            } => {
                region.validate()?;
                self.require_object(obj_id)?;
                let handle = ctx.transport.resolve(&bulk)?;
                let data: Bytes = ctx
                    .transport
                    .pull(origin, &handle, 0, handle.size())
                    .await?;
                let size = data.len() as u64;
                ctx.data.write(obj_id, &region, data)?;
                debug!(obj = %obj_id, client = %client_id, size, "region written");
                Ok(MetadataResponse::Written { size })
            }
            MetadataRequest::UpdateRegionLocation { obj_id, location } => {
                ctx.store.update_region_location(obj_id, location)?;
                Ok(MetadataResponse::Ok)
            }
            MetadataRequest::GetStorageInfo { obj_id, region } => {
                let regions = ctx.store.get_storage_info(obj_id, &region)?;
                Ok(MetadataResponse::StorageRegions { regions })
            }
            MetadataRequest::ReleaseBulk { export_id } => {
                ctx.registry.decrement_ref(export_id)?;
                Ok(MetadataResponse::Ok)
            }
            MetadataRequest::CloseServer => {
                if ctx.request_shutdown() {
                    info!(%origin, "close requested");
                }
                Ok(MetadataResponse::Ok)
            }
        }
    }

    fn require_object(&self, obj_id: ObjectId) -> Result<()> {
        if self.ctx.store.contains(obj_id) {
            Ok(())
        } else {
            Err(MetaError::ObjectNotFound(obj_id))
        }
    }

    /// Drops everything hanging off a deleted object.
    /// The record is already gone, so failures here are logged, not returned.
    fn teardown_object(&self, obj_id: ObjectId) {
        let unmapped = self.ctx.maps.unmap(obj_id, None);
        let locks = self
            .ctx
            .locks
            .release_object(obj_id)
            .inspect_err(|e| warn!(obj = %obj_id, error = %e, "could not drop locks of deleted object"))
            .unwrap_or(0);
        let payloads = self
            .ctx
            .data
            .delete_object(obj_id)
            .inspect_err(|e| warn!(obj = %obj_id, error = %e, "could not drop payloads of deleted object"))
            .unwrap_or(0);
        debug!(obj = %obj_id, ?unmapped, locks, payloads, "object torn down");
    }

    fn query_response(&self, records: Vec<MetadataRecord>) -> Result<MetadataResponse> {
        let count = records.len();
        let encoded_size = bincode::serialized_size(&records)? as usize;
        if count <= self.ctx.config.inline_query_limit && encoded_size <= MAX_INLINE_SIZE {
            check_inline_size(encoded_size)?;
            return Ok(MetadataResponse::QueryInline { records });
        }
        let encoded = bincode::serialize(&records)?;
        let (bulk, export_id) = self.export(encoded)?;
        debug!(count, size = encoded_size, "partial query staged in bulk buffer");
        Ok(MetadataResponse::QueryBulk {
            bulk,
            count,
            export_id,
        })
    }

    /// Exposes a read-only buffer and tracks it until the client releases it.
    fn export(&self, data: Vec<u8>) -> Result<(BulkRef, u64)> {
        let handle = self.ctx.transport.expose(data, BulkAccess::ReadOnly);
        let bulk = handle.to_ref();
        let handle_id = handle.id();
        let object: ObjectRef = Arc::new(BulkExport { handle });
        match self.ctx.registry.register_object(TYPE_BULK_EXPORT, object) {
            Ok(export_id) => Ok((bulk, export_id)),
            Err(e) => {
                if let Err(revoke_err) = self.ctx.transport.revoke(handle_id) {
                    warn!(bulk_id = handle_id, error = %revoke_err, "could not revoke unregistered export");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::datastore::{MemoryRegionStore, RegionStore};
    use crate::metadata::name_hash;
    use pdc_transport::{BulkTransport, Fault, LocalTransport};

    const CLIENT: ClientId = ClientId::new(7);

    struct Fixture {
        transport: Arc<LocalTransport>,
        dispatcher: RpcDispatcher,
        client: PeerAddr,
    }

    fn fixture() -> Fixture {
        fixture_with(ServerConfig {
            table_size: 16,
            ..Default::default()
        })
    }

    fn fixture_with(config: ServerConfig) -> Fixture {
        let transport = Arc::new(LocalTransport::new(PeerAddr::new("local://server-0")));
        let ctx = ServerContext::new(config, transport.clone()).unwrap();
        Fixture {
            transport,
            dispatcher: RpcDispatcher::new(Arc::new(ctx)),
            client: PeerAddr::new("local://client-7"),
        }
    }

    impl Fixture {
        async fn call(&self, request: MetadataRequest) -> MetadataResponse {
            self.dispatcher.dispatch(&self.client, request).await
        }

        fn stage(&self, data: &[u8]) -> BulkHandle {
            self.transport
                .expose_as(self.client.clone(), data.to_vec(), BulkAccess::ReadWrite)
        }
    }

    fn generate(name: &str, ts: i32) -> MetadataRequest {
        MetadataRequest::GenObjectId {
            user_id: 42,
            app_name: "sim".into(),
            obj_name: name.into(),
            tags: String::new(),
            time_step: ts,
            dims: vec![],
            name_hash: name_hash(name),
        }
    }

    fn lock(access: AccessType, op: LockOp, mapped: bool) -> MetadataRequest {
        MetadataRequest::RegionLock {
            obj_id: ObjectId::new(1),
            region_id: RegionId::new(1),
            region: Region::linear(0, 8),
            access,
            op,
            mapped,
            client_id: CLIENT,
        }
    }

    fn map(f: &Fixture, remote_obj: u64, payload: &[u8]) -> MetadataRequest {
        MetadataRequest::RegionMap {
            local_obj: ObjectId::new(1),
            local_region: RegionId::new(1),
            local_ndim: 1,
            remote_obj: ObjectId::new(remote_obj),
            remote_region: RegionId::new(5),
            remote_client: CLIENT,
            bulk: f.stage(payload).to_ref(),
        }
    }

    fn object_id(resp: MetadataResponse) -> ObjectId {
        match resp {
            MetadataResponse::ObjectId { obj_id } => obj_id,
            other => panic!("expected ObjectId, got {:?}", other),
        }
    }

    #[test]
    fn test_request_serialization_roundtrip() {
        let request = MetadataRequest::DeleteByName {
            obj_name: "run1".into(),
            name_hash: 9,
            time_step: Some(3),
        };
        let serialized = bincode::serialize(&request).unwrap();
        let deserialized: MetadataRequest = bincode::deserialize(&serialized).unwrap();
        match deserialized {
            MetadataRequest::DeleteByName {
                obj_name,
                time_step,
                ..
            } => {
                assert_eq!(obj_name, "run1");
                assert_eq!(time_step, Some(3));
            }
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn test_opcode_mapping() {
        assert_eq!(generate("x", 0).opcode(), 0x0200);
        assert_eq!(
            request_to_opcode(&MetadataRequest::GetById {
                obj_id: ObjectId::new(1)
            }),
            0x0202
        );
        assert_eq!(lock(AccessType::Read, LockOp::Obtain, false).opcode(), 0x0208);
        assert_eq!(MetadataRequest::CloseServer.opcode(), 0x0210);
    }

    #[test]
    fn test_is_read_only() {
        assert!(is_read_only(&MetadataRequest::QueryPartial {
            filter: QueryFilter::default()
        }));
        assert!(!is_read_only(&generate("x", 0)));
    }

    #[tokio::test]
    async fn test_generate_query_delete() {
        let f = fixture();
        let id = object_id(f.call(generate("run1", 0)).await);
        assert!(id.as_u64() > 0);

        assert_eq!(f.call(generate("run1", 0)).await.status(), Status::Duplicate);

        let found = f
            .call(MetadataRequest::QueryByName {
                obj_name: "run1".into(),
                name_hash: name_hash("run1"),
            })
            .await;
        match found {
            MetadataResponse::Record { record } => assert_eq!(record.obj_id, id),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            f.call(MetadataRequest::DeleteById { obj_id: id }).await,
            MetadataResponse::Ok
        ));
        assert!(matches!(
            f.call(MetadataRequest::GetById { obj_id: id }).await,
            MetadataResponse::NotFound
        ));
        assert_eq!(
            f.call(MetadataRequest::DeleteById { obj_id: id })
                .await
                .status(),
            Status::NotFound
        );
    }

    #[tokio::test]
    async fn test_generate_rejects_bad_shape() {
        let f = fixture();
        let resp = f
            .call(MetadataRequest::GenObjectId {
                user_id: 1,
                app_name: "a".into(),
                obj_name: "x".into(),
                tags: String::new(),
                time_step: 0,
                dims: vec![1, 2, 3, 4, 5],
                name_hash: 1,
            })
            .await;
        assert_eq!(resp.status(), Status::InvalidRequest);
        assert_eq!(
            f.call(generate("", 0)).await.status(),
            Status::InvalidRequest
        );
    }

    #[tokio::test]
    async fn test_update_and_tag() {
        let f = fixture();
        let id = object_id(f.call(generate("run1", 0)).await);
        let resp = f
            .call(MetadataRequest::Update {
                obj_id: id,
                patch: MetadataPatch {
                    data_location: Some("/lustre/run1".into()),
                    ..Default::default()
                },
            })
            .await;
        match resp {
            MetadataResponse::Record { record } => {
                assert_eq!(record.data_location, "/lustre/run1")
            }
            other => panic!("unexpected {:?}", other),
        }
        f.call(MetadataRequest::AddTag {
            obj_id: id,
            tag: "hot".into(),
        })
        .await;
        match f.call(MetadataRequest::GetById { obj_id: id }).await {
            MetadataResponse::Record { record } => assert!(record.has_tag("hot")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_map_protocol() {
        let f = fixture();
        assert!(matches!(
            f.call(map(&f, 2, b"aaaa")).await,
            MetadataResponse::Mapped { mapping_count: 1 }
        ));
        assert_eq!(
            f.call(map(&f, 2, b"bbbb")).await.status(),
            Status::AlreadyMapped
        );
        assert!(matches!(
            f.call(map(&f, 3, b"cccc")).await,
            MetadataResponse::Mapped { mapping_count: 2 }
        ));

        let unmap = MetadataRequest::RegionUnmap {
            local_obj: ObjectId::new(1),
            local_region: Some(RegionId::new(1)),
            remote: None,
        };
        assert!(matches!(
            f.call(unmap.clone()).await,
            MetadataResponse::Unmapped {
                records: 1,
                targets: 2
            }
        ));
        assert!(matches!(f.call(unmap).await, MetadataResponse::NotFound));

        assert_eq!(
            f.call(lock(AccessType::Write, LockOp::Release, true))
                .await
                .status(),
            Status::RegionNotMapped
        );
    }

    #[tokio::test]
    async fn test_map_unknown_bulk_fails() {
        let f = fixture();
        let mut req = map(&f, 2, b"x");
        if let MetadataRequest::RegionMap { bulk, .. } = &mut req {
            bulk.id = 9_999;
        }
        assert_eq!(f.call(req).await.status(), Status::TransportError);
    }

    #[tokio::test]
    async fn test_write_release_pulls_mapped_data() {
        let f = fixture();
        let obj = object_id(f.call(generate("field", 0)).await);
        let region = Region::linear(0, 8);
        let lock_on = |op| MetadataRequest::RegionLock {
            obj_id: obj,
            region_id: RegionId::new(1),
            region: region.clone(),
            access: AccessType::Write,
            op,
            mapped: true,
            client_id: CLIENT,
        };
        let mut req = map(&f, 2, b"payload");
        if let MetadataRequest::RegionMap { local_obj, .. } = &mut req {
            *local_obj = obj;
        }
        f.call(req).await;

        assert!(matches!(
            f.call(lock_on(LockOp::Obtain)).await,
            MetadataResponse::LockGranted { .. }
        ));
        assert!(matches!(
            f.call(lock_on(LockOp::Release)).await,
            MetadataResponse::LockReleased { transferred: 1 }
        ));

        let read = MetadataRequest::DataRead {
            obj_id: obj,
            region: region.clone(),
            client_id: CLIENT,
        };
        match f.call(read).await {
            MetadataResponse::Shm { bulk, size, .. } => {
                assert_eq!(size, 7);
                let handle = f.transport.resolve(&bulk).unwrap();
                assert_eq!(handle.snapshot(), b"payload".to_vec());
            }
            other => panic!("expected Shm, got {:?}", other),
        }
        let ctx = f.dispatcher.context();
        assert!(!ctx.locks.is_locked(obj, RegionId::new(1)).unwrap());
    }

    #[tokio::test]
    async fn test_write_release_transfer_failure_keeps_lock() {
        let f = fixture();
        f.call(map(&f, 2, b"payload")).await;
        f.call(lock(AccessType::Write, LockOp::Obtain, true)).await;
        f.transport.inject_fault(Fault::Fail);
        assert_eq!(
            f.call(lock(AccessType::Write, LockOp::Release, true))
                .await
                .status(),
            Status::TransportError
        );
        let ctx = f.dispatcher.context();
        assert!(ctx
            .locks
            .is_locked(ObjectId::new(1), RegionId::new(1))
            .unwrap());

        // Retrying after the fault clears succeeds.
        assert!(matches!(
            f.call(lock(AccessType::Write, LockOp::Release, true)).await,
            MetadataResponse::LockReleased { transferred: 1 }
        ));
    }

    #[tokio::test]
    async fn test_lock_conflict_and_plain_release() {
        let f = fixture();
        f.call(lock(AccessType::Read, LockOp::Obtain, false)).await;
        assert_eq!(
            f.call(lock(AccessType::Write, LockOp::Obtain, false))
                .await
                .status(),
            Status::LockConflict
        );
        assert!(matches!(
            f.call(lock(AccessType::Read, LockOp::Release, false)).await,
            MetadataResponse::LockReleased { transferred: 0 }
        ));
        assert!(matches!(
            f.call(lock(AccessType::Write, LockOp::Obtain, false)).await,
            MetadataResponse::LockGranted { .. }
        ));
    }

    #[tokio::test]
    async fn test_query_partial_inline_then_bulk() {
        let f = fixture_with(ServerConfig {
            table_size: 16,
            inline_query_limit: 5,
            ..Default::default()
        });
        for ts in 0..5 {
            object_id(f.call(generate("series", ts)).await);
        }
        let query = MetadataRequest::QueryPartial {
            filter: QueryFilter {
                obj_name: Some("series".into()),
                ..Default::default()
            },
        };
        match f.call(query.clone()).await {
            MetadataResponse::QueryInline { records } => assert_eq!(records.len(), 5),
            other => panic!("unexpected {:?}", other),
        }

        object_id(f.call(generate("series", 5)).await);
        let (bulk, count, export_id) = match f.call(query).await {
            MetadataResponse::QueryBulk {
                bulk,
                count,
                export_id,
            } => (bulk, count, export_id),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(count, 6);
        let handle = f.transport.resolve(&bulk).unwrap();
        let data = f
            .transport
            .pull(&f.client, &handle, 0, handle.size())
            .await
            .unwrap();
        let records = decode_query_results(&data).unwrap();
        assert_eq!(records.len(), 6);

        assert!(f.transport.is_exposed(bulk.id));
        assert!(matches!(
            f.call(MetadataRequest::ReleaseBulk { export_id }).await,
            MetadataResponse::Ok
        ));
        assert!(!f.transport.is_exposed(bulk.id));
        assert_eq!(
            f.call(MetadataRequest::ReleaseBulk { export_id })
                .await
                .status(),
            Status::InvalidId
        );
    }

    #[tokio::test]
    async fn test_data_write_then_read() {
        let f = fixture();
        let id = object_id(f.call(generate("grid", 0)).await);
        let region = Region::linear(0, 4);
        let staged = f.stage(b"\x01\x02\x03\x04");
        assert!(matches!(
            f.call(MetadataRequest::DataWrite {
                obj_id: id,
                region: region.clone(),
                client_id: CLIENT,
                bulk: staged.to_ref(),
            })
            .await,
            MetadataResponse::Written { size: 4 }
        ));

        let (bulk, export_id) = match f
            .call(MetadataRequest::DataRead {
                obj_id: id,
                region: region.clone(),
                client_id: CLIENT,
            })
            .await
        {
            MetadataResponse::Shm {
                bulk,
                size,
                export_id,
            } => {
                assert_eq!(size, 4);
                (bulk, export_id)
            }
            other => panic!("unexpected {:?}", other),
        };
        let handle = f.transport.resolve(&bulk).unwrap();
        assert_eq!(handle.snapshot(), vec![1, 2, 3, 4]);
        f.call(MetadataRequest::ReleaseBulk { export_id }).await;

        assert!(matches!(
            f.call(MetadataRequest::DataRead {
                obj_id: id,
                region: Region::linear(4, 4),
                client_id: CLIENT,
            })
            .await,
            MetadataResponse::NotFound
        ));
        assert_eq!(
            f.call(MetadataRequest::DataRead {
                obj_id: ObjectId::new(5),
                region,
                client_id: CLIENT,
            })
            .await
            .status(),
            Status::NotFound
        );
    }

    #[tokio::test]
    async fn test_delete_tears_down_object_state() {
        let f = fixture();
        let id = object_id(f.call(generate("grid", 0)).await);
        let staged = f.stage(b"abcd");
        f.call(MetadataRequest::DataWrite {
            obj_id: id,
            region: Region::linear(0, 4),
            client_id: CLIENT,
            bulk: staged.to_ref(),
        })
        .await;
        f.call(MetadataRequest::RegionMap {
            local_obj: id,
            local_region: RegionId::new(1),
            local_ndim: 1,
            remote_obj: ObjectId::new(2),
            remote_region: RegionId::new(1),
            remote_client: CLIENT,
            bulk: staged.to_ref(),
        })
        .await;
        let before = staged.ref_count();

        f.call(MetadataRequest::DeleteByName {
            obj_name: "grid".into(),
            name_hash: name_hash("grid"),
            time_step: None,
        })
        .await;

        let ctx = f.dispatcher.context();
        assert!(!ctx.maps.is_mapped(id, RegionId::new(1)));
        assert_eq!(staged.ref_count(), before - 1);
        assert_eq!(ctx.data.len().unwrap(), 0);
    }

    struct BrokenDeletes(MemoryRegionStore);

    impl RegionStore for BrokenDeletes {
        fn write(&self, obj: ObjectId, region: &Region, data: Bytes) -> Result<()> {
            self.0.write(obj, region, data)
        }

        fn read(&self, obj: ObjectId, region: &Region) -> Result<Option<Bytes>> {
            self.0.read(obj, region)
        }

        fn delete_object(&self, _obj: ObjectId) -> Result<usize> {
            Err(MetaError::Internal("payload store offline".into()))
        }

        fn len(&self) -> Result<usize> {
            self.0.len()
        }
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_teardown_fails() {
        let transport = Arc::new(LocalTransport::new(PeerAddr::new("local://server-0")));
        let ctx = ServerContext::with_region_store(
            ServerConfig {
                table_size: 16,
                ..Default::default()
            },
            transport.clone(),
            Arc::new(BrokenDeletes(MemoryRegionStore::new())),
        )
        .unwrap();
        let f = Fixture {
            transport,
            dispatcher: RpcDispatcher::new(Arc::new(ctx)),
            client: PeerAddr::new("local://client-7"),
        };
        let id = object_id(f.call(generate("grid", 0)).await);

        assert!(matches!(
            f.call(MetadataRequest::DeleteById { obj_id: id }).await,
            MetadataResponse::Ok
        ));
        assert!(matches!(
            f.call(MetadataRequest::GetById { obj_id: id }).await,
            MetadataResponse::NotFound
        ));
    }

    #[tokio::test]
    async fn test_unregistered_export_is_revoked() {
        let f = fixture_with(ServerConfig {
            table_size: 16,
            inline_query_limit: 1,
            ..Default::default()
        });
        for ts in 0..3 {
            f.call(generate("wide", ts)).await;
        }
        let ctx = f.dispatcher.context();
        ctx.registry.destroy_type(TYPE_BULK_EXPORT).unwrap();
        let last_staged = f.stage(b"marker").id();

        let resp = f
            .call(MetadataRequest::QueryPartial {
                filter: QueryFilter::default(),
            })
            .await;
        assert_eq!(resp.status(), Status::InvalidType);
        assert!(!f.transport.is_exposed(last_staged + 1));
        assert!(f.transport.is_exposed(last_staged));
    }

    #[tokio::test]
    async fn test_storage_info() {
        let f = fixture();
        let id = object_id(f.call(generate("grid", 0)).await);
        f.call(MetadataRequest::UpdateRegionLocation {
            obj_id: id,
            location: StorageRegion {
                region: Region::linear(0, 10),
                location: "/data/grid.0".into(),
                offset: 0,
            },
        })
        .await;
        match f
            .call(MetadataRequest::GetStorageInfo {
                obj_id: id,
                region: Region::linear(5, 1),
            })
            .await
        {
            MetadataResponse::StorageRegions { regions } => {
                assert_eq!(regions.len(), 1);
                assert_eq!(regions[0].location, "/data/grid.0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmap_single_target_requires_region() {
        let f = fixture();
        let resp = f
            .call(MetadataRequest::RegionUnmap {
                local_obj: ObjectId::new(1),
                local_region: None,
                remote: Some((ObjectId::new(2), RegionId::new(5))),
            })
            .await;
        assert_eq!(resp.status(), Status::InvalidRequest);
    }

    #[tokio::test]
    async fn test_close_server_sets_flag() {
        let f = fixture();
        assert!(!f.dispatcher.context().is_shutting_down());
        assert!(matches!(
            f.call(MetadataRequest::CloseServer).await,
            MetadataResponse::Ok
        ));
        assert!(f.dispatcher.context().is_shutting_down());
        // Idempotent.
        assert!(matches!(
            f.call(MetadataRequest::CloseServer).await,
            MetadataResponse::Ok
        ));
    }
}
