#![warn(missing_docs)]

//! Metadata server for a distributed object store: object registration and
//! duplicate detection, region locks and mappings, and the request dispatcher.

pub mod config;
pub mod datastore;
pub mod filter;
pub mod locking;
pub mod mapping;
pub mod metadata;
pub mod pool;
pub mod region;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod store;
pub mod types;

pub use config::ServerConfig;
pub use metadata::{name_hash, MetadataPatch, MetadataRecord, QueryFilter};
pub use region::{Region, StorageRegion};
pub use rpc::{decode_query_results, MetadataRequest, MetadataResponse, RpcDispatcher};
pub use server::{MetaClient, MetaEndpoint, Server, ServerContext, ServerState, ShutdownSummary};
pub use store::{MetadataStore, StoreConfig};
pub use types::{AccessType, ClientId, LockOp, MetaError, ObjectId, RegionId, Status};
