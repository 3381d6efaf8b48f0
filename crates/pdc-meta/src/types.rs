//! Identifiers, lock and status enums, and the server error type.

use serde::{Deserialize, Serialize};
use std::fmt;

use pdc_transport::TransportError;

/// Identifier of a metadata object, unique across the server group
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Creates a new ObjectId from a raw u64 value
    pub const fn new(id: u64) -> Self {
        ObjectId(id)
    }

    /// Returns the raw u64 value of this object ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Encodes the id as big-endian bytes for ordered key construction
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a region within one object
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(u64);

impl RegionId {
    /// Creates a new RegionId from a raw u64 value
    pub const fn new(id: u64) -> Self {
        RegionId(id)
    }

    /// Returns the raw u64 value of this region ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a client process
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u32);

impl ClientId {
    /// Creates a new ClientId from a raw u32 value
    pub const fn new(id: u32) -> Self {
        ClientId(id)
    }

    /// Returns the raw u32 value of this client ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock timestamp with nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Access requested on a region
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    /// Shared read access
    Read,
    /// Exclusive write access
    Write,
}

/// Direction of a lock request
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockOp {
    /// Acquire the lock
    Obtain,
    /// Release a held lock
    Release,
}

/// Result code carried in responses in place of a Rust error
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Request succeeded
    Ok,
    /// Registry type unknown or not initialized
    InvalidType,
    /// Malformed or unknown id
    InvalidId,
    /// Memory or table space could not be obtained
    AllocationError,
    /// Sequence space of a type is used up
    IdSpaceExhausted,
    /// Record already present
    Duplicate,
    /// Requested object does not exist
    NotFound,
    /// No region map for the requested pair
    RegionNotMapped,
    /// Remote target already mapped
    AlreadyMapped,
    /// Region lock held by another request
    LockConflict,
    /// Bulk transfer failed
    TransportError,
    /// A destructor could not complete; the object was retained
    DestructorFailed,
    /// Request fields are malformed
    InvalidRequest,
    /// Server is draining
    ShuttingDown,
    /// Unexpected internal failure
    Internal,
}

/// Errors raised by the metadata server
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The registry type was never registered or has been torn down.
    #[error("invalid registry type {0}")]
    InvalidType(u8),

    /// The id does not decode to a live registry entry.
    #[error("invalid id {0:#x}")]
    InvalidId(u64),

    /// Storage for a new entry could not be reserved.
    #[error("allocation failed: {0}")]
    AllocationError(String),

    /// No further sequence numbers are available for the type.
    #[error("id space exhausted for type {0}")]
    IdSpaceExhausted(u8),

    /// A record comparing equal to the candidate already exists.
    #[error("duplicate metadata for object '{name}'")]
    Duplicate {
        /// Object name of the rejected record
        name: String,
    },

    /// The requested object does not exist.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// No object with the given name (and time step) exists.
    #[error("object named '{0}' not found")]
    NameNotFound(String),

    /// No region map exists for the pair.
    #[error("region {region} of object {obj} is not mapped")]
    RegionNotMapped {
        /// Local object
        obj: ObjectId,
        /// Local region
        region: RegionId,
    },

    /// The remote target is already mapped for the pair.
    #[error("object {remote_obj} region {remote_region} already mapped")]
    AlreadyMapped {
        /// Remote object
        remote_obj: ObjectId,
        /// Remote region
        remote_region: RegionId,
    },

    /// Another holder owns a conflicting lock on the region.
    #[error("region {region} of object {obj} is locked")]
    LockConflict {
        /// Locked object
        obj: ObjectId,
        /// Locked region
        region: RegionId,
    },

    /// A bulk transfer or channel operation failed.
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),

    /// The destructor failed; the entry stays registered.
    #[error("destructor failed for id {id:#x}: {reason}")]
    DestructorFailed {
        /// Entry whose teardown failed
        id: u64,
        /// Destructor message
        reason: String,
    },

    /// Clearing a type left entries behind because destructors failed.
    #[error("{failed} destructor(s) failed while clearing type {type_id}")]
    FailOnDestructor {
        /// Type being cleared
        type_id: u8,
        /// Number of entries retained
        failed: usize,
    },

    /// The region description is malformed.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The server no longer accepts work.
    #[error("server is shutting down")]
    ShuttingDown,

    /// An internal invariant was violated (poisoned lock, closed pool).
    #[error("internal error: {0}")]
    Internal(String),

    /// Encoding or decoding a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// Maps the error to the status code carried on the wire.
    pub fn status(&self) -> Status {
        match self {
            MetaError::InvalidType(_) => Status::InvalidType,
            MetaError::InvalidId(_) => Status::InvalidId,
            MetaError::AllocationError(_) => Status::AllocationError,
            MetaError::IdSpaceExhausted(_) => Status::IdSpaceExhausted,
            MetaError::Duplicate { .. } => Status::Duplicate,
            MetaError::ObjectNotFound(_) | MetaError::NameNotFound(_) => Status::NotFound,
            MetaError::RegionNotMapped { .. } => Status::RegionNotMapped,
            MetaError::AlreadyMapped { .. } => Status::AlreadyMapped,
            MetaError::LockConflict { .. } => Status::LockConflict,
            MetaError::TransportError(_) => Status::TransportError,
            MetaError::DestructorFailed { .. } | MetaError::FailOnDestructor { .. } => {
                Status::DestructorFailed
            }
            MetaError::InvalidRegion(_) | MetaError::InvalidRequest(_) => Status::InvalidRequest,
            MetaError::ShuttingDown => Status::ShuttingDown,
            MetaError::Internal(_) | MetaError::Serialization(_) | MetaError::IoError(_) => {
                Status::Internal
            }
        }
    }
}

impl From<bincode::Error> for MetaError {
    fn from(e: bincode::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

/// Result alias for metadata server operations
pub type Result<T> = std::result::Result<T, MetaError>;
