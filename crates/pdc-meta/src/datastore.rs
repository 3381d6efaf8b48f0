//! Backing store for region payloads.
//!
//! Payloads arrive after a write-release pull on a mapped region or through a
//! direct data write. Keys sort by object first so one object's payloads can be
//! scanned or dropped together.

use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;

use crate::region::Region;
use crate::types::{MetaError, ObjectId};

fn payload_key(obj: ObjectId, region: &Region) -> Vec<u8> {
    let mut key = obj.to_be_bytes().to_vec();
    key.extend_from_slice(&region.encode_key());
    key
}

/// Payload storage used by the region engine.
pub trait RegionStore: Send + Sync {
    /// Stores a payload, replacing any previous one.
    fn write(&self, obj: ObjectId, region: &Region, data: Bytes) -> Result<(), MetaError>;

    /// Reads a payload. Returns None if nothing was written.
    fn read(&self, obj: ObjectId, region: &Region) -> Result<Option<Bytes>, MetaError>;

    /// Drops every payload of an object. Returns how many were removed.
    fn delete_object(&self, obj: ObjectId) -> Result<usize, MetaError>;

    /// Number of stored payloads.
    fn len(&self) -> Result<usize, MetaError>;
}

/// In-memory payload store backed by a BTreeMap.
pub struct MemoryRegionStore {
    data: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl MemoryRegionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryRegionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionStore for MemoryRegionStore {
    fn write(&self, obj: ObjectId, region: &Region, data: Bytes) -> Result<(), MetaError> {
        let mut map = self
            .data
            .write()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        map.insert(payload_key(obj, region), data);
        Ok(())
    }

    fn read(&self, obj: ObjectId, region: &Region) -> Result<Option<Bytes>, MetaError> {
        let map = self
            .data
            .read()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        Ok(map.get(&payload_key(obj, region)).cloned())
    }

    fn delete_object(&self, obj: ObjectId) -> Result<usize, MetaError> {
        let mut map = self
            .data
            .write()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        let prefix = obj.to_be_bytes();
        let doomed: Vec<Vec<u8>> = map
            .range::<Vec<u8>, _>(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            map.remove(k);
        }
        Ok(doomed.len())
    }

    fn len(&self) -> Result<usize, MetaError> {
        let map = self
            .data
            .read()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        Ok(map.len())
    }
}
