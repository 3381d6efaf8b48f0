//! Region read/write locks.
//!
//! Locks are tracked per (object, region) pair. A write lock excludes every
//! other lock on the pair; read locks exclude only writers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::region::Region;
use crate::types::{AccessType, ClientId, MetaError, ObjectId, RegionId};

/// An active lock on a region.
#[derive(Clone, Debug)]
pub struct RegionLock {
    /// Locked object.
    pub obj: ObjectId,
    /// Locked region id.
    pub region_id: RegionId,
    /// Bounds the holder asked for.
    pub region: Region,
    /// Read or write.
    pub access: AccessType,
    /// Client holding the lock.
    pub holder: ClientId,
    /// Unique identifier for this lock instance.
    pub lock_id: u64,
}

/// Manages region locks for every object on this server.
pub struct RegionLockManager {
    locks: RwLock<HashMap<(ObjectId, RegionId), Vec<RegionLock>>>,
    next_lock_id: AtomicU64,
}

impl RegionLockManager {
    /// Creates a new RegionLockManager.
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            next_lock_id: AtomicU64::new(1),
        }
    }

    /// Acquires a lock on a region.
    pub fn acquire(
        &self,
        obj: ObjectId,
        region_id: RegionId,
        region: Region,
        access: AccessType,
        holder: ClientId,
    ) -> Result<u64, MetaError> {
        let mut locks = self
            .locks
            .write()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        let held = locks.entry((obj, region_id)).or_default();

        let conflict = match access {
            AccessType::Read => held.iter().any(|l| l.access == AccessType::Write),
            AccessType::Write => !held.is_empty(),
        };
        if conflict {
            return Err(MetaError::LockConflict {
                obj,
                region: region_id,
            });
        }

        let lock_id = self.next_lock_id.fetch_add(1, Ordering::Relaxed);
        held.push(RegionLock {
            obj,
            region_id,
            region,
            access,
            holder,
            lock_id,
        });
        Ok(lock_id)
    }

    /// Releases the holder's lock of the given access type.
    ///
    /// Returns false when no such lock was held; that is not an error.
    pub fn release(
        &self,
        obj: ObjectId,
        region_id: RegionId,
        access: AccessType,
        holder: ClientId,
    ) -> Result<bool, MetaError> {
        let mut locks = self
            .locks
            .write()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        let key = (obj, region_id);
        let Some(held) = locks.get_mut(&key) else {
            return Ok(false);
        };
        let found = match held
            .iter()
            .position(|l| l.holder == holder && l.access == access)
        {
            Some(pos) => {
                held.remove(pos);
                true
            }
            None => false,
        };
        if held.is_empty() {
            locks.remove(&key);
        }
        Ok(found)
    }

    /// Drops every lock on an object. Returns how many were released.
    pub fn release_object(&self, obj: ObjectId) -> Result<usize, MetaError> {
        let mut locks = self
            .locks
            .write()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        let mut released = 0;
        locks.retain(|(o, _), held| {
            if *o == obj {
                released += held.len();
                false
            } else {
                true
            }
        });
        Ok(released)
    }

    /// Returns true if the region has any active locks.
    pub fn is_locked(&self, obj: ObjectId, region_id: RegionId) -> Result<bool, MetaError> {
        let locks = self
            .locks
            .read()
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        Ok(locks
            .get(&(obj, region_id))
            .is_some_and(|v| !v.is_empty()))
    }
}

impl Default for RegionLockManager {
    fn default() -> Self {
        Self::new()
    }
}
