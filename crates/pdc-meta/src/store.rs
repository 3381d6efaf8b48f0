//! Sharded metadata table with per-bucket duplicate filters.
//!
//! Records land in bucket `name_hash % table_size`. Every bucket is guarded by
//! its own mutex and owns its duplicate filter; the filter is built with the
//! first record and dropped when the last record leaves. An id index routes
//! id-based operations to the right bucket and is only written while that
//! bucket's mutex is held.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::filter::DuplicateFilter;
use crate::metadata::{
    first_object_id, metadata_cmp, MetadataPatch, MetadataRecord, QueryFilter,
};
use crate::region::{Region, StorageRegion};
use crate::types::{MetaError, ObjectId, Result, Timestamp};

/// Sizing and id placement for a [`MetadataStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of buckets
    pub table_size: usize,
    /// Keys each bucket filter is sized for
    pub filter_capacity: usize,
    /// Target false-positive rate of each bucket filter
    pub filter_error_rate: f64,
    /// Rank of this server
    pub server_id: u32,
    /// Width of each server's object id range
    pub id_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_size: 1024,
            filter_capacity: 4096,
            filter_error_rate: 0.05,
            server_id: 0,
            id_interval: 1_000_000_000_000,
        }
    }
}

/// Filter effectiveness counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    /// Duplicate checks performed against non-empty buckets
    pub total: u64,
    /// Checks that needed a full bucket scan
    pub maybe: u64,
    /// Inserts rejected as duplicates
    pub duplicates: u64,
    /// Fullest bucket filter, in thousandths of its counters set
    pub max_fill_permille: u32,
}

/// Outcome of [`MetadataStore::duplicate_audit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateAudit {
    /// Non-empty buckets examined
    pub buckets: usize,
    /// Records examined
    pub records: usize,
    /// Adjacent pairs that compared equal after sorting
    pub duplicates: Vec<(ObjectId, ObjectId)>,
}

impl DuplicateAudit {
    /// True if any duplicate pair was found.
    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }
}

#[derive(Default)]
struct Bucket {
    records: VecDeque<MetadataRecord>,
    filter: Option<DuplicateFilter>,
    // Records with at least one wildcard field. While non-zero the filter's
    // negative answer cannot be trusted.
    partial_records: usize,
}

impl Bucket {
    fn position(&self, id: ObjectId) -> Option<usize> {
        self.records.iter().position(|r| r.obj_id == id)
    }

    fn track(&mut self, record: &MetadataRecord, capacity: usize, error_rate: f64) {
        self.filter
            .get_or_insert_with(|| DuplicateFilter::new(capacity, error_rate))
            .add(&record.filter_key());
        if !record.is_fully_specified() {
            self.partial_records += 1;
        }
    }

    fn untrack(&mut self, record: &MetadataRecord) {
        if let Some(filter) = self.filter.as_mut() {
            filter.remove(&record.filter_key());
        }
        if !record.is_fully_specified() {
            self.partial_records = self.partial_records.saturating_sub(1);
        }
    }

    fn remove_at(&mut self, pos: usize) -> Option<MetadataRecord> {
        let record = self.records.remove(pos)?;
        self.untrack(&record);
        if self.records.is_empty() {
            self.filter = None;
            self.partial_records = 0;
        }
        Some(record)
    }
}

/// Total order used to group candidate duplicates before the adjacent-pair check.
fn audit_order(a: &MetadataRecord, b: &MetadataRecord) -> CmpOrdering {
    a.time_step
        .cmp(&b.time_step)
        .then_with(|| a.obj_name.cmp(&b.obj_name))
        .then_with(|| a.user_id.cmp(&b.user_id))
        .then_with(|| a.app_name.cmp(&b.app_name))
}

/// Server-wide metadata table.
pub struct MetadataStore {
    buckets: Vec<Mutex<Bucket>>,
    index: DashMap<ObjectId, usize>,
    next_id: AtomicU64,
    id_limit: u64,
    filter_capacity: usize,
    filter_error_rate: f64,
    checks: AtomicU64,
    maybes: AtomicU64,
    duplicates: AtomicU64,
}

impl MetadataStore {
    /// Allocates the bucket table.
    pub fn new(config: StoreConfig) -> Self {
        let table_size = config.table_size.max(1);
        let first = first_object_id(config.server_id, config.id_interval);
        Self {
            buckets: (0..table_size).map(|_| Mutex::new(Bucket::default())).collect(),
            index: DashMap::new(),
            next_id: AtomicU64::new(first),
            id_limit: first.saturating_add(config.id_interval),
            filter_capacity: config.filter_capacity,
            filter_error_rate: config.filter_error_rate,
            checks: AtomicU64::new(0),
            maybes: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Number of buckets.
    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True if `id` is stored.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.index.contains_key(&id)
    }

    fn bucket_index(&self, name_hash: u32) -> usize {
        name_hash as usize % self.buckets.len()
    }

    fn lock_bucket(&self, idx: usize) -> Result<MutexGuard<'_, Bucket>> {
        self.buckets[idx]
            .lock()
            .map_err(|e| MetaError::Internal(e.to_string()))
    }

    fn bucket_of(&self, id: ObjectId) -> Result<usize> {
        // Copy out so no index guard is held while a bucket mutex is taken.
        let idx = self.index.get(&id).map(|r| *r);
        idx.ok_or(MetaError::ObjectNotFound(id))
    }

    fn mint_id(&self) -> Result<ObjectId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id >= self.id_limit {
            return Err(MetaError::AllocationError(
                "object id range exhausted".to_string(),
            ));
        }
        Ok(ObjectId::new(id))
    }

    fn has_identical(&self, bucket: &Bucket, candidate: &MetadataRecord) -> bool {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let filter_rules_out = candidate.is_fully_specified()
            && bucket.partial_records == 0
            && bucket
                .filter
                .as_ref()
                .is_some_and(|f| !f.contains(&candidate.filter_key()));
        if filter_rules_out {
            return false;
        }
        self.maybes.fetch_add(1, Ordering::Relaxed);
        bucket
            .records
            .iter()
            .any(|r| metadata_cmp(r, candidate) == CmpOrdering::Equal)
    }

    /// Inserts a record unless an equal one exists, returning the new object id.
    pub fn insert(&self, mut record: MetadataRecord, name_hash: u32) -> Result<ObjectId> {
        let idx = self.bucket_index(name_hash);
        let mut bucket = self.lock_bucket(idx)?;

        if !bucket.records.is_empty() && self.has_identical(&bucket, &record) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(name = %record.obj_name, time_step = record.time_step, "duplicate metadata rejected");
            return Err(MetaError::Duplicate {
                name: record.obj_name,
            });
        }

        bucket
            .records
            .try_reserve(1)
            .map_err(|e| MetaError::AllocationError(e.to_string()))?;
        let id = self.mint_id()?;
        let now = Timestamp::now();
        record.obj_id = id;
        record.create_time = now;
        record.last_modified_time = now;
        bucket.track(&record, self.filter_capacity, self.filter_error_rate);
        bucket.records.push_front(record);
        self.index.insert(id, idx);
        Ok(id)
    }

    /// Returns the most recently inserted record with exactly this name.
    pub fn query_by_name_hash(&self, name: &str, name_hash: u32) -> Result<Option<MetadataRecord>> {
        let bucket = self.lock_bucket(self.bucket_index(name_hash))?;
        Ok(bucket.records.iter().find(|r| r.obj_name == name).cloned())
    }

    /// Returns the record with this id.
    pub fn get_by_id(&self, id: ObjectId) -> Result<Option<MetadataRecord>> {
        let idx = match self.bucket_of(id) {
            Ok(idx) => idx,
            Err(_) => return Ok(None),
        };
        let bucket = self.lock_bucket(idx)?;
        Ok(bucket.position(id).map(|pos| bucket.records[pos].clone()))
    }

    /// Removes the record with this id.
    pub fn delete_by_id(&self, id: ObjectId) -> Result<MetadataRecord> {
        let idx = self.bucket_of(id)?;
        let mut bucket = self.lock_bucket(idx)?;
        let pos = bucket.position(id).ok_or(MetaError::ObjectNotFound(id))?;
        let record = bucket
            .remove_at(pos)
            .ok_or(MetaError::ObjectNotFound(id))?;
        self.index.remove(&id);
        Ok(record)
    }

    /// Removes the most recent record with this name, optionally restricted to one time step.
    pub fn delete_by_name(
        &self,
        name: &str,
        name_hash: u32,
        time_step: Option<i32>,
    ) -> Result<MetadataRecord> {
        let mut bucket = self.lock_bucket(self.bucket_index(name_hash))?;
        let pos = bucket
            .records
            .iter()
            .position(|r| r.obj_name == name && time_step.map_or(true, |ts| r.time_step == ts))
            .ok_or_else(|| MetaError::NameNotFound(name.to_string()))?;
        let record = bucket
            .remove_at(pos)
            .ok_or_else(|| MetaError::NameNotFound(name.to_string()))?;
        self.index.remove(&record.obj_id);
        Ok(record)
    }

    /// Applies a patch in place. No duplicate check is made against the new field values.
    pub fn update(&self, id: ObjectId, patch: &MetadataPatch) -> Result<MetadataRecord> {
        let idx = self.bucket_of(id)?;
        let mut bucket = self.lock_bucket(idx)?;
        let pos = bucket.position(id).ok_or(MetaError::ObjectNotFound(id))?;

        let mut updated = bucket.records[pos].clone();
        patch.apply(&mut updated)?;
        if patch.touches_key() {
            let old = bucket.records[pos].clone();
            bucket.untrack(&old);
            bucket.track(&updated, self.filter_capacity, self.filter_error_rate);
        }
        bucket.records[pos] = updated.clone();
        Ok(updated)
    }

    /// Appends a tag to a record.
    pub fn add_tag(&self, id: ObjectId, tag: &str) -> Result<()> {
        self.with_record_mut(id, |record| {
            record.add_tag(tag);
            Ok(())
        })
    }

    /// Records (or replaces) the storage extent backing `region` of an object.
    pub fn update_region_location(&self, id: ObjectId, location: StorageRegion) -> Result<()> {
        location.region.validate()?;
        self.with_record_mut(id, |record| {
            match record
                .storage_regions
                .iter_mut()
                .find(|s| s.region == location.region)
            {
                Some(existing) => {
                    existing.location = location.location.clone();
                    existing.offset = location.offset;
                }
                None => record.storage_regions.push(location.clone()),
            }
            record.last_modified_time = Timestamp::now();
            Ok(())
        })
    }

    /// Storage extents of an object that overlap `region`.
    pub fn get_storage_info(&self, id: ObjectId, region: &Region) -> Result<Vec<StorageRegion>> {
        region.validate()?;
        let record = self.get_by_id(id)?.ok_or(MetaError::ObjectNotFound(id))?;
        Ok(record
            .storage_regions
            .into_iter()
            .filter(|s| s.region.overlaps(region))
            .collect())
    }

    fn with_record_mut<F>(&self, id: ObjectId, f: F) -> Result<()>
    where
        F: FnOnce(&mut MetadataRecord) -> Result<()>,
    {
        let idx = self.bucket_of(id)?;
        let mut bucket = self.lock_bucket(idx)?;
        let pos = bucket.position(id).ok_or(MetaError::ObjectNotFound(id))?;
        f(&mut bucket.records[pos])
    }

    /// Returns every record matching the filter, bucket by bucket.
    pub fn query_partial(&self, filter: &QueryFilter) -> Result<Vec<MetadataRecord>> {
        let mut out = Vec::new();
        for idx in 0..self.buckets.len() {
            let bucket = self.lock_bucket(idx)?;
            out.extend(bucket.records.iter().filter(|r| filter.matches(r)).cloned());
        }
        Ok(out)
    }

    /// Filter counters so far.
    pub fn filter_stats(&self) -> FilterStats {
        let max_fill = self
            .buckets
            .iter()
            .filter_map(|b| b.lock().ok()?.filter.as_ref().map(DuplicateFilter::fill_ratio))
            .fold(0.0_f64, f64::max);
        FilterStats {
            total: self.checks.load(Ordering::Relaxed),
            maybe: self.maybes.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            max_fill_permille: (max_fill * 1000.0).round() as u32,
        }
    }

    /// Sorts every bucket and reports adjacent records that compare equal.
    ///
    /// The comparator is not transitive once wildcards are involved, so the
    /// sort uses the strict field order and only the pair check uses the
    /// comparator.
    pub fn duplicate_audit(&self) -> Result<DuplicateAudit> {
        let mut audit = DuplicateAudit::default();
        for idx in 0..self.buckets.len() {
            let mut records: Vec<MetadataRecord> = {
                let bucket = self.lock_bucket(idx)?;
                bucket.records.iter().cloned().collect()
            };
            if records.is_empty() {
                continue;
            }
            audit.buckets += 1;
            audit.records += records.len();
            records.sort_by(audit_order);
            for pair in records.windows(2) {
                if metadata_cmp(&pair[0], &pair[1]) == CmpOrdering::Equal {
                    audit.duplicates.push((pair[0].obj_id, pair[1].obj_id));
                }
            }
        }
        Ok(audit)
    }

    /// Drops every record and filter. Returns the number of records freed.
    pub fn clear(&self) -> Result<usize> {
        let mut freed = 0;
        for idx in 0..self.buckets.len() {
            let mut bucket = self.lock_bucket(idx)?;
            for record in bucket.records.drain(..) {
                self.index.remove(&record.obj_id);
                freed += 1;
            }
            bucket.filter = None;
            bucket.partial_records = 0;
        }
        info!(records = freed, "metadata table cleared");
        Ok(freed)
    }

    #[cfg(test)]
    fn bucket_has_filter(&self, name_hash: u32) -> bool {
        self.lock_bucket(self.bucket_index(name_hash))
            .map(|b| b.filter.is_some())
            .unwrap_or(false)
    }
}
