//! Metadata records, the duplicate comparator and object placement helpers.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::region::{Region, StorageRegion, MAX_DIMS};
use crate::types::{MetaError, ObjectId, Result, Timestamp};

/// Time step value meaning "not set".
pub const TIME_STEP_UNSET: i32 = -1;

/// Separator placed between tags appended with `add_tag`.
pub const TAG_SEPARATOR: char = ',';

/// One versioned data object known to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Object id; zero until the server assigns one
    pub obj_id: ObjectId,
    /// Owner; zero means "not set"
    pub user_id: u32,
    /// Producing application
    pub app_name: String,
    /// Object name
    pub obj_name: String,
    /// Free-text tags
    pub tags: String,
    /// Number of used dimensions in `dims`
    pub ndim: u32,
    /// Shape per dimension
    pub dims: [u64; MAX_DIMS],
    /// Creation time
    pub create_time: Timestamp,
    /// Last modification time
    pub last_modified_time: Timestamp,
    /// Data location on storage
    pub data_location: String,
    /// Time step, `TIME_STEP_UNSET` when absent
    pub time_step: i32,
    /// Physical extents registered for the object
    pub storage_regions: Vec<StorageRegion>,
}

impl MetadataRecord {
    /// Creates a candidate record with no id and no shape.
    pub fn new(
        user_id: u32,
        app_name: impl Into<String>,
        obj_name: impl Into<String>,
        time_step: i32,
    ) -> Self {
        Self {
            obj_id: ObjectId::new(0),
            user_id,
            app_name: app_name.into(),
            obj_name: obj_name.into(),
            tags: String::new(),
            ndim: 0,
            dims: [0; MAX_DIMS],
            create_time: Timestamp::default(),
            last_modified_time: Timestamp::default(),
            data_location: String::new(),
            time_step,
            storage_regions: Vec::new(),
        }
    }

    /// Sets the tags.
    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = tags.into();
        self
    }

    /// Sets the shape. At most `MAX_DIMS` entries are used.
    pub fn with_dims(mut self, dims: &[u64]) -> Self {
        let n = dims.len().min(MAX_DIMS);
        self.ndim = n as u32;
        self.dims = [0; MAX_DIMS];
        self.dims[..n].copy_from_slice(&dims[..n]);
        self
    }

    /// Canonical key fed to the duplicate filter.
    pub fn filter_key(&self) -> String {
        format!(
            "{}{}{}{}",
            self.user_id, self.app_name, self.obj_name, self.time_step
        )
    }

    /// True when every field the comparator looks at is populated.
    ///
    /// Only such records can rely on the filter's negative answer: a record with
    /// a wildcard field may equal a stored record whose key differs.
    pub fn is_fully_specified(&self) -> bool {
        self.time_step >= 0 && self.user_id > 0 && !self.app_name.is_empty() && !self.obj_name.is_empty()
    }

    /// Whole-object region built from the shape.
    pub fn extent(&self) -> Option<Region> {
        let n = self.ndim as usize;
        if n == 0 || n > MAX_DIMS {
            return None;
        }
        Some(Region {
            offset: vec![0; n],
            count: self.dims[..n].to_vec(),
        })
    }

    /// Appends a tag.
    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.is_empty() {
            self.tags.push(TAG_SEPARATOR);
        }
        self.tags.push_str(tag);
        self.last_modified_time = Timestamp::now();
    }

    /// Returns true if `tag` is one of the record's tags.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.split(TAG_SEPARATOR).any(|t| t == tag)
    }
}

/// Orders two records for duplicate detection.
///
/// Fields are compared in the order time step, object name, user id, app name.
/// A field unset on either side is skipped, so records whose populated fields
/// do not intersect compare equal.
pub fn metadata_cmp(a: &MetadataRecord, b: &MetadataRecord) -> Ordering {
    if a.time_step >= 0 && b.time_step >= 0 {
        let ord = a.time_step.cmp(&b.time_step);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if !a.obj_name.is_empty() && !b.obj_name.is_empty() {
        let ord = a.obj_name.cmp(&b.obj_name);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if a.user_id > 0 && b.user_id > 0 {
        let ord = a.user_id.cmp(&b.user_id);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if !a.app_name.is_empty() && !b.app_name.is_empty() {
        return a.app_name.cmp(&b.app_name);
    }
    Ordering::Equal
}

/// Fields an update may change. Renaming is not supported because the name selects the bucket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    /// New owner
    pub user_id: Option<u32>,
    /// New application name
    pub app_name: Option<String>,
    /// New time step
    pub time_step: Option<i32>,
    /// Replacement tags
    pub tags: Option<String>,
    /// New data location
    pub data_location: Option<String>,
    /// New shape
    pub dims: Option<Vec<u64>>,
}

impl MetadataPatch {
    /// True if the patch changes a field that feeds the filter key.
    pub fn touches_key(&self) -> bool {
        self.user_id.is_some() || self.app_name.is_some() || self.time_step.is_some()
    }

    /// Applies the patch in place.
    pub fn apply(&self, record: &mut MetadataRecord) -> Result<()> {
        if let Some(dims) = &self.dims {
            if dims.len() > MAX_DIMS {
                return Err(MetaError::InvalidRequest(format!(
                    "{} dims exceed the maximum of {}",
                    dims.len(),
                    MAX_DIMS
                )));
            }
        }
        if let Some(user_id) = self.user_id {
            record.user_id = user_id;
        }
        if let Some(app_name) = &self.app_name {
            record.app_name = app_name.clone();
        }
        if let Some(time_step) = self.time_step {
            record.time_step = time_step;
        }
        if let Some(tags) = &self.tags {
            record.tags = tags.clone();
        }
        if let Some(location) = &self.data_location {
            record.data_location = location.clone();
        }
        if let Some(dims) = &self.dims {
            let updated = record.clone().with_dims(dims);
            record.ndim = updated.ndim;
            record.dims = updated.dims;
        }
        record.last_modified_time = Timestamp::now();
        Ok(())
    }
}

/// Predicate for partial queries. Absent fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Exact owner
    pub user_id: Option<u32>,
    /// Exact application name
    pub app_name: Option<String>,
    /// Exact object name
    pub obj_name: Option<String>,
    /// Inclusive time step range
    pub time_step_range: Option<(i32, i32)>,
    /// Required tag
    pub tag: Option<String>,
}

impl QueryFilter {
    /// Returns true if the record satisfies every populated field.
    pub fn matches(&self, record: &MetadataRecord) -> bool {
        if let Some(user_id) = self.user_id {
            if record.user_id != user_id {
                return false;
            }
        }
        if let Some(app) = &self.app_name {
            if &record.app_name != app {
                return false;
            }
        }
        if let Some(name) = &self.obj_name {
            if &record.obj_name != name {
                return false;
            }
        }
        if let Some((lo, hi)) = self.time_step_range {
            if record.time_step < lo || record.time_step > hi {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !record.has_tag(tag) {
                return false;
            }
        }
        true
    }
}

/// djb2 string hash used by clients to compute an object's name hash.
pub fn name_hash(name: &str) -> u32 {
    name.bytes()
        .fold(5381u32, |h, c| h.wrapping_mul(33).wrapping_add(c as u32))
}

/// First object id minted by server `server_id`.
pub fn first_object_id(server_id: u32, id_interval: u64) -> u64 {
    id_interval.saturating_mul(server_id as u64 + 1)
}

/// Server that minted `id`.
pub fn server_for_object(id: ObjectId, id_interval: u64, num_servers: u32) -> u32 {
    if id_interval == 0 || num_servers == 0 {
        return 0;
    }
    let block = (id.as_u64() / id_interval).saturating_sub(1);
    (block % num_servers as u64) as u32
}

/// Server that owns the bucket of a name hash.
pub fn server_for_name_hash(hash: u32, num_servers: u32) -> u32 {
    if num_servers == 0 {
        return 0;
    }
    hash % num_servers
}
