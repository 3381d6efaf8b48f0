//! Region-to-region mappings used for zero-copy transfers.
//!
//! A mapping record exists per local (object, region) pair and lists the remote
//! (object, region) targets it feeds. Each target keeps its own reference to the
//! peer's bulk buffer; dropping the target releases that reference.

use dashmap::DashMap;
use tracing::debug;

use pdc_transport::{BulkHandle, PeerAddr};

use crate::types::{ClientId, MetaError, ObjectId, RegionId, Result};

/// One remote correspondence of a local region.
#[derive(Clone, Debug)]
pub struct MapTarget {
    /// Remote object.
    pub remote_obj: ObjectId,
    /// Remote region.
    pub remote_region: RegionId,
    /// Client that owns the staged data.
    pub remote_client: ClientId,
    /// Address of the peer that exposed `bulk`.
    pub origin: PeerAddr,
    /// Staged data buffer.
    pub bulk: BulkHandle,
}

/// All targets of one local (object, region) pair.
#[derive(Debug)]
pub struct RegionMapRecord {
    /// Local object.
    pub local_obj: ObjectId,
    /// Local region.
    pub local_region: RegionId,
    /// Dimensionality of the local region.
    pub local_ndim: u32,
    /// Remote targets, in mapping order.
    pub targets: Vec<MapTarget>,
    mapping_count: usize,
}

impl RegionMapRecord {
    /// Number of targets mapped so far.
    pub fn mapping_count(&self) -> usize {
        self.mapping_count
    }
}

/// Parameters of a map request after the bulk descriptor was resolved.
#[derive(Clone, Debug)]
pub struct MapRequest {
    /// Local object.
    pub local_obj: ObjectId,
    /// Local region.
    pub local_region: RegionId,
    /// Dimensionality of the local region.
    pub local_ndim: u32,
    /// Remote object.
    pub remote_obj: ObjectId,
    /// Remote region.
    pub remote_region: RegionId,
    /// Client that owns the staged data.
    pub remote_client: ClientId,
    /// Address of the requesting peer.
    pub origin: PeerAddr,
    /// Resolved bulk buffer.
    pub bulk: BulkHandle,
}

/// Result of an unmap call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmapOutcome {
    /// Mappings were removed.
    Removed {
        /// Records removed entirely.
        records: usize,
        /// Targets dropped.
        targets: usize,
    },
    /// Nothing was mapped.
    NotMapped,
}

/// Region maps of every object on this server. Each object's list is
/// serialized by its map entry.
#[derive(Default)]
pub struct RegionMapTable {
    maps: DashMap<ObjectId, Vec<RegionMapRecord>>,
}

impl RegionMapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target to the local pair, creating the record on first use.
    /// Returns the pair's mapping count afterwards.
    pub fn map(&self, req: MapRequest) -> Result<usize> {
        let mut records = self.maps.entry(req.local_obj).or_default();
        let target = MapTarget {
            remote_obj: req.remote_obj,
            remote_region: req.remote_region,
            remote_client: req.remote_client,
            origin: req.origin.dup(),
            bulk: req.bulk,
        };

        match records
            .iter_mut()
            .find(|r| r.local_region == req.local_region)
        {
            Some(record) => {
                if record
                    .targets
                    .iter()
                    .any(|t| t.remote_obj == req.remote_obj && t.remote_region == req.remote_region)
                {
                    return Err(MetaError::AlreadyMapped {
                        remote_obj: req.remote_obj,
                        remote_region: req.remote_region,
                    });
                }
                record.targets.push(target);
                record.mapping_count += 1;
                debug!(obj = %req.local_obj, region = %req.local_region, count = record.mapping_count, "region map extended");
                Ok(record.mapping_count)
            }
            None => {
                records.push(RegionMapRecord {
                    local_obj: req.local_obj,
                    local_region: req.local_region,
                    local_ndim: req.local_ndim,
                    targets: vec![target],
                    mapping_count: 1,
                });
                debug!(obj = %req.local_obj, region = %req.local_region, "region map created");
                Ok(1)
            }
        }
    }

    /// Removes the mappings of one region, or of the whole object when `region` is `None`.
    pub fn unmap(&self, obj: ObjectId, region: Option<RegionId>) -> UnmapOutcome {
        let outcome = match region {
            None => match self.maps.remove(&obj) {
                Some((_, records)) if !records.is_empty() => UnmapOutcome::Removed {
                    records: records.len(),
                    targets: records.iter().map(|r| r.targets.len()).sum(),
                },
                _ => UnmapOutcome::NotMapped,
            },
            Some(region) => {
                let removed = match self.maps.get_mut(&obj) {
                    Some(mut records) => records
                        .iter()
                        .position(|r| r.local_region == region)
                        .map(|pos| records.remove(pos)),
                    None => None,
                };
                self.maps.remove_if(&obj, |_, records| records.is_empty());
                match removed {
                    Some(record) => UnmapOutcome::Removed {
                        records: 1,
                        targets: record.targets.len(),
                    },
                    None => UnmapOutcome::NotMapped,
                }
            }
        };
        if let UnmapOutcome::Removed { records, targets } = outcome {
            debug!(obj = %obj, records, targets, "region map removed");
        }
        outcome
    }

    /// Removes one remote target; the record goes with its last target.
    pub fn unmap_target(
        &self,
        obj: ObjectId,
        region: RegionId,
        remote_obj: ObjectId,
        remote_region: RegionId,
    ) -> UnmapOutcome {
        let outcome = match self.maps.get_mut(&obj) {
            Some(mut records) => match records.iter().position(|r| r.local_region == region) {
                Some(pos) => {
                    let record = &mut records[pos];
                    match record
                        .targets
                        .iter()
                        .position(|t| t.remote_obj == remote_obj && t.remote_region == remote_region)
                    {
                        Some(tpos) => {
                            record.targets.remove(tpos);
                            record.mapping_count -= 1;
                            let emptied = record.targets.is_empty();
                            if emptied {
                                records.remove(pos);
                            }
                            UnmapOutcome::Removed {
                                records: usize::from(emptied),
                                targets: 1,
                            }
                        }
                        None => UnmapOutcome::NotMapped,
                    }
                }
                None => UnmapOutcome::NotMapped,
            },
            None => UnmapOutcome::NotMapped,
        };
        self.maps.remove_if(&obj, |_, records| records.is_empty());
        outcome
    }

    /// Snapshot of the targets of a pair. The returned handles hold their own references.
    pub fn targets(&self, obj: ObjectId, region: RegionId) -> Option<Vec<MapTarget>> {
        self.maps.get(&obj).and_then(|records| {
            records
                .iter()
                .find(|r| r.local_region == region)
                .map(|r| r.targets.clone())
        })
    }

    /// Mapping count of a pair; zero when unmapped.
    pub fn mapping_count(&self, obj: ObjectId, region: RegionId) -> usize {
        self.maps
            .get(&obj)
            .and_then(|records| {
                records
                    .iter()
                    .find(|r| r.local_region == region)
                    .map(|r| r.mapping_count)
            })
            .unwrap_or(0)
    }

    /// True if the pair has a mapping record.
    pub fn is_mapped(&self, obj: ObjectId, region: RegionId) -> bool {
        self.mapping_count(obj, region) > 0
    }

    /// Number of mapping records.
    pub fn len(&self) -> usize {
        self.maps.iter().map(|e| e.value().len()).sum()
    }

    /// True if no region is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every mapping. Returns the number of records removed.
    pub fn clear(&self) -> usize {
        let n = self.len();
        self.maps.clear();
        n
    }
}
