//! N-dimensional regions in object coordinate space.

use serde::{Deserialize, Serialize};

use crate::types::{MetaError, Result};

/// Maximum number of dimensions a region (or object shape) can have.
pub const MAX_DIMS: usize = 4;

/// Hyperrectangle given by a start offset and an extent per dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    /// Start offset per dimension
    pub offset: Vec<u64>,
    /// Extent per dimension
    pub count: Vec<u64>,
}

impl Region {
    /// Builds and validates a region.
    pub fn new(offset: Vec<u64>, count: Vec<u64>) -> Result<Self> {
        let region = Region { offset, count };
        region.validate()?;
        Ok(region)
    }

    /// One-dimensional region `[offset, offset + count)`.
    pub fn linear(offset: u64, count: u64) -> Self {
        Region {
            offset: vec![offset],
            count: vec![count],
        }
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.offset.len()
    }

    /// Checks dimension bounds and coordinate overflow.
    pub fn validate(&self) -> Result<()> {
        let ndim = self.offset.len();
        if ndim == 0 || ndim > MAX_DIMS {
            return Err(MetaError::InvalidRegion(format!(
                "ndim {} outside 1..={}",
                ndim, MAX_DIMS
            )));
        }
        if self.count.len() != ndim {
            return Err(MetaError::InvalidRegion(format!(
                "{} offsets but {} counts",
                ndim,
                self.count.len()
            )));
        }
        for (o, c) in self.offset.iter().zip(&self.count) {
            if o.checked_add(*c).is_none() {
                return Err(MetaError::InvalidRegion(format!(
                    "extent {}+{} overflows",
                    o, c
                )));
            }
        }
        Ok(())
    }

    /// Number of elements covered.
    pub fn volume(&self) -> u64 {
        self.count.iter().fold(1u64, |acc, c| acc.saturating_mul(*c))
    }

    /// True when both regions share at least one element.
    pub fn overlaps(&self, other: &Region) -> bool {
        if self.ndim() != other.ndim() {
            return false;
        }
        self.offset
            .iter()
            .zip(&self.count)
            .zip(other.offset.iter().zip(&other.count))
            .all(|((ao, ac), (bo, bc))| {
                *ac > 0 && *bc > 0 && *ao < bo.saturating_add(*bc) && *bo < ao.saturating_add(*ac)
            })
    }

    /// True when `other` lies entirely inside this region.
    pub fn contains(&self, other: &Region) -> bool {
        if self.ndim() != other.ndim() {
            return false;
        }
        self.offset
            .iter()
            .zip(&self.count)
            .zip(other.offset.iter().zip(&other.count))
            .all(|((ao, ac), (bo, bc))| {
                *bo >= *ao && bo.saturating_add(*bc) <= ao.saturating_add(*ac)
            })
    }

    /// Order-preserving byte encoding used in storage keys.
    pub fn encode_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + self.ndim() * 16);
        key.push(self.ndim() as u8);
        for (o, c) in self.offset.iter().zip(&self.count) {
            key.extend_from_slice(&o.to_be_bytes());
            key.extend_from_slice(&c.to_be_bytes());
        }
        key
    }
}

/// Physical extent of a region on storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRegion {
    /// Region in object coordinates
    pub region: Region,
    /// Storage location (file path or target name)
    pub location: String,
    /// Byte offset of the region within the location
    pub offset: u64,
}
