//! Reference-counted identifier registry.
//!
//! Ids pack an 8-bit type tag over a 56-bit per-type sequence. Each type keeps
//! its entries behind its own mutex. Destructors run while that mutex is held,
//! so a concurrent `find` never observes an entry halfway through teardown.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::types::{MetaError, Result};

/// Bits reserved for the per-type sequence.
pub const SEQ_BITS: u32 = 56;

/// Largest sequence number representable in an id.
pub const MAX_SEQUENCE: u64 = (1 << SEQ_BITS) - 1;

/// Number of distinct type tags.
pub const MAX_TYPES: usize = 256;

/// Object stored behind an id.
pub type ObjectRef = Arc<dyn Any + Send + Sync>;

/// Teardown hook run when an entry's count drops to zero.
pub type Destructor = Arc<dyn Fn(&ObjectRef) -> std::result::Result<(), String> + Send + Sync>;

/// Lifecycle of a registry entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Live, referenced
    Active,
    /// Count reached zero but the destructor failed; kept for retry
    PendingDestroy,
    /// Destructor succeeded; the entry is gone from its type
    Destroyed,
}

/// Snapshot of an entry returned by lookups.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Packed id
    pub id: u64,
    /// Outstanding references
    pub ref_count: u32,
    /// Lifecycle state
    pub state: EntryState,
    /// Registered object
    pub object: ObjectRef,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("id", &format_args!("{:#x}", self.id))
            .field("ref_count", &self.ref_count)
            .field("state", &self.state)
            .finish()
    }
}

struct Entry {
    id: u64,
    ref_count: u32,
    state: EntryState,
    object: ObjectRef,
}

impl Entry {
    fn snapshot(&self) -> RegistryEntry {
        RegistryEntry {
            id: self.id,
            ref_count: self.ref_count,
            state: self.state,
            object: self.object.clone(),
        }
    }
}

#[derive(Default)]
struct TypeSlot {
    init_count: u32,
    next_seq: u64,
    entries: VecDeque<Entry>,
    destructor: Option<Destructor>,
}

impl TypeSlot {
    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    fn destroy(&self, type_id: u8, entry: &Entry) -> Result<()> {
        match &self.destructor {
            None => Ok(()),
            Some(destructor) => destructor(&entry.object).map_err(|reason| {
                warn!(type_id, id = entry.id, %reason, "destructor failed, entry retained");
                MetaError::DestructorFailed {
                    id: entry.id,
                    reason,
                }
            }),
        }
    }
}

/// Packs a type tag and sequence number into an id.
pub fn make_id(type_id: u8, seq: u64) -> u64 {
    ((type_id as u64) << SEQ_BITS) | (seq & MAX_SEQUENCE)
}

/// Type tag embedded in an id.
pub fn id_type(id: u64) -> u8 {
    (id >> SEQ_BITS) as u8
}

/// Sequence number embedded in an id.
pub fn id_sequence(id: u64) -> u64 {
    id & MAX_SEQUENCE
}

/// Type-grouped table of reference-counted objects.
pub struct IdRegistry {
    types: Vec<Mutex<TypeSlot>>,
    max_sequence: u64,
}

impl Default for IdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_max_sequence(MAX_SEQUENCE)
    }

    /// Creates a registry whose types run out of ids after `max_sequence`.
    pub fn with_max_sequence(max_sequence: u64) -> Self {
        Self {
            types: (0..MAX_TYPES).map(|_| Mutex::new(TypeSlot::default())).collect(),
            max_sequence: max_sequence.min(MAX_SEQUENCE),
        }
    }

    fn slot(&self, type_id: u8) -> Result<MutexGuard<'_, TypeSlot>> {
        self.types[type_id as usize]
            .lock()
            .map_err(|e| MetaError::Internal(e.to_string()))
    }

    fn live_slot(&self, type_id: u8) -> Result<MutexGuard<'_, TypeSlot>> {
        let slot = self.slot(type_id)?;
        if slot.init_count == 0 {
            return Err(MetaError::InvalidType(type_id));
        }
        Ok(slot)
    }

    /// Registers a type. Repeated calls only bump the init count; the first destructor wins.
    pub fn register_type(&self, type_id: u8, destructor: Option<Destructor>) -> Result<u32> {
        let mut slot = self.slot(type_id)?;
        if slot.init_count == 0 {
            if slot.next_seq == 0 {
                slot.next_seq = 1;
            }
            slot.destructor = destructor;
        }
        slot.init_count += 1;
        debug!(type_id, init_count = slot.init_count, "registered type");
        Ok(slot.init_count)
    }

    /// Registers an object and returns its id with a reference count of one.
    pub fn register_object(&self, type_id: u8, object: ObjectRef) -> Result<u64> {
        let mut slot = self.live_slot(type_id)?;
        let seq = slot.next_seq;
        if seq > self.max_sequence {
            return Err(MetaError::IdSpaceExhausted(type_id));
        }
        slot.entries
            .try_reserve(1)
            .map_err(|e| MetaError::AllocationError(e.to_string()))?;
        slot.next_seq = seq + 1;
        let id = make_id(type_id, seq);
        slot.entries.push_front(Entry {
            id,
            ref_count: 1,
            state: EntryState::Active,
            object,
        });
        Ok(id)
    }

    /// Looks up an id. Unknown ids of a live type yield `None`.
    pub fn find(&self, id: u64) -> Result<Option<RegistryEntry>> {
        let slot = self
            .live_slot(id_type(id))
            .map_err(|_| MetaError::InvalidId(id))?;
        Ok(slot
            .position(id)
            .and_then(|i| slot.entries.get(i))
            .map(Entry::snapshot))
    }

    /// Looks up an id and downcasts its object.
    pub fn get<T: Any + Send + Sync>(&self, id: u64) -> Result<Option<Arc<T>>> {
        Ok(self
            .find(id)?
            .and_then(|entry| entry.object.downcast::<T>().ok()))
    }

    /// Takes another reference on an active entry.
    pub fn increment_ref(&self, id: u64) -> Result<u32> {
        let mut slot = self
            .live_slot(id_type(id))
            .map_err(|_| MetaError::InvalidId(id))?;
        let pos = slot.position(id).ok_or(MetaError::InvalidId(id))?;
        let entry = &mut slot.entries[pos];
        if entry.state != EntryState::Active {
            return Err(MetaError::InvalidId(id));
        }
        entry.ref_count += 1;
        Ok(entry.ref_count)
    }

    /// Drops a reference. At zero the destructor runs; if it fails the entry
    /// stays registered as `PendingDestroy` and a later call retries it.
    pub fn decrement_ref(&self, id: u64) -> Result<u32> {
        let type_id = id_type(id);
        let mut slot = self
            .live_slot(type_id)
            .map_err(|_| MetaError::InvalidId(id))?;
        let pos = slot.position(id).ok_or(MetaError::InvalidId(id))?;

        {
            let entry = &mut slot.entries[pos];
            match entry.state {
                EntryState::Active => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    if entry.ref_count > 0 {
                        return Ok(entry.ref_count);
                    }
                    entry.state = EntryState::PendingDestroy;
                }
                EntryState::PendingDestroy => {}
                EntryState::Destroyed => return Err(MetaError::InvalidId(id)),
            }
        }

        slot.destroy(type_id, &slot.entries[pos])?;
        if let Some(mut entry) = slot.entries.remove(pos) {
            entry.state = EntryState::Destroyed;
            debug!(type_id, id = entry.id, "destroyed entry");
        }
        Ok(0)
    }

    /// Destroys every entry of a type regardless of count. Entries whose
    /// destructor fails stay registered and are reported in the error.
    pub fn clear_type(&self, type_id: u8) -> Result<usize> {
        let mut slot = self.live_slot(type_id)?;
        let drained: Vec<Entry> = slot.entries.drain(..).collect();
        let mut destroyed = 0;
        let mut kept = VecDeque::new();
        for mut entry in drained {
            match slot.destroy(type_id, &entry) {
                Ok(()) => {
                    entry.state = EntryState::Destroyed;
                    destroyed += 1;
                }
                Err(_) => {
                    entry.state = EntryState::PendingDestroy;
                    kept.push_back(entry);
                }
            }
        }
        let failed = kept.len();
        slot.entries = kept;
        if failed > 0 {
            return Err(MetaError::FailOnDestructor { type_id, failed });
        }
        Ok(destroyed)
    }

    /// Number of entries registered under a type.
    pub fn id_count(&self, type_id: u8) -> Result<usize> {
        Ok(self.live_slot(type_id)?.entries.len())
    }

    /// Undoes one `register_type`. Fails while entries remain.
    pub fn destroy_type(&self, type_id: u8) -> Result<()> {
        let mut slot = self.live_slot(type_id)?;
        if !slot.entries.is_empty() {
            return Err(MetaError::InvalidRequest(format!(
                "type {} still has {} entries",
                type_id,
                slot.entries.len()
            )));
        }
        slot.init_count -= 1;
        if slot.init_count == 0 {
            slot.destructor = None;
        }
        Ok(())
    }
}
