//! Generational slot tables that turn native objects into thin ids.
//!
//! SlotId: `(index, salt)`. The salt is issued from a per-table counter on
//! every store, so an id kept across a remove never aliases the object that
//! later reuses its slot.
//!
//! ReferenceTable<H>: the table, parameterized by the handle it keeps.
//! Strong handles keep the object alive, weak handles only observe it.
//!
//! ExportedRef: the retained form of a SlotId handed across the boundary.
use std::{
    collections::HashMap,
    fmt,
    sync::OnceLock,
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{BridgeError, BridgeResult, Strong, Weak};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    salt: u32,
}

impl SlotId {
    pub const fn new(index: u32, salt: u32) -> Self {
        Self { index, salt }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn salt(self) -> u32 {
        self.salt
    }

    /// Salt 0 is never issued, so the default id never resolves.
    pub fn is_valid(self) -> bool {
        self.salt != 0
    }

    pub fn to_raw(self) -> u64 {
        (u64::from(self.salt) << 32) | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            salt: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.salt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strength {
    Strong,
    Weak,
}

/// What a table keeps per slot.
pub trait TableHandle: Clone + Send + Sync {
    const STRENGTH: Strength;

    /// The object behind the handle, or None if it is gone.
    fn resolve(&self) -> Option<Strong>;
}

impl TableHandle for Strong {
    const STRENGTH: Strength = Strength::Strong;

    fn resolve(&self) -> Option<Strong> {
        Some(self.clone())
    }
}

impl TableHandle for Weak {
    const STRENGTH: Strength = Strength::Weak;

    fn resolve(&self) -> Option<Strong> {
        self.upgrade()
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceTableCreateInfo {
    pub name: &'static str,
    pub initial_capacity: usize,
}

impl Default for ReferenceTableCreateInfo {
    fn default() -> Self {
        Self {
            name: "references",
            initial_capacity: 64,
        }
    }
}

/// A live entry as seen by [`ReferenceTableReader::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTableEntry {
    pub id: SlotId,
    pub retain_count: u32,
    pub tag: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceTableStats {
    pub table_size: usize,
    pub active_references_count: usize,
    /// Sorted by count, highest first, then by tag.
    pub active_references_by_tag: Vec<(&'static str, usize)>,
}

enum SlotState<H> {
    Occupied {
        handle: H,
        retain_count: u32,
        tag: &'static str,
    },
    Tombstone,
}

struct Slot<H> {
    salt: u32,
    state: SlotState<H>,
}

struct ReferenceTableImpl<H> {
    name: &'static str,
    slots: Vec<Slot<H>>,
    // LIFO, the most recently freed slot is reused first
    free: Vec<u32>,
    next_salt: u32,
    active: usize,
}

pub struct ReferenceTable<H>(RwLock<ReferenceTableImpl<H>>);

pub type StrongReferenceTable = ReferenceTable<Strong>;
pub type WeakReferenceTable = ReferenceTable<Weak>;

/// Holds the read lock for several lookups.
pub struct ReferenceTableReader<'a, H>(RwLockReadGuard<'a, ReferenceTableImpl<H>>);

/// Holds the write lock for several mutations.
pub struct ReferenceTableWriter<'a, H>(RwLockWriteGuard<'a, ReferenceTableImpl<H>>);

fn stale<H: TableHandle>(id: SlotId) -> BridgeError {
    BridgeError::StaleReference {
        id,
        strength: H::STRENGTH,
    }
}

impl<H: TableHandle> ReferenceTableImpl<H> {
    fn new(info: &ReferenceTableCreateInfo) -> Self {
        Self {
            name: info.name,
            slots: Vec::with_capacity(info.initial_capacity),
            free: Vec::new(),
            next_salt: 1,
            active: 0,
        }
    }

    fn issue_salt(&mut self) -> u32 {
        let salt = self.next_salt;
        self.next_salt = match self.next_salt.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        salt
    }

    fn slot(&self, id: SlotId) -> Option<&Slot<H>> {
        if !id.is_valid() {
            return None;
        }
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.salt == id.salt)
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot<H>> {
        if !id.is_valid() {
            return None;
        }
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.salt == id.salt)
    }

    fn occupied(&self, id: SlotId) -> Option<(&H, u32, &'static str)> {
        match &self.slot(id)?.state {
            SlotState::Occupied {
                handle,
                retain_count,
                tag,
            } => Some((handle, *retain_count, *tag)),
            SlotState::Tombstone => None,
        }
    }

    fn store(&mut self, handle: H, tag: &'static str) -> SlotId {
        let salt = self.issue_salt();
        let state = SlotState::Occupied {
            handle,
            retain_count: 1,
            tag,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Slot { salt, state };
                index
            }
            None => {
                self.slots.push(Slot { salt, state });
                (self.slots.len() - 1) as u32
            }
        };
        self.active += 1;
        let id = SlotId::new(index, salt);
        log::debug!("{}: stored {tag} at {id}", self.name);
        id
    }

    fn retain(&mut self, id: SlotId) -> BridgeResult<u32> {
        match self.slot_mut(id).map(|slot| &mut slot.state) {
            Some(SlotState::Occupied { retain_count, .. }) => {
                *retain_count += 1;
                Ok(*retain_count)
            }
            _ => Err(stale::<H>(id)),
        }
    }

    fn tombstone(&mut self, id: SlotId) -> BridgeResult<H> {
        let name = self.name;
        let slot = self
            .slot_mut(id)
            .ok_or_else(|| stale::<H>(id))?;
        match std::mem::replace(&mut slot.state, SlotState::Tombstone) {
            SlotState::Occupied { handle, tag, .. } => {
                self.free.push(id.index);
                self.active -= 1;
                log::debug!("{name}: removed {tag} at {id}");
                Ok(handle)
            }
            SlotState::Tombstone => Err(stale::<H>(id)),
        }
    }

    fn release(&mut self, id: SlotId) -> BridgeResult<Option<H>> {
        let remaining = match self.slot_mut(id).map(|slot| &mut slot.state) {
            Some(SlotState::Occupied { retain_count, .. }) => {
                *retain_count -= 1;
                *retain_count
            }
            _ => return Err(stale::<H>(id)),
        };
        if remaining == 0 {
            self.tombstone(id).map(Some)
        } else {
            Ok(None)
        }
    }

    fn load(&self, id: SlotId) -> Option<Strong> {
        self.occupied(id).and_then(|(handle, _, _)| handle.resolve())
    }

    fn entries(&self) -> Vec<ReferenceTableEntry> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Occupied {
                    retain_count, tag, ..
                } => Some(ReferenceTableEntry {
                    id: SlotId::new(index as u32, slot.salt),
                    retain_count: *retain_count,
                    tag: *tag,
                }),
                SlotState::Tombstone => None,
            })
            .collect()
    }

    fn stats(&self) -> ReferenceTableStats {
        let mut by_tag: HashMap<&'static str, usize> = HashMap::new();
        for slot in &self.slots {
            if let SlotState::Occupied { tag, .. } = slot.state {
                *by_tag.entry(tag).or_default() += 1;
            }
        }
        let mut active_references_by_tag: Vec<_> = by_tag.into_iter().collect();
        active_references_by_tag
            .sort_by(|(a_tag, a), (b_tag, b)| b.cmp(a).then(a_tag.cmp(b_tag)));

        ReferenceTableStats {
            table_size: self.slots.len(),
            active_references_count: self.active,
            active_references_by_tag,
        }
    }
}

impl<H: TableHandle> ReferenceTable<H> {
    pub fn new(info: &ReferenceTableCreateInfo) -> Self {
        Self(RwLock::new(ReferenceTableImpl::new(info)))
    }

    /// Stores `handle` with a retain count of 1. Reuses the most recently
    /// freed slot when there is one.
    pub fn store(&self, handle: H, tag: &'static str) -> SlotId {
        self.0.write().store(handle, tag)
    }

    /// Returns the new retain count.
    pub fn retain(&self, id: SlotId) -> BridgeResult<u32> {
        self.0.write().retain(id)
    }

    /// Drops one retain. When the count reaches zero the slot is freed and
    /// its handle handed back to the caller.
    pub fn release(&self, id: SlotId) -> BridgeResult<Option<H>> {
        self.0.write().release(id)
    }

    /// Frees the slot whatever its retain count.
    pub fn remove(&self, id: SlotId) -> BridgeResult<H> {
        self.0.write().tombstone(id)
    }

    /// The live object at `id`. Fails on removed, reused or never issued
    /// ids and on weak entries whose object is gone.
    pub fn load(&self, id: SlotId) -> BridgeResult<Strong> {
        self.try_load(id)
            .ok_or_else(|| stale::<H>(id))
    }

    pub fn try_load(&self, id: SlotId) -> Option<Strong> {
        self.0.read().load(id)
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.0.read().occupied(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.read().active
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &'static str {
        self.0.read().name
    }

    pub fn entries(&self) -> Vec<ReferenceTableEntry> {
        self.0.read().entries()
    }

    pub fn dump_stats(&self) -> ReferenceTableStats {
        self.0.read().stats()
    }

    pub fn read(&self) -> ReferenceTableReader<'_, H> {
        ReferenceTableReader(self.0.read())
    }

    pub fn write(&self) -> ReferenceTableWriter<'_, H> {
        ReferenceTableWriter(self.0.write())
    }
}

impl ReferenceTable<Weak> {
    /// Frees every entry whose object has been deallocated. Returns how
    /// many were freed.
    pub fn purge_dead(&self) -> usize {
        let mut table = self.0.write();
        let dead: Vec<SlotId> = table
            .entries()
            .into_iter()
            .map(|entry| entry.id)
            .filter(|id| {
                table
                    .occupied(*id)
                    .is_some_and(|(handle, _, _)| !handle.is_alive())
            })
            .collect();
        for id in &dead {
            let _ = table.tombstone(*id);
        }
        dead.len()
    }
}

impl<H: TableHandle> Default for ReferenceTable<H> {
    fn default() -> Self {
        Self::new(&ReferenceTableCreateInfo::default())
    }
}

impl<H: TableHandle> ReferenceTableReader<'_, H> {
    pub fn load(&self, id: SlotId) -> Option<Strong> {
        self.0.load(id)
    }

    pub fn entry(&self, id: SlotId) -> Option<ReferenceTableEntry> {
        self.0
            .occupied(id)
            .map(|(_, retain_count, tag)| ReferenceTableEntry {
                id,
                retain_count,
                tag,
            })
    }

    pub fn entries(&self) -> Vec<ReferenceTableEntry> {
        self.0.entries()
    }
}

impl<H: TableHandle> ReferenceTableWriter<'_, H> {
    pub fn store(&mut self, handle: H, tag: &'static str) -> SlotId {
        self.0.store(handle, tag)
    }

    pub fn retain(&mut self, id: SlotId) -> BridgeResult<u32> {
        self.0.retain(id)
    }

    pub fn release(&mut self, id: SlotId) -> BridgeResult<Option<H>> {
        self.0.release(id)
    }

    pub fn remove(&mut self, id: SlotId) -> BridgeResult<H> {
        self.0.tombstone(id)
    }

    pub fn load(&self, id: SlotId) -> Option<Strong> {
        self.0.load(id)
    }
}

static STRONG_REFERENCES: OnceLock<StrongReferenceTable> = OnceLock::new();
static WEAK_REFERENCES: OnceLock<WeakReferenceTable> = OnceLock::new();

pub fn strong_references() -> &'static StrongReferenceTable {
    STRONG_REFERENCES.get_or_init(|| {
        ReferenceTable::new(&ReferenceTableCreateInfo {
            name: "strong references",
            ..Default::default()
        })
    })
}

pub fn weak_references() -> &'static WeakReferenceTable {
    WEAK_REFERENCES.get_or_init(|| {
        ReferenceTable::new(&ReferenceTableCreateInfo {
            name: "weak references",
            ..Default::default()
        })
    })
}

/// A slot in one of the global tables, owned by this value. Cloning
/// retains the slot, dropping releases it.
pub struct ExportedRef {
    id: SlotId,
    strength: Strength,
}

impl ExportedRef {
    /// Stores `object` in the global table for `strength`.
    pub fn export(object: &Strong, strength: Strength, tag: &'static str) -> Self {
        let id = match strength {
            Strength::Strong => strong_references().store(object.clone(), tag),
            Strength::Weak => {
                weak_references().store(Strong::downgrade(object), tag)
            }
        };
        Self { id, strength }
    }

    /// Takes a retain on an id received from the other side.
    pub fn from_raw_id(raw: u64, strength: Strength) -> BridgeResult<Self> {
        let id = SlotId::from_raw(raw);
        match strength {
            Strength::Strong => strong_references().retain(id)?,
            Strength::Weak => weak_references().retain(id)?,
        };
        Ok(Self { id, strength })
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn strength(&self) -> Strength {
        self.strength
    }

    /// The referenced object. A weak reference whose object is gone reads
    /// as `Ok(None)`; a strong reference never does.
    pub fn load(&self) -> BridgeResult<Option<Strong>> {
        match self.strength {
            Strength::Strong => strong_references().load(self.id).map(Some),
            Strength::Weak => {
                let object = weak_references().try_load(self.id);
                if object.is_none() {
                    log::debug!("weak reference {} is deallocated", self.id);
                }
                Ok(object)
            }
        }
    }
}

impl Clone for ExportedRef {
    fn clone(&self) -> Self {
        let retained = match self.strength {
            Strength::Strong => strong_references().retain(self.id),
            Strength::Weak => weak_references().retain(self.id),
        };
        if let Err(error) = retained {
            log::warn!("cloning exported reference: {error}");
        }
        Self {
            id: self.id,
            strength: self.strength,
        }
    }
}

impl Drop for ExportedRef {
    fn drop(&mut self) {
        let released = match self.strength {
            Strength::Strong => strong_references().release(self.id).map(drop),
            Strength::Weak => weak_references().release(self.id).map(drop),
        };
        if let Err(error) = released {
            log::debug!("releasing exported reference: {error}");
        }
    }
}

impl PartialEq for ExportedRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.strength == other.strength
    }
}

impl fmt::Debug for ExportedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExportedRef({:?} {})", self.strength, self.id)
    }
}
