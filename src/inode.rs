//! Inode cache and per-delta attribute forks.
//!
//! Inodes live in a fixed-size open hash keyed by a mix of the inum.
//! A dirty inode stays pinned until the delta it belongs to commits,
//! even with no outside references; `FREEING` blocks new references
//! during teardown and `BAD` marks a partially initialized inode so it
//! can be torn down safely.
//!
//! Attribute forks mirror the buffer fork: the frontend copies the
//! stable attributes into the previous delta's dirty chunk before the
//! first modification of a new delta, so the backend always reads a
//! snapshot that cannot change under it.

use bitflags::bitflags;
use log::trace;

use crate::buffer::MapId;
use crate::iattr::{IattrData, Present};
use crate::types::{delta_slot, Root};
use crate::{Inum, Result};

const HASH_SHIFT: u32 = 10;
const HASH_SIZE: usize = 1 << HASH_SHIFT;

// hash_64: multiplicative hash by the 64-bit golden ratio.
const GOLDEN_RATIO: u64 = 0x61c8_8646_80b5_83eb;

fn hash(inum: Inum) -> usize {
    (inum.wrapping_mul(GOLDEN_RATIO) >> (64 - HASH_SHIFT)) as usize
}

bitflags! {
    pub struct InodeState: u32 {
        const NEW           = 0x01;
        const DIRTY         = 0x02;
        const DIRTY_SYNC    = 0x04;
        const DIRTY_DATASYNC = 0x08;
        const FREEING       = 0x10;
        const BAD           = 0x20;
    }
}

impl InodeState {
    pub fn is_dirty(&self) -> bool {
        self.intersects(InodeState::DIRTY | InodeState::DIRTY_SYNC | InodeState::DIRTY_DATASYNC)
    }
}

/// Handle into the cache's inode arena.
pub type InodeId = usize;

/// Per-delta dirty chunk: the attribute snapshot the backend flushes
/// while the frontend keeps mutating the live inode, plus the lowest
/// size this delta truncated to (the backend chops the extent tree
/// before writing new data).
#[derive(Default)]
pub struct DirtyChunk {
    pub idata: Option<IattrData>,
    pub truncate: Option<u64>,
}

pub struct Inode {
    pub inum: Inum,
    pub attrs: IattrData,
    /// Extent btree root for file contents.
    pub btree: Root,
    /// This inode's address space.
    pub map: MapId,
    pub state: InodeState,
    count: u32,
    /// Delta slot the live attributes were dirtied for.
    iattr_state: Option<u8>,
    pub ddc: [DirtyChunk; 2],
}

impl Inode {
    pub fn new(inum: Inum, map: MapId) -> Inode {
        Inode {
            inum,
            attrs: IattrData::default(),
            btree: Root::default(),
            map,
            state: InodeState::NEW,
            count: 1,
            iattr_state: None,
            ddc: [DirtyChunk::default(), DirtyChunk::default()],
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    fn is_reg(&self) -> bool {
        self.attrs.mode & 0o170000 == 0o100000
    }

    /// Snapshot the live attributes, with the btree bit reflecting
    /// whether file data exists.
    pub fn idata(&self) -> IattrData {
        let mut idata = self.attrs;
        if self.btree.has_root() {
            idata.present |= Present::DATA_BTREE;
            idata.btree = self.btree;
        }
        idata
    }
}

/// Fixed-size open hash of live inodes, one per filesystem instance.
pub struct InodeCache {
    buckets: Vec<Vec<InodeId>>,
    slots: Vec<Option<Inode>>,
    free: Vec<InodeId>,
}

impl Default for InodeCache {
    fn default() -> InodeCache {
        InodeCache {
            buckets: (0..HASH_SIZE).map(|_| vec![]).collect(),
            slots: vec![],
            free: vec![],
        }
    }
}

impl InodeCache {
    pub fn get(&self, id: InodeId) -> &Inode {
        self.slots[id].as_ref().unwrap()
    }

    pub fn get_mut(&mut self, id: InodeId) -> &mut Inode {
        self.slots[id].as_mut().unwrap()
    }

    /// Register a freshly built inode without hashing it yet.
    pub fn add_slot(&mut self, inode: Inode) -> InodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(inode);
                id
            }
            None => {
                self.slots.push(Some(inode));
                self.slots.len() - 1
            }
        }
    }

    /// Take one reference. A zero count is legal only for an inode
    /// pinned by its dirty state.
    pub fn iget_ref(&mut self, id: InodeId) {
        let inode = self.get_mut(id);
        assert!(!inode.state.contains(InodeState::FREEING));
        if inode.count == 0 {
            assert!(inode.state.is_dirty());
        }
        inode.count += 1;
    }

    /// Take an additional reference; the caller must already hold one.
    pub fn ihold(&mut self, id: InodeId) {
        let inode = self.get_mut(id);
        assert!(!inode.state.contains(InodeState::FREEING));
        assert!(inode.count >= 1);
        inode.count += 1;
    }

    /// Find a live inode accepted by `test`, taking a reference.
    pub fn ilookup5<T>(&mut self, inum: Inum, test: T) -> Option<InodeId>
    where
        T: Fn(&Inode) -> bool,
    {
        let bucket = &self.buckets[hash(inum)];
        let id = bucket
            .iter()
            .copied()
            .find(|&id| test(self.get(id)))?;
        self.iget_ref(id);
        Some(id)
    }

    /// Locate a hashed inode by inum without touching its reference
    /// count; the backend's way in.
    pub fn find_id(&self, inum: Inum) -> Option<InodeId> {
        self.buckets[hash(inum)]
            .iter()
            .copied()
            .find(|&id| self.get(id).inum == inum)
    }

    /// Hash a pre-built inode, failing with `Busy` when another
    /// matching inode is live and not being freed.
    pub fn insert_locked4<T>(&mut self, id: InodeId, inum: Inum, test: T) -> Result<()>
    where
        T: Fn(&Inode) -> bool,
    {
        let bucket = hash(inum);
        let old = self.buckets[bucket]
            .iter()
            .copied()
            .find(|&old| test(self.get(old)) && !self.get(old).state.contains(InodeState::FREEING));
        if old.is_some() {
            return err_at!(Busy, msg: "inum {} already live", inum);
        }

        self.get_mut(id).state |= InodeState::NEW;
        self.buckets[bucket].push(id);
        Ok(())
    }

    pub fn unhash(&mut self, id: InodeId) {
        let inum = self.get(id).inum;
        self.buckets[hash(inum)].retain(|&slot| slot != id);
    }

    /// Drop one reference; returns true when the count hit zero and
    /// the caller should decide eviction.
    pub fn iput_ref(&mut self, id: InodeId) -> bool {
        let inode = self.get_mut(id);
        assert!(inode.count > 0);
        inode.count -= 1;
        inode.count == 0
    }

    /// Detach and drop a slot. Caller has already torn down the map.
    pub fn remove_slot(&mut self, id: InodeId) -> Inode {
        let inode = self.slots[id].take().unwrap();
        self.free.push(id);
        inode
    }

    /// Count of live inodes, for leak checks.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Inode {
    /// Ensure the appropriate dirty chunk carries the pre-change
    /// snapshot before the frontend mutates attributes for `delta`.
    /// Skips all work if already dirtied this delta.
    pub fn iattrdirty(&mut self, delta: u64) {
        let slot = delta_slot(delta) as u8;
        if self.iattr_state == Some(slot) {
            return;
        }

        trace!(target: "inode", "iattrdirty inum {} delta {}", self.inum, delta);

        if self.is_reg() || self.iattr_state.is_some() {
            // For a regular file the backend may be committing data
            // pages and needs a stable i_size even when the previous
            // delta never dirtied attributes.
            let old_slot = match self.iattr_state {
                Some(old) => old,
                None => delta_slot(delta.wrapping_sub(1)) as u8,
            };
            if old_slot != slot {
                self.ddc[old_slot as usize].idata = Some(self.idata());
            }
        }
        self.iattr_state = Some(slot);
    }

    /// Backend: read the stable attributes for `delta` and clear the
    /// fork state when the live copy was used.
    pub fn iattr_read_and_clear(&mut self, delta: u64) -> IattrData {
        let slot = delta_slot(delta);

        let idata = match self.iattr_state {
            None => {
                let idata = self.idata();
                idata
            }
            Some(dirtied) if dirtied as usize == slot => {
                self.iattr_state = None;
                self.idata()
            }
            Some(_) => {
                // Dirtied again after this delta stabilized; the fork
                // holds the snapshot.
                self.ddc[slot]
                    .idata
                    .take()
                    .expect("missing forked attribute snapshot")
            }
        };

        // Reset the slot after the backend consumed it.
        self.ddc[slot].idata = None;
        idata
    }
}

#[cfg(test)]
#[path = "inode_test.rs"]
mod inode_test;
