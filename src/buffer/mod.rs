//! Block buffer cache.
//!
//! Buffers cache fixed-size blocks of an address space (a [Map]),
//! which is backed either by the raw volume (volmap, logmap) or by a
//! file's logical block space. Instead of state bits, each buffer
//! carries a scalar state; every state change is also a move between
//! the lists implied by the state, so a buffer is always on exactly
//! one list:
//!
//! ```text
//! freed  --alloc-->  empty
//! empty  --read-->   clean
//! empty  --write-->  dirty(d)
//! clean  --dirty-->  dirty(d)
//! dirty(d) --endio-> clean        (success)
//! dirty(d) --endio-> empty        (error, re-read required)
//! any    --truncate--> empty
//! ```
//!
//! "Dirty for delta d" stores `d mod 2`; the frontend must never
//! modify a buffer that is dirty for a different delta without forking
//! it first (see [fork]).

mod fork;

pub mod bufvec;

use log::{debug, trace, warn};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::types::delta_slot;
use crate::{BlockNum, Inum, Result};

/// Handle into the pool's buffer arena. A held handle is backed by a
/// reference count; the slot cannot be recycled from under it.
pub type BufId = usize;

/// Handle into the pool's map registry.
pub type MapId = usize;

/// Shared handle on a buffer's data region. Cloning is cheap; the
/// borrow is checked at runtime, which lets a caller mutate leaf bytes
/// while still reaching the rest of the filesystem state.
pub type BlockData = Rc<RefCell<Box<[u8]>>>;

/// Fewest buffers the pool will be sized for.
const MIN_BUFFERS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BufState {
    Freed,
    Empty,
    Clean,
    /// Dirty for the delta (or, on the volmap's bnode list, the unify
    /// cycle) whose low bit is `slot`.
    Dirty { slot: u8, unify: bool },
}

impl BufState {
    pub fn is_dirty(&self) -> bool {
        matches!(self, BufState::Dirty { .. })
    }
}

/// How flush routes a map's buffers to disk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MapIo {
    /// Logical index is the physical block (volmap).
    Vol,
    /// Physical blocks allocated at flush time, chained in reverse
    /// (logmap).
    Log,
    /// Logical-to-physical translation through the owning inode's
    /// extent btree.
    File,
    /// Maps that must never reach the device (special inodes).
    Err,
}

struct Buffer {
    index: BlockNum,
    map: MapId,
    count: u32,
    state: BufState,
    hashed: bool,
    access: u64,
    data: BlockData,
}

/// An address space: logical index to buffer translation plus the
/// per-delta dirty lists.
pub struct Map {
    pub inum: Option<Inum>,
    pub io: MapIo,
    hash: HashMap<BlockNum, BufId>,
    /// Dirty buffers per delta slot.
    pub dirty: [Vec<BufId>; 2],
    /// Volmap only: bnode buffers dirty for the open unify cycle.
    pub unify_dirty: Vec<BufId>,
}

/// The process... no: the *instance*-wide buffer pool. Shares one LRU
/// and one free list across all maps of a filesystem instance.
pub struct BufferPool {
    blocksize: usize,
    max_buffers: usize,
    max_evict: usize,
    tick: u64,
    live: usize,
    slots: Vec<Buffer>,
    freed: Vec<BufId>,
    maps: Vec<Option<Map>>,
}

impl BufferPool {
    /// `poolsize` is a byte budget; the buffer count cap is derived
    /// from it, floored at a workable minimum.
    pub fn new(blocksize: usize, poolsize: usize) -> BufferPool {
        let max_buffers = (poolsize / blocksize).max(MIN_BUFFERS);
        BufferPool {
            blocksize,
            max_buffers,
            max_evict: max_buffers / 10,
            tick: 0,
            live: 0,
            slots: vec![],
            freed: vec![],
            maps: vec![],
        }
    }

    pub fn block_size(&self) -> usize {
        self.blocksize
    }

    pub fn new_map(&mut self, inum: Option<Inum>, io: MapIo) -> MapId {
        let map = Map {
            inum,
            io,
            hash: HashMap::new(),
            dirty: [vec![], vec![]],
            unify_dirty: vec![],
        };
        match self.maps.iter().position(|m| m.is_none()) {
            Some(id) => {
                self.maps[id] = Some(map);
                id
            }
            None => {
                self.maps.push(Some(map));
                self.maps.len() - 1
            }
        }
    }

    /// Drop a map, evicting its buffers. All of them must be idle
    /// (only the hash reference) and flushed.
    pub fn free_map(&mut self, map: MapId) {
        let ids: Vec<BufId> = self.map(map).hash.values().copied().collect();
        for id in ids {
            assert_eq!(self.slots[id].count, 1, "free_map: buffer in use");
            assert!(!self.slots[id].state.is_dirty(), "free_map: dirty buffer");
            self.remove_hash(id);
        }
        self.maps[map] = None;
    }

    pub fn map(&self, map: MapId) -> &Map {
        self.maps[map].as_ref().unwrap()
    }

    pub fn map_mut(&mut self, map: MapId) -> &mut Map {
        self.maps[map].as_mut().unwrap()
    }

    // Accessors, buffer side.

    pub fn index(&self, id: BufId) -> BlockNum {
        self.slots[id].index
    }

    pub fn state(&self, id: BufId) -> BufState {
        self.slots[id].state
    }

    pub fn count(&self, id: BufId) -> u32 {
        self.slots[id].count
    }

    pub fn map_of(&self, id: BufId) -> MapId {
        self.slots[id].map
    }

    pub fn is_hashed(&self, id: BufId) -> bool {
        self.slots[id].hashed
    }

    pub fn data(&self, id: BufId) -> BlockData {
        Rc::clone(&self.slots[id].data)
    }

    /// Buffer was already dirtied for `delta`?
    pub fn already_dirty(&self, id: BufId, delta: u64) -> bool {
        match self.slots[id].state {
            BufState::Dirty { slot, unify: false } => slot as usize == delta_slot(delta),
            _ => false,
        }
    }

    /// Buffer was already dirtied for unify cycle `unify`?
    pub fn already_unify_dirty(&self, id: BufId, unify: u64) -> bool {
        match self.slots[id].state {
            BufState::Dirty { slot, unify: true } => slot as usize == delta_slot(unify),
            _ => false,
        }
    }

    /// Can the frontend modify this buffer for `delta` without a fork?
    pub fn can_modify(&self, id: BufId, delta: u64) -> bool {
        !self.slots[id].state.is_dirty() || self.already_dirty(id, delta)
    }

    // Reference counting.

    pub fn hold(&mut self, id: BufId) {
        assert!(self.slots[id].count >= 1);
        self.slots[id].count += 1;
    }

    /// Drop one reference. On the last one the slot detaches and goes
    /// back to the free pool.
    pub fn release(&mut self, id: BufId) {
        let buf = &mut self.slots[id];
        assert!(buf.count > 0);
        trace!(target: "buffer",
               "release buffer {:x}, count {} state {:?}", buf.index, buf.count, buf.state);
        buf.count -= 1;
        if buf.count == 0 {
            assert!(!buf.state.is_dirty());
            assert!(!buf.hashed);
            self.free_slot(id);
        }
    }

    fn free_slot(&mut self, id: BufId) {
        let buf = &mut self.slots[id];
        buf.state = BufState::Freed;
        // A stray data handle keeps the old region alive; give the
        // slot a fresh one in that case.
        if Rc::strong_count(&buf.data) > 1 {
            buf.data = new_block_data(self.blocksize);
        }
        self.freed.push(id);
        self.live -= 1;
    }

    // State transitions. Every transition maintains the state/list
    // agreement.

    fn unlink_dirty(&mut self, id: BufId) {
        if let BufState::Dirty { slot, unify } = self.slots[id].state {
            let map = self.slots[id].map;
            let list = match unify {
                false => &mut self.map_mut(map).dirty[slot as usize],
                true => &mut self.map_mut(map).unify_dirty,
            };
            list.retain(|&b| b != id);
        }
    }

    /// Dirty for `delta`, onto the map's per-delta dirty list.
    pub fn mark_dirty(&mut self, id: BufId, delta: u64) {
        self.unlink_dirty(id);
        let slot = delta_slot(delta);
        let map = self.slots[id].map;
        self.map_mut(map).dirty[slot].push(id);
        self.slots[id].state = BufState::Dirty {
            slot: slot as u8,
            unify: false,
        };
    }

    /// Dirty for the unify cycle, onto the map's unify list. Used for
    /// bnodes, which are flushed at unify rather than every delta.
    pub fn mark_unify_dirty(&mut self, id: BufId, unify: u64) {
        self.unlink_dirty(id);
        let map = self.slots[id].map;
        self.map_mut(map).unify_dirty.push(id);
        self.slots[id].state = BufState::Dirty {
            slot: delta_slot(unify) as u8,
            unify: true,
        };
    }

    pub fn set_clean(&mut self, id: BufId) {
        assert!(self.slots[id].state != BufState::Clean);
        self.unlink_dirty(id);
        self.slots[id].state = BufState::Clean;
    }

    pub fn set_empty(&mut self, id: BufId) {
        assert!(self.slots[id].state != BufState::Empty);
        self.unlink_dirty(id);
        self.slots[id].state = BufState::Empty;
    }

    fn set_empty_lenient(&mut self, id: BufId) {
        if self.slots[id].state != BufState::Empty {
            self.set_empty(id);
        }
    }

    /// End-of-I/O transition for volmap and logmap buffers.
    pub fn end_io_vol(&mut self, id: BufId, err: bool) {
        if err {
            self.set_empty_lenient(id);
        } else {
            self.set_clean(id);
        }
    }

    /// End-of-I/O transition for file data buffers. A forked buffer
    /// (unhashed) was pinned by the backend; writing it out drops that
    /// pin.
    pub fn end_io_file(&mut self, id: BufId, err: bool) {
        let forked = !self.slots[id].hashed;
        self.end_io_vol(id, err);
        if forked {
            self.release(id);
        }
    }

    /// Mark clean and unhash, for buffers whose backing block is going
    /// away without I/O (discarded log blocks).
    pub fn forget_dirty(&mut self, id: BufId) {
        if self.slots[id].state.is_dirty() {
            self.set_clean(id);
        }
        if self.slots[id].hashed {
            self.remove_hash(id);
        }
    }

    /// Cancel a redirect: the caller and the hash hold the only two
    /// references, the block itself has been freed in the allocator.
    pub fn put_free(&mut self, id: BufId, counter: u64) {
        if self.count(id) != 2 {
            warn!(target: "buffer",
                  "free block {:x}/{} still in use", self.index(id), self.count(id));
            self.release(id);
            return;
        }
        assert!(self.can_modify(id, counter) || self.already_unify_dirty(id, counter));
        if self.slots[id].state != BufState::Clean {
            self.set_clean(id);
        }
        self.release(id);
    }

    // Hash and lookup.

    fn insert_hash(&mut self, id: BufId) {
        let (map, index) = (self.slots[id].map, self.slots[id].index);
        self.slots[id].count += 1; // additional refcount for the hash link
        self.slots[id].hashed = true;
        self.slots[id].access = self.next_tick();
        let old = self.map_mut(map).hash.insert(index, id);
        assert!(old.is_none(), "two hashed buffers for one block");
    }

    fn remove_hash(&mut self, id: BufId) {
        let (map, index) = (self.slots[id].map, self.slots[id].index);
        assert!(self.slots[id].hashed);
        self.slots[id].hashed = false;
        let hashed = self.map_mut(map).hash.remove(&index);
        assert_eq!(hashed, Some(id));
        self.release(id); // put the hash link's refcount
    }

    /// Unhash `old` and hash `new` in its place (the CoW fork swap).
    pub(crate) fn rehash(&mut self, old: BufId, new: BufId) {
        self.remove_hash(old);
        self.insert_hash(new);
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Non-allocating lookup; bumps the reference count on a hit.
    pub fn peek(&mut self, map: MapId, block: BlockNum) -> Option<BufId> {
        let id = *self.map(map).hash.get(&block)?;
        self.slots[id].count += 1;
        Some(id)
    }

    /// Return a buffer for `(map, block)`, allocating if absent. Never
    /// performs I/O; a fresh buffer comes back `empty`.
    pub fn get(&mut self, map: MapId, block: BlockNum) -> Result<BufId> {
        if let Some(&id) = self.map(map).hash.get(&block) {
            self.slots[id].access = self.next_tick();
            self.slots[id].count += 1;
            return Ok(id);
        }

        trace!(target: "buffer", "make buffer [{:x}]", block);
        let id = self.new_buffer(map)?;
        self.slots[id].index = block;
        self.insert_hash(id);
        Ok(id)
    }

    /// Allocate a buffer slot in `empty` state with one reference.
    fn new_buffer(&mut self, map: MapId) -> Result<BufId> {
        if self.freed.is_empty() && self.live >= self.max_buffers {
            trace!(target: "buffer", "try to evict buffers");
            self.evict_some();
        }

        let id = match self.freed.pop() {
            Some(id) => id,
            None if self.live < self.max_buffers => {
                self.slots.push(Buffer {
                    index: 0,
                    map: 0,
                    count: 0,
                    state: BufState::Freed,
                    hashed: false,
                    access: 0,
                    data: new_block_data(self.blocksize),
                });
                self.slots.len() - 1
            }
            None => {
                warn!(target: "buffer",
                      "maximum buffer count exceeded ({})", self.live);
                return err_at!(NoMemory, msg: "buffer pool exhausted ({})", self.live);
            }
        };

        let buf = &mut self.slots[id];
        assert_eq!(buf.count, 0);
        assert_eq!(buf.state, BufState::Freed);
        buf.map = map;
        buf.count = 1;
        buf.state = BufState::Empty;
        self.live += 1;
        Ok(id)
    }

    /// Walk reclaim candidates in LRU order, dropping buffers held
    /// only by their hash link, up to the eviction batch limit.
    fn evict_some(&mut self) {
        let mut victims: Vec<(u64, BufId)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.hashed && b.count == 1 && !b.state.is_dirty() && b.state != BufState::Freed
            })
            .map(|(id, b)| (b.access, id))
            .collect();
        victims.sort_unstable();

        for (_, id) in victims.into_iter().take(self.max_evict) {
            trace!(target: "buffer", "evict buffer [{:x}]", self.slots[id].index);
            self.remove_hash(id);
        }
    }

    // Introspection, not load bearing.

    /// Count of live (non-freed) buffers.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn dirty_count(&self, map: MapId, delta: u64) -> usize {
        self.map(map).dirty[delta_slot(delta)].len()
    }

    /// Trace-dump a map's buffers.
    pub fn show_buffers(&self, map: MapId) {
        for (&block, &id) in self.map(map).hash.iter() {
            let buf = &self.slots[id];
            debug!(target: "buffer",
                   "{:x}/{} {:?}{}", block, buf.count, buf.state,
                   if buf.hashed { "" } else { " (forked)" });
        }
    }
}

fn new_block_data(blocksize: usize) -> BlockData {
    Rc::new(RefCell::new(vec![0_u8; blocksize].into_boxed_slice()))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
