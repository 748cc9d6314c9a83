//! Block fork: copy-on-write of logically addressed blocks.
//!
//! The backend may be mid-flush of the previous delta, reading the
//! stable copy of a buffer from its dirty list. The frontend diverges
//! onto a clone which replaces the original in the map's hash, so
//! every later lookup finds the clone while the flusher keeps the
//! original, now unhashed and owned through its remaining reference.

use log::trace;

use super::{BufId, BufState, BufferPool, MapId};
use crate::{BlockNum, Result};

impl BufferPool {
    /// Make `id` writable for `delta`, forking if it is dirty for an
    /// earlier delta. The caller's reference to `id` either comes back
    /// (already dirty this delta, or newly dirtied) or is handed to
    /// the backend and a fresh, held clone is returned in its place.
    pub fn fork_for_delta(&mut self, id: BufId, delta: u64) -> Result<BufId> {
        let id = if self.state(id).is_dirty() {
            if self.already_dirty(id, delta) {
                return Ok(id);
            }

            trace!(target: "buffer", "fork buffer [{:x}]", self.index(id));
            let map = self.map_of(id);
            let clone = self.new_buffer(map)?;
            {
                let from = self.data(id);
                let to = self.data(clone);
                to.borrow_mut().copy_from_slice(&from.borrow());
            }
            self.slots[clone].index = self.index(id);
            // Replace the buffer by the cloned buffer. The original's
            // reference now belongs to the backend, which drops it at
            // end of I/O.
            self.rehash(id, clone);
            clone
        } else {
            id
        };

        self.mark_dirty(id, delta);
        Ok(id)
    }

    /// Detach a buffer the backend still needs before invalidating its
    /// block. Returns true when the buffer was forked out of the hash
    /// (the caller skips it), false when it can be invalidated in
    /// place.
    fn fork_to_invalidate(&mut self, id: BufId, delta: u64) -> bool {
        if self.can_modify(id, delta) {
            return false;
        }
        self.hold(id); // keep alive for the backend
        self.remove_hash(id);
        true
    }

    /// Invalidate every buffer of `map` wholly inside the half-open
    /// byte range, zeroing the in-block tail of a partial first block.
    /// `lend` must be one short of a block boundary.
    pub fn truncate_range(&mut self, map: MapId, lstart: u64, lend: u64, delta: u64) {
        let bits = self.block_size().trailing_zeros();
        let bmask = (self.block_size() - 1) as u64;
        let start = ((lstart + bmask) >> bits) as BlockNum;
        let end = (lend >> bits) as BlockNum;
        let partial = (lstart & bmask) as usize;

        assert_eq!(lend & bmask, bmask);

        let bufs: Vec<(BlockNum, BufId)> = {
            let hash = &self.map(map).hash;
            hash.iter().map(|(&b, &id)| (b, id)).collect()
        };
        for (index, id) in bufs {
            // Clear the partial truncated buffer.
            if partial != 0 && index == start - 1 {
                let data = self.data(id);
                data.borrow_mut()[partial..].fill(0);
            }

            if index < start || end < index {
                continue;
            }

            if self.fork_to_invalidate(id, delta) {
                continue;
            }

            if self.state(id) != BufState::Empty {
                assert!(self.can_modify(id, delta));
                self.set_empty(id);
            }
            self.reclaim(id);
        }
    }

    /// Drop every idle buffer of `map` and empty the rest.
    pub fn invalidate(&mut self, map: MapId) {
        let bufs: Vec<BufId> = self.map(map).hash.values().copied().collect();
        for id in bufs {
            if self.count(id) == 1 {
                if self.state(id) != BufState::Empty {
                    self.set_empty(id);
                }
                self.reclaim(id);
            }
        }
    }

    fn reclaim(&mut self, id: BufId) {
        if self.count(id) == 1 && !self.state(id).is_dirty() && self.is_hashed(id) {
            self.remove_hash(id);
        }
    }
}
