//! Delta transition and unify cycles.
//!
//! A delta transition closes the current frontend delta, hands its
//! dirty lists to the backend and opens the next delta. The backend
//! then flushes, in order: each dirty inode's data (allocating
//! extents and mutating btrees, which accumulates log records),
//! volmap leaves, the delta's log blocks, and finally the superblock.
//! Deferred frees drain through the allocator only after the
//! superblock lands, so a crash at any point leaves the previous tree
//! intact.
//!
//! A unify runs at the head of a delta flush, while the allocator
//! still holds the previous delta's state: dirty bnodes and the
//! bitmap snapshot are written, still-deferred frees are re-logged
//! into the fresh cycle, and the old cycle's log blocks become
//! reclaimable.

use log::{debug, trace};

use std::mem;

use crate::fs::Fs;
use crate::iattr::IattrData;
use crate::types::delta_slot;
use crate::wal::{defer_bfree, unpack_bfree};
use crate::Result;

/// Log blocks in a cycle before a delta forces a unify.
const UNIFY_LOGCOUNT_THRESHOLD: u32 = 64;

/// Closed dirty state handed from a delta transition to the flusher.
pub(crate) struct DeltaMarshal {
    pub delta: u64,
    pub unify: bool,
}

/// Attribute snapshot used when flushing device-backed maps, which
/// have no real inode size to cancel against.
fn internal_idata() -> IattrData {
    IattrData {
        size: u64::MAX >> 1,
        ..IattrData::default()
    }
}

impl Fs {
    /// Open a change window: pins the current delta until the matching
    /// [Fs::change_end].
    pub fn change_begin(&mut self) -> u64 {
        self.change_refs += 1;
        self.delta
    }

    pub fn change_end(&mut self, delta: u64) {
        assert_eq!(delta, self.delta, "change window crossed a delta transition");
        assert!(self.change_refs > 0);
        self.change_refs -= 1;
    }

    /// Close the current delta and open the next frontend delta. The
    /// closed delta's dirty lists now belong to the backend.
    pub(crate) fn delta_transition(&mut self) -> DeltaMarshal {
        assert_eq!(self.change_refs, 0, "change windows not drained");
        let delta = self.delta;
        self.delta += 1;
        trace!(target: "commit", "delta transition {} -> {}", delta, self.delta);
        DeltaMarshal {
            delta,
            unify: self.super_block.logcount >= UNIFY_LOGCOUNT_THRESHOLD,
        }
    }

    /// Flush a closed delta to disk. With `force_unify` the flush
    /// also closes the unify cycle.
    pub(crate) fn flush_delta(&mut self, marshal: DeltaMarshal, force_unify: bool) -> Result<()> {
        // The two-slot regime requires the flusher to never trail by
        // more than one delta.
        assert_eq!(marshal.delta + 1, self.delta, "flusher trails too far");

        self.backend = true;
        self.marshal_delta = marshal.delta;
        let res = self.flush_delta_inner(marshal.delta, marshal.unify || force_unify);
        if res.is_err() {
            // The delta is lost. Drop its log blocks and refuse
            // further commits; the disk still holds the previous
            // consistent tree.
            self.log_finish();
            self.log_finish_cycle(true);
            self.readonly = true;
        }
        self.backend = false;
        res
    }

    fn flush_delta_inner(&mut self, delta: u64, unify: bool) -> Result<()> {
        debug!(target: "commit", "flush delta {} unify {}", delta, unify);

        if unify {
            self.unify_begin()?;
        }

        // Dirty inodes: file data, then attributes into the itable.
        let inums = mem::take(&mut self.dirty_inodes[delta_slot(delta)]);
        for inum in inums {
            let id = self.icache.find_id(inum).expect("dirty inode not hashed");
            self.flush_inode(id, delta)?;
        }

        // Frontend-queued orphan intents.
        for record in mem::take(&mut self.pending_orphans) {
            self.log_append(record)?;
        }

        // Volmap leaves of this delta.
        self.flush_list(self.volmap, &internal_idata(), delta)?;

        // Close the log and write its blocks, chaining them onto the
        // superblock's reverse chain.
        self.log_delta()?;
        self.log_finish();
        self.flush_list(self.logmap, &internal_idata(), delta)?;
        self.log_finish_cycle(false);

        if self.crash_before_super {
            // Test hook: the delta's blocks are on disk but the
            // superblock never points at them.
            return Ok(());
        }

        // This delta's deferred frees return to the allocator. Nothing
        // allocates between here and the superblock write, and the
        // tree it commits no longer references these blocks.
        let mut defree = mem::take(&mut self.defree);
        defree.unstash(|val| {
            let (block, count) = unpack_bfree(val);
            self.alloc.bfree(block, count);
            Ok(())
        })?;

        // Log blocks strictly before the superblock that references
        // them.
        self.super_block.freeblocks = self.alloc.freeblocks;
        self.super_block.unify = self.unify;
        self.super_block.store(&self.dev)?;

        Ok(())
    }

    /// Close the current unify cycle. Runs before any of the new
    /// delta's flush work, while the allocator still describes the
    /// state every record of the fresh cycle will build on.
    fn unify_begin(&mut self) -> Result<()> {
        trace!(target: "commit", "unify {}", self.unify);

        // Pinned metadata reaches disk: every bnode dirtied during
        // the closing cycle.
        self.flush_unify_list()?;

        // Bitmap snapshot into the inactive region; the superblock
        // flip makes it current only when this delta commits.
        self.write_bitmap_region()?;

        // Open the new cycle.
        self.log_unify()?;
        let freeblocks = self.alloc.freeblocks;
        self.log_freeblocks(freeblocks)?;

        // Blocks parked until this barrier are re-logged into the new
        // cycle and freed once this delta commits.
        let mut deunify = mem::take(&mut self.deunify);
        deunify.unstash(|val| {
            let (block, count) = unpack_bfree(val);
            self.log_bfree_relog(block, count)?;
            defer_bfree(&mut self.defree, block, count);
            Ok(())
        })?;

        // Orphan records must survive the log truncation.
        let version = self.super_block.version as u16;
        for inum in self.orphans.clone() {
            self.log_orphan_add(version, inum)?;
        }

        // The cycle restarts: only this delta's log blocks count.
        self.super_block.logcount = 0;
        self.unify += 1;
        Ok(())
    }

    /// Write the in-memory bitmap into the inactive region and flip
    /// the active pointer (durable at the next superblock write).
    fn write_bitmap_region(&mut self) -> Result<()> {
        let target = 1 - self.alloc.active_region;
        let base = self.alloc.region_base[target];
        let bytes = self.alloc.region_blocks as usize * self.pool.block_size();

        let mut image = vec![0_u8; bytes];
        image[..self.alloc.bitmap_bytes().len()].copy_from_slice(self.alloc.bitmap_bytes());
        self.dev.write(self.dev.block_offset(base), &image)?;

        self.alloc.active_region = target;
        self.super_block.bitmap_root = base as u64;
        Ok(())
    }

    /// Commit one delta.
    pub fn commit(&mut self) -> Result<()> {
        if self.readonly {
            return err_at!(IoFail, msg: "filesystem went read-only after a failed commit");
        }
        let marshal = self.delta_transition();
        self.flush_delta(marshal, false)
    }

    /// Commit one delta and force a unify, leaving the log empty but
    /// for this delta's records.
    pub fn sync(&mut self) -> Result<()> {
        if self.readonly {
            return err_at!(IoFail, msg: "filesystem went read-only after a failed commit");
        }
        let marshal = self.delta_transition();
        self.flush_delta(marshal, true)
    }
}

#[cfg(test)]
#[path = "commit_test.rs"]
mod commit_test;
