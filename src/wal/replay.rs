//! Mount-time replay.
//!
//! Reverse-read the log chain from the superblock's head, then apply
//! every record in physical write order. Allocator records rebuild
//! the bitmap and defer queues on top of the region image written at
//! the last unify; bnode records rebuild the in-memory btree node
//! cache so the buffers match what existed before the crash; orphan
//! records rebuild the orphan list. A partially committed delta is
//! naturally invisible: its log blocks hang off the chain beyond the
//! committed `logcount` and are never visited.

use log::{debug, trace, warn};

use crate::btree;
use crate::fs::Fs;
use crate::types::MAGIC_LOG;
use crate::wal::{decode_block, defer_bfree, LogRecord, LOGBLOCK_HDR};
use crate::{BlockNum, Result};

impl Fs {
    /// Rebuild in-memory state from the log; called once at mount.
    pub(crate) fn replay(&mut self) -> Result<()> {
        self.backend = true;
        let res = self.replay_inner();
        self.backend = false;
        res
    }

    fn replay_inner(&mut self) -> Result<()> {
        let logcount = self.super_block.logcount as usize;
        let blocksize = self.pool.block_size();
        debug!(target: "replay", "replay {} log blocks, unify {}",
               logcount, self.super_block.unify);

        // Walk the reverse chain; the first-written block lands at
        // index zero.
        let mut blocks: Vec<(BlockNum, Vec<u8>)> = vec![];
        let mut chain = self.super_block.logchain;
        for _ in 0..logcount {
            let mut data = vec![0_u8; blocksize];
            self.dev.read(self.dev.block_offset(chain), &mut data)?;
            if data[0..2] != MAGIC_LOG.to_be_bytes() {
                return err_at!(Corrupt, msg: "bad log magic at {:x}", chain);
            }
            let prev = u64::from_be_bytes(data[4..12].try_into().unwrap()) as BlockNum;
            blocks.push((chain, data));
            chain = prev;
        }
        blocks.reverse();

        // The chain blocks themselves are allocated storage, carried
        // into the logmap cache and reclaimable after the next unify.
        for (index, (block, data)) in blocks.iter().enumerate() {
            self.alloc.replay_balloc(*block, 1)?;
            defer_bfree(&mut self.deunify, *block, 1);

            let id = self.pool.get(self.logmap, index as BlockNum)?;
            {
                let cached = self.pool.data(id);
                cached.borrow_mut().copy_from_slice(data);
            }
            self.pool.set_clean(id);
            self.pool.release(id);
        }

        let mut logged_freeblocks = None;
        for (block, data) in blocks.iter() {
            let bytes = u16::from_be_bytes([data[2], data[3]]) as usize;
            if LOGBLOCK_HDR + bytes > blocksize {
                return err_at!(Corrupt, msg: "log block {:x} payload {}", block, bytes);
            }
            for record in decode_block(&data[LOGBLOCK_HDR..LOGBLOCK_HDR + bytes])? {
                self.replay_record(record, &mut logged_freeblocks)?;
            }
        }

        if let Some(freeblocks) = logged_freeblocks {
            trace!(target: "replay", "freeblocks at unify {}", freeblocks);
        }
        if self.alloc.freeblocks != self.super_block.freeblocks {
            warn!(target: "replay",
                  "freeblocks mismatch: replayed {}, superblock {}",
                  self.alloc.freeblocks, self.super_block.freeblocks);
        }
        Ok(())
    }

    fn replay_record(
        &mut self,
        record: LogRecord,
        logged_freeblocks: &mut Option<u64>,
    ) -> Result<()> {
        use LogRecord::*;

        trace!(target: "replay", "replay {:?}", record);
        match record {
            Balloc { count, block } => self.replay_alloc(block, count),
            Bfree { count, block } | BfreeRelog { count, block } => {
                self.replay_bfree(block, count)
            }
            BfreeOnUnify { count, block } => self.replay_bfree_on_unify(block, count),
            LeafRedirect { old, new } => self.replay_leaf_redirect(old, new),
            LeafFree { block } => self.replay_leaf_free(block),
            BnodeRedirect { old, new } => self.replay_bnode_redirect_rec(old, new),
            BnodeRoot { count, root, left, right, rkey } => {
                self.alloc.replay_balloc(root, 1)?;
                btree::replay_bnode_root(self, root, count as usize, left, right, rkey)
            }
            BnodeSplit { pos, src, dst } => {
                self.alloc.replay_balloc(dst, 1)?;
                btree::replay_bnode_split(self, src, pos as usize, dst)
            }
            BnodeAdd { parent, child, key } => btree::replay_bnode_add(self, parent, child, key),
            BnodeUpdate { parent, child, key } => {
                btree::replay_bnode_update(self, parent, child, key)
            }
            BnodeMerge { src, dst } => {
                btree::replay_bnode_merge(self, src, dst)?;
                self.alloc.bfree(src, 1);
                Ok(())
            }
            BnodeDel { count, bnode, key } => {
                btree::replay_bnode_del(self, bnode, key, count as usize)
            }
            BnodeAdjust { bnode, from, to } => btree::replay_bnode_adjust(self, bnode, from, to),
            BnodeFree { block } => {
                self.alloc.bfree(block, 1);
                Ok(())
            }
            OrphanAdd { version: _, inum } => {
                if !self.orphans.contains(&inum) {
                    self.orphans.push(inum);
                }
                Ok(())
            }
            OrphanDel { version: _, inum } => {
                self.orphans.retain(|&orphan| orphan != inum);
                Ok(())
            }
            Freeblocks { freeblocks } => {
                *logged_freeblocks = Some(freeblocks);
                Ok(())
            }
            // Cycle boundary markers.
            Unify | Delta => Ok(()),
        }
    }

    fn replay_alloc(&mut self, block: BlockNum, count: u32) -> Result<()> {
        self.alloc.replay_balloc(block, count)
    }

    fn replay_bfree(&mut self, block: BlockNum, count: u32) -> Result<()> {
        self.alloc.bfree(block, count);
        Ok(())
    }

    /// The block stays allocated until the next unify barrier.
    fn replay_bfree_on_unify(&mut self, block: BlockNum, count: u32) -> Result<()> {
        defer_bfree(&mut self.deunify, block, count);
        Ok(())
    }

    /// Leaf contents were flushed with their delta; only the
    /// allocator effects replay.
    fn replay_leaf_redirect(&mut self, old: BlockNum, new: BlockNum) -> Result<()> {
        self.alloc.replay_balloc(new, 1)?;
        self.alloc.bfree(old, 1);
        Ok(())
    }

    /// Cancels a leaf redirect's allocation.
    fn replay_leaf_free(&mut self, block: BlockNum) -> Result<()> {
        self.alloc.bfree(block, 1);
        Ok(())
    }

    fn replay_bnode_redirect_rec(&mut self, old: BlockNum, new: BlockNum) -> Result<()> {
        self.alloc.replay_balloc(new, 1)?;
        defer_bfree(&mut self.deunify, old, 1);
        btree::replay_bnode_redirect(self, old, new)
    }
}

#[cfg(test)]
#[path = "replay_test.rs"]
mod replay_test;
