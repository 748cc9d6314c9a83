//! File data paths: logical-to-physical mapping through the extent
//! btree, the backend write-out of dirty file buffers, and the byte
//! granular frontend read/write/truncate operations.
//!
//! Writes are delayed-allocation: the frontend only dirties cache
//! buffers; physical extents are materialized at flush time, after
//! the leaf redirect, so fresh data lands near its metadata.

use log::trace;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::btree::dleaf::{self, DleafReq, DLEAF_OPS};
use crate::btree::{self, ileaf};
use crate::buffer::bufvec::{Bufvec, EndIo};
use crate::buffer::{BufId, BufState};
use crate::fs::Fs;
use crate::inode::{InodeId, InodeState};
use crate::types::{seg_total_count, BlockSeg, KEY_LIMIT};
use crate::{BlockNum, Key, Result};

fn gettime() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        Err(_) => 0,
    }
}

impl Fs {
    /// Translate `[start, start+count)` of a file into physical
    /// segments, without modifying the tree. Holes come back as hole
    /// segments.
    pub(crate) fn map_region_read(
        &mut self,
        id: InodeId,
        start: BlockNum,
        count: u64,
        seg_max: usize,
    ) -> Result<Vec<BlockSeg>> {
        let root = self.icache.get(id).btree;
        if !root.has_root() {
            return Ok(vec![BlockSeg::hole(count as u32)]);
        }

        let mut rq = DleafReq::read(start as Key, count, seg_max);
        let mut cursor = btree::btree_probe(self, &root, &DLEAF_OPS, start as Key)?;
        let res = (|fs: &mut Fs, cursor: &mut btree::Cursor| -> Result<()> {
            loop {
                btree::btree_read(fs, cursor, |fs, bottom, limit, leafbuf| {
                    let data = fs.pool.data(leafbuf);
                    let leaf = data.borrow();
                    dleaf::leaf_read(bottom, limit, &leaf, &mut rq);
                    Ok(())
                })?;
                if rq.key.len == 0 || rq.seg_idx >= seg_max {
                    return Ok(());
                }
                if !btree::cursor_advance(fs, &root, &DLEAF_OPS, cursor)? {
                    return Ok(());
                }
            }
        })(self, &mut cursor);
        cursor.release(self);
        res?;

        // Anything past the last leaf is one hole.
        if rq.key.len > 0 && rq.seg_idx < seg_max {
            rq.segs.push(BlockSeg::hole(rq.key.len as u32));
        }
        Ok(rq.segs)
    }

    /// Map `[start, start+count)` for writing: allocate extents,
    /// redirecting and splitting leaves as needed. Backend only.
    pub(crate) fn map_region_write(
        &mut self,
        id: InodeId,
        start: BlockNum,
        count: u64,
    ) -> Result<Vec<BlockSeg>> {
        assert!(self.under_backend());
        trace!(target: "filemap",
               "write inode 0x{:x} block 0x{:x}/{}",
               self.icache.get(id).inum, start, count);

        let mut root = self.icache.get(id).btree;
        if !root.has_root() {
            root = btree::alloc_empty_btree(self, &DLEAF_OPS)?;
            self.icache.get_mut(id).btree = root;
        }

        let mut rq = DleafReq::write(start as Key, count);
        let mut cursor = btree::btree_probe(self, &root, &DLEAF_OPS, start as Key)?;
        let res = btree::btree_write(self, &mut root, &DLEAF_OPS, &mut cursor, |fs, bottom, limit, leafbuf| {
            let data = fs.pool.data(leafbuf);
            let step = {
                let mut leaf = data.borrow_mut();
                dleaf::leaf_write(fs, bottom, limit, &mut leaf, &mut rq)?
            };
            Ok(step)
        });
        cursor.release(self);
        res?;
        self.icache.get_mut(id).btree = root;

        assert_eq!(rq.seg_idx, rq.segs.len());
        Ok(rq.segs)
    }

    /// Backend write-out of one contiguous dirty range of a file map:
    /// translate through the extent tree in write mode, then one
    /// gather transfer per physical segment.
    pub(crate) fn filemap_write_out(&mut self, bufvec: &mut Bufvec) -> Result<()> {
        let index = bufvec.contig_index(&self.pool);
        let count = bufvec.contig_count() as u64;
        let inum = self.pool.map(bufvec.map).inum.expect("file map without inode");
        let id = self.icache.find_id(inum).expect("flushing unhashed inode");

        let segs = self.map_region_write(id, index, count)?;
        assert_eq!(seg_total_count(&segs), count, "allocation shortfall");

        let mut index = index;
        for seg in segs {
            assert!(!seg.is_hole());
            trace!(target: "filemap",
                   "extent 0x{:x}/{} => 0x{:x}", index, seg.count, seg.block);
            bufvec.write_contig(
                &mut self.pool,
                &self.dev,
                seg.block,
                seg.count as usize,
                EndIo::File,
            )?;
            index += seg.count as BlockNum;
        }
        Ok(())
    }

    /// Buffer for one file block, read through the extent map when not
    /// cached; a hole zero-fills without device I/O.
    pub(crate) fn blockread_file(&mut self, id: InodeId, index: BlockNum) -> Result<BufId> {
        let map = self.icache.get(id).map;
        let buf = self.pool.get(map, index)?;
        if self.pool.state(buf) != BufState::Empty {
            return Ok(buf);
        }

        let segs = match self.map_region_read(id, index, 1, 1) {
            Ok(segs) => segs,
            Err(err) => {
                self.pool.release(buf);
                return Err(err);
            }
        };
        let seg = segs[0];

        let mut bufvec = Bufvec::single(&self.pool, map, buf);
        if seg.is_hole() {
            bufvec.complete_without_io(&mut self.pool, 1, EndIo::Hole);
        } else if let Err(err) =
            bufvec.read_contig(&mut self.pool, &self.dev, seg.block, 1, EndIo::Read)
        {
            self.pool.release(buf);
            return Err(err);
        }
        Ok(buf)
    }

    /// Write `data` at byte offset `pos`, extending the file as
    /// needed. Full-block writes skip the read-modify-write.
    pub fn write(&mut self, id: InodeId, pos: u64, data: &[u8]) -> Result<usize> {
        let delta = self.change_begin();
        let res = self.write_inner(id, pos, data);
        self.change_end(delta);
        res
    }

    fn write_inner(&mut self, id: InodeId, mut pos: u64, data: &[u8]) -> Result<usize> {
        let bsize = self.pool.block_size() as u64;
        let bmask = bsize - 1;
        let bbits = bsize.trailing_zeros();
        let delta = self.cur_delta();

        trace!(target: "filemap",
               "write {} bytes at {}, isize 0x{:x}",
               data.len(), pos, self.icache.get(id).attrs.size);
        if pos + data.len() as u64 > self.super_block.s_maxbytes {
            return err_at!(TooBig, msg: "write past maxbytes at {}", pos);
        }

        {
            let inode = self.icache.get_mut(id);
            inode.iattrdirty(delta);
            let now = gettime();
            inode.attrs.mtime = now;
            inode.attrs.ctime = now;
        }
        let map = self.icache.get(id).map;

        let mut tail = data.len();
        while tail > 0 {
            let from = (pos & bmask) as usize;
            let some = tail.min(bsize as usize - from);
            let full = some == bsize as usize;

            let buffer = if full {
                self.pool.get(map, (pos >> bbits) as BlockNum)?
            } else {
                self.blockread_file(id, (pos >> bbits) as BlockNum)?
            };
            let clone = match self.pool.fork_for_delta(buffer, delta) {
                Ok(clone) => clone,
                Err(err) => {
                    self.pool.release(buffer);
                    return Err(err);
                }
            };
            {
                let done = data.len() - tail;
                let block = self.pool.data(clone);
                block.borrow_mut()[from..from + some].copy_from_slice(&data[done..done + some]);
            }
            self.pool.release(clone);

            tail -= some;
            pos += some as u64;
        }

        let inode = self.icache.get_mut(id);
        if inode.attrs.size < pos {
            inode.attrs.size = pos;
        }
        self.mark_inode_dirty(id);
        Ok(data.len())
    }

    /// Read up to `data.len()` bytes at `pos`; short reads happen only
    /// at end of file.
    pub fn read(&mut self, id: InodeId, mut pos: u64, data: &mut [u8]) -> Result<usize> {
        let bsize = self.pool.block_size() as u64;
        let bmask = bsize - 1;
        let bbits = bsize.trailing_zeros();

        let i_size = self.icache.get(id).attrs.size;
        trace!(target: "filemap",
               "read {} bytes at {}, isize 0x{:x}", data.len(), pos, i_size);
        if pos >= i_size {
            return Ok(0);
        }
        let len = data.len().min((i_size - pos) as usize);

        let mut tail = len;
        while tail > 0 {
            let from = (pos & bmask) as usize;
            let some = tail.min(bsize as usize - from);

            let buffer = self.blockread_file(id, (pos >> bbits) as BlockNum)?;
            {
                let done = len - tail;
                let block = self.pool.data(buffer);
                data[done..done + some].copy_from_slice(&block.borrow()[from..from + some]);
            }
            self.pool.release(buffer);

            tail -= some;
            pos += some as u64;
        }
        Ok(len)
    }

    /// Truncate to `size` bytes. The cache is invalidated now; the
    /// extent tree chop happens when this delta flushes.
    pub fn truncate(&mut self, id: InodeId, size: u64) -> Result<()> {
        let delta = self.change_begin();
        let res = self.truncate_inner(id, size);
        self.change_end(delta);
        res
    }

    fn truncate_inner(&mut self, id: InodeId, size: u64) -> Result<()> {
        let bsize = self.pool.block_size() as u64;
        let bmask = bsize - 1;
        let bbits = bsize.trailing_zeros();
        let delta = self.cur_delta();
        let slot = crate::types::delta_slot(delta);

        self.icache.get_mut(id).iattrdirty(delta);

        // If partial, the tail of the last block must be zeroed now.
        if size & bmask != 0 {
            let buffer = self.blockread_file(id, (size >> bbits) as BlockNum)?;
            let clone = match self.pool.fork_for_delta(buffer, delta) {
                Ok(clone) => clone,
                Err(err) => {
                    self.pool.release(buffer);
                    return Err(err);
                }
            };
            {
                let block = self.pool.data(clone);
                block.borrow_mut()[(size & bmask) as usize..].fill(0);
            }
            self.pool.release(clone);
        }

        let map = self.icache.get(id).map;
        self.pool.truncate_range(map, size, u64::MAX >> 1, delta);

        {
            let inode = self.icache.get_mut(id);
            let pending = inode.ddc[slot].truncate;
            inode.ddc[slot].truncate = Some(pending.map_or(size, |old| old.min(size)));
            inode.attrs.size = size;
            let now = gettime();
            inode.attrs.mtime = now;
            inode.attrs.ctime = now;
        }
        self.mark_inode_dirty(id);
        Ok(())
    }

    /// Backend: flush one dirty inode's data and attributes for
    /// `delta`. An inode in `FREEING` is reaped instead: extents,
    /// itable record and cache slot all go away.
    pub(crate) fn flush_inode(&mut self, id: InodeId, delta: u64) -> Result<()> {
        assert!(self.under_backend());
        let slot = crate::types::delta_slot(delta);
        let inum = self.icache.get(id).inum;
        let map = self.icache.get(id).map;

        let mut idata = self.icache.get_mut(id).iattr_read_and_clear(delta);
        let truncate = self.icache.get_mut(id).ddc[slot].truncate.take();
        let dead = self.icache.get(id).state.contains(InodeState::FREEING);

        // Shrink the extent tree before writing new data, so stale
        // extents free exactly once.
        if let Some(size) = truncate {
            let bsize = self.pool.block_size() as u64;
            let start = (size + bsize - 1) / bsize;
            let mut root = self.icache.get(id).btree;
            if root.has_root() {
                btree::btree_chop(self, &mut root, &DLEAF_OPS, start, KEY_LIMIT)?;
                self.icache.get_mut(id).btree = root;
            }
        }

        if dead {
            let mut root = self.icache.get(id).btree;
            if root.has_root() {
                btree::free_empty_btree(self, &DLEAF_OPS, root)?;
                root = crate::types::Root::default();
                self.icache.get_mut(id).btree = root;
            }
            // Drop the itable record.
            let mut iroot = self.super_block.iroot;
            btree::btree_chop(self, &mut iroot, &ileaf::ITABLE_OPS, inum, 1)?;
            self.super_block.iroot = iroot;

            // Any dirty stragglers were invalidated, never written.
            let stale = std::mem::take(&mut self.pool.map_mut(map).dirty[slot]);
            for buf in stale {
                self.pool.end_io_file(buf, false);
            }
            self.pool.invalidate(map);
            self.icache.unhash(id);
            self.pool.free_map(map);
            self.icache.remove_slot(id);
            return Ok(());
        }

        self.flush_list(map, &idata, delta)?;

        // The data flush may have moved or grown the tree; the itable
        // record carries the final root.
        let root = self.icache.get(id).btree;
        if root.has_root() {
            idata.present |= crate::iattr::Present::DATA_BTREE;
            idata.btree = root;
        } else {
            idata.present -= crate::iattr::Present::DATA_BTREE;
            idata.btree = crate::types::Root::default();
        }
        self.itable_write(inum, &idata)?;

        // The frontend may have re-dirtied the inode for the delta now
        // open; it stays pinned for that flush.
        let still_dirty = self.dirty_inodes[1 - slot].contains(&inum);
        if !still_dirty {
            {
                let inode = self.icache.get_mut(id);
                inode.state -=
                    InodeState::DIRTY | InodeState::DIRTY_SYNC | InodeState::DIRTY_DATASYNC;
            }
            if self.icache.get(id).count() == 0 {
                // Unreferenced once unpinned; out of the cache it goes.
                self.icache.unhash(id);
                self.pool.invalidate(map);
                self.pool.free_map(map);
                self.icache.remove_slot(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "filemap_test.rs"]
mod filemap_test;
