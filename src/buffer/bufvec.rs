//! Buffer vector I/O: gather logically contiguous dirty buffers of
//! one map into single scatter-gather device transfers, and drive the
//! end-of-I/O state transitions.

use log::trace;

use std::io::{IoSlice, IoSliceMut};

use crate::buffer::{BufId, BufferPool, MapId, MapIo};
use crate::fs::Fs;
use crate::iattr::IattrData;
use crate::types::delta_slot;
use crate::{dev::Dev, BlockNum, Result};

/// Cap on buffers in one gathered transfer.
const MAX_BUFVEC_COUNT: usize = u32::MAX as usize;

/// End-of-I/O flavor, selecting the state transition applied to each
/// buffer when its transfer completes.
#[derive(Clone, Copy, Debug)]
pub enum EndIo {
    /// Volmap/logmap writeout: clean on success, empty on error.
    Vol,
    /// File data writeout: like `Vol`, plus forked buffers drop the
    /// backend's pin.
    File,
    /// Read completion: clean, ready for the frontend.
    Read,
    /// Hole on read: zero-fill, no device transfer.
    Hole,
    /// Buffer not mapped this time: back to empty.
    Cancel,
}

/// One flush pass over a dirty list: the remaining candidates, sorted
/// by logical index, and the contiguous run currently being built.
pub struct Bufvec {
    pub map: MapId,
    buffers: Vec<BufId>,
    pos: usize,
    contig: Vec<BufId>,
    /// `i_size` from the stable attribute snapshot; buffers at or past
    /// its block ceiling are cancelled, not written.
    pub limit_block: BlockNum,
}

impl Bufvec {
    /// Seed with a map's dirty list and the owning inode's stable
    /// attribute snapshot. Buffers are sorted by index ascending.
    pub fn new(pool: &BufferPool, map: MapId, mut buffers: Vec<BufId>, i_size: u64) -> Bufvec {
        let bits = pool.block_size().trailing_zeros();
        let bmask = (pool.block_size() - 1) as u64;
        buffers.sort_by_key(|&id| pool.index(id));
        Bufvec {
            map,
            buffers,
            pos: 0,
            contig: vec![],
            limit_block: ((i_size + bmask) >> bits) as BlockNum,
        }
    }

    /// Single-buffer vector, for the read path.
    pub fn single(pool: &BufferPool, map: MapId, id: BufId) -> Bufvec {
        let mut bufvec = Bufvec::new(pool, map, vec![], u64::MAX >> 1);
        bufvec.contig.push(id);
        bufvec
    }

    pub fn contig_count(&self) -> usize {
        self.contig.len()
    }

    /// The `n`th buffer of the contiguous range.
    pub fn contig_nth(&self, n: usize) -> BufId {
        self.contig[n]
    }

    /// Logical index of the head of the contiguous range.
    pub fn contig_index(&self, pool: &BufferPool) -> BlockNum {
        pool.index(self.contig[0])
    }

    fn contig_last_index(&self, pool: &BufferPool) -> BlockNum {
        pool.index(*self.contig.last().unwrap())
    }

    /// Any candidate left, in the run or on the list?
    pub fn has_next(&self) -> bool {
        !self.contig.is_empty() || self.pos < self.buffers.len()
    }

    /// Append `id` to the contiguous range if it extends it by exactly
    /// one block and the transfer cap allows.
    pub fn contig_add(&mut self, pool: &BufferPool, id: BufId) -> bool {
        if !self.contig.is_empty() {
            if self.contig.len() == MAX_BUFVEC_COUNT {
                return false;
            }
            if self.contig_last_index(pool) != pool.index(id) - 1 {
                return false;
            }
        }
        self.contig.push(id);
        true
    }

    /// Cancel the dirty state of every remaining candidate; they sit
    /// wholly outside `i_size` and must not reach the device.
    fn cancel_outside(&mut self, pool: &mut BufferPool, endio: EndIo) {
        while self.pos < self.buffers.len() {
            let id = self.buffers[self.pos];
            self.pos += 1;
            trace!(target: "bufvec", "cancel dirty: block {:x}", pool.index(id));
            end_io(pool, id, endio, false);
        }
    }

    /// Collect a logically contiguous dirty run from the candidates.
    /// Returns true when there is a range to submit.
    pub fn contig_collect(&mut self, pool: &mut BufferPool, endio: EndIo) -> bool {
        // If there is an in-progress contiguous range, leave as is.
        if !self.contig.is_empty() {
            return true;
        }
        assert!(self.pos < self.buffers.len());

        if pool.index(self.buffers[self.pos]) >= self.limit_block {
            self.cancel_outside(pool, endio);
            return false;
        }

        loop {
            let id = self.buffers[self.pos];
            self.pos += 1;
            let added = self.contig_add(pool, id);
            if !added {
                self.pos -= 1;
                break;
            }
            if self.pos == self.buffers.len() {
                break;
            }
            let next = self.buffers[self.pos];
            if pool.index(next) >= self.limit_block {
                self.cancel_outside(pool, endio);
                break;
            }
            if pool.index(next) != pool.index(id) + 1 {
                break;
            }
        }

        !self.contig.is_empty()
    }

    /// Write the first `count` buffers of the contiguous range as one
    /// gather transfer starting at `physical`.
    pub fn write_contig(
        &mut self,
        pool: &mut BufferPool,
        dev: &Dev,
        physical: BlockNum,
        count: usize,
        endio: EndIo,
    ) -> Result<()> {
        assert!(count > 0 && count <= self.contig.len());
        let ids: Vec<BufId> = self.contig.drain(..count).collect();

        let res = {
            let datas: Vec<_> = ids.iter().map(|&id| pool.data(id)).collect();
            let borrows: Vec<_> = datas.iter().map(|d| d.borrow()).collect();
            let iov: Vec<IoSlice> = borrows.iter().map(|b| IoSlice::new(&b[..])).collect();
            dev.write_vec(dev.block_offset(physical), &iov)
        };

        for id in ids {
            end_io(pool, id, endio, res.is_err());
        }
        res
    }

    /// Read into the first `count` buffers of the contiguous range
    /// from `physical`.
    pub fn read_contig(
        &mut self,
        pool: &mut BufferPool,
        dev: &Dev,
        physical: BlockNum,
        count: usize,
        endio: EndIo,
    ) -> Result<()> {
        assert!(count > 0 && count <= self.contig.len());
        let ids: Vec<BufId> = self.contig.drain(..count).collect();

        let res = {
            let datas: Vec<_> = ids.iter().map(|&id| pool.data(id)).collect();
            let mut borrows: Vec<_> = datas.iter().map(|d| d.borrow_mut()).collect();
            let mut iov: Vec<IoSliceMut> =
                borrows.iter_mut().map(|b| IoSliceMut::new(&mut b[..])).collect();
            dev.read_vec(dev.block_offset(physical), &mut iov)
        };

        for id in ids {
            end_io(pool, id, endio, res.is_err());
        }
        res
    }

    /// Complete `count` buffers without touching the device, changing
    /// only their state (hole fills, read cancels).
    pub fn complete_without_io(&mut self, pool: &mut BufferPool, count: usize, endio: EndIo) {
        assert!(count > 0 && count <= self.contig.len());
        for id in self.contig.drain(..count) {
            end_io(pool, id, endio, false);
        }
    }
}

fn end_io(pool: &mut BufferPool, id: BufId, endio: EndIo, err: bool) {
    match endio {
        EndIo::Vol => pool.end_io_vol(id, err),
        EndIo::File => pool.end_io_file(id, err),
        EndIo::Read => pool.end_io_vol(id, err),
        EndIo::Hole => {
            assert!(!err);
            let data = pool.data(id);
            data.borrow_mut().fill(0);
            pool.set_clean(id);
        }
        EndIo::Cancel => {
            assert!(!err);
            if pool.state(id) != crate::buffer::BufState::Empty {
                pool.set_empty(id);
            }
        }
    }
}

impl Fs {
    /// Flush one per-delta dirty list of `map`: sort by index, carve
    /// into contiguous runs, translate each run to physical segments
    /// per the map's I/O flavor and write them out.
    pub(crate) fn flush_list(&mut self, map: MapId, idata: &IattrData, delta: u64) -> Result<()> {
        let list = std::mem::take(&mut self.pool.map_mut(map).dirty[delta_slot(delta)]);
        if list.is_empty() {
            return Ok(());
        }

        let io = self.pool.map(map).io;
        let endio = match io {
            MapIo::File => EndIo::File,
            _ => EndIo::Vol,
        };

        let mut bufvec = Bufvec::new(&self.pool, map, list, idata.size);
        while bufvec.has_next() {
            if !bufvec.contig_collect(&mut self.pool, endio) {
                continue;
            }
            match io {
                MapIo::Vol => {
                    let physical = bufvec.contig_index(&self.pool);
                    let count = bufvec.contig_count();
                    bufvec.write_contig(&mut self.pool, &self.dev, physical, count, EndIo::Vol)?;
                }
                MapIo::File => self.filemap_write_out(&mut bufvec)?,
                MapIo::Log => self.logmap_write_out(&mut bufvec)?,
                MapIo::Err => unreachable!("flushing an errio map"),
            }
        }
        Ok(())
    }

    /// Flush the volmap's unify list (bnodes), written only when a
    /// unify cycle closes.
    pub(crate) fn flush_unify_list(&mut self) -> Result<()> {
        let map = self.volmap;
        let list = std::mem::take(&mut self.pool.map_mut(map).unify_dirty);
        if list.is_empty() {
            return Ok(());
        }

        let mut bufvec = Bufvec::new(&self.pool, map, list, u64::MAX >> 1);
        while bufvec.has_next() {
            if !bufvec.contig_collect(&mut self.pool, EndIo::Vol) {
                continue;
            }
            let physical = bufvec.contig_index(&self.pool);
            let count = bufvec.contig_count();
            bufvec.write_contig(&mut self.pool, &self.dev, physical, count, EndIo::Vol)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "bufvec_test.rs"]
mod bufvec_test;
