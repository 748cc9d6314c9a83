//! File index btree leaf operations.
//!
//! The extent table is sorted by logical address. Explicit extent
//! counts are not present: the count of an extent is the difference
//! between two successive logical addresses. A hole between allocated
//! regions is an extent with physical address zero, which no real
//! extent can use because the filesystem header occupies that block.
//! The final entry is always a sentinel with physical zero bounding
//! the leaf on the right.
//!
//! Version tags ride in the top 16 bits of both words; until extent
//! versioning arrives they are always zero.

use crate::btree::LeafOps;
use crate::fs::Fs;
use crate::types::{seg_total_count, BlockSeg, SegState, ADDR_BITS, ADDR_MASK, MAGIC_DLEAF2};
use crate::wal::defer_bfree;
use crate::{BlockNum, Key, Result};

/// Header bytes before the extent table.
const DLEAF_HDR: usize = 8;
/// Bytes per `diskextent2` pair.
const DLEAF_ENTRY: usize = 16;

/// A half-open key range being written or read.
#[derive(Clone, Copy, Debug)]
pub struct KeyRange {
    pub start: Key,
    pub len: u64,
}

/// Request state threaded through extent writes and reads.
pub struct DleafReq {
    pub key: KeyRange,
    /// Physical segments; on write these are produced by the
    /// allocator, on read they are filled from the leaf.
    pub segs: Vec<BlockSeg>,
    /// First segment not yet consumed.
    pub seg_idx: usize,
    /// Read-side cap on returned segments.
    pub seg_max: usize,
    /// Write-side: segments have been materialized by the allocator.
    pub allocated: bool,
}

impl DleafReq {
    pub fn write(start: Key, count: u64) -> DleafReq {
        DleafReq {
            key: KeyRange { start, len: count },
            segs: vec![],
            seg_idx: 0,
            seg_max: usize::MAX,
            allocated: false,
        }
    }

    pub fn read(start: Key, len: u64, seg_max: usize) -> DleafReq {
        DleafReq {
            key: KeyRange { start, len },
            segs: vec![],
            seg_idx: 0,
            seg_max,
            allocated: false,
        }
    }
}

/// Decoded `diskextent2`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extent {
    pub version: u32,
    pub logical: Key,
    pub physical: BlockNum,
}

fn dcount(leaf: &[u8]) -> usize {
    u16::from_be_bytes([leaf[2], leaf[3]]) as usize
}

pub(crate) fn set_dcount(leaf: &mut [u8], count: usize) {
    leaf[2..4].copy_from_slice(&(count as u16).to_be_bytes());
}

fn get_extent(leaf: &[u8], at: usize) -> Extent {
    let off = DLEAF_HDR + at * DLEAF_ENTRY;
    let hi = u64::from_be_bytes(leaf[off..off + 8].try_into().unwrap());
    let lo = u64::from_be_bytes(leaf[off + 8..off + 16].try_into().unwrap());
    Extent {
        version: (((hi >> ADDR_BITS) as u32) << 16) | (lo >> ADDR_BITS) as u32,
        logical: hi & ADDR_MASK,
        physical: (lo & ADDR_MASK) as BlockNum,
    }
}

fn get_logical(leaf: &[u8], at: usize) -> Key {
    let off = DLEAF_HDR + at * DLEAF_ENTRY;
    u64::from_be_bytes(leaf[off..off + 8].try_into().unwrap()) & ADDR_MASK
}

pub(crate) fn put_extent(leaf: &mut [u8], at: usize, version: u32, logical: Key, physical: BlockNum) {
    let off = DLEAF_HDR + at * DLEAF_ENTRY;
    let verhi = (version >> 16) as u64;
    let verlo = (version & 0xffff) as u64;
    let hi = (verhi << ADDR_BITS) | logical;
    let lo = (verlo << ADDR_BITS) | physical as u64;
    leaf[off..off + 8].copy_from_slice(&hi.to_be_bytes());
    leaf[off + 8..off + 16].copy_from_slice(&lo.to_be_bytes());
}

/// Position of the extent containing `index`: the rightmost entry
/// whose logical address is at or below it, or `count` when the index
/// lies past the sentinel.
fn lookup_index(leaf: &[u8], index: Key) -> usize {
    let count = dcount(leaf);
    let mut at = 0;
    while at < count {
        let logical = get_logical(leaf, at);
        if index == logical {
            return at;
        }
        if index < logical {
            // The bottom key always has an extent on the leaf.
            assert!(at > 0);
            return at - 1;
        }
        at += 1;
    }
    if count > 0 {
        // Not found; the last entry must be the sentinel.
        debug_assert_eq!(get_extent(leaf, count - 1).physical, 0);
    }
    count
}

/// Expand (positive `diff`) or shrink the table from entry `at`.
fn resize(leaf: &mut [u8], at: usize, diff: isize) {
    if diff == 0 {
        return;
    }
    let count = dcount(leaf);
    let start = DLEAF_HDR + at * DLEAF_ENTRY;
    let end = DLEAF_HDR + count * DLEAF_ENTRY;
    if diff > 0 {
        leaf.copy_within(start..end, start + diff as usize * DLEAF_ENTRY);
    } else {
        let skip = (-diff) as usize * DLEAF_ENTRY;
        leaf.copy_within(start + skip..end, start);
    }
    set_dcount(leaf, (count as isize + diff) as usize);
}

/// Initialize the sentinel from the bottom key of an empty leaf.
fn init_sentinel(leaf: &mut [u8], key_bottom: Key, version: u32) {
    if dcount(leaf) == 0 {
        set_dcount(leaf, 1);
        put_extent(leaf, 0, version, key_bottom, 0);
    }
}

/// Split key of the center entry, the hint when only a prefix fits.
fn split_at_center(leaf: &[u8]) -> Key {
    get_extent(leaf, dcount(leaf) / 2).logical
}

/// The file-extent dialect.
pub struct Dleaf;

/// Shared instance wired into file btrees.
pub const DLEAF_OPS: Dleaf = Dleaf;

impl LeafOps for Dleaf {
    fn magic(&self) -> u16 {
        MAGIC_DLEAF2
    }

    fn entries_per_leaf(&self, blocksize: usize) -> usize {
        (blocksize - DLEAF_HDR) / DLEAF_ENTRY
    }

    fn leaf_init(&self, _blocksize: usize, leaf: &mut [u8]) {
        leaf.fill(0);
        leaf[0..2].copy_from_slice(&MAGIC_DLEAF2.to_be_bytes());
    }

    fn leaf_sniff(&self, _blocksize: usize, leaf: &[u8]) -> bool {
        if leaf[0..2] != MAGIC_DLEAF2.to_be_bytes() {
            return false;
        }
        let count = dcount(leaf);
        // The last entry must be the sentinel.
        count == 0 || get_extent(leaf, count - 1).physical == 0
    }

    fn leaf_can_free(&self, _blocksize: usize, leaf: &[u8]) -> bool {
        dcount(leaf) <= 1
    }

    fn leaf_dump(&self, _blocksize: usize, leaf: &[u8]) {
        let count = dcount(leaf);
        log::debug!(target: "dleaf", "dleaf count {}", count);
        for at in 0..count {
            let ex = get_extent(leaf, at);
            log::debug!(target: "dleaf",
                        "  0x{:x} => 0x{:x} v{}", ex.logical, ex.physical, ex.version);
        }
    }

    /// Split honoring the hint key, putting a fresh sentinel on the
    /// left half. Returns the pivot.
    fn leaf_split(&self, _blocksize: usize, hint: Key, from: &mut [u8], into: &mut [u8]) -> Key {
        let count = dcount(from);
        // Two extents plus sentinel, at least.
        assert!(count >= 3);

        let at = lookup_index(from, hint);
        if at == count {
            // Use the sentinel of the previous leaf.
            let ex = get_extent(from, count - 1);
            assert_eq!(ex.physical, 0);
            return ex.logical;
        }
        let split_at = if at == 0 { 1 } else { at };

        set_dcount(from, split_at + 1); // +1 for sentinel
        set_dcount(into, count - split_at);

        let src = DLEAF_HDR + split_at * DLEAF_ENTRY;
        let len = (count - split_at) * DLEAF_ENTRY;
        into[DLEAF_HDR..DLEAF_HDR + len].copy_from_slice(&from[src..src + len]);

        let ex = get_extent(from, split_at);
        put_extent(from, split_at, ex.version, ex.logical, 0);

        ex.logical
    }

    /// Fold `from` into `into`, eliding one redundant boundary entry
    /// when the right leaf starts with a hole or repeats the left
    /// sentinel's logical address.
    fn leaf_merge(&self, blocksize: usize, into: &mut [u8], from: &mut [u8]) -> bool {
        let from_count = dcount(from);
        // Empty or sentinel-only right side merges away entirely.
        if from_count <= 1 {
            return true;
        }

        let from_bytes = from_count * DLEAF_ENTRY;
        let into_count = dcount(into);
        if into_count == 0 {
            set_dcount(into, from_count);
            set_dcount(from, 0);
            into[DLEAF_HDR..DLEAF_HDR + from_bytes]
                .copy_from_slice(&from[DLEAF_HDR..DLEAF_HDR + from_bytes]);
            return true;
        }

        let into_ex = get_extent(into, into_count - 1);
        let from_ex = get_extent(from, 0);
        assert!(into_ex.logical <= from_ex.logical);
        assert_eq!(into_ex.physical, 0);

        let can_merge = from_ex.physical == 0 || into_ex.logical == from_ex.logical;
        let folded = can_merge as usize;
        if into_count + from_count - folded > self.entries_per_leaf(blocksize) {
            return false;
        }

        if from_ex.physical == 0 {
            // Right side starts with a hole; keep the left sentinel.
            let bytes = from_bytes - folded * DLEAF_ENTRY;
            let dst = DLEAF_HDR + into_count * DLEAF_ENTRY;
            into[dst..dst + bytes]
                .copy_from_slice(&from[DLEAF_HDR + DLEAF_ENTRY..DLEAF_HDR + DLEAF_ENTRY + bytes]);
        } else if into_ex.logical == from_ex.logical {
            // Same logical; the right side's entry replaces the
            // sentinel.
            let dst = DLEAF_HDR + (into_count - 1) * DLEAF_ENTRY;
            into[dst..dst + from_bytes].copy_from_slice(&from[DLEAF_HDR..DLEAF_HDR + from_bytes]);
        } else {
            let dst = DLEAF_HDR + into_count * DLEAF_ENTRY;
            into[dst..dst + from_bytes].copy_from_slice(&from[DLEAF_HDR..DLEAF_HDR + from_bytes]);
        }
        set_dcount(into, into_count + from_count - folded);
        set_dcount(from, 0);

        true
    }

    /// Truncate from `start`, freeing covered extents to the deferred
    /// queue. Range chop is not used by the file paths; `len` must
    /// reach the end of the keyspace.
    fn leaf_chop(&self, fs: &mut Fs, start: Key, len: u64, leaf: &mut [u8]) -> Result<bool> {
        assert!(start + len >= crate::types::KEY_LIMIT);
        let version = fs.super_block.version;

        if dcount(leaf) == 0 {
            return Ok(false);
        }

        let dex_limit = dcount(leaf);
        let mut at = lookup_index(leaf, start);
        if at + 1 >= dex_limit {
            return Ok(false);
        }

        let mut need_sentinel = true;
        let ex = get_extent(leaf, at);
        let mut start = start;
        if start == ex.logical {
            if at > 0 && get_extent(leaf, at - 1).physical == 0 {
                // The previous entry is a hole; reuse it as sentinel.
                at -= 1;
            } else {
                put_extent(leaf, at, version, start, 0);
            }
            need_sentinel = false;
        } else if ex.physical == 0 {
            // Chop point inside a hole; it becomes the sentinel.
            start = ex.logical;
            need_sentinel = false;
        }
        set_dcount(leaf, at + 1 + need_sentinel as usize);

        let mut block = ex.physical + (start as BlockNum - ex.logical as BlockNum);
        at += 1;

        while at < dex_limit {
            let next = get_extent(leaf, at);
            let count = next.logical - start;
            if block != 0 && count != 0 {
                defer_bfree(&mut fs.defree, block, count as u32);
                fs.log_bfree(block, count as u32)?;
            }
            if need_sentinel {
                put_extent(leaf, at, version, start, 0);
                need_sentinel = false;
            }
            start = next.logical;
            block = next.physical;
            at += 1;
        }

        Ok(true)
    }
}

/// Materialize physical extents covering the whole remaining write.
/// The leaf-capacity logic reruns afterwards against the real
/// segmentation; extents past this leaf's span carry into later
/// leaves.
fn seg_alloc(fs: &mut Fs, rq: &mut DleafReq) -> Result<()> {
    let mut got: Vec<BlockSeg> = vec![];
    let mut remaining = rq.key.len;

    while remaining > 0 {
        let seg = fs.alloc.balloc_partial(remaining.min(u32::MAX as u64) as u32)?;
        fs.log_balloc(seg.block, seg.count)?;
        remaining -= seg.count as u64;
        got.push(seg);
    }

    rq.segs.truncate(rq.seg_idx);
    rq.segs.extend(got);
    rq.allocated = true;
    Ok(())
}

/// Write extents into the leaf for `rq.key`, clamped to the leaf's
/// `[key_bottom, key_limit)` span. Returns the standard write step:
/// split request with hint, or progress with remaining length.
pub fn leaf_write(
    fs: &mut Fs,
    key_bottom: Key,
    key_limit: Key,
    leaf: &mut [u8],
    rq: &mut DleafReq,
) -> Result<crate::btree::WriteStep> {
    let version = fs.super_block.version;
    let epl = DLEAF_OPS.entries_per_leaf(fs.pool.block_size());

    let step = |need_split: bool, start: Key, remaining: u64, hint: Key| crate::btree::WriteStep {
        need_split,
        start,
        remaining,
        hint,
    };

    loop {
        // Clamp this step to the leaf's span; the engine advances the
        // cursor for the remainder.
        let span = (key_limit - rq.key.start).min(rq.key.len);
        if span == 0 {
            return Ok(step(false, rq.key.start, rq.key.len, 0));
        }

        if !rq.allocated {
            // Start from a single desired segment covering the range.
            rq.segs.truncate(rq.seg_idx);
            rq.segs.push(BlockSeg::new(0, span.min(u32::MAX as u64) as u32));
        }
        debug_assert!(
            !rq.allocated || rq.key.len == seg_total_count(&rq.segs[rq.seg_idx..]),
        );

        // Overwrite existing extents with the segments: locate the
        // entries to replace, resize the table, then fill.
        init_sentinel(leaf, key_bottom, version);

        let in_leaf: u64 = seg_total_count(&rq.segs[rq.seg_idx..]).min(span);
        let limit = rq.key.start + in_leaf;
        let write_segs = {
            // Segments inside the clamped span; one straddling the
            // span boundary is cut in two so the tail carries into
            // the next leaf.
            let mut n = 0;
            let mut covered: u64 = 0;
            while rq.seg_idx + n < rq.segs.len() && covered < in_leaf {
                let seg = rq.segs[rq.seg_idx + n];
                if covered + seg.count as u64 > in_leaf {
                    let first = (in_leaf - covered) as u32;
                    rq.segs[rq.seg_idx + n].count = first;
                    let rest = BlockSeg {
                        block: match seg.state {
                            SegState::Hole => 0,
                            SegState::Data => seg.block + first as BlockNum,
                        },
                        count: seg.count - first,
                        state: seg.state,
                    };
                    rq.segs.insert(rq.seg_idx + n + 1, rest);
                    covered = in_leaf;
                } else {
                    covered += seg.count as u64;
                }
                n += 1;
            }
            n.max(1)
        };

        let count = dcount(leaf);

        // Find the start of the overwritten range.
        let mut dex_start = lookup_index(leaf, rq.key.start);
        if dex_start < count {
            let ex = get_extent(leaf, dex_start);
            // Overwrite only if logical matches; the bottom key is
            // always present.
            assert!(ex.logical <= rq.key.start);
            if ex.logical < rq.key.start {
                dex_start += 1;
            }
        }
        let head = dex_start;

        // Find the end of the overwritten range.
        let dex_end = lookup_index(leaf, limit);
        let (between, end_physical, tail) = if dex_end < count {
            let between = if dex_end < dex_start {
                0 // splitting a single extent
            } else {
                dex_end - dex_start + 1
            };
            let ex = get_extent(leaf, dex_end);
            let end_physical = if ex.physical != 0 {
                ex.physical + (limit - ex.logical) as BlockNum
            } else {
                0
            };
            (between, end_physical, count - dex_end - 1)
        } else {
            (dex_end - dex_start, 0, 0)
        };

        let need = head + write_segs + 1 + tail;
        let mut write_now = write_segs;
        let mut temp_hole = false;
        if need > epl {
            let rest = need - epl;
            if rest >= write_segs {
                // Nothing fits; pick a hint and split first.
                let hint = if dex_start + 1 < count.saturating_sub(1) {
                    get_extent(leaf, dex_start + 1).logical
                } else {
                    rq.key.start
                };
                return Ok(step(true, rq.key.start, rq.key.len, hint));
            }
            // A prefix fits; the rest is temporarily encoded as a
            // hole and overwritten after the split.
            write_now = write_segs - rest - 1;
            temp_hole = true;
        }

        if !rq.allocated {
            // Allocate after the leaf redirect, so data blocks land
            // near the leaf's fresh physical address. Then recheck
            // against the real segmentation.
            seg_alloc(fs, rq)?;
            continue;
        }

        // Data runs being replaced go back to the allocator once this
        // delta commits.
        {
            let count = dcount(leaf);
            for at in 0..count.saturating_sub(1) {
                let ex = get_extent(leaf, at);
                if ex.physical == 0 {
                    continue;
                }
                let next = get_logical(leaf, at + 1);
                let lo = ex.logical.max(rq.key.start);
                let hi = next.min(limit);
                if lo < hi {
                    let block = ex.physical + (lo - ex.logical) as BlockNum;
                    defer_bfree(&mut fs.defree, block, (hi - lo) as u32);
                    fs.log_bfree(block, (hi - lo) as u32)?;
                }
            }
        }

        // Expand or shrink space for the segments.
        let diff = (write_now + temp_hole as usize + 1) as isize - between as isize;
        resize(leaf, dex_start, diff);

        // Fill extents.
        let mut at = dex_start;
        for _ in 0..write_now {
            let seg = rq.segs[rq.seg_idx];
            put_extent(leaf, at, version, rq.key.start, seg.block);
            rq.key.start += seg.count as u64;
            rq.key.len -= seg.count as u64;
            rq.seg_idx += 1;
            at += 1;
        }
        let mut hint = 0;
        if temp_hole {
            put_extent(leaf, at, version, rq.key.start, 0);
            at += 1;
            hint = split_at_center(leaf);
        }
        // Closing sentinel.
        put_extent(leaf, at, version, limit, end_physical);

        return Ok(step(temp_hole, rq.key.start, rq.key.len, hint));
    }
}

/// Read extents covering `rq.key` from the leaf into `rq.segs`; the
/// uncovered tail up to `key_limit` becomes one hole segment.
pub fn leaf_read(key_bottom: Key, key_limit: Key, leaf: &[u8], rq: &mut DleafReq) {
    let _ = key_bottom;

    if rq.seg_idx >= rq.seg_max {
        return;
    }

    let dex_limit = dcount(leaf);
    let mut at = lookup_index(leaf, rq.key.start);

    if at + 1 < dex_limit {
        let mut ex = get_extent(leaf, at);
        let mut physical = ex.physical;
        if physical != 0 {
            physical += (rq.key.start - ex.logical) as BlockNum;
        }
        at += 1;
        loop {
            ex = get_extent(leaf, at);
            let count = rq.key.len.min(ex.logical - rq.key.start);
            rq.segs.push(if physical != 0 {
                BlockSeg::new(physical, count as u32)
            } else {
                BlockSeg::hole(count as u32)
            });
            physical = ex.physical;
            rq.key.start += count;
            rq.key.len -= count;
            rq.seg_idx += 1;
            at += 1;
            if rq.key.len == 0 || rq.seg_idx >= rq.seg_max || at >= dex_limit {
                break;
            }
        }
    } else if at < dex_limit {
        debug_assert_eq!(get_extent(leaf, dex_limit - 1).physical, 0);
    }

    // Between the sentinel and key_limit is a hole.
    if rq.key.start < key_limit && rq.key.len > 0 && rq.seg_idx < rq.seg_max {
        let count = rq.key.len.min(key_limit - rq.key.start);
        rq.segs.push(BlockSeg::hole(count as u32));
        rq.key.start += count;
        rq.key.len -= count;
        rq.seg_idx += 1;
    }
}

/// Cheap summary used by tests: (logical, physical, implied count)
/// triples including the sentinel.
#[cfg(test)]
pub fn extents(leaf: &[u8]) -> Vec<Extent> {
    (0..dcount(leaf)).map(|at| get_extent(leaf, at)).collect()
}

#[cfg(test)]
pub(crate) use {put_extent as raw_put, set_dcount as raw_set_count};

#[cfg(test)]
#[path = "dleaf_test.rs"]
mod dleaf_test;
