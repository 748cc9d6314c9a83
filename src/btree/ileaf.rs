//! Inode btree leaf operations.
//!
//! A leaf has a small header followed by a table of attribute
//! records. A vector of offsets within the block grows down from the
//! top of the leaf towards the top of the attribute table, indexed by
//! the difference between inum and `ibase`, the base inum of the
//! block. Slot `i` covers payload bytes `[dict[i-1], dict[i])`; equal
//! offsets encode an absent inode.
//!
//! The same format serves the primary inode table and the overflow
//! attribute table; only the magic differs.

use crate::btree::LeafOps;
use crate::fs::Fs;
use crate::types::{Inum, MAGIC_ILEAF, MAGIC_OLEAF};
use crate::{Key, Result};

/// Header bytes before the attribute table.
const ILEAF_HDR: usize = 16;

fn icount(leaf: &[u8]) -> usize {
    u16::from_be_bytes([leaf[2], leaf[3]]) as usize
}

fn set_icount(leaf: &mut [u8], count: usize) {
    leaf[2..4].copy_from_slice(&(count as u16).to_be_bytes());
}

fn ibase(leaf: &[u8]) -> Inum {
    u64::from_be_bytes(leaf[8..16].try_into().unwrap())
}

fn set_ibase(leaf: &mut [u8], base: Inum) {
    leaf[8..16].copy_from_slice(&base.to_be_bytes());
}

/// End offset of slot `at - 1` (`at` is 1-based into the dictionary).
fn atdict_raw(leaf: &[u8], at: usize) -> usize {
    assert!(at >= 1);
    let off = leaf.len() - 2 * at;
    u16::from_be_bytes([leaf[off], leaf[off + 1]]) as usize
}

/// Start offset of slot `at`.
fn atdict(leaf: &[u8], at: usize) -> usize {
    if at == 0 {
        0
    } else {
        atdict_raw(leaf, at)
    }
}

fn set_dict(leaf: &mut [u8], at: usize, val: usize) {
    assert!(at >= 1);
    let off = leaf.len() - 2 * at;
    leaf[off..off + 2].copy_from_slice(&(val as u16).to_be_bytes());
}

fn add_dict(leaf: &mut [u8], at: usize, diff: isize) {
    let val = (atdict_raw(leaf, at) as isize + diff) as usize;
    set_dict(leaf, at, val);
}

/// Payload plus dictionary bytes in use.
fn ileaf_need(leaf: &[u8]) -> usize {
    let count = icount(leaf);
    atdict(leaf, count) + count * 2
}

fn ileaf_free(leaf: &[u8]) -> usize {
    leaf.len() - ileaf_need(leaf) - ILEAF_HDR
}

/// Drop trailing empty slots from the dictionary.
fn trim(leaf: &mut [u8]) {
    let mut count = icount(leaf);
    while count > 1 && atdict_raw(leaf, count) == atdict_raw(leaf, count - 1) {
        count -= 1;
    }
    if count == 1 && atdict_raw(leaf, 1) == 0 {
        count = 0;
    }
    set_icount(leaf, count);
}

/// Attribute bytes for `inum`, or None when the slot is empty or out
/// of the dictionary.
pub fn lookup(leaf: &[u8], inum: Inum) -> Option<(usize, usize)> {
    assert!(inum >= ibase(leaf));
    let at = (inum - ibase(leaf)) as usize;
    if at >= icount(leaf) {
        return None;
    }
    let offset = atdict(leaf, at);
    let size = atdict_raw(leaf, at + 1) - offset;
    if size == 0 {
        return None;
    }
    Some((ILEAF_HDR + offset, size))
}

/// Dictionary offsets are monotonic.
fn in_order(leaf: &[u8]) -> bool {
    let mut offset = 0;
    for at in 1..=icount(leaf) {
        let limit = atdict_raw(leaf, at);
        if limit < offset {
            return false;
        }
        offset = limit;
    }
    true
}

/// Grow or shrink the slot for `inum` to `newsize` bytes, shifting the
/// payload tail and patching later dictionary entries. None when the
/// free space cannot take it.
pub fn resize(leaf: &mut [u8], inum: Inum, newsize: usize) -> Option<usize> {
    assert!(inum >= ibase(leaf));
    let count = icount(leaf);
    let at = (inum - ibase(leaf)) as usize;

    let (extend_dict, offset, size) = if at + 1 > count {
        // Check size roughly to avoid overflow.
        if (at + 1) * 2 >= leaf.len() {
            return None;
        }
        ((at + 1 - count) * 2, atdict(leaf, count), 0)
    } else {
        let offset = atdict(leaf, at);
        (0, offset, atdict_raw(leaf, at + 1) - offset)
    };

    if (ileaf_free(leaf) as isize) < newsize as isize - size as isize + extend_dict as isize {
        return None;
    }

    if extend_dict > 0 {
        let limit = atdict(leaf, count);
        let mut count = count;
        while count < at + 1 {
            count += 1;
            set_dict(leaf, count, limit);
        }
        set_icount(leaf, count);
    }

    if newsize != size {
        // Expand or shrink the attribute space.
        let count = icount(leaf);
        let limit = atdict_raw(leaf, count);
        assert!(limit >= offset + size);
        let src = ILEAF_HDR + offset + size;
        let dst = ILEAF_HDR + offset + newsize;
        let tail = limit - offset - size;
        leaf.copy_within(src..src + tail, dst);

        let diff = newsize as isize - size as isize;
        for later in at + 1..=count {
            add_dict(leaf, later, diff);
        }
    }

    Some(ILEAF_HDR + offset)
}

/// Split position preference: the write's inum (rounded to a slot
/// group) when it lies beyond the dictionary, else the median slot.
pub fn split_hint(leaf: &[u8], key: Key, epl: usize) -> Key {
    let base = ibase(leaf);
    let count = icount(leaf) as u64;
    if key >= base + count {
        let round = key & !(epl as u64 - 1);
        // Rounding must not fall back into this leaf's base.
        return if round > base { round } else { key };
    }
    base + count / 2
}

/// Attribute-pack dialect, parameterized by magic so the primary
/// itable and the overflow atable share the engine.
pub struct Ileaf {
    magic: u16,
    /// Slots per leaf, kept a power of two so split points round
    /// cleanly.
    epl_shift: u32,
}

/// Dialect of the primary inode table.
pub const ITABLE_OPS: Ileaf = Ileaf { magic: MAGIC_ILEAF, epl_shift: 6 };
/// Dialect of the overflow attribute table.
pub const ATABLE_OPS: Ileaf = Ileaf { magic: MAGIC_OLEAF, epl_shift: 6 };

impl LeafOps for Ileaf {
    fn magic(&self) -> u16 {
        self.magic
    }

    fn entries_per_leaf(&self, blocksize: usize) -> usize {
        blocksize >> self.epl_shift
    }

    fn leaf_init(&self, _blocksize: usize, leaf: &mut [u8]) {
        leaf.fill(0);
        leaf[0..2].copy_from_slice(&self.magic.to_be_bytes());
    }

    fn leaf_sniff(&self, _blocksize: usize, leaf: &[u8]) -> bool {
        leaf[0..2] == self.magic.to_be_bytes() && in_order(leaf)
    }

    fn leaf_can_free(&self, _blocksize: usize, leaf: &[u8]) -> bool {
        icount(leaf) == 0
    }

    fn leaf_dump(&self, _blocksize: usize, leaf: &[u8]) {
        let base = ibase(leaf);
        log::debug!(target: "ileaf",
                    "ileaf 0x{:x}/{} ({} bytes free)", base, icount(leaf), ileaf_free(leaf));
        let mut offset = 0;
        for at in 0..icount(leaf) {
            let limit = atdict_raw(leaf, at + 1);
            if limit > offset {
                log::debug!(target: "ileaf",
                            "  0x{:x}: {} bytes at {}", base + at as u64, limit - offset, offset);
            }
            offset = limit;
        }
    }

    /// Split at the hint's inum, bumping by one when it equals the
    /// base so both halves get distinct bases.
    fn leaf_split(&self, blocksize: usize, hint: Key, from: &mut [u8], into: &mut [u8]) -> Key {
        let epl = self.entries_per_leaf(blocksize);
        let base = ibase(from);
        let old_count = icount(from);

        let hint = if hint == base { hint + 1 } else { hint };
        let at = ((hint - base) as usize).min(old_count);

        let split = atdict(from, at);
        let free = atdict(from, old_count);
        assert!(free >= split);

        // Payload for slots at.. moves to the new leaf, rebased.
        into[ILEAF_HDR..ILEAF_HDR + free - split]
            .copy_from_slice(&from[ILEAF_HDR + split..ILEAF_HDR + free]);
        let into_count = old_count - at;
        set_icount(into, into_count);
        for i in 1..=into_count {
            let val = atdict_raw(from, at + i) - split;
            set_dict(into, i, val);
        }

        // Round down to a multiple of the leaf capacity above ibase.
        let round = hint & !(epl as u64 - 1);
        let into_base = if round > base + old_count as u64 { round } else { hint };
        set_ibase(into, into_base);

        set_icount(from, at);
        let dict_start = from.len() - 2 * at;
        from[ILEAF_HDR + split..dict_start].fill(0);
        trim(from);

        ibase(into)
    }

    /// Extend the left dictionary across the inum gap, then append the
    /// right leaf's payload and rebased dictionary.
    fn leaf_merge(&self, _blocksize: usize, into: &mut [u8], from: &mut [u8]) -> bool {
        let from_count = icount(from);
        if from_count == 0 {
            return true;
        }

        let from_base = ibase(from);
        let count = icount(into);
        assert!(from_base > ibase(into));
        let hole = (from_base - ibase(into)) as usize - count;

        let need_size = hole * 2 + ileaf_need(from);
        if ileaf_free(into) < need_size {
            return false;
        }

        // Fill the dictionary hole up to from's base.
        let limit = atdict(into, count);
        let mut count = count;
        for _ in 0..hole {
            count += 1;
            set_dict(into, count, limit);
        }

        // Copy payload from "from".
        let from_limit = atdict(from, from_count);
        into[ILEAF_HDR + limit..ILEAF_HDR + limit + from_limit]
            .copy_from_slice(&from[ILEAF_HDR..ILEAF_HDR + from_limit]);

        // Append from's dictionary, shifted by the left payload size.
        for i in 1..=from_count {
            let val = atdict_raw(from, i) + limit;
            set_dict(into, count + i, val);
        }
        set_icount(into, count + from_count);

        true
    }

    /// Remove attribute records for inums `[start, start+len)`.
    fn leaf_chop(&self, _fs: &mut Fs, start: Key, len: u64, leaf: &mut [u8]) -> Result<bool> {
        let base = ibase(leaf);
        let count = icount(leaf);
        let at = (start - base) as usize;

        if at + 1 > count {
            return Ok(false);
        }
        let len = (len as usize).min(count - at);

        let startp = atdict(leaf, at);
        let endp = atdict(leaf, at + len);
        if startp == endp {
            return Ok(false);
        }

        // Remove the covered payload bytes.
        let tailp = atdict(leaf, count);
        leaf.copy_within(ILEAF_HDR + endp..ILEAF_HDR + tailp, ILEAF_HDR + startp);

        // Patch the dictionary.
        let size = (endp - startp) as isize;
        for i in at + 1..=count {
            let val = atdict_raw(leaf, i);
            let val = if val < endp { startp } else { (val as isize - size) as usize };
            set_dict(leaf, i, val);
        }

        trim(leaf);
        Ok(true)
    }
}

/// Store pre-encoded attribute bytes for `inum`; None means the leaf
/// must split (hint computed via [split_hint]).
pub fn leaf_write(leaf: &mut [u8], inum: Inum, attrs: &[u8]) -> Option<()> {
    assert!(!attrs.is_empty());
    let offset = resize(leaf, inum, attrs.len())?;
    leaf[offset..offset + attrs.len()].copy_from_slice(attrs);
    Some(())
}

/// Attribute bytes for `inum`.
pub fn leaf_read<'a>(leaf: &'a [u8], inum: Inum) -> Option<&'a [u8]> {
    let (offset, size) = lookup(leaf, inum)?;
    Some(&leaf[offset..offset + size])
}

/// Traverse callback helper: first inum in `[key, key+len)` whose slot
/// is empty, scanning this leaf.
pub fn find_free(leaf: &[u8], key_limit: Key, key: Key, len: u64) -> Option<Inum> {
    let base = ibase(leaf);
    let count = icount(leaf);
    let mut at = (key - base) as usize;
    let key_limit = key_limit.min(key + len);

    if at < count {
        let mut offset = atdict(leaf, at);
        while at < count {
            let limit = atdict_raw(leaf, at + 1);
            if offset == limit {
                break;
            }
            offset = limit;
            at += 1;
        }
    }

    let inum = base + at as u64;
    if inum < key_limit {
        Some(inum)
    } else {
        None
    }
}

/// Traverse callback helper: invoke `cb(inum, attrs)` for each
/// nonempty slot in `[key, key+len)` within this leaf.
pub fn enumerate<F>(leaf: &[u8], key: Key, len: u64, cb: &mut F) -> Result<()>
where
    F: FnMut(Inum, &[u8]) -> Result<()>,
{
    let base = ibase(leaf);
    let mut at = (key - base) as usize;
    let count = (icount(leaf) as u64).min(key + len - base) as usize;

    if at < count {
        let mut offset = atdict(leaf, at);
        while at < count {
            let limit = atdict_raw(leaf, at + 1);
            if limit > offset {
                let attrs = &leaf[ILEAF_HDR + offset..ILEAF_HDR + limit];
                cb(base + at as u64, attrs)?;
            }
            offset = limit;
            at += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "ileaf_test.rs"]
mod ileaf_test;
