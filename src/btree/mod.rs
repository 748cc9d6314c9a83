//! Generic btree operations.
//!
//! A btree is a variable-depth, copy-on-write index over the volmap.
//! Internal nodes (bnodes) carry `(key, block)` separators; leaves are
//! opaque to the engine, interpreted through a [LeafOps] vtable so the
//! same machinery serves the file-extent dialect ([dleaf]) and the
//! inode-attribute dialect ([ileaf]).
//!
//! Note that the first key of an index node is never accessed. This
//! is because for a btree there is always one more key than nodes in
//! each index node: keys lie between node pointers.
//!
//! Every mutation is preceded by a redirect pass that gives each
//! not-yet-dirty block on the cursor path a fresh physical address for
//! this delta (leaves) or unify cycle (bnodes), logging the move so
//! replay can rebuild the bnode cache.

pub mod dleaf;
pub mod ileaf;

use log::trace;

use crate::buffer::BufId;
use crate::fs::Fs;
use crate::types::{Root, KEY_LIMIT, MAGIC_BNODE};
use crate::{BlockNum, Key, Result};

/// Bytes of bnode header before the entry array.
pub const BNODE_HDR: usize = 8;
/// Bytes per index entry.
pub const BNODE_ENTRY: usize = 16;

/// Index entries that fit one bnode block.
pub fn entries_per_node(blocksize: usize) -> usize {
    (blocksize - BNODE_HDR) / BNODE_ENTRY
}

// Bnode block layout: magic u16, unused u16, count u32, then `count`
// entries of {key u64, block u64}, all big-endian.

pub fn bnode_init(data: &mut [u8]) {
    data.fill(0);
    data[0..2].copy_from_slice(&MAGIC_BNODE.to_be_bytes());
}

pub fn bnode_sniff(data: &[u8]) -> bool {
    data[0..2] == MAGIC_BNODE.to_be_bytes()
}

pub fn bcount(data: &[u8]) -> usize {
    u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize
}

fn bnode_set_count(data: &mut [u8], count: usize) {
    data[4..8].copy_from_slice(&(count as u32).to_be_bytes());
}

pub fn bnode_key(data: &[u8], at: usize) -> Key {
    let off = BNODE_HDR + at * BNODE_ENTRY;
    u64::from_be_bytes(data[off..off + 8].try_into().unwrap())
}

pub fn bnode_block(data: &[u8], at: usize) -> BlockNum {
    let off = BNODE_HDR + at * BNODE_ENTRY + 8;
    u64::from_be_bytes(data[off..off + 8].try_into().unwrap()) as BlockNum
}

fn bnode_set_key(data: &mut [u8], at: usize, key: Key) {
    let off = BNODE_HDR + at * BNODE_ENTRY;
    data[off..off + 8].copy_from_slice(&key.to_be_bytes());
}

fn bnode_set_block(data: &mut [u8], at: usize, block: BlockNum) {
    let off = BNODE_HDR + at * BNODE_ENTRY + 8;
    data[off..off + 8].copy_from_slice(&(block as u64).to_be_bytes());
}

/// Index of the entry containing `key`: the rightmost entry whose key
/// compares at or below it, never comparing entry zero.
pub fn bnode_lookup(data: &[u8], key: Key) -> usize {
    let count = bcount(data);
    assert!(count > 0);
    let mut at = 1;
    while at < count {
        if bnode_key(data, at) > key {
            break;
        }
        at += 1;
    }
    at - 1
}

/// Insert `(childkey, child)` at position `at`, shifting the tail up.
fn bnode_add_index(data: &mut [u8], at: usize, child: BlockNum, childkey: Key) {
    let count = bcount(data);
    let start = BNODE_HDR + at * BNODE_ENTRY;
    let end = BNODE_HDR + count * BNODE_ENTRY;
    data.copy_within(start..end, start + BNODE_ENTRY);
    bnode_set_key(data, at, childkey);
    bnode_set_block(data, at, child);
    bnode_set_count(data, count + 1);
}

/// Remove `remove` entries starting at position `at`.
fn bnode_remove_index(data: &mut [u8], at: usize, remove: usize) {
    let count = bcount(data);
    let start = BNODE_HDR + at * BNODE_ENTRY;
    let from = start + remove * BNODE_ENTRY;
    let end = BNODE_HDR + count * BNODE_ENTRY;
    data.copy_within(from..end, start);
    bnode_set_count(data, count - remove);
}

/// Move entries at `pos..` of `src` to the start of `dst`.
fn bnode_split_at(src: &mut [u8], pos: usize, dst: &mut [u8]) {
    let count = bcount(src);
    let moved = count - pos;
    let from = BNODE_HDR + pos * BNODE_ENTRY;
    let till = BNODE_HDR + count * BNODE_ENTRY;
    dst[BNODE_HDR..BNODE_HDR + moved * BNODE_ENTRY].copy_from_slice(&src[from..till]);
    bnode_set_count(dst, moved);
    bnode_set_count(src, pos);
}

/// Append `from`'s entries to `into` when they fit.
fn bnode_merge_nodes(into: &mut [u8], from: &[u8], entries_per_node: usize) -> bool {
    let into_count = bcount(into);
    let from_count = bcount(from);

    if into_count + from_count > entries_per_node {
        return false;
    }

    let start = BNODE_HDR + into_count * BNODE_ENTRY;
    into[start..start + from_count * BNODE_ENTRY]
        .copy_from_slice(&from[BNODE_HDR..BNODE_HDR + from_count * BNODE_ENTRY]);
    bnode_set_count(into, into_count + from_count);
    true
}

/// Root must be zero-initialized (fresh bnode).
fn bnode_init_root(data: &mut [u8], count: usize, left: BlockNum, right: BlockNum, rkey: Key) {
    bnode_set_count(data, count);
    bnode_set_block(data, 0, left);
    bnode_set_block(data, 1, right);
    bnode_set_key(data, 1, rkey);
}

/// Leaf dialect vtable. A closed set of implementations: [dleaf::Dleaf]
/// for file extents, [ileaf::Ileaf] for attribute packs.
pub trait LeafOps {
    fn magic(&self) -> u16;
    fn entries_per_leaf(&self, blocksize: usize) -> usize;
    fn leaf_init(&self, blocksize: usize, leaf: &mut [u8]);
    fn leaf_sniff(&self, blocksize: usize, leaf: &[u8]) -> bool;
    fn leaf_can_free(&self, blocksize: usize, leaf: &[u8]) -> bool;
    /// Trace-dump for diagnostics; not load bearing.
    fn leaf_dump(&self, blocksize: usize, leaf: &[u8]);
    /// Split `from` at (or near) `hint`, filling the fresh `into`;
    /// returns the pivot key.
    fn leaf_split(&self, blocksize: usize, hint: Key, from: &mut [u8], into: &mut [u8]) -> Key;
    /// Fold `from` into `into` if the result fits one leaf.
    fn leaf_merge(&self, blocksize: usize, into: &mut [u8], from: &mut [u8]) -> bool;
    /// Delete the key range from the leaf. Ok(true) when the leaf was
    /// modified.
    fn leaf_chop(&self, fs: &mut Fs, start: Key, len: u64, leaf: &mut [u8]) -> Result<bool>;
}

/// Outcome of one leaf-level write attempt.
#[derive(Clone, Copy, Debug)]
pub struct WriteStep {
    /// Leaf lacked space; split around the hint and retry.
    pub need_split: bool,
    /// Current write position, used to decide which half the cursor
    /// follows after a split.
    pub start: Key,
    /// Keys still to write after this step.
    pub remaining: u64,
    /// Split hint, meaningful when `need_split`.
    pub hint: Key,
}

/// A cursor is a path of `(buffer, next)` pairs from the root to a
/// leaf. `next` holds the index of the next entry that a left-to-right
/// traversal would load, not the current one; for the leaf slot it is
/// unused.
pub struct Cursor {
    path: Vec<PathLevel>,
    depth: usize,
}

#[derive(Clone, Copy)]
struct PathLevel {
    buf: BufId,
    next: usize,
}

impl Cursor {
    fn new(depth: usize) -> Cursor {
        Cursor {
            path: Vec::with_capacity(depth + 2),
            depth,
        }
    }

    fn level(&self) -> usize {
        self.path.len() - 1
    }

    fn at_leaf(&self) -> bool {
        self.level() == self.depth
    }

    fn push(&mut self, buf: BufId, next: usize) {
        self.path.push(PathLevel { buf, next });
    }

    fn pop(&mut self) -> BufId {
        self.path.pop().unwrap().buf
    }

    fn pop_release(&mut self, fs: &mut Fs) {
        let buf = self.pop();
        fs.pool.release(buf);
    }

    /// Buffer of the leaf under the cursor.
    pub fn leafbuf(&self) -> BufId {
        assert!(self.at_leaf());
        self.path[self.depth].buf
    }

    /// Release every buffer on the path.
    pub fn release(&mut self, fs: &mut Fs) {
        while !self.path.is_empty() {
            self.pop_release(fs);
        }
    }

    /// No next entry at `level`?
    fn level_finished(&self, fs: &Fs, level: usize) -> bool {
        let data = fs.pool.data(self.path[level].buf);
        let data = data.borrow();
        self.path[level].next == bcount(&data)
    }

    /// Key of the current leaf.
    pub fn this_key(&self, fs: &Fs) -> Key {
        assert!(self.at_leaf());
        let at = &self.path[self.depth - 1];
        let data = fs.pool.data(at.buf);
        let data = data.borrow();
        bnode_key(&data, at.next - 1)
    }

    fn level_this_key(&self, fs: &Fs) -> Key {
        let at = &self.path[self.level()];
        let data = fs.pool.data(at.buf);
        let data = data.borrow();
        bnode_key(&data, at.next - 1)
    }

    /// Climb up the path until a level has not been read to the end;
    /// its next key separates this subtree from the one to the right.
    pub fn next_key(&self, fs: &Fs) -> Key {
        assert!(self.at_leaf());
        self.next_key_from(fs, self.depth)
    }

    fn level_next_key(&self, fs: &Fs) -> Key {
        self.next_key_from(fs, self.level() + 1)
    }

    fn next_key_from(&self, fs: &Fs, from: usize) -> Key {
        let mut level = from;
        while level > 0 {
            level -= 1;
            if !self.level_finished(fs, level) {
                let at = &self.path[level];
                let data = fs.pool.data(at.buf);
                let data = data.borrow();
                return bnode_key(&data, at.next);
            }
        }
        KEY_LIMIT
    }

    #[cfg(debug_assertions)]
    fn check(&self, fs: &Fs, root: &Root) {
        if self.path.is_empty() {
            return;
        }
        let mut key = 0;
        let mut block = root.block;
        for level in 0..self.path.len() {
            let at = &self.path[level];
            assert_eq!(fs.pool.index(at.buf), block);
            if level == self.path.len() - 1 {
                break;
            }
            let data = fs.pool.data(at.buf);
            let data = data.borrow();
            let entry = at.next - 1;
            assert!(entry < bcount(&data));
            if entry == 0 {
                assert_eq!(bnode_key(&data, entry), key);
            } else {
                assert!(bnode_key(&data, entry) > key);
            }
            block = bnode_block(&data, entry);
            key = bnode_key(&data, entry);
        }
    }

    #[cfg(not(debug_assertions))]
    fn check(&self, _fs: &Fs, _root: &Root) {}
}

impl Fs {
    /// Volmap buffer for `block`, no I/O.
    pub(crate) fn vol_getblk(&mut self, block: BlockNum) -> Result<BufId> {
        self.pool.get(self.volmap, block)
    }

    /// Volmap buffer for `block`, read from disk if not cached.
    pub(crate) fn vol_bread(&mut self, block: BlockNum) -> Result<BufId> {
        let id = self.pool.get(self.volmap, block)?;
        if self.pool.state(id) == crate::buffer::BufState::Empty {
            let data = self.pool.data(id);
            let res = self.dev.read(self.dev.block_offset(block), &mut data.borrow_mut());
            if let Err(err) = res {
                self.pool.release(id);
                return Err(err);
            }
            self.pool.set_clean(id);
        }
        Ok(id)
    }
}

/// Allocate one block and take its (stale, uninitialized) volmap
/// buffer.
fn new_block(fs: &mut Fs) -> Result<BufId> {
    let block = fs.alloc.balloc(1)?;
    fs.vol_getblk(block)
}

/// Fresh leaf: allocated, zeroed, initialized, dirty this delta.
pub fn new_leaf(fs: &mut Fs, ops: &dyn LeafOps) -> Result<BufId> {
    let blocksize = fs.pool.block_size();
    let id = new_block(fs)?;
    {
        let data = fs.pool.data(id);
        let mut data = data.borrow_mut();
        data.fill(0);
        ops.leaf_init(blocksize, &mut data);
    }
    let delta = fs.cur_delta();
    fs.pool.mark_dirty(id, delta);
    Ok(id)
}

/// Fresh bnode: allocated, initialized, dirty for this unify cycle.
fn new_node(fs: &mut Fs) -> Result<BufId> {
    let id = new_block(fs)?;
    {
        let data = fs.pool.data(id);
        bnode_init(&mut data.borrow_mut());
    }
    let unify = fs.unify;
    fs.pool.mark_unify_dirty(id, unify);
    Ok(id)
}

/// Load the leaf containing `key`, building the cursor path.
pub fn btree_probe(fs: &mut Fs, root: &Root, ops: &dyn LeafOps, key: Key) -> Result<Cursor> {
    assert!(root.has_root());
    let mut cursor = Cursor::new(root.depth as usize);

    let buf = match fs.vol_bread(root.block) {
        Ok(buf) => buf,
        Err(err) => return Err(err),
    };
    {
        let data = fs.pool.data(buf);
        if !bnode_sniff(&data.borrow()) {
            fs.pool.release(buf);
            return err_at!(Corrupt, msg: "bad bnode magic at {:x}", root.block);
        }
    }
    cursor.push(buf, 0);

    loop {
        // Look up the entry containing key and set it as the next
        // down path.
        {
            let at = cursor.path.last_mut().unwrap();
            let data = fs.pool.data(at.buf);
            at.next = bnode_lookup(&data.borrow(), key);
        }
        match cursor_advance_down(fs, root, ops, &mut cursor) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                cursor.release(fs);
                return Err(err);
            }
        }
    }

    Ok(cursor)
}

/// Descend from the current level's next entry. Ok(true) pushed a
/// bnode, Ok(false) pushed the leaf.
fn cursor_advance_down(
    fs: &mut Fs,
    root: &Root,
    ops: &dyn LeafOps,
    cursor: &mut Cursor,
) -> Result<bool> {
    let level = cursor.level();
    assert!(level < cursor.depth);

    let child = {
        let at = &cursor.path[level];
        let data = fs.pool.data(at.buf);
        let data = data.borrow();
        bnode_block(&data, at.next)
    };
    let buf = fs.vol_bread(child)?;
    cursor.path[level].next += 1;

    let blocksize = fs.pool.block_size();
    let data = fs.pool.data(buf);
    if level < cursor.depth - 1 {
        if !bnode_sniff(&data.borrow()) {
            fs.pool.release(buf);
            return err_at!(Corrupt, msg: "bad bnode magic at {:x}", child);
        }
        cursor.push(buf, 0);
        cursor.check(fs, root);
        Ok(true)
    } else {
        if !ops.leaf_sniff(blocksize, &data.borrow()) {
            fs.pool.release(buf);
            return err_at!(Corrupt, msg: "bad leaf magic at {:x}", child);
        }
        cursor.push(buf, 0);
        cursor.check(fs, root);
        Ok(false)
    }
}

/// Advance to the next leaf in key order. Ok(false) when the whole
/// tree is traversed (cursor empty).
pub fn cursor_advance(
    fs: &mut Fs,
    root: &Root,
    ops: &dyn LeafOps,
    cursor: &mut Cursor,
) -> Result<bool> {
    loop {
        cursor.pop_release(fs);
        if cursor.path.is_empty() {
            return Ok(false);
        }
        if !cursor.level_finished(fs, cursor.level()) {
            break;
        }
    }
    loop {
        match cursor_advance_down(fs, root, ops, cursor)? {
            true => continue,
            false => return Ok(true),
        }
    }
}

/// Walk leaves covering `[key, key+len)`, invoking `func` per leaf
/// with that leaf's bottom and limit keys. A nonzero return from
/// `func` stops the traversal and is passed through.
pub fn btree_traverse<F>(
    fs: &mut Fs,
    root: &Root,
    ops: &dyn LeafOps,
    cursor: &mut Cursor,
    mut key: Key,
    mut len: u64,
    mut func: F,
) -> Result<i32>
where
    F: FnMut(&mut Fs, Key, Key, BufId, Key, u64) -> Result<i32>,
{
    loop {
        let bottom = cursor.this_key(fs);
        let limit = cursor.next_key(fs);
        let leafbuf = cursor.leafbuf();
        {
            let blocksize = fs.pool.block_size();
            let data = fs.pool.data(leafbuf);
            assert!(ops.leaf_sniff(blocksize, &data.borrow()));
        }

        if key < bottom {
            let skip = len.min(bottom - key);
            len -= skip;
            if len == 0 {
                break;
            }
            key = bottom;
        }

        let ret = func(fs, bottom, limit, leafbuf, key, len)?;
        if ret != 0 {
            return Ok(ret);
        }

        // If next key is out of range, done.
        if key.saturating_add(len) <= limit {
            break;
        }

        if !cursor_advance(fs, root, ops, cursor)? {
            break;
        }
    }
    Ok(0)
}

/// Recursively redirect non-dirty buffers on the path, root to leaf,
/// so modifications land on blocks fresh for this delta. Redirect
/// order matters: root first, so path block allocation stays in
/// forward order.
pub fn cursor_redirect(
    fs: &mut Fs,
    root: &mut Root,
    ops: &dyn LeafOps,
    cursor: &mut Cursor,
) -> Result<bool> {
    let _ = ops;
    let mut root_moved = false;

    for level in 0..=cursor.depth {
        let buf = cursor.path[level].buf;
        let is_leaf = level == cursor.depth;

        let redirect = if is_leaf {
            // Leaves lack a stored delta; any dirty leaf is writable.
            !fs.pool.state(buf).is_dirty()
        } else {
            !fs.pool.already_unify_dirty(buf, fs.unify)
        };
        if !redirect {
            continue;
        }

        let clone = new_block(fs)?;
        let oldblock = fs.pool.index(buf);
        let newblock = fs.pool.index(clone);
        trace!(target: "btree", "redirect {:x} to {:x}", oldblock, newblock);

        {
            let from = fs.pool.data(buf);
            let to = fs.pool.data(clone);
            to.borrow_mut().copy_from_slice(&from.borrow());
        }
        fs.pool.release(buf);
        cursor.path[level].buf = clone;

        if is_leaf {
            let delta = fs.cur_delta();
            fs.pool.mark_dirty(clone, delta);
            fs.log_leaf_redirect(oldblock, newblock)?;
            crate::wal::defer_bfree(&mut fs.defree, oldblock, 1);
        } else {
            let unify = fs.unify;
            fs.pool.mark_unify_dirty(clone, unify);
            fs.log_bnode_redirect(oldblock, newblock)?;
            crate::wal::defer_bfree(&mut fs.deunify, oldblock, 1);
        }

        trace!(target: "btree", "update parent");
        if level == 0 {
            // Update pointer in the btree root.
            assert_eq!(oldblock, root.block);
            root.block = newblock;
            root_moved = true;
            continue;
        }
        // Update the parent's index entry for the redirected block.
        let at = &cursor.path[level - 1];
        let (parent, key) = {
            let data = fs.pool.data(at.buf);
            let mut data = data.borrow_mut();
            bnode_set_block(&mut data, at.next - 1, newblock);
            (fs.pool.index(at.buf), bnode_key(&data, at.next - 1))
        };
        fs.log_bnode_update(parent, newblock, key)?;
    }

    cursor.check(fs, root);
    Ok(root_moved)
}

/// Insert a new leaf at the next cursor position. With `keep` the
/// cursor stays on the current leaf, otherwise it moves to the new
/// one. Splits parents as needed, growing tree depth when the root
/// splits.
fn insert_leaf(
    fs: &mut Fs,
    root: &mut Root,
    cursor: &mut Cursor,
    childkey: Key,
    leafbuf: BufId,
    keep: bool,
) -> Result<bool> {
    let epn = entries_per_node(fs.pool.block_size());
    let mut childblock = fs.pool.index(leafbuf);
    let mut childkey = childkey;
    let mut keep = keep;
    let mut root_moved = false;

    if keep {
        fs.pool.release(leafbuf);
    } else {
        cursor.pop_release(fs);
        cursor.push(leafbuf, 0);
    }

    let mut level = cursor.depth;
    while level > 0 {
        level -= 1;

        let parentbuf = cursor.path[level].buf;
        let full = {
            let data = fs.pool.data(parentbuf);
            let full = bcount(&data.borrow()) >= epn;
            full
        };

        if !full {
            // Insert and exit.
            let at_next = cursor.path[level].next;
            {
                let data = fs.pool.data(parentbuf);
                bnode_add_index(&mut data.borrow_mut(), at_next, childblock, childkey);
            }
            if !keep {
                cursor.path[level].next += 1;
            }
            fs.log_bnode_add(fs.pool.index(parentbuf), childblock, childkey)?;
            let unify = fs.unify;
            fs.pool.mark_unify_dirty(parentbuf, unify);
            cursor.check(fs, root);
            return Ok(root_moved);
        }

        // Split a full index node.
        let newbuf = new_node(fs)?;
        let (half, newkey) = {
            let src = fs.pool.data(parentbuf);
            let dst = fs.pool.data(newbuf);
            let mut src = src.borrow_mut();
            let half = bcount(&src) / 2;
            let newkey = bnode_key(&src, half);
            bnode_split_at(&mut src, half, &mut dst.borrow_mut());
            (half, newkey)
        };
        fs.log_bnode_split(fs.pool.index(parentbuf), half as u16, fs.pool.index(newbuf))?;

        // If the cursor landed in the new node, track it as parent.
        let at_next = cursor.path[level].next;
        let child_is_left = at_next <= half;
        let unify = fs.unify;
        let insertbuf = if !child_is_left {
            fs.pool.mark_unify_dirty(parentbuf, unify);
            fs.pool.hold(newbuf);
            fs.pool.release(parentbuf);
            cursor.path[level].buf = newbuf;
            cursor.path[level].next = at_next - half;
            newbuf
        } else {
            fs.pool.mark_unify_dirty(newbuf, unify);
            parentbuf
        };

        let insert_at = cursor.path[level].next;
        {
            let data = fs.pool.data(insertbuf);
            bnode_add_index(&mut data.borrow_mut(), insert_at, childblock, childkey);
        }
        if !keep {
            cursor.path[level].next += 1;
        }
        fs.log_bnode_add(fs.pool.index(insertbuf), childblock, childkey)?;
        fs.pool.mark_unify_dirty(insertbuf, unify);

        childkey = newkey;
        childblock = fs.pool.index(newbuf);
        fs.pool.release(newbuf);

        // Cursor stays with the child: on the left it keeps its
        // position, otherwise it was adjusted to the new bnode.
        keep = child_is_left;
    }

    // Make a new root bnode.
    trace!(target: "btree", "add tree level");
    let newbuf = new_node(fs)?;
    let newrootblock = fs.pool.index(newbuf);
    let oldrootblock = root.block;
    let left_node = fs.pool.index(cursor.path[0].buf) != childblock;
    {
        let data = fs.pool.data(newbuf);
        bnode_init_root(&mut data.borrow_mut(), 2, oldrootblock, childblock, childkey);
    }
    cursor.path.insert(
        0,
        PathLevel {
            buf: newbuf,
            next: if left_node { 1 } else { 2 },
        },
    );
    cursor.depth += 1;
    fs.log_bnode_root(newrootblock, 2, oldrootblock, childblock, childkey)?;

    root.block = newrootblock;
    root.depth += 1;

    let unify = fs.unify;
    fs.pool.mark_unify_dirty(newbuf, unify);
    cursor.check(fs, root);

    Ok(true)
}

/// Split the cursor's leaf around `hint` and hook the new leaf into
/// the parent. The cursor ends on the half containing `key`.
fn btree_leaf_split(
    fs: &mut Fs,
    root: &mut Root,
    ops: &dyn LeafOps,
    cursor: &mut Cursor,
    key: Key,
    hint: Key,
) -> Result<bool> {
    trace!(target: "btree", "split leaf");
    let blocksize = fs.pool.block_size();

    let newbuf = new_leaf(fs, ops)?;
    fs.log_balloc(fs.pool.index(newbuf), 1)?;

    let leafbuf = cursor.leafbuf();
    let newkey = {
        let from = fs.pool.data(leafbuf);
        let into = fs.pool.data(newbuf);
        let mut from_ref = from.borrow_mut();
        let mut into_ref = into.borrow_mut();
        ops.leaf_split(blocksize, hint, &mut from_ref, &mut into_ref)
    };
    assert!(cursor.this_key(fs) < newkey);
    assert!(newkey < cursor.next_key(fs));

    insert_leaf(fs, root, cursor, newkey, newbuf, key < newkey)
}

/// Write through the cursor's leaf, splitting as long as the dialect
/// asks for more room. `leaf_write` applies one step of the dialect's
/// write to the given leaf bytes and reports progress.
///
/// Returns true when the root moved (caller re-marks the owner
/// dirty).
pub fn btree_write<W>(
    fs: &mut Fs,
    root: &mut Root,
    ops: &dyn LeafOps,
    cursor: &mut Cursor,
    mut leaf_write: W,
) -> Result<bool>
where
    W: FnMut(&mut Fs, Key, Key, BufId) -> Result<WriteStep>,
{
    let mut root_moved = cursor_redirect(fs, root, ops, cursor)?;

    loop {
        let bottom = cursor.this_key(fs);
        let limit = cursor.next_key(fs);
        let leafbuf = cursor.leafbuf();
        {
            let blocksize = fs.pool.block_size();
            let data = fs.pool.data(leafbuf);
            assert!(ops.leaf_sniff(blocksize, &data.borrow()));
        }

        let step = leaf_write(fs, bottom, limit, leafbuf)?;
        assert!(bottom <= step.start);

        if !step.need_split {
            let delta = fs.cur_delta();
            fs.pool.mark_dirty(leafbuf, delta);
            if step.remaining == 0 {
                return Ok(root_moved);
            }
            // The range continues into the next leaf.
            if step.start >= cursor.next_key(fs) {
                let advanced = cursor_advance(fs, root, ops, cursor)?;
                assert!(advanced, "write ran past the last leaf");
                root_moved |= cursor_redirect(fs, root, ops, cursor)?;
            }
            continue;
        }

        root_moved |= btree_leaf_split(fs, root, ops, cursor, step.start, step.hint)?;
    }
}

/// Read through the cursor's leaf: single-leaf call, the caller
/// advances between leaves.
pub fn btree_read<R>(fs: &mut Fs, cursor: &Cursor, leaf_read: R) -> Result<()>
where
    R: FnOnce(&Fs, Key, Key, BufId) -> Result<()>,
{
    let bottom = cursor.this_key(fs);
    let limit = cursor.next_key(fs);
    leaf_read(fs, bottom, limit, cursor.leafbuf())
}

/// Tracking info for chopped bnode indexes, one per level.
#[derive(Clone, Copy, Default)]
struct ChoppedIndexInfo {
    start: Key,
    count: usize,
}

/// Update the separating key on the nearest right-turning ancestors
/// after the first entry of a node changed.
fn adjust_parent_sep(fs: &mut Fs, cursor: &mut Cursor, mut level: i32, newsep: Key) -> Result<()> {
    // Update the separating key until the nearest common parent.
    while level >= 0 {
        let at = &cursor.path[level as usize];
        let parent_entry = at.next - 1;
        let parentbuf = at.buf;

        let (oldkey, at_start) = {
            let data = fs.pool.data(parentbuf);
            let mut data = data.borrow_mut();
            let oldkey = bnode_key(&data, parent_entry);
            assert!(0 < oldkey);
            assert!(oldkey < newsep);
            bnode_set_key(&mut data, parent_entry, newsep);
            (oldkey, parent_entry == 0)
        };
        fs.log_bnode_adjust(fs.pool.index(parentbuf), oldkey, newsep)?;
        let unify = fs.unify;
        fs.pool.mark_unify_dirty(parentbuf, unify);

        if !at_start {
            break;
        }
        level -= 1;
    }
    Ok(())
}

/// Remove the index entry the cursor just consumed at its current
/// (bnode) level, propagating separator updates.
fn remove_index(fs: &mut Fs, cursor: &mut Cursor, cii: &mut [ChoppedIndexInfo]) -> Result<()> {
    let level = cursor.level();
    let at_next = cursor.path[level].next;
    let buf = cursor.path[level].buf;

    let (removed_key, now_first, next_key) = {
        let data = fs.pool.data(buf);
        let mut data = data.borrow_mut();
        let removed_key = bnode_key(&data, at_next - 1);
        bnode_remove_index(&mut data, at_next - 1, 1);
        let now_first = at_next - 1 == 0;
        let next_key = if at_next - 1 < bcount(&data) {
            bnode_key(&data, at_next - 1)
        } else {
            0
        };
        (removed_key, now_first, next_key)
    };
    cursor.path[level].next -= 1;

    // Collect chopped indexes in this node for logging later.
    let ciil = &mut cii[level];
    if ciil.count == 0 {
        ciil.start = removed_key;
    }
    ciil.count += 1;

    let unify = fs.unify;
    fs.pool.mark_unify_dirty(buf, unify);

    // No separator to fix for the last entry or at the root.
    if level == 0 || cursor.level_finished(fs, level) {
        return Ok(());
    }
    // If the removed index was not the first entry, no separator
    // changes.
    if !now_first {
        return Ok(());
    }

    adjust_parent_sep(fs, cursor, level as i32 - 1, next_key)
}

fn try_leaf_merge(
    fs: &mut Fs,
    ops: &dyn LeafOps,
    intobuf: BufId,
    frombuf: BufId,
) -> Result<bool> {
    let blocksize = fs.pool.block_size();
    let merged = {
        let into = fs.pool.data(intobuf);
        let from = fs.pool.data(frombuf);
        let mut into_ref = into.borrow_mut();
        let mut from_ref = from.borrow_mut();
        ops.leaf_merge(blocksize, &mut into_ref, &mut from_ref)
    };
    if merged {
        // frombuf is redirected and dirty, so this cancels the
        // leaf redirect with an immediate free.
        let block = fs.pool.index(frombuf);
        fs.alloc.bfree(block, 1);
        fs.log_leaf_free(block)?;
    }
    Ok(merged)
}

fn try_bnode_merge(fs: &mut Fs, intobuf: BufId, frombuf: BufId) -> Result<bool> {
    let epn = entries_per_node(fs.pool.block_size());
    let merged = {
        let into = fs.pool.data(intobuf);
        let from = fs.pool.data(frombuf);
        let from = from.borrow();
        let mut into_ref = into.borrow_mut();
        bnode_merge_nodes(&mut into_ref, &from, epn)
    };
    if merged {
        let block = fs.pool.index(frombuf);
        fs.alloc.bfree(block, 1);
        fs.log_bnode_merge(block, fs.pool.index(intobuf))?;
    }
    Ok(merged)
}

/// Range deletion over `[start, start+len)`. Walks leaves, chops each,
/// and merges strictly right-into-left, adjusting separators via the
/// nearest common parent. Drops tree levels when the root is left with
/// a single child.
pub fn btree_chop(
    fs: &mut Fs,
    root: &mut Root,
    ops: &dyn LeafOps,
    start: Key,
    len: u64,
) -> Result<bool> {
    if !root.has_root() {
        return Ok(false);
    }

    let depth = root.depth as usize;
    let limit = if len >= KEY_LIMIT { KEY_LIMIT } else { start + len };
    let mut start = start;
    let mut len = len;

    let mut prev: Vec<Option<BufId>> = vec![None; depth];
    let mut cii: Vec<ChoppedIndexInfo> = vec![ChoppedIndexInfo::default(); depth];
    let mut leafprev: Option<BufId> = None;
    let mut root_moved = false;

    let mut cursor = btree_probe(fs, root, ops, start)?;

    let res = (|| -> Result<bool> {
        // Walk leaves.
        'walk: loop {
            root_moved |= cursor_redirect(fs, root, ops, &mut cursor)?;
            let leafbuf = cursor.pop();

            // Adjust start and len for this leaf.
            let this_key = cursor.level_this_key(fs);
            if start < this_key {
                if limit < KEY_LIMIT {
                    len -= this_key - start;
                }
                start = this_key;
            }

            let modified = {
                let data = fs.pool.data(leafbuf);
                let data_rc = data;
                let res = {
                    let mut leaf = data_rc.borrow_mut();
                    ops.leaf_chop(fs, start, len, &mut leaf)
                };
                match res {
                    Err(err) => {
                        fs.pool.release(leafbuf);
                        return Err(err);
                    }
                    Ok(modified) => modified,
                }
            };
            if modified {
                let delta = fs.cur_delta();
                fs.pool.mark_dirty(leafbuf, delta);
            }

            // Try to merge this leaf into the previous one.
            if let Some(prevbuf) = leafprev {
                if try_leaf_merge(fs, ops, prevbuf, leafbuf)? {
                    trace!(target: "btree", "merged leaf {:x}", fs.pool.index(leafbuf));
                    remove_index(fs, &mut cursor, &mut cii)?;
                    let delta = fs.cur_delta();
                    fs.pool.mark_dirty(prevbuf, delta);
                    fs.pool.put_free(leafbuf, delta);
                } else {
                    fs.pool.release(prevbuf);
                    leafprev = Some(leafbuf);
                }
            } else {
                leafprev = Some(leafbuf);
            }

            let done = cursor.level_next_key(fs) >= limit;
            // Pop and try to merge finished nodes.
            while done || cursor.level_finished(fs, cursor.level()) {
                let level = cursor.level();
                let buf = cursor.pop();

                // Log chopped indexes of this node.
                let ciil = cii[level];
                if ciil.count > 0 {
                    fs.log_bnode_del(fs.pool.index(buf), ciil.start, ciil.count as u16)?;
                }
                cii[level] = ChoppedIndexInfo::default();

                // Try to merge node with prev.
                if let Some(prevbuf) = prev[level] {
                    assert!(level > 0);
                    if try_bnode_merge(fs, prevbuf, buf)? {
                        trace!(target: "btree", "merged node {:x}", fs.pool.index(buf));
                        remove_index(fs, &mut cursor, &mut cii)?;
                        let unify = fs.unify;
                        fs.pool.mark_unify_dirty(prevbuf, unify);
                        fs.pool.put_free(buf, unify);
                    } else {
                        fs.pool.release(prevbuf);
                        prev[level] = Some(buf);
                    }
                } else {
                    prev[level] = Some(buf);
                }

                if level == 0 {
                    break 'walk;
                }
            }

            // Push back down to leaf level.
            while cursor_advance_down(fs, root, ops, &mut cursor)? {}
        }

        // Remove depth where the root holds a single child.
        while root.depth > 1 {
            let rootbuf = prev[0].unwrap();
            let single = {
                let data = fs.pool.data(rootbuf);
                let single = bcount(&data.borrow()) == 1;
                single
            };
            if !single {
                break;
            }
            trace!(target: "btree", "drop btree level");
            root.block = fs.pool.index(prev[1].unwrap());
            root.depth -= 1;
            root_moved = true;

            let block = fs.pool.index(rootbuf);
            fs.alloc.bfree(block, 1);
            fs.log_bnode_free(block)?;
            let unify = fs.unify;
            fs.pool.put_free(rootbuf, unify);

            prev.remove(0);
        }
        Ok(root_moved)
    })();

    if let Some(buf) = leafprev {
        fs.pool.release(buf);
    }
    for buf in prev.into_iter().flatten() {
        fs.pool.release(buf);
    }
    cursor.release(fs);

    res
}

/// Materialize a one-leaf tree for a fresh btree owner.
pub fn alloc_empty_btree(fs: &mut Fs, ops: &dyn LeafOps) -> Result<Root> {
    let rootbuf = new_node(fs)?;
    let leafbuf = match new_leaf(fs, ops) {
        Ok(leafbuf) => leafbuf,
        Err(err) => {
            let block = fs.pool.index(rootbuf);
            fs.alloc.bfree(block, 1);
            fs.pool.release(rootbuf);
            return Err(err);
        }
    };

    let rootblock = fs.pool.index(rootbuf);
    let leafblock = fs.pool.index(leafbuf);
    trace!(target: "btree", "root at {:x}, leaf at {:x}", rootblock, leafblock);
    {
        let data = fs.pool.data(rootbuf);
        bnode_init_root(&mut data.borrow_mut(), 1, leafblock, 0, 0);
    }
    fs.log_bnode_root(rootblock, 1, leafblock, 0, 0)?;
    fs.log_balloc(leafblock, 1)?;

    fs.pool.release(rootbuf);
    fs.pool.release(leafbuf);

    Ok(Root::new(rootblock, 1))
}

/// Tear down a tree already chopped back to its last leaf.
pub fn free_empty_btree(fs: &mut Fs, ops: &dyn LeafOps, root: Root) -> Result<()> {
    if !root.has_root() {
        return Ok(());
    }
    assert_eq!(root.depth, 1);

    let blocksize = fs.pool.block_size();
    let rootbuf = fs.vol_bread(root.block)?;
    {
        let data = fs.pool.data(rootbuf);
        if !bnode_sniff(&data.borrow()) {
            fs.pool.release(rootbuf);
            return err_at!(Corrupt, msg: "bad bnode magic at {:x}", root.block);
        }
    }

    let leaf = {
        let data = fs.pool.data(rootbuf);
        let data = data.borrow();
        assert_eq!(bcount(&data), 1);
        bnode_block(&data, 0)
    };

    let leafbuf = fs.pool.peek(fs.volmap, leaf);
    let leaf_redirected = match leafbuf {
        Some(id) => fs.pool.state(id).is_dirty(),
        None => false,
    };
    if let Some(id) = leafbuf {
        let data = fs.pool.data(id);
        assert!(ops.leaf_can_free(blocksize, &data.borrow()));
    }
    if leaf_redirected {
        // Redirected this delta: cancel the redirect with an
        // immediate free.
        fs.alloc.bfree(leaf, 1);
        fs.log_leaf_free(leaf)?;
        let delta = fs.cur_delta();
        fs.pool.put_free(leafbuf.unwrap(), delta);
    } else {
        crate::wal::defer_bfree(&mut fs.defree, leaf, 1);
        fs.log_bfree(leaf, 1)?;
        if let Some(id) = leafbuf {
            fs.pool.release(id);
        }
    }

    if fs.pool.already_unify_dirty(rootbuf, fs.unify) {
        fs.alloc.bfree(root.block, 1);
        fs.log_bnode_free(root.block)?;
        let unify = fs.unify;
        fs.pool.put_free(rootbuf, unify);
    } else {
        crate::wal::defer_bfree(&mut fs.deunify, root.block, 1);
        fs.log_bfree_on_unify(root.block, 1)?;
        fs.pool.release(rootbuf);
    }

    Ok(())
}

// Replay of bnode construction records. These rebuild the in-memory
// bnode cache to the state it had before the crash; the rebuilt
// buffers are dirty for the open unify cycle and reach disk at the
// next unify.

pub(crate) fn replay_bnode_redirect(fs: &mut Fs, old: BlockNum, new: BlockNum) -> Result<()> {
    let newbuf = fs.vol_getblk(new)?;
    let oldbuf = match fs.vol_bread(old) {
        Ok(oldbuf) => oldbuf,
        Err(err) => {
            fs.pool.release(newbuf);
            return Err(err);
        }
    };
    {
        let from = fs.pool.data(oldbuf);
        let from = from.borrow();
        if !bnode_sniff(&from) {
            fs.pool.release(oldbuf);
            fs.pool.release(newbuf);
            return err_at!(Corrupt, msg: "bad bnode magic at {:x}", old);
        }
        let to = fs.pool.data(newbuf);
        to.borrow_mut().copy_from_slice(&from);
    }
    let unify = fs.unify;
    fs.pool.mark_unify_dirty(newbuf, unify);

    fs.pool.release(oldbuf);
    fs.pool.release(newbuf);
    Ok(())
}

pub(crate) fn replay_bnode_root(
    fs: &mut Fs,
    root: BlockNum,
    count: usize,
    left: BlockNum,
    right: BlockNum,
    rkey: Key,
) -> Result<()> {
    let rootbuf = fs.vol_getblk(root)?;
    {
        let data = fs.pool.data(rootbuf);
        let mut data = data.borrow_mut();
        bnode_init(&mut data);
        bnode_init_root(&mut data, count, left, right, rkey);
    }
    let unify = fs.unify;
    fs.pool.mark_unify_dirty(rootbuf, unify);
    fs.pool.release(rootbuf);
    Ok(())
}

/// Replay should already have dirtied the src buffer (by redirect).
pub(crate) fn replay_bnode_split(
    fs: &mut Fs,
    src: BlockNum,
    pos: usize,
    dst: BlockNum,
) -> Result<()> {
    let srcbuf = fs.vol_getblk(src)?;
    let dstbuf = match fs.vol_getblk(dst) {
        Ok(dstbuf) => dstbuf,
        Err(err) => {
            fs.pool.release(srcbuf);
            return Err(err);
        }
    };
    {
        let from = fs.pool.data(srcbuf);
        let to = fs.pool.data(dstbuf);
        let mut to = to.borrow_mut();
        bnode_init(&mut to);
        bnode_split_at(&mut from.borrow_mut(), pos, &mut to);
    }
    let unify = fs.unify;
    fs.pool.mark_unify_dirty(srcbuf, unify);
    fs.pool.mark_unify_dirty(dstbuf, unify);
    fs.pool.release(dstbuf);
    fs.pool.release(srcbuf);
    Ok(())
}

fn replay_bnode_change<C>(fs: &mut Fs, bnode: BlockNum, change: C) -> Result<()>
where
    C: FnOnce(&mut [u8]),
{
    let buf = fs.vol_getblk(bnode)?;
    {
        let data = fs.pool.data(buf);
        change(&mut data.borrow_mut());
    }
    let unify = fs.unify;
    fs.pool.mark_unify_dirty(buf, unify);
    fs.pool.release(buf);
    Ok(())
}

pub(crate) fn replay_bnode_add(
    fs: &mut Fs,
    parent: BlockNum,
    child: BlockNum,
    key: Key,
) -> Result<()> {
    replay_bnode_change(fs, parent, |data| {
        let at = bnode_lookup(data, key) + 1;
        bnode_add_index(data, at, child, key);
    })
}

pub(crate) fn replay_bnode_update(
    fs: &mut Fs,
    parent: BlockNum,
    child: BlockNum,
    key: Key,
) -> Result<()> {
    replay_bnode_change(fs, parent, |data| {
        let at = bnode_lookup(data, key);
        assert_eq!(bnode_key(data, at), key);
        bnode_set_block(data, at, child);
    })
}

pub(crate) fn replay_bnode_merge(fs: &mut Fs, src: BlockNum, dst: BlockNum) -> Result<()> {
    let epn = entries_per_node(fs.pool.block_size());
    let srcbuf = fs.vol_getblk(src)?;
    let dstbuf = match fs.vol_getblk(dst) {
        Ok(dstbuf) => dstbuf,
        Err(err) => {
            fs.pool.release(srcbuf);
            return Err(err);
        }
    };
    {
        let from = fs.pool.data(srcbuf);
        let from = from.borrow();
        let to = fs.pool.data(dstbuf);
        let merged = bnode_merge_nodes(&mut to.borrow_mut(), &from, epn);
        assert!(merged);
    }
    let unify = fs.unify;
    fs.pool.mark_unify_dirty(srcbuf, unify);
    fs.pool.mark_unify_dirty(dstbuf, unify);
    fs.pool.release(dstbuf);
    fs.pool.release(srcbuf);
    Ok(())
}

pub(crate) fn replay_bnode_del(
    fs: &mut Fs,
    bnode: BlockNum,
    key: Key,
    count: usize,
) -> Result<()> {
    replay_bnode_change(fs, bnode, |data| {
        let at = bnode_lookup(data, key);
        assert_eq!(bnode_key(data, at), key);
        bnode_remove_index(data, at, count);
    })
}

pub(crate) fn replay_bnode_adjust(fs: &mut Fs, bnode: BlockNum, from: Key, to: Key) -> Result<()> {
    replay_bnode_change(fs, bnode, |data| {
        let at = bnode_lookup(data, from);
        assert_eq!(bnode_key(data, at), from);
        bnode_set_key(data, at, to);
    })
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
