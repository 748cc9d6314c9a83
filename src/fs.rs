//! The filesystem instance.
//!
//! [Fs] owns the device, the buffer pool with its maps, the inode
//! cache, the allocator, the log cursor and the delta counters, so
//! multiple volumes can be mounted side by side. [Fs::format] lays
//! down a fresh volume; [Fs::open] loads the superblock and replays
//! the log before the first operation.

use log::{debug, info};

use std::ffi;

use crate::balloc::Allocator;
use crate::btree::{self, ileaf, LeafOps};
use crate::buffer::{BufferPool, MapId, MapIo};
use crate::dev::Dev;
use crate::iattr::{AttrOps, IattrData, IattrOps};
use crate::inode::{Inode, InodeCache, InodeId, InodeState};
use crate::super_block::SuperBlock;
use crate::types::{FIRST_NORMAL_INUM, KEY_LIMIT};
use crate::wal::{LogRecord, LogState, Stash};
use crate::{BlockNum, Inum, Result};

/// Byte budget for the buffer pool.
const POOL_SIZE: usize = 4 << 20;

/// Largest file offset the engine accepts.
const MAX_FILESIZE: u64 = 1 << 47;

pub struct FormatOpts {
    pub blockbits: u32,
    pub volblocks: u64,
}

/// One mounted volume.
pub struct Fs {
    pub dev: Dev,
    pub pool: BufferPool,
    pub volmap: MapId,
    pub logmap: MapId,
    pub alloc: Allocator,
    pub icache: InodeCache,
    pub super_block: SuperBlock,

    /// Current frontend delta.
    pub delta: u64,
    /// Delta whose flush is in progress (meaningful under backend).
    pub(crate) marshal_delta: u64,
    /// Current unify cycle.
    pub unify: u64,
    pub(crate) change_refs: u32,
    pub(crate) backend: bool,

    /// Inums dirtied per delta slot.
    pub(crate) dirty_inodes: [Vec<Inum>; 2],
    /// Blocks free after this delta commits.
    pub defree: Stash,
    /// Blocks free after the next unify.
    pub deunify: Stash,
    /// Unlinked inodes whose storage is still pinned.
    pub orphans: Vec<Inum>,
    /// Orphan intents queued by the frontend for the next flush.
    pub(crate) pending_orphans: Vec<LogRecord>,
    pub(crate) log: LogState,
    /// A failed commit poisons the instance: in-memory cycle state no
    /// longer matches the disk, so further commits are refused.
    pub(crate) readonly: bool,
    /// Test hook: stop a flush after the log blocks, before the
    /// superblock, emulating a crash mid-commit.
    pub(crate) crash_before_super: bool,
}

impl Fs {
    fn build(dev: Dev, super_block: SuperBlock, alloc: Allocator) -> Fs {
        let mut pool = BufferPool::new(1 << super_block.blockbits, POOL_SIZE);
        let volmap = pool.new_map(None, MapIo::Vol);
        let logmap = pool.new_map(None, MapIo::Log);
        let unify = super_block.unify;

        Fs {
            dev,
            pool,
            volmap,
            logmap,
            alloc,
            icache: InodeCache::default(),
            super_block,
            delta: 0,
            marshal_delta: 0,
            unify,
            change_refs: 0,
            backend: false,
            dirty_inodes: [vec![], vec![]],
            defree: Stash::default(),
            deunify: Stash::default(),
            orphans: vec![],
            pending_orphans: vec![],
            log: LogState::default(),
            readonly: false,
            crash_before_super: false,
        }
    }

    pub(crate) fn under_backend(&self) -> bool {
        self.backend
    }

    /// The delta new dirty state belongs to: the frontend delta, or
    /// the delta being flushed when called from the backend.
    pub(crate) fn cur_delta(&self) -> u64 {
        if self.backend {
            self.marshal_delta
        } else {
            self.delta
        }
    }

    /// Lay down a fresh volume: superblock, bitmap regions, empty
    /// inode and attribute tables, all committed through one unified
    /// delta.
    pub fn format(loc: &ffi::OsStr, opts: FormatOpts) -> Result<Fs> {
        let blocksize = 1_usize << opts.blockbits;
        let dev = Dev::create(loc, opts.blockbits, opts.volblocks << opts.blockbits)?;
        info!(target: "fs", "format {:?}: {} blocks of {}", loc, opts.volblocks, blocksize);

        let mut alloc = Allocator::new(opts.volblocks, blocksize);
        // Superblock and both bitmap regions are never allocatable.
        alloc.reserve(0, 1 + 2 * alloc.region_blocks);

        let super_block = SuperBlock {
            blockbits: opts.blockbits,
            volblocks: opts.volblocks,
            freeblocks: alloc.freeblocks,
            bitmap_root: alloc.region_base[0] as u64,
            s_maxbytes: MAX_FILESIZE.min(opts.volblocks << opts.blockbits),
            ..SuperBlock::default()
        };

        let mut fs = Fs::build(dev, super_block, alloc);

        // Seed the active bitmap region with the reservation-only
        // image. The table trees built next are described by log
        // records, which replay applies on top of exactly this image.
        {
            let base = fs.alloc.region_base[0];
            let bytes = fs.alloc.region_blocks as usize * fs.pool.block_size();
            let mut image = vec![0_u8; bytes];
            image[..fs.alloc.bitmap_bytes().len()].copy_from_slice(fs.alloc.bitmap_bytes());
            fs.dev.write(fs.dev.block_offset(base), &image)?;
        }

        // The table trees are built by backend rules: their log
        // records describe the construction for replay.
        fs.backend = true;
        fs.marshal_delta = fs.delta;
        let iroot = btree::alloc_empty_btree(&mut fs, &ileaf::ITABLE_OPS)?;
        let oroot = btree::alloc_empty_btree(&mut fs, &ileaf::ATABLE_OPS)?;
        fs.backend = false;
        fs.super_block.iroot = iroot;
        fs.super_block.oroot = oroot;

        fs.commit()?;
        Ok(fs)
    }

    /// Mount: load the superblock, the active bitmap region, then
    /// replay the log chain to rebuild allocator, defer queues,
    /// orphans and the bnode cache.
    pub fn open(loc: &ffi::OsStr) -> Result<Fs> {
        let super_block = {
            let probe = Dev::open(loc, 9)?;
            let mut buf = vec![0_u8; 512];
            probe.read(0, &mut buf)?;
            SuperBlock::decode(&buf)?
        };
        let dev = Dev::open(loc, super_block.blockbits)?;
        info!(target: "fs", "open {:?}: {} blocks, unify {}",
              loc, super_block.volblocks, super_block.unify);

        let mut alloc = Allocator::new(super_block.volblocks, super_block.blocksize());
        let image = {
            let base = super_block.bitmap_root as BlockNum;
            let bytes = alloc.region_blocks as usize * super_block.blocksize();
            let mut image = vec![0_u8; bytes];
            dev.read(dev.block_offset(base), &mut image)?;
            image
        };
        alloc.load(&image);
        alloc.active_region = if super_block.bitmap_root as BlockNum == alloc.region_base[0] {
            0
        } else {
            1
        };

        let mut fs = Fs::build(dev, super_block, alloc);
        fs.replay()?;
        Ok(fs)
    }

    // Inode surface.

    fn new_inode_slot(&mut self, inum: Inum) -> InodeId {
        let map = self.pool.new_map(Some(inum), MapIo::File);
        self.icache.add_slot(Inode::new(inum, map))
    }

    fn drop_inode_slot(&mut self, id: InodeId) {
        let map = self.icache.get(id).map;
        self.pool.invalidate(map);
        self.pool.free_map(map);
        self.icache.remove_slot(id);
    }

    /// Look up a cached inode or load it from the inode table.
    pub fn iget(&mut self, inum: Inum) -> Result<InodeId> {
        if let Some(id) = self.icache.ilookup5(inum, |inode| inode.inum == inum) {
            return Ok(id);
        }

        let attrs = self.itable_read(inum)?;
        let id = self.new_inode_slot(inum);
        {
            let inode = self.icache.get_mut(id);
            inode.attrs = attrs;
            inode.btree = attrs.btree;
            inode.state = InodeState::empty();
        }
        if let Err(err) = self.icache.insert_locked4(id, inum, |other| other.inum == inum) {
            self.drop_inode_slot(id);
            return Err(err);
        }
        self.icache.get_mut(id).state -= InodeState::NEW;
        Ok(id)
    }

    /// Create a fresh inode at the first free inum at or after
    /// `goal`, holding one reference.
    pub fn create_inode(&mut self, goal: Inum, attrs: IattrData) -> Result<InodeId> {
        let delta = self.change_begin();
        let res = self.create_inode_inner(goal.max(FIRST_NORMAL_INUM), attrs);
        self.change_end(delta);
        res
    }

    fn create_inode_inner(&mut self, goal: Inum, attrs: IattrData) -> Result<InodeId> {
        let mut goal = goal;
        let inum = loop {
            let candidate = self.find_free_inum(goal)?;
            // A created-but-unflushed inode can shadow a slot that
            // still looks free on disk.
            let live = self
                .icache
                .ilookup5(candidate, |inode| inode.inum == candidate);
            match live {
                None => break candidate,
                Some(id) => {
                    self.iput(id);
                    goal = candidate + 1;
                }
            }
        };

        let id = self.new_inode_slot(inum);
        self.icache.get_mut(id).attrs = attrs;
        if let Err(err) = self.icache.insert_locked4(id, inum, |other| other.inum == inum) {
            self.drop_inode_slot(id);
            return Err(err);
        }
        debug!(target: "fs", "create inode {}", inum);

        let delta = self.cur_delta();
        self.icache.get_mut(id).state -= InodeState::NEW;
        self.icache.get_mut(id).iattrdirty(delta);
        self.mark_inode_dirty(id);
        Ok(id)
    }

    /// Drop a reference. Clean, unreferenced inodes leave the cache;
    /// dirty inodes stay pinned until their delta commits.
    pub fn iput(&mut self, id: InodeId) {
        if !self.icache.iput_ref(id) {
            return;
        }
        let state = self.icache.get(id).state;
        if state.is_dirty() {
            // Pinned by the dirty list; freed after flush.
            return;
        }
        self.icache.unhash(id);
        self.drop_inode_slot(id);
    }

    /// Tear down an inode: file extents, itable record and orphan
    /// membership all go away when the delta commits. The caller's
    /// reference is consumed; the inode stays pinned until the flush.
    pub fn destroy_inode(&mut self, id: InodeId) -> Result<()> {
        let delta = self.change_begin();
        let res = self.destroy_inode_inner(id);
        self.change_end(delta);
        res
    }

    fn destroy_inode_inner(&mut self, id: InodeId) -> Result<()> {
        let inum = self.icache.get(id).inum;
        assert_eq!(self.icache.get(id).count(), 1, "destroy of referenced inode");
        debug!(target: "fs", "destroy inode {}", inum);

        let delta = self.cur_delta();
        let slot = crate::types::delta_slot(delta);
        {
            let inode = self.icache.get_mut(id);
            inode.iattrdirty(delta);
            inode.ddc[slot].truncate = Some(0);
        }
        self.mark_inode_dirty(id);
        self.icache.get_mut(id).state |= InodeState::FREEING;

        let map = self.icache.get(id).map;
        self.pool.truncate_range(map, 0, u64::MAX >> 1, delta);
        self.orphan_del(inum)?;

        // Pinned by the dirty state until the backend reaps it.
        self.icache.iput_ref(id);
        Ok(())
    }

    /// Record `inum` as orphaned: its directory entry is gone but the
    /// storage stays pinned until the last reference drops.
    pub fn orphan_add(&mut self, inum: Inum) -> Result<()> {
        assert!(!self.orphans.contains(&inum));
        self.orphans.push(inum);
        self.pending_orphans.push(LogRecord::OrphanAdd {
            version: self.super_block.version as u16,
            inum,
        });
        Ok(())
    }

    /// Remove `inum` from the orphan list.
    pub fn orphan_del(&mut self, inum: Inum) -> Result<()> {
        if !self.orphans.contains(&inum) {
            return Ok(());
        }
        self.orphans.retain(|&orphan| orphan != inum);
        self.pending_orphans.push(LogRecord::OrphanDel {
            version: self.super_block.version as u16,
            inum,
        });
        Ok(())
    }

    /// Mark an inode dirty for the current delta.
    pub fn mark_inode_dirty(&mut self, id: InodeId) {
        let delta = self.cur_delta();
        let slot = crate::types::delta_slot(delta);
        let inode = self.icache.get_mut(id);
        inode.state |= InodeState::DIRTY;
        let inum = inode.inum;
        if !self.dirty_inodes[slot].contains(&inum) {
            self.dirty_inodes[slot].push(inum);
        }
    }

    // Inode table plumbing.

    /// Load an inode's attribute record from the itable.
    pub(crate) fn itable_read(&mut self, inum: Inum) -> Result<IattrData> {
        let root = self.super_block.iroot;
        let mut cursor = btree::btree_probe(self, &root, &ileaf::ITABLE_OPS, inum)?;

        let res = (|fs: &mut Fs, cursor: &btree::Cursor| -> Result<IattrData> {
            let mut attrs: Option<Result<IattrData>> = None;
            btree::btree_read(fs, cursor, |fs, _bottom, _limit, leafbuf| {
                let data = fs.pool.data(leafbuf);
                let leaf = data.borrow();
                attrs = ileaf::leaf_read(&leaf, inum).map(|bytes| IattrOps.decode(bytes));
                Ok(())
            })?;
            match attrs {
                Some(attrs) => attrs,
                None => err_at!(NotFound, msg: "no attributes for inum {}", inum),
            }
        })(self, &cursor);

        cursor.release(self);
        res
    }

    /// Store an inode's attribute record into the itable; backend
    /// only.
    pub(crate) fn itable_write(&mut self, inum: Inum, idata: &IattrData) -> Result<()> {
        assert!(self.under_backend());

        let encoded = {
            let mut buf = vec![];
            IattrOps.encode(idata, &mut buf);
            buf
        };

        let mut root = self.super_block.iroot;
        let mut cursor = btree::btree_probe(self, &root, &ileaf::ITABLE_OPS, inum)?;
        let res = btree::btree_write(
            self,
            &mut root,
            &ileaf::ITABLE_OPS,
            &mut cursor,
            |fs, _bottom, _limit, leafbuf| {
                let blocksize = fs.pool.block_size();
                let data = fs.pool.data(leafbuf);
                let mut leaf = data.borrow_mut();
                match ileaf::leaf_write(&mut leaf, inum, &encoded) {
                    Some(()) => Ok(btree::WriteStep {
                        need_split: false,
                        start: inum,
                        remaining: 0,
                        hint: 0,
                    }),
                    None => {
                        let epl = ileaf::ITABLE_OPS.entries_per_leaf(blocksize);
                        Ok(btree::WriteStep {
                            need_split: true,
                            start: inum,
                            remaining: 1,
                            hint: ileaf::split_hint(&leaf, inum, epl),
                        })
                    }
                }
            },
        );
        cursor.release(self);
        res?;
        self.super_block.iroot = root;
        Ok(())
    }

    /// First inum at or after `goal` with no attribute record.
    pub(crate) fn find_free_inum(&mut self, goal: Inum) -> Result<Inum> {
        let root = self.super_block.iroot;
        let mut cursor = btree::btree_probe(self, &root, &ileaf::ITABLE_OPS, goal)?;

        let mut found = None;
        let res = btree::btree_traverse(
            self,
            &root,
            &ileaf::ITABLE_OPS,
            &mut cursor,
            goal,
            KEY_LIMIT - goal,
            |fs, _bottom, limit, leafbuf, key, len| {
                let data = fs.pool.data(leafbuf);
                let leaf = data.borrow();
                match ileaf::find_free(&leaf, limit, key, len) {
                    Some(inum) => {
                        found = Some(inum);
                        Ok(1)
                    }
                    None => Ok(0),
                }
            },
        );
        cursor.release(self);
        res?;

        match found {
            Some(inum) => Ok(inum),
            None => err_at!(NoSpace, msg: "inode table full"),
        }
    }

    /// Invoke `cb(inum, attrs)` for every inode record in
    /// `[start, start+len)`.
    pub fn enumerate_inodes<F>(&mut self, start: Inum, len: u64, mut cb: F) -> Result<()>
    where
        F: FnMut(Inum, &IattrData) -> Result<()>,
    {
        let root = self.super_block.iroot;
        let mut cursor = btree::btree_probe(self, &root, &ileaf::ITABLE_OPS, start)?;

        let res = btree::btree_traverse(
            self,
            &root,
            &ileaf::ITABLE_OPS,
            &mut cursor,
            start,
            len,
            |fs, _bottom, _limit, leafbuf, key, len| {
                let data = fs.pool.data(leafbuf);
                let leaf = data.borrow();
                ileaf::enumerate(&leaf, key, len, &mut |inum, bytes| {
                    let attrs = IattrOps.decode(bytes)?;
                    cb(inum, &attrs)
                })?;
                Ok(0)
            },
        );
        cursor.release(self);
        res.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) fn test_fs(name: &str, seed: u64, volblocks: u64) -> Fs {
    use std::env;

    let loc = {
        let mut loc = env::temp_dir();
        loc.push(format!("{}-{}", name, seed));
        loc.into_os_string()
    };
    std::fs::remove_file(&loc).ok();
    Fs::format(
        &loc,
        FormatOpts {
            blockbits: 12,
            volblocks,
        },
    )
    .unwrap()
}

#[cfg(test)]
#[path = "fs_test.rs"]
mod fs_test;
