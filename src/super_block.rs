//! Superblock: the root of everything durable.
//!
//! Written once per delta commit, strictly after the delta's log
//! blocks. A crash before the superblock write leaves the previous
//! superblock pointing at the previous, fully consistent tree, which
//! is what makes partially flushed deltas invisible.

use crate::dev::Dev;
use crate::types::Root;
use crate::{BlockNum, Result};

pub const SB_MAGIC: [u8; 8] = *b"deltafs\0";

// On-disk layout, big-endian:
//
// +--------+--------------------------------+
// |  0..8  | magic                          |
// |  8..16 | birth                          |
// | 16..20 | blockbits                      |
// | 20..28 | volblocks                      |
// | 28..36 | logchain                       |
// | 36..40 | logcount                       |
// | 40..48 | freeblocks                     |
// | 48..56 | unify                          |
// | 56..60 | version                        |
// | 60..108| tree roots: volmap, logmap,    |
// |        |   itable, atable, vtable,      |
// |        |   bitmap (packed depth:block)  |
// |108..116| s_maxbytes                     |
// +--------+--------------------------------+

#[derive(Clone, Debug, PartialEq, Default)]
pub struct SuperBlock {
    pub blockbits: u32,
    pub volblocks: u64,
    /// Physical address of the newest log block on disk.
    pub logchain: BlockNum,
    /// Count of log blocks in the current unify cycle.
    pub logcount: u32,
    pub freeblocks: u64,
    /// Unify cycle counter.
    pub unify: u64,
    /// Version pinned to zero by the current engine.
    pub version: u32,
    pub volmap_root: u64,
    pub logmap_root: u64,
    /// Inode table root.
    pub iroot: Root,
    /// Overflow attribute table root.
    pub oroot: Root,
    pub vtable_root: u64,
    /// Active bitmap region base block.
    pub bitmap_root: u64,
    pub s_maxbytes: u64,
}

impl SuperBlock {
    pub fn blocksize(&self) -> usize {
        1 << self.blockbits
    }

    pub fn encode(&self, blocksize: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; blocksize];
        buf[0..8].copy_from_slice(&SB_MAGIC);
        // birth stays zero
        buf[16..20].copy_from_slice(&self.blockbits.to_be_bytes());
        buf[20..28].copy_from_slice(&self.volblocks.to_be_bytes());
        buf[28..36].copy_from_slice(&(self.logchain as u64).to_be_bytes());
        buf[36..40].copy_from_slice(&self.logcount.to_be_bytes());
        buf[40..48].copy_from_slice(&self.freeblocks.to_be_bytes());
        buf[48..56].copy_from_slice(&self.unify.to_be_bytes());
        buf[56..60].copy_from_slice(&self.version.to_be_bytes());
        let roots = [
            self.volmap_root,
            self.logmap_root,
            self.iroot.pack(),
            self.oroot.pack(),
            self.vtable_root,
            self.bitmap_root,
        ];
        for (i, root) in roots.iter().enumerate() {
            let off = 60 + i * 8;
            buf[off..off + 8].copy_from_slice(&root.to_be_bytes());
        }
        buf[108..116].copy_from_slice(&self.s_maxbytes.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<SuperBlock> {
        check_remaining!(buf, 116, "superblock")?;
        if buf[0..8] != SB_MAGIC {
            return err_at!(Corrupt, msg: "bad superblock magic {:?}", &buf[0..8]);
        }

        let u32_at = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());

        let sb = SuperBlock {
            blockbits: u32_at(16),
            volblocks: u64_at(20),
            logchain: u64_at(28) as BlockNum,
            logcount: u32_at(36),
            freeblocks: u64_at(40),
            unify: u64_at(48),
            version: u32_at(56),
            volmap_root: u64_at(60),
            logmap_root: u64_at(68),
            iroot: Root::unpack(u64_at(76)),
            oroot: Root::unpack(u64_at(84)),
            vtable_root: u64_at(92),
            bitmap_root: u64_at(100),
            s_maxbytes: u64_at(108),
        };
        if sb.blockbits < 9 || sb.blockbits > 16 {
            return err_at!(Corrupt, msg: "implausible blockbits {}", sb.blockbits);
        }
        Ok(sb)
    }

    /// Read and validate the superblock from block zero.
    pub fn load(dev: &Dev) -> Result<SuperBlock> {
        let mut buf = vec![0_u8; dev.block_size()];
        dev.read(0, &mut buf)?;
        SuperBlock::decode(&buf)
    }

    /// Write to block zero and force it down to the platter.
    pub fn store(&self, dev: &Dev) -> Result<()> {
        dev.write(0, &self.encode(dev.block_size()))?;
        dev.sync()
    }
}

#[cfg(test)]
#[path = "super_block_test.rs"]
mod super_block_test;
