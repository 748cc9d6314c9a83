//! Inode attribute records.
//!
//! A record is a present-bitmask followed by big-endian fields, in
//! fixed order, for each present bit. The record is variable length;
//! absent attributes cost nothing. The same seam ([AttrOps]) also
//! carries the overflow attribute table's opaque records, so the
//! ileaf engine serves both trees.

use bitflags::bitflags;

use crate::types::Root;
use crate::Result;

bitflags! {
    /// Which attributes a record carries.
    pub struct Present: u16 {
        const MODE       = 0x0001;
        const UID        = 0x0002;
        const GID        = 0x0004;
        const NLINK      = 0x0008;
        const RDEV       = 0x0010;
        const SIZE       = 0x0020;
        const MTIME      = 0x0040;
        const CTIME      = 0x0080;
        const VERSION    = 0x0100;
        const DATA_BTREE = 0x0200;
    }
}

/// A stable snapshot of an inode's attributes, as carried in the
/// per-delta dirty chunks and encoded into the itable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IattrData {
    pub present: Present,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub rdev: u64,
    pub size: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub version: u64,
    pub btree: Root,
}

impl Default for IattrData {
    fn default() -> IattrData {
        IattrData {
            present: Present::empty(),
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 0,
            rdev: 0,
            size: 0,
            mtime: 0,
            ctime: 0,
            version: 0,
            btree: Root::default(),
        }
    }
}

impl IattrData {
    /// A fresh regular-file record with the common attributes present.
    pub fn regular(mode: u32, uid: u32, gid: u32) -> IattrData {
        IattrData {
            present: Present::MODE
                | Present::UID
                | Present::GID
                | Present::NLINK
                | Present::SIZE
                | Present::MTIME
                | Present::CTIME,
            mode,
            uid,
            gid,
            nlink: 1,
            ..IattrData::default()
        }
    }
}

/// Attribute record codec: the vtable behind ileaf writes and reads.
pub trait AttrOps {
    type Attrs;

    fn encoded_size(&self, attrs: &Self::Attrs) -> usize;
    fn encode(&self, attrs: &Self::Attrs, buf: &mut Vec<u8>);
    fn decode(&self, data: &[u8]) -> Result<Self::Attrs>;
}

/// Codec for the primary inode table.
pub struct IattrOps;

impl AttrOps for IattrOps {
    type Attrs = IattrData;

    fn encoded_size(&self, attrs: &IattrData) -> usize {
        let p = attrs.present;
        let mut size = 2;
        size += 4 * (p.contains(Present::MODE) as usize);
        size += 4 * (p.contains(Present::UID) as usize);
        size += 4 * (p.contains(Present::GID) as usize);
        size += 4 * (p.contains(Present::NLINK) as usize);
        size += 8 * (p.contains(Present::RDEV) as usize);
        size += 8 * (p.contains(Present::SIZE) as usize);
        size += 8 * (p.contains(Present::MTIME) as usize);
        size += 8 * (p.contains(Present::CTIME) as usize);
        size += 8 * (p.contains(Present::VERSION) as usize);
        size += 8 * (p.contains(Present::DATA_BTREE) as usize);
        size
    }

    fn encode(&self, attrs: &IattrData, buf: &mut Vec<u8>) {
        let p = attrs.present;
        buf.extend_from_slice(&p.bits().to_be_bytes());
        if p.contains(Present::MODE) {
            buf.extend_from_slice(&attrs.mode.to_be_bytes());
        }
        if p.contains(Present::UID) {
            buf.extend_from_slice(&attrs.uid.to_be_bytes());
        }
        if p.contains(Present::GID) {
            buf.extend_from_slice(&attrs.gid.to_be_bytes());
        }
        if p.contains(Present::NLINK) {
            buf.extend_from_slice(&attrs.nlink.to_be_bytes());
        }
        if p.contains(Present::RDEV) {
            buf.extend_from_slice(&attrs.rdev.to_be_bytes());
        }
        if p.contains(Present::SIZE) {
            buf.extend_from_slice(&attrs.size.to_be_bytes());
        }
        if p.contains(Present::MTIME) {
            buf.extend_from_slice(&attrs.mtime.to_be_bytes());
        }
        if p.contains(Present::CTIME) {
            buf.extend_from_slice(&attrs.ctime.to_be_bytes());
        }
        if p.contains(Present::VERSION) {
            buf.extend_from_slice(&attrs.version.to_be_bytes());
        }
        if p.contains(Present::DATA_BTREE) {
            buf.extend_from_slice(&attrs.btree.pack().to_be_bytes());
        }
    }

    fn decode(&self, data: &[u8]) -> Result<IattrData> {
        check_remaining!(data, 2, "iattr-present")?;
        let bits = u16::from_be_bytes([data[0], data[1]]);
        let present = match Present::from_bits(bits) {
            Some(present) => present,
            None => return err_at!(Corrupt, msg: "bad present mask {:x}", bits),
        };

        let mut attrs = IattrData {
            present,
            ..IattrData::default()
        };
        let mut pos = 2;

        if present.contains(Present::MODE) {
            attrs.mode = u32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        }
        if present.contains(Present::UID) {
            attrs.uid = u32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        }
        if present.contains(Present::GID) {
            attrs.gid = u32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        }
        if present.contains(Present::NLINK) {
            attrs.nlink = u32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
        }
        if present.contains(Present::RDEV) {
            attrs.rdev = u64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
        }
        if present.contains(Present::SIZE) {
            attrs.size = u64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
        }
        if present.contains(Present::MTIME) {
            attrs.mtime = u64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
        }
        if present.contains(Present::CTIME) {
            attrs.ctime = u64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
        }
        if present.contains(Present::VERSION) {
            attrs.version = u64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
        }
        if present.contains(Present::DATA_BTREE) {
            let val = u64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap());
            attrs.btree = Root::unpack(val);
        }

        if pos != data.len() {
            return err_at!(Corrupt, msg: "iattr trailing bytes {}/{}", pos, data.len());
        }
        Ok(attrs)
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    check_remaining!(data, *pos + n, "iattr-field")?;
    let field = &data[*pos..*pos + n];
    *pos += n;
    Ok(field)
}

/// Codec for the overflow attribute table: opaque byte strings.
pub struct OattrOps;

impl AttrOps for OattrOps {
    type Attrs = Vec<u8>;

    fn encoded_size(&self, attrs: &Vec<u8>) -> usize {
        attrs.len()
    }

    fn encode(&self, attrs: &Vec<u8>, buf: &mut Vec<u8>) {
        buf.extend_from_slice(attrs);
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
#[path = "iattr_test.rs"]
mod iattr_test;
