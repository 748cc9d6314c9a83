//! Device I/O shim. Positional reads and writes of aligned byte
//! ranges, in single-buffer and scatter-gather form. Interrupted and
//! would-block returns are retried internally; short transfers are
//! resumed until the full range completes.

use fs2::FileExt;
use log::trace;
use rustix::io::Errno;

use std::io::{IoSlice, IoSliceMut, Seek, SeekFrom};
use std::{ffi, fs, path};

use crate::{BlockNum, Result};

/// Largest iovec handed to the kernel in one call.
const UIO_MAXIOV: usize = 1024;

/// An open volume: the backing file or block device plus the block
/// size in bits. The volume file is locked exclusive for the lifetime
/// of this value.
pub struct Dev {
    loc: ffi::OsString,
    file: fs::File,
    pub bits: u32,
}

impl Drop for Dev {
    fn drop(&mut self) {
        self.file.unlock().ok();
    }
}

impl Dev {
    /// Open an existing volume. Takes the exclusive lock; fails with
    /// `Busy` if another instance holds it.
    pub fn open(loc: &ffi::OsStr, bits: u32) -> Result<Dev> {
        let file = {
            let mut opts = fs::OpenOptions::new();
            err_at!(IoFail, opts.read(true).write(true).open(loc), "open {:?}", loc)?
        };
        err_at!(Busy, file.try_lock_exclusive(), "volume lock {:?}", loc)?;

        Ok(Dev {
            loc: loc.to_os_string(),
            file,
            bits,
        })
    }

    /// Create (or truncate) a regular file of `size` bytes to serve as
    /// a fresh volume.
    pub fn create(loc: &ffi::OsStr, bits: u32, size: u64) -> Result<Dev> {
        if let Some(parent) = path::Path::new(loc).parent() {
            err_at!(IoFail, fs::create_dir_all(parent))?;
        }
        let file = {
            let mut opts = fs::OpenOptions::new();
            let opts = opts.read(true).write(true).create(true).truncate(true);
            err_at!(IoFail, opts.open(loc), "create {:?}", loc)?
        };
        err_at!(Busy, file.try_lock_exclusive(), "volume lock {:?}", loc)?;
        err_at!(IoFail, file.set_len(size), "set_len {:?}", loc)?;

        Ok(Dev {
            loc: loc.to_os_string(),
            file,
            bits,
        })
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.loc.clone()
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        1 << self.bits
    }

    /// Byte offset of a block address.
    pub fn block_offset(&self, block: BlockNum) -> u64 {
        (block as u64) << self.bits
    }

    /// Device size in bytes. Works for both regular files and block
    /// devices.
    pub fn size(&self) -> Result<u64> {
        let mut file = &self.file;
        err_at!(IoFail, file.seek(SeekFrom::End(0)), "size {:?}", self.loc)
    }

    /// Flush file data and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        err_at!(IoFail, self.file.sync_data(), "sync {:?}", self.loc)
    }

    /// Positional read of `data.len()` bytes at `offset`.
    pub fn read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        trace!(target: "dev", "read {:?} fpos:{} len:{}", self.loc, offset, data.len());

        let mut pos = 0;
        while pos < data.len() {
            match rustix::io::pread(&self.file, &mut data[pos..], offset + pos as u64) {
                Ok(0) => return err_at!(IoFail, msg: "eof {:?} at {}", self.loc, offset),
                Ok(n) => pos += n,
                Err(err) if err == Errno::INTR || err == Errno::AGAIN => continue,
                Err(err) => return err_at!(IoFail, Err(err), "read {:?}", self.loc),
            }
        }
        Ok(())
    }

    /// Positional write of `data` at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        trace!(target: "dev", "write {:?} fpos:{} len:{}", self.loc, offset, data.len());

        let mut pos = 0;
        while pos < data.len() {
            match rustix::io::pwrite(&self.file, &data[pos..], offset + pos as u64) {
                Ok(0) => return err_at!(IoFail, msg: "zero write {:?} at {}", self.loc, offset),
                Ok(n) => pos += n,
                Err(err) if err == Errno::INTR || err == Errno::AGAIN => continue,
                Err(err) => return err_at!(IoFail, Err(err), "write {:?}", self.loc),
            }
        }
        Ok(())
    }

    /// Gather-write `iov` at `offset`. Each iovec batch must complete
    /// in full; a short vector transfer is an I/O error.
    pub fn write_vec(&self, mut offset: u64, iov: &[IoSlice]) -> Result<()> {
        let mut iov = iov;
        while !iov.is_empty() {
            let count = iov.len().min(UIO_MAXIOV);
            let batch = &iov[..count];
            let want: usize = batch.iter().map(|v| v.len()).sum();

            let n = loop {
                match rustix::io::pwritev(&self.file, batch, offset) {
                    Ok(n) => break n,
                    Err(err) if err == Errno::INTR || err == Errno::AGAIN => continue,
                    Err(err) => return err_at!(IoFail, Err(err), "writev {:?}", self.loc),
                }
            };
            if n != want {
                return err_at!(Fatal, msg: "partial-wr {:?} {}/{}", self.loc, n, want);
            }

            iov = &iov[count..];
            offset += want as u64;
        }
        Ok(())
    }

    /// Scatter-read into `iov` at `offset`.
    pub fn read_vec(&self, mut offset: u64, iov: &mut [IoSliceMut]) -> Result<()> {
        let mut start = 0;
        while start < iov.len() {
            let count = (iov.len() - start).min(UIO_MAXIOV);
            let batch = &mut iov[start..start + count];
            let want: usize = batch.iter().map(|v| v.len()).sum();

            let n = loop {
                match rustix::io::preadv(&self.file, batch, offset) {
                    Ok(n) => break n,
                    Err(err) if err == Errno::INTR || err == Errno::AGAIN => continue,
                    Err(err) => return err_at!(IoFail, Err(err), "readv {:?}", self.loc),
                }
            };
            if n != want {
                return err_at!(IoFail, msg: "short read {:?} {}/{}", self.loc, n, want);
            }

            start += count;
            offset += want as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "dev_test.rs"]
mod dev_test;
