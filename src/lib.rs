//! Deltafs is a copy-on-write filesystem engine. The volume is a flat
//! array of fixed-size blocks; on top of it the engine keeps a block
//! cache with an explicit state machine, copy-on-write btrees for file
//! extents and inode attributes, and a write-ahead log of typed intent
//! records. Changes are committed in atomic units called *deltas*;
//! every few deltas a *unify* cycle truncates the log by re-logging the
//! still-needed deferred frees and reclaiming the old log blocks.
//!
//! Crash consistency comes from ordering, not locking: dirty metadata
//! blocks get fresh physical addresses (redirect) before their first
//! modification in a delta, log blocks are written before the
//! superblock that references them, and a superblock that was never
//! written leaves the old tree fully intact. On mount, [Fs::open]
//! replays the log chain to reconstruct the allocator, the deferred
//! free queues and the in-memory btree node cache.
//!
//! The engine is single-threaded cooperative. Frontend operations
//! bracket themselves in a change window which pins the current delta;
//! the backend flusher runs at delta transition and never overlaps a
//! frontend mutation, because the frontend forks any buffer that is
//! still dirty for the delta being flushed.

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use deltafs::Error;
/// err_at!(IoFail, msg: "failed {}", "reason");
/// err_at!(IoFail, std::io::read(buf));
/// err_at!(IoFail, std::fs::read(file_path), "reading file");
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Fail decode when `buf` has fewer than `want` bytes left.
#[macro_export]
macro_rules! check_remaining {
    ($buf:expr, $want:expr, $msg:expr) => {
        if $buf.len() < $want {
            err_at!(Corrupt, msg: "insufficient input {} {}/{}", $msg, $buf.len(), $want)
        } else {
            Ok(())
        }
    };
}

pub mod types;

pub mod balloc;
pub mod btree;
pub mod buffer;
pub mod commit;
pub mod dev;
pub mod filemap;
pub mod fs;
pub mod iattr;
pub mod inode;
pub mod super_block;
pub mod wal;

pub use crate::fs::{FormatOpts, Fs};
pub use crate::types::{BlockNum, Inum, Key};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and the error message.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Device I/O failed, or completed short.
    IoFail(String, String),
    /// Buffer pool exhausted.
    NoMemory(String, String),
    /// Block allocation failed at capacity.
    NoSpace(String, String),
    /// Offset and length exceed the volume's file size limit.
    TooBig(String, String),
    /// Another live inode with the same identity exists.
    Busy(String, String),
    /// Missing inode attribute slot.
    NotFound(String, String),
    /// On-disk structure failed a sanity check.
    Corrupt(String, String),
    /// Conditions that a correct volume never produces.
    Fatal(String, String),
}

impl Error {
    /// The POSIX errno this error maps onto; negate for a C-style
    /// return value.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::IoFail(_, _) => 5,    // EIO
            Error::NoMemory(_, _) => 12, // ENOMEM
            Error::NoSpace(_, _) => 28,  // ENOSPC
            Error::TooBig(_, _) => 27,   // EFBIG
            Error::Busy(_, _) => 16,     // EBUSY
            Error::NotFound(_, _) => 2,  // ENOENT
            Error::Corrupt(_, _) => 5,   // EIO
            Error::Fatal(_, _) => 5,     // EIO
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            IoFail(p, m) => write!(f, "IoFail:{} {}", p, m),
            NoMemory(p, m) => write!(f, "NoMemory:{} {}", p, m),
            NoSpace(p, m) => write!(f, "NoSpace:{} {}", p, m),
            TooBig(p, m) => write!(f, "TooBig:{} {}", p, m),
            Busy(p, m) => write!(f, "Busy:{} {}", p, m),
            NotFound(p, m) => write!(f, "NotFound:{} {}", p, m),
            Corrupt(p, m) => write!(f, "Corrupt:{} {}", p, m),
            Fatal(p, m) => write!(f, "Fatal:{} {}", p, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
