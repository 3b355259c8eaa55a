// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Error type shared by every component of the engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the storage engine.
///
/// Every fallible operation in the crate returns this type (or a `Result`
/// alias over it).
#[derive(Debug, Error)]
pub enum Error {
    /// Sector address out of range, unallocated, or otherwise not usable.
    #[error("invalid sector address {0:#x}")]
    InvalidSector(u32),

    /// `word_offset + n_words` exceeded the sector payload.
    #[error("offset {offset} + len {len} exceeds sector payload of {capacity} words")]
    OutOfBounds {
        offset: u32,
        len: u32,
        capacity: u32,
    },

    /// Caller-provided buffer was smaller than the requested word count.
    #[error("buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    /// The RAM allocator and the disk spill path both failed to produce a
    /// sector.
    #[error("no free sectors available (ram and disk tiers both exhausted)")]
    NoFreeSectors,

    /// A disk file failed header or checksum validation.
    #[error("corrupt data store file {path:?}: {reason}")]
    DataCorrupt { path: PathBuf, reason: String },

    /// Underlying filesystem failure.
    #[error("I/O error at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The filesystem rejected a write with `ENOSPC`.
    #[error("disk full while writing {path:?}")]
    DiskFull { path: PathBuf },

    /// The operation was aborted because cancellation was requested.
    #[error("operation cancelled")]
    Cancelled,

    /// A chain walk detected a cycle or a link into a non-allocated sector.
    #[error("chain corruption in stream {stream}: {reason}")]
    ChainCorrupt { stream: u16, reason: &'static str },

    /// The stream identifier is not registered with the engine.
    #[error("unknown stream {0}")]
    UnknownStream(u16),

    /// `EngineConfig` failed validation.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(&'static str),

    /// A double-free was detected on an already-free sector.
    #[error("double free of sector {0:#x}")]
    DoubleFree(u32),
}

impl Error {
    /// Wraps a `std::io::Error`, upgrading it to [`Error::DiskFull`] when the
    /// OS reports `ENOSPC`. This is the one place in the crate that performs
    /// this classification (the disk file layer calls it at every write
    /// site) so the mapping cannot drift between call sites.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.raw_os_error() == Some(libc_enospc()) {
            Error::DiskFull { path }
        } else {
            Error::Io { path, source }
        }
    }
}

/// `ENOSPC` on every platform this crate is expected to run on (Linux/macOS
/// share the value; kept as a function rather than a `libc` dependency since
/// it is the only constant the crate needs from that crate).
const fn libc_enospc() -> i32 {
    28
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enospc_is_classified_as_disk_full() {
        let io_err = io::Error::from_raw_os_error(28);
        assert!(matches!(
            Error::from_io("x.imx", io_err),
            Error::DiskFull { .. }
        ));
    }

    #[test]
    fn other_io_errors_pass_through() {
        let io_err = io::Error::from_raw_os_error(13); // EACCES
        assert!(matches!(Error::from_io("x.imx", io_err), Error::Io { .. }));
    }
}
