#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `storage` is the uniform byte-addressable backend layer of the image
//! daemon. A [`Backend`] drives exactly one image (a regular file, a block
//! device, a remote NBD export, or an in-process buffer) and exposes the
//! same surface to the transfer engine regardless of what sits underneath:
//! positioned reads and writes, sparse-aware zeroing and discard, durable
//! flush, and allocation extent enumeration.
//!
//! # Design
//!
//! Backends are tagged variants behind one trait, not an inheritance chain:
//!
//! - [`file::FileBackend`] wraps a POSIX file descriptor. It covers both
//!   regular files and block devices; the block path swaps `fallocate` for
//!   the `BLKZEROOUT`/`BLKDISCARD` ioctls and reads its size from the
//!   kernel. Optional `O_DIRECT` mode expects the caller to supply buffers
//!   aligned with [`aligned::AlignedBuffer`].
//! - [`nbd::NbdBackend`] adapts the blocking NBD client.
//! - [`memory::MemoryBackend`] backs tests and the `memory:` image URL.
//!
//! [`open`] parses an [`uri::ImageUrl`] and picks the variant. Backends are
//! never shared between connections; each HTTP connection owns its instance.
//!
//! # Invariants
//!
//! - `readinto` returns fewer bytes than requested only at end of file.
//! - `zero(n)` always results in `n` bytes reading back as zero, whether the
//!   backend punched a hole, used a zeroing ioctl, or wrote zero buffers.
//! - Every mutating call sets the `dirty` bit; only `flush` clears it.
//! - `close` is idempotent; any other call on a closed backend fails with
//!   [`Error::Closed`].
//! - Interrupted syscalls are retried transparently; callers never see
//!   `EINTR`.

pub mod aligned;
pub mod file;
pub mod memory;
pub mod nbd;
pub mod qemu_img;
pub mod uri;
pub mod util;

use std::io;
use std::io::SeekFrom;

use thiserror::Error;

pub use aligned::AlignedBuffer;
pub use uri::ImageUrl;

/// Errors returned by backend operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Raw OS error, propagated unchanged for the HTTP layer to translate.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The backend was closed and cannot serve further calls.
    #[error("backend is closed")]
    Closed,

    /// The backend was opened without the capability for this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The image URL does not name a known backend.
    #[error("invalid image url: {0}")]
    InvalidUrl(String),

    /// Failure reported by the remote NBD server.
    #[error(transparent)]
    Nbd(#[from] ::nbd::Error),
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Access mode a backend is opened with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Read-only.
    Read,
    /// Write-only.
    Write,
    /// Read and write.
    ReadWrite,
}

impl Mode {
    /// Whether reads are permitted.
    #[must_use]
    pub const fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether writes are permitted.
    #[must_use]
    pub const fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// A contiguous image region known to be either data or all zeroes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// Offset of the first byte.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// Whether the region reads as zeroes.
    pub zero: bool,
}

/// Options shared by [`open`] and the individual backend constructors.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Open files with `O_DIRECT`, bypassing the page cache. Callers must
    /// supply buffers aligned to [`Backend::block_size`].
    pub direct: bool,
    /// Allow zero and trim to deallocate instead of writing zeroes.
    pub sparse: bool,
}

/// Uniform I/O surface over one image.
pub trait Backend: Send {
    /// Short backend name used in logs (`"file"`, `"nbd"`, `"memory"`).
    fn name(&self) -> &'static str;

    /// Whether the backend was opened for reading.
    fn readable(&self) -> bool;

    /// Whether the backend was opened for writing.
    fn writable(&self) -> bool;

    /// Whether zero and trim may deallocate storage.
    fn sparse(&self) -> bool;

    /// Whether there are writes not yet committed by [`flush`](Self::flush).
    fn dirty(&self) -> bool;

    /// Required buffer alignment when the backend is in direct mode, and a
    /// hint for efficient transfer sizes otherwise.
    fn block_size(&self) -> u64;

    /// Reads into `buf` at the current position, advancing it. Returns the
    /// number of bytes read; short counts happen only at end of file.
    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` at the current position, advancing it. May write fewer
    /// bytes than given; callers loop.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Produces `count` zero bytes at the current position, advancing it.
    fn zero(&mut self, count: u64) -> Result<u64>;

    /// Discards `count` bytes at the current position, advancing it. Equal
    /// to [`zero`](Self::zero) for backends that cannot deallocate.
    fn trim(&mut self, count: u64) -> Result<u64>;

    /// Commits all completed writes to durable storage.
    fn flush(&mut self) -> Result<()>;

    /// Returns the current position.
    fn tell(&mut self) -> Result<u64>;

    /// Moves the current position.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Total size of the backing image in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Enumerates allocation extents intersecting
    /// `[offset, offset + length)`, clipped to the image size. Backends
    /// without allocation information report one data extent.
    fn extents(&mut self, offset: u64, length: u64) -> Result<Vec<Extent>>;

    /// Releases the backend. Idempotent; later calls fail with
    /// [`Error::Closed`].
    fn close(&mut self) -> Result<()>;
}

/// Opens the backend named by an image URL.
pub fn open(url: &ImageUrl, mode: Mode, options: &Options) -> Result<Box<dyn Backend>> {
    match url {
        ImageUrl::File(path) => Ok(Box::new(file::FileBackend::open(path, mode, options)?)),
        ImageUrl::Nbd(address) => Ok(Box::new(nbd::NbdBackend::connect(address, mode, options)?)),
        ImageUrl::Memory => Ok(Box::new(memory::MemoryBackend::new(mode))),
    }
}
