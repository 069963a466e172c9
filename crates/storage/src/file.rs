//! POSIX file and block device backend.
//!
//! Regular files and block devices share one implementation; the block path
//! swaps `fallocate` for the zero-out and discard ioctls and reads the
//! device size from the kernel instead of `stat`. Positioned I/O keeps the
//! kernel file offset untouched so the extent probe can reuse it.
#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::util::uninterruptible;
use crate::{Backend, Error, Extent, Mode, Options, Result};

// Block device ioctls, values from <linux/fs.h>; the libc crate does not
// export them.
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
const BLKSSZGET: libc::c_ulong = 0x1268;
const BLKDISCARD: libc::c_ulong = 0x1277;
const BLKZEROOUT: libc::c_ulong = 0x127f;

// Copy size for the dense zeroing fallback.
const ZERO_BUF_SIZE: usize = 128 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Kind {
    Regular,
    Block,
}

/// Backend for `file:` image URLs.
pub struct FileBackend {
    // None once closed.
    file: Option<File>,
    path: PathBuf,
    mode: Mode,
    kind: Kind,
    direct: bool,
    sparse: bool,
    sector: u64,
    position: u64,
    dirty: bool,
}

impl FileBackend {
    /// Opens a regular file or block device.
    pub fn open(path: &Path, mode: Mode, options: &Options) -> Result<Self> {
        let mut open_options = OpenOptions::new();
        open_options
            .read(mode.readable())
            .write(mode.writable());
        if options.direct {
            open_options.custom_flags(libc::O_DIRECT);
        }
        let file = open_options.open(path)?;

        let metadata = file.metadata()?;
        let kind = if metadata.file_type().is_block_device() {
            Kind::Block
        } else {
            Kind::Regular
        };
        let sector = match kind {
            Kind::Block => u64::from(ioctl_int(&file, BLKSSZGET)?),
            Kind::Regular => 512,
        };

        debug!(
            path = %path.display(),
            ?kind,
            direct = options.direct,
            sparse = options.sparse,
            "opened file backend"
        );
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            mode,
            kind,
            direct: options.direct,
            // Only a filesystem can deallocate; block devices stay dense.
            sparse: options.sparse && kind == Kind::Regular,
            sector,
            position: 0,
            dirty: false,
        })
    }

    /// Path the backend was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_readable(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::Closed);
        }
        if !self.mode.readable() {
            return Err(Error::Unsupported("read"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::Closed);
        }
        if !self.mode.writable() {
            return Err(Error::Unsupported("write"));
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        match self.kind {
            Kind::Regular => "file",
            Kind::Block => "block",
        }
    }

    fn readable(&self) -> bool {
        self.mode.readable()
    }

    fn writable(&self) -> bool {
        self.mode.writable()
    }

    fn sparse(&self) -> bool {
        self.sparse
    }

    fn dirty(&self) -> bool {
        self.dirty
    }

    fn block_size(&self) -> u64 {
        self.sector
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_readable()?;
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        let mut total = 0;
        while total < buf.len() {
            let offset = self.position + total as u64;
            let n = uninterruptible(|| file.read_at(&mut buf[total..], offset))?;
            if n == 0 {
                break;
            }
            total += n;
        }
        self.position += total as u64;
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let position = self.position;
        let unaligned = self.direct
            && (position % self.sector != 0 || buf.len() as u64 % self.sector != 0);
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        let n = if unaligned {
            // The tail of an image rarely ends on a sector boundary; drop
            // O_DIRECT for this one write and restore it afterwards.
            write_dropping_direct(file, buf, position)?
        } else {
            uninterruptible(|| file.write_at(buf, position))?
        };
        self.position += n as u64;
        self.dirty = true;
        Ok(n)
    }

    fn zero(&mut self, count: u64) -> Result<u64> {
        self.check_writable()?;
        let position = self.position;
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        match self.kind {
            Kind::Regular => {
                let mode = if self.sparse {
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE
                } else {
                    libc::FALLOC_FL_ZERO_RANGE
                };
                match fallocate(file, mode, position, count) {
                    Ok(()) => {
                        if self.sparse {
                            // Punching keeps the size; extend when zeroing
                            // past the current end.
                            let end = position + count;
                            if file.metadata()?.len() < end {
                                file.set_len(end)?;
                            }
                        }
                    }
                    Err(e) if fallocate_unsupported(&e) => {
                        write_zeroes(file, position, count)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Kind::Block => {
                if let Err(e) = range_ioctl(file, BLKZEROOUT, position, count) {
                    if !ioctl_unsupported(&e) {
                        return Err(e.into());
                    }
                    write_zeroes(file, position, count)?;
                }
            }
        }
        self.position += count;
        self.dirty = true;
        Ok(count)
    }

    fn trim(&mut self, count: u64) -> Result<u64> {
        self.check_writable()?;
        let position = self.position;
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        match self.kind {
            Kind::Regular => {
                let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
                if let Err(e) = fallocate(file, mode, position, count) {
                    if !fallocate_unsupported(&e) {
                        return Err(e.into());
                    }
                    write_zeroes(file, position, count)?;
                }
            }
            Kind::Block => {
                // Discard is advisory; fall back to explicit zeroing so the
                // range always reads back as zeroes.
                if range_ioctl(file, BLKDISCARD, position, count).is_err()
                    && range_ioctl(file, BLKZEROOUT, position, count).is_err()
                {
                    write_zeroes(file, position, count)?;
                }
            }
        }
        self.position += count;
        self.dirty = true;
        Ok(count)
    }

    fn flush(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        uninterruptible(|| file.sync_data())?;
        self.dirty = false;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        if self.file.is_none() {
            return Err(Error::Closed);
        }
        Ok(self.position)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.size()?;
        let new = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match new {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of image",
            ))),
        }
    }

    fn size(&mut self) -> Result<u64> {
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        match self.kind {
            Kind::Regular => Ok(file.metadata()?.len()),
            Kind::Block => Ok(ioctl_u64(file, BLKGETSIZE64)?),
        }
    }

    fn extents(&mut self, offset: u64, length: u64) -> Result<Vec<Extent>> {
        let size = self.size()?;
        if offset >= size || length == 0 {
            return Ok(Vec::new());
        }
        let end = (offset + length).min(size);
        let file = self.file.as_ref().ok_or(Error::Closed)?;

        if self.kind == Kind::Block {
            return Ok(vec![Extent {
                start: offset,
                length: end - offset,
                zero: false,
            }]);
        }

        let mut extents = Vec::new();
        let mut cursor = offset;
        while cursor < end {
            let data_start = match probe(file, cursor, libc::SEEK_DATA) {
                Ok(found) => found,
                Err(e) if probe_unsupported(&e) => {
                    // No SEEK_DATA on this filesystem; report everything
                    // within the requested range as data.
                    return Ok(vec![Extent {
                        start: offset,
                        length: end - offset,
                        zero: false,
                    }]);
                }
                Err(e) => return Err(e.into()),
            };
            let Some(data_start) = data_start else {
                // Only a hole remains until end of file.
                extents.push(Extent {
                    start: cursor,
                    length: end - cursor,
                    zero: true,
                });
                break;
            };
            let data_start = data_start.min(end);
            if data_start > cursor {
                extents.push(Extent {
                    start: cursor,
                    length: data_start - cursor,
                    zero: true,
                });
            }
            if data_start >= end {
                break;
            }
            let hole_start = probe(file, data_start, libc::SEEK_HOLE)?
                .unwrap_or(size)
                .min(end);
            extents.push(Extent {
                start: data_start,
                length: hole_start - data_start,
                zero: false,
            });
            cursor = hole_start;
        }
        Ok(extents)
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

fn write_dropping_direct(file: &File, buf: &[u8], position: u64) -> Result<usize> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    set_status_flags(fd, flags & !libc::O_DIRECT)?;
    let result = uninterruptible(|| file.write_at(buf, position));
    let restored = set_status_flags(fd, flags);
    let n = result?;
    restored?;
    Ok(n)
}

fn set_status_flags(fd: libc::c_int, flags: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn write_zeroes(file: &File, mut position: u64, mut count: u64) -> Result<()> {
    let zeroes = vec![0u8; ZERO_BUF_SIZE.min(count as usize).max(1)];
    while count > 0 {
        let step = (count as usize).min(zeroes.len());
        let mut written = 0;
        while written < step {
            let n = uninterruptible(|| {
                file.write_at(&zeroes[written..step], position + written as u64)
            })?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            written += n;
        }
        position += step as u64;
        count -= step as u64;
    }
    Ok(())
}

fn fallocate(file: &File, mode: libc::c_int, offset: u64, length: u64) -> io::Result<()> {
    uninterruptible(|| {
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                mode,
                offset as libc::off_t,
                length as libc::off_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    })
}

fn fallocate_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EOPNOTSUPP | libc::ENOSYS | libc::EINVAL)
    )
}

fn ioctl_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EOPNOTSUPP | libc::ENOTTY | libc::EINVAL)
    )
}

fn probe_unsupported(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINVAL | libc::EOPNOTSUPP))
}

fn ioctl_u64(file: &File, request: libc::c_ulong) -> io::Result<u64> {
    let mut value: u64 = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, &raw mut value) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn ioctl_int(file: &File, request: libc::c_ulong) -> io::Result<u32> {
    let mut value: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, &raw mut value) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value as u32)
}

fn range_ioctl(file: &File, request: libc::c_ulong, offset: u64, length: u64) -> io::Result<()> {
    let range = [offset, length];
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, range.as_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// Probes for the next data or hole offset; Ok(None) means past end of data.
fn probe(file: &File, offset: u64, whence: libc::c_int) -> io::Result<Option<u64>> {
    let rc = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, whence) };
    if rc < 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ENXIO) {
            return Ok(None);
        }
        return Err(e);
    }
    Ok(Some(rc as u64))
}

#[cfg(test)]
mod tests {
    use super::FileBackend;
    use crate::{Backend, Error, Mode, Options};
    use std::io::SeekFrom;
    use tempfile::NamedTempFile;

    fn open_rw(file: &NamedTempFile) -> FileBackend {
        FileBackend::open(file.path(), Mode::ReadWrite, &Options::default()).unwrap()
    }

    #[test]
    fn write_then_read_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = open_rw(&tmp);
        assert_eq!(backend.write(b"hello, world").unwrap(), 12);
        backend.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(backend.readinto(&mut buf).unwrap(), 12);
        assert_eq!(&buf, b"hello, world");
    }

    #[test]
    fn zero_then_read_returns_zeroes() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = open_rw(&tmp);
        backend.write(&[0xFFu8; 65536]).unwrap();
        backend.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(backend.zero(65536).unwrap(), 65536);
        backend.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = vec![0xAAu8; 65536];
        assert_eq!(backend.readinto(&mut buf).unwrap(), 65536);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_zero_keeps_contents_zero() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = FileBackend::open(
            tmp.path(),
            Mode::ReadWrite,
            &Options { direct: false, sparse: true },
        )
        .unwrap();
        backend.write(&[0x55u8; 8192]).unwrap();
        backend.seek(SeekFrom::Start(0)).unwrap();
        backend.zero(8192).unwrap();
        assert_eq!(backend.size().unwrap(), 8192);
        backend.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = vec![1u8; 8192];
        backend.readinto(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_zero_past_end_extends_file() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = FileBackend::open(
            tmp.path(),
            Mode::ReadWrite,
            &Options { direct: false, sparse: true },
        )
        .unwrap();
        backend.zero(4096).unwrap();
        assert_eq!(backend.size().unwrap(), 4096);
    }

    #[test]
    fn read_at_end_returns_zero_bytes() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = open_rw(&tmp);
        backend.write(b"data").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(backend.readinto(&mut buf).unwrap(), 0);
    }

    #[test]
    fn extents_cover_requested_range() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = open_rw(&tmp);
        backend.write(&[1u8; 4096]).unwrap();
        tmp.as_file().set_len(1024 * 1024).unwrap();

        let extents = backend.extents(0, 1024 * 1024).unwrap();
        let mut position = 0;
        for extent in &extents {
            assert_eq!(extent.start, position);
            assert!(extent.length > 0);
            position += extent.length;
        }
        assert_eq!(position, 1024 * 1024);
        assert!(!extents[0].zero, "first extent holds written data");
    }

    #[test]
    fn extents_of_empty_range_are_empty() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = open_rw(&tmp);
        assert!(backend.extents(0, 0).unwrap().is_empty());
        assert!(backend.extents(100, 10).unwrap().is_empty());
    }

    #[test]
    fn dirty_tracks_writes_and_flush() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = open_rw(&tmp);
        assert!(!backend.dirty());
        backend.write(b"x").unwrap();
        assert!(backend.dirty());
        backend.flush().unwrap();
        assert!(!backend.dirty());
    }

    #[test]
    fn close_is_idempotent_and_blocks_io() {
        let tmp = NamedTempFile::new().unwrap();
        let mut backend = open_rw(&tmp);
        backend.close().unwrap();
        backend.close().unwrap();
        assert!(matches!(backend.write(b"x"), Err(Error::Closed)));
        assert!(matches!(backend.size(), Err(Error::Closed)));
    }

    #[test]
    fn read_only_mode_rejects_writes() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut backend = open_rw(&tmp);
            backend.write(b"data").unwrap();
        }
        let mut backend =
            FileBackend::open(tmp.path(), Mode::Read, &Options::default()).unwrap();
        assert!(matches!(
            backend.write(b"x"),
            Err(Error::Unsupported("write"))
        ));
    }

    #[test]
    fn direct_mode_round_trip_when_supported() {
        let tmp = NamedTempFile::new().unwrap();
        let Ok(mut backend) = FileBackend::open(
            tmp.path(),
            Mode::ReadWrite,
            &Options { direct: true, sparse: false },
        ) else {
            // Filesystem without O_DIRECT (tmpfs); nothing to test here.
            return;
        };
        let mut buf = crate::AlignedBuffer::new(4096, 4096);
        buf.fill(0x5A);
        assert_eq!(backend.write(&buf).unwrap(), 4096);
        backend.seek(SeekFrom::Start(0)).unwrap();
        let mut read_buf = crate::AlignedBuffer::new(4096, 4096);
        assert_eq!(backend.readinto(&mut read_buf).unwrap(), 4096);
        assert!(read_buf.iter().all(|&b| b == 0x5A));
    }
}
