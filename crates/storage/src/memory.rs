//! In-process backend for tests and the `memory:` image URL.
//!
//! Every open creates a fresh, empty buffer; state lives only as long as the
//! backend instance. Writes past the end grow the buffer, zero-filling any
//! gap, the way a regular file grows under positioned writes.

use std::io::SeekFrom;

use crate::{Backend, Error, Extent, Mode, Result};

/// Growable in-memory image.
pub struct MemoryBackend {
    // None once closed.
    buf: Option<Vec<u8>>,
    position: u64,
    mode: Mode,
    dirty: bool,
}

impl MemoryBackend {
    /// Creates an empty backend with the given access mode.
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            buf: Some(Vec::new()),
            position: 0,
            mode,
            dirty: false,
        }
    }

    /// Creates a read-write backend over existing bytes, for tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            buf: Some(data),
            position: 0,
            mode: Mode::ReadWrite,
            dirty: false,
        }
    }

    /// Borrows the current contents, for test assertions.
    pub fn data(&self) -> Result<&[u8]> {
        self.buf.as_deref().ok_or(Error::Closed)
    }

    fn buf(&mut self) -> Result<&mut Vec<u8>> {
        self.buf.as_mut().ok_or(Error::Closed)
    }

    fn check_readable(&self) -> Result<()> {
        if self.buf.is_none() {
            return Err(Error::Closed);
        }
        if !self.mode.readable() {
            return Err(Error::Unsupported("read"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.buf.is_none() {
            return Err(Error::Closed);
        }
        if !self.mode.writable() {
            return Err(Error::Unsupported("write"));
        }
        Ok(())
    }

    fn splice(&mut self, data_len: usize, fill: Option<&[u8]>) -> Result<usize> {
        let position = self.position as usize;
        let buf = self.buf()?;
        let end = position + data_len;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        if let Some(data) = fill {
            buf[position..end].copy_from_slice(data);
        } else {
            buf[position..end].fill(0);
        }
        self.position = end as u64;
        self.dirty = true;
        Ok(data_len)
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn readable(&self) -> bool {
        self.mode.readable()
    }

    fn writable(&self) -> bool {
        self.mode.writable()
    }

    fn sparse(&self) -> bool {
        false
    }

    fn dirty(&self) -> bool {
        self.dirty
    }

    fn block_size(&self) -> u64 {
        1
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_readable()?;
        let position = self.position as usize;
        let data = self.buf.as_deref().ok_or(Error::Closed)?;
        if position >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - position);
        buf[..n].copy_from_slice(&data[position..position + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_writable()?;
        self.splice(buf.len(), Some(buf))
    }

    fn zero(&mut self, count: u64) -> Result<u64> {
        self.check_writable()?;
        self.splice(count as usize, None)?;
        Ok(count)
    }

    fn trim(&mut self, count: u64) -> Result<u64> {
        self.zero(count)
    }

    fn flush(&mut self) -> Result<()> {
        if self.buf.is_none() {
            return Err(Error::Closed);
        }
        self.dirty = false;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        if self.buf.is_none() {
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
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of image",
            ))),
        }
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.buf.as_deref().ok_or(Error::Closed)?.len() as u64)
    }

    fn extents(&mut self, offset: u64, length: u64) -> Result<Vec<Extent>> {
        let size = self.size()?;
        if offset >= size {
            return Ok(Vec::new());
        }
        let length = length.min(size - offset);
        Ok(vec![Extent {
            start: offset,
            length,
            zero: false,
        }])
    }

    fn close(&mut self) -> Result<()> {
        self.buf = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryBackend;
    use crate::{Backend, Error, Mode};

    #[test]
    fn write_then_read_round_trip() {
        let mut backend = MemoryBackend::new(Mode::ReadWrite);
        assert_eq!(backend.write(b"hello, world").unwrap(), 12);
        backend.seek(std::io::SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(backend.readinto(&mut buf).unwrap(), 12);
        assert_eq!(&buf, b"hello, world");
    }

    #[test]
    fn read_at_end_returns_zero_bytes() {
        let mut backend = MemoryBackend::with_data(b"data".to_vec());
        backend.seek(std::io::SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(backend.readinto(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let mut backend = MemoryBackend::new(Mode::ReadWrite);
        backend.seek(std::io::SeekFrom::Start(4)).unwrap();
        backend.write(b"xy").unwrap();
        assert_eq!(backend.data().unwrap(), b"\0\0\0\0xy");
    }

    #[test]
    fn zero_then_read_returns_zeroes() {
        let mut backend = MemoryBackend::with_data(vec![0xFF; 8]);
        assert_eq!(backend.zero(8).unwrap(), 8);
        backend.seek(std::io::SeekFrom::Start(0)).unwrap();
        let mut buf = [0xAAu8; 8];
        backend.readinto(&mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn read_only_mode_rejects_writes() {
        let mut backend = MemoryBackend::new(Mode::Read);
        assert!(matches!(
            backend.write(b"x"),
            Err(Error::Unsupported("write"))
        ));
        assert!(matches!(backend.zero(1), Err(Error::Unsupported("write"))));
    }

    #[test]
    fn write_only_mode_rejects_reads() {
        let mut backend = MemoryBackend::new(Mode::Write);
        let mut buf = [0u8; 1];
        assert!(matches!(
            backend.readinto(&mut buf),
            Err(Error::Unsupported("read"))
        ));
    }

    #[test]
    fn dirty_tracks_writes_and_flush() {
        let mut backend = MemoryBackend::new(Mode::ReadWrite);
        assert!(!backend.dirty());
        backend.write(b"x").unwrap();
        assert!(backend.dirty());
        backend.flush().unwrap();
        assert!(!backend.dirty());
    }

    #[test]
    fn close_is_idempotent_and_blocks_io() {
        let mut backend = MemoryBackend::new(Mode::ReadWrite);
        backend.close().unwrap();
        backend.close().unwrap();
        assert!(matches!(backend.write(b"x"), Err(Error::Closed)));
        assert!(matches!(backend.flush(), Err(Error::Closed)));
        assert!(matches!(backend.size(), Err(Error::Closed)));
    }

    #[test]
    fn extents_clip_to_size() {
        let mut backend = MemoryBackend::with_data(vec![1; 100]);
        let extents = backend.extents(40, 1000).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].start, 40);
        assert_eq!(extents[0].length, 60);
        assert!(!extents[0].zero);
        assert!(backend.extents(100, 10).unwrap().is_empty());
    }
}
