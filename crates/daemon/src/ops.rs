//! Streaming transfer operations.
//!
//! An [`Operation`] binds one authorized ticket handle to one backend for
//! the duration of one request. It owns the transfer buffer (aligned for
//! direct I/O) and the phase clock, checks for cancellation between chunks,
//! and reports how many bytes it actually moved so the handler can merge
//! the accessed range into the ticket on success and error paths alike.

use std::io::SeekFrom;

use checksums::{Algorithm, Blkhash, Checksum};
use measure::Range;
use storage::util::is_zero;
use storage::{AlignedBuffer, Backend, Extent};

use crate::auth::Authorized;
use crate::clock::Clock;
use crate::errors::{Error, Failure};
use crate::server::Connection;

/// One request's streaming state.
pub struct Operation<'a> {
    handle: Authorized,
    backend: &'a mut dyn Backend,
    buffer: AlignedBuffer,
    clock: Clock,
    offset: u64,
    length: u64,
    done: u64,
}

impl<'a> Operation<'a> {
    /// Creates an operation over the handle's authorized range.
    ///
    /// The buffer is aligned for the backend's direct I/O requirements and
    /// reused for every chunk.
    #[must_use]
    pub fn new(handle: Authorized, backend: &'a mut dyn Backend, buffer_size: usize) -> Self {
        let align = usize::try_from(backend.block_size()).unwrap_or(4096).max(4096);
        let offset = handle.offset();
        let length = handle.length();
        let mut clock = Clock::new();
        clock.start("request");
        Self {
            handle,
            backend,
            buffer: AlignedBuffer::new(buffer_size.max(align), align),
            clock,
            offset,
            length,
            done: 0,
        }
    }

    /// Streams the authorized range into the response body.
    ///
    /// Holes reported by the backend are emitted as zero bytes without
    /// touching storage; a backend shorter than the range is padded with
    /// zeroes so the response always matches its Content-Length.
    pub fn read_to(&mut self, conn: &mut Connection) -> Result<(), Failure> {
        let end = self.offset + self.length;
        let mut extents = self.backend.extents(self.offset, self.length)?;
        // The tail past the backend's last extent reads as zeroes.
        let covered = extents.last().map_or(self.offset, |e| e.start + e.length);
        if covered < end {
            extents.push(Extent {
                start: covered,
                length: end - covered,
                zero: true,
            });
        }

        let zeroes = vec![0u8; self.buffer.len()];
        for extent in extents {
            if extent.zero {
                let mut remaining = extent.length;
                while remaining > 0 {
                    let n = chunk_len(&self.buffer, remaining);
                    conn.write_body(&zeroes[..n])?;
                    self.done += n as u64;
                    remaining -= n as u64;
                    self.handle.check_cancel()?;
                }
            } else {
                self.backend.seek(SeekFrom::Start(extent.start))?;
                let mut remaining = extent.length;
                while remaining > 0 {
                    let n = chunk_len(&self.buffer, remaining);
                    self.clock.start("read");
                    let read = self.backend.readinto(&mut self.buffer[..n]);
                    self.clock.stop("read");
                    let read = read?;
                    if read == 0 {
                        // Image shrank under us; the tail reads as zeroes.
                        break;
                    }
                    conn.write_body(&self.buffer[..read])?;
                    self.done += read as u64;
                    remaining -= read as u64;
                    self.handle.check_cancel()?;
                }
                while remaining > 0 {
                    let n = chunk_len(&self.buffer, remaining);
                    conn.write_body(&zeroes[..n])?;
                    self.done += n as u64;
                    remaining -= n as u64;
                }
            }
        }
        conn.flush()?;
        Ok(())
    }

    /// Streams the request body into the backend.
    ///
    /// When the ticket is sparse and the backend can deallocate, chunks
    /// that are entirely zero become `zero()` calls instead of writes, the
    /// way `dd conv=sparse` behaves.
    pub fn write_from(&mut self, conn: &mut Connection, flush: bool) -> Result<(), Failure> {
        self.backend.seek(SeekFrom::Start(self.offset))?;
        let sparse = self.handle.sparse() && self.backend.sparse();

        loop {
            let want = chunk_len(&self.buffer, self.length - self.done);
            if want == 0 {
                // The authorized range is full; any extra body byte is an
                // oversized payload.
                let mut probe = [0u8; 1];
                if conn.read_body(&mut probe)? > 0 {
                    return Err(Error::payload_too_large(
                        "body exceeds the requested range",
                    )
                    .into());
                }
                break;
            }
            let n = conn.read_body(&mut self.buffer[..want])?;
            if n == 0 {
                break;
            }
            if sparse && is_zero(&self.buffer[..n]) {
                self.clock.start("zero");
                let zeroed = self.backend.zero(n as u64);
                self.clock.stop("zero");
                zeroed?;
            } else {
                self.clock.start("write");
                let written = self.write_all(n);
                self.clock.stop("write");
                written?;
            }
            self.done += n as u64;
            self.handle.check_cancel()?;
        }

        if flush {
            self.sync()?;
        }
        Ok(())
    }

    /// Zeroes the authorized range.
    pub fn zero(&mut self, flush: bool) -> Result<(), Failure> {
        self.backend.seek(SeekFrom::Start(self.offset))?;
        self.clock.start("zero");
        let zeroed = self.backend.zero(self.length);
        self.clock.stop("zero");
        zeroed?;
        self.done = self.length;
        self.handle.check_cancel()?;
        if flush {
            self.sync()?;
        }
        Ok(())
    }

    /// Flushes the backend.
    pub fn flush(&mut self) -> Result<(), Failure> {
        self.sync()
    }

    /// Fingerprints the whole image using extent information for the zero
    /// fast path. Does not count toward the ticket's transferred bytes.
    pub fn checksum(&mut self, algorithm: Algorithm) -> Result<Checksum, Failure> {
        let size = self.backend.size()?;
        let mut extents = self.backend.extents(0, size)?;
        let covered = extents.last().map_or(0, |e| e.start + e.length);
        if covered < size {
            extents.push(Extent {
                start: covered,
                length: size - covered,
                zero: true,
            });
        }

        let mut hash = Blkhash::new(algorithm, checksums::blkhash::BLOCK_SIZE);
        for extent in extents {
            if extent.zero {
                hash.zero(extent.length);
                self.handle.check_cancel()?;
                continue;
            }
            self.backend.seek(SeekFrom::Start(extent.start))?;
            let mut remaining = extent.length;
            while remaining > 0 {
                let n = chunk_len(&self.buffer, remaining);
                self.clock.start("read");
                let read = self.backend.readinto(&mut self.buffer[..n]);
                self.clock.stop("read");
                let read = read?;
                if read == 0 {
                    hash.zero(remaining);
                    break;
                }
                hash.update(&self.buffer[..read]);
                remaining -= read as u64;
                self.handle.check_cancel()?;
            }
        }
        Ok(hash.finalize_checksum())
    }

    /// Finishes the operation: merges the bytes actually moved into the
    /// ticket's accounting and returns the phase clock for logging.
    ///
    /// Must be called on success and error paths; the handler owns the
    /// result either way.
    pub fn finish(mut self) -> Clock {
        self.clock.stop("request");
        self.handle
            .release(Some(Range::new(self.offset, self.offset + self.done)));
        std::mem::take(&mut self.clock)
    }

    fn sync(&mut self) -> Result<(), Failure> {
        self.clock.start("sync");
        let flushed = self.backend.flush();
        self.clock.stop("sync");
        flushed?;
        Ok(())
    }

    fn write_all(&mut self, n: usize) -> Result<(), Failure> {
        let mut written = 0;
        while written < n {
            let w = self.backend.write(&self.buffer[written..n])?;
            if w == 0 {
                return Err(Failure::Response(Error::internal(
                    "backend refused to accept bytes",
                )));
            }
            written += w;
        }
        Ok(())
    }
}

fn chunk_len(buffer: &AlignedBuffer, remaining: u64) -> usize {
    usize::try_from(remaining.min(buffer.len() as u64)).unwrap_or(buffer.len())
}
