//! Backend adapter over the blocking NBD client.

use std::io::SeekFrom;

use ::nbd::client::Client;
use tracing::debug;

use crate::uri::NbdAddress;
use crate::{Backend, Error, Extent, Mode, Options, Result};

/// Backend for `nbd:` image URLs.
pub struct NbdBackend {
    // None once closed.
    client: Option<Client>,
    mode: Mode,
    sparse: bool,
    position: u64,
    dirty: bool,
}

impl NbdBackend {
    /// Connects to the export named by the address.
    pub fn connect(address: &NbdAddress, mode: Mode, options: &Options) -> Result<Self> {
        let client = match address {
            NbdAddress::Unix { path, export } => Client::connect_unix(path, export)?,
            NbdAddress::Tcp { host, port, export } => {
                Client::connect_tcp((host.as_str(), *port), export)?
            }
        };
        if mode.writable() && !client.writable() {
            return Err(Error::Unsupported("write to read-only export"));
        }
        debug!(size = client.export_size(), "connected nbd backend");
        // Punching holes needs write-zeroes support on the server.
        let sparse = options.sparse && client_can_punch(&client);
        Ok(Self {
            client: Some(client),
            mode,
            sparse,
            position: 0,
            dirty: false,
        })
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client.as_mut().ok_or(Error::Closed)
    }
}

fn client_can_punch(client: &Client) -> bool {
    client.can_zero() || client.can_trim()
}

impl Backend for NbdBackend {
    fn name(&self) -> &'static str {
        "nbd"
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
        match &self.client {
            Some(client) => u64::from(client.block_size()),
            None => 4096,
        }
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.readable() {
            return Err(Error::Unsupported("read"));
        }
        let position = self.position;
        let client = self.client()?;
        let size = client.export_size();
        if position >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - position) as usize);
        client.read_at(position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.mode.writable() {
            return Err(Error::Unsupported("write"));
        }
        let position = self.position;
        self.client()?.write_at(position, buf)?;
        self.position += buf.len() as u64;
        self.dirty = true;
        Ok(buf.len())
    }

    fn zero(&mut self, count: u64) -> Result<u64> {
        if !self.mode.writable() {
            return Err(Error::Unsupported("write"));
        }
        let position = self.position;
        let punch = self.sparse;
        let client = self.client()?;
        match client.zero(position, count, punch) {
            Ok(()) => {}
            Err(::nbd::Error::Unsupported(_)) => {
                // Old server without write-zeroes; send plain writes.
                write_zeroes(client, position, count)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.position += count;
        self.dirty = true;
        Ok(count)
    }

    fn trim(&mut self, count: u64) -> Result<u64> {
        if !self.mode.writable() {
            return Err(Error::Unsupported("write"));
        }
        let position = self.position;
        let client = self.client()?;
        if client.can_trim() {
            client.trim(position, count)?;
            self.position += count;
            self.dirty = true;
            Ok(count)
        } else {
            self.zero(count)
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.client()?.flush()?;
        self.dirty = false;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        if self.client.is_none() {
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
        Ok(self.client()?.export_size())
    }

    fn extents(&mut self, offset: u64, length: u64) -> Result<Vec<Extent>> {
        let client = self.client()?;
        let size = client.export_size();
        if offset >= size || length == 0 {
            return Ok(Vec::new());
        }
        let length = length.min(size - offset);
        if !client.can_extents() {
            return Ok(vec![Extent {
                start: offset,
                length,
                zero: false,
            }]);
        }
        ::nbd::extents(client, offset, Some(length))
            .map(|extent| {
                let extent = extent?;
                Ok(Extent {
                    start: extent.start,
                    length: extent.length,
                    zero: extent.zero,
                })
            })
            .collect()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut client) = self.client.take() {
            client.close()?;
        }
        Ok(())
    }
}

fn write_zeroes(client: &mut Client, mut position: u64, mut count: u64) -> Result<()> {
    const CHUNK: u64 = 1024 * 1024;
    let zeroes = vec![0u8; CHUNK.min(count) as usize];
    while count > 0 {
        let step = count.min(CHUNK);
        client.write_at(position, &zeroes[..step as usize])?;
        position += step;
        count -= step;
    }
    Ok(())
}
