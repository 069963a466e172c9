//! Blocking NBD client connection.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use tracing::debug;

use crate::proto::{
    self, ChunkHeader, ClientFlags, CommandFlags, HandshakeFlags, TransmissionFlags,
};
use crate::{Error, Result};

// Largest single command payload we send or request. Big enough to keep the
// pipe busy, small enough that a misbehaving server cannot make us allocate
// unbounded buffers.
const MAX_COMMAND_LENGTH: u64 = 32 * 1024 * 1024;

/// One extent from a `base:allocation` block-status reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawExtent {
    /// Extent length in bytes.
    pub length: u64,
    /// `STATE_HOLE` / `STATE_ZERO` bits.
    pub flags: u32,
}

impl RawExtent {
    /// Whether the extent reads as zeroes.
    #[must_use]
    pub const fn zero(&self) -> bool {
        self.flags & proto::STATE_ZERO != 0
    }
}

enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

// One reply frame: the legacy simple form or a structured chunk. A server
// that negotiated structured replies may still answer data-less commands
// with simple replies.
enum Reply {
    Simple { errno: u32 },
    Chunk(ChunkHeader),
}

/// A connected NBD client in the transmission phase.
pub struct Client {
    stream: Transport,
    export_size: u64,
    flags: TransmissionFlags,
    structured: bool,
    allocation_context: Option<u32>,
    preferred_block_size: u32,
    cookie: u64,
    closed: bool,
}

impl Client {
    /// Connects over TCP and negotiates the named export.
    pub fn connect_tcp<A: ToSocketAddrs>(addr: A, export: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Self::handshake(Transport::Tcp(stream), export)
    }

    /// Connects over a UNIX socket and negotiates the named export.
    pub fn connect_unix<P: AsRef<Path>>(path: P, export: &str) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        Self::handshake(Transport::Unix(stream), export)
    }

    /// Size of the negotiated export in bytes.
    #[must_use]
    pub const fn export_size(&self) -> u64 {
        self.export_size
    }

    /// Preferred I/O size announced by the server, or 4096 when unknown.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        if self.preferred_block_size == 0 {
            4096
        } else {
            self.preferred_block_size
        }
    }

    /// Whether the export is writable.
    #[must_use]
    pub const fn writable(&self) -> bool {
        !self.flags.contains(TransmissionFlags::READ_ONLY)
    }

    /// Whether `NBD_CMD_FLUSH` may be sent.
    #[must_use]
    pub const fn can_flush(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_FLUSH)
    }

    /// Whether `NBD_CMD_WRITE_ZEROES` may be sent.
    #[must_use]
    pub const fn can_zero(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_WRITE_ZEROES)
    }

    /// Whether `NBD_CMD_TRIM` may be sent.
    #[must_use]
    pub const fn can_trim(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_TRIM)
    }

    /// Whether block status was negotiated and extents can be queried.
    #[must_use]
    pub const fn can_extents(&self) -> bool {
        self.allocation_context.is_some()
    }

    fn handshake(stream: Transport, export: &str) -> Result<Self> {
        let mut client = Self {
            stream,
            export_size: 0,
            flags: TransmissionFlags::default(),
            structured: false,
            allocation_context: None,
            preferred_block_size: 0,
            cookie: 0,
            closed: false,
        };

        let magic = client.stream.read_u64::<BE>()?;
        if magic != proto::NBDMAGIC {
            return Err(Error::Protocol(format!("bad handshake magic {magic:#x}")));
        }
        let opt_magic = client.stream.read_u64::<BE>()?;
        if opt_magic != proto::IHAVEOPT {
            return Err(Error::Protocol(
                "server does not speak the newstyle protocol".to_string(),
            ));
        }
        let raw_flags = client.stream.read_u16::<BE>()?;
        let server_flags = HandshakeFlags::from_bits_truncate(raw_flags);
        if !server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            return Err(Error::Protocol(
                "server does not support fixed newstyle".to_string(),
            ));
        }

        let mut client_flags = ClientFlags::FIXED_NEWSTYLE;
        if server_flags.contains(HandshakeFlags::NO_ZEROES) {
            client_flags |= ClientFlags::NO_ZEROES;
        }
        client.stream.write_u32::<BE>(client_flags.bits())?;
        client.stream.flush()?;

        client.negotiate_structured_reply()?;
        if client.structured {
            client.negotiate_meta_context(export)?;
        }
        client.negotiate_go(export)?;

        debug!(
            export,
            size = client.export_size,
            flags = ?client.flags,
            structured = client.structured,
            "nbd handshake complete"
        );
        Ok(client)
    }

    fn negotiate_structured_reply(&mut self) -> Result<()> {
        proto::send_option(&mut self.stream, proto::OPT_STRUCTURED_REPLY, &[])?;
        let reply = proto::recv_option_reply(&mut self.stream, proto::OPT_STRUCTURED_REPLY)?;
        match reply.reply_type {
            proto::REP_ACK => self.structured = true,
            proto::REP_ERR_UNSUP => self.structured = false,
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected reply {other:#x} to structured reply option"
                )))
            }
        }
        Ok(())
    }

    fn negotiate_meta_context(&mut self, export: &str) -> Result<()> {
        let mut data = Vec::with_capacity(export.len() + proto::BASE_ALLOCATION.len() + 12);
        data.write_u32::<BE>(export.len() as u32)?;
        data.write_all(export.as_bytes())?;
        data.write_u32::<BE>(1)?;
        data.write_u32::<BE>(proto::BASE_ALLOCATION.len() as u32)?;
        data.write_all(proto::BASE_ALLOCATION.as_bytes())?;
        proto::send_option(&mut self.stream, proto::OPT_SET_META_CONTEXT, &data)?;

        loop {
            let reply =
                proto::recv_option_reply(&mut self.stream, proto::OPT_SET_META_CONTEXT)?;
            match reply.reply_type {
                proto::REP_META_CONTEXT => {
                    if reply.data.len() < 4 {
                        return Err(Error::Protocol("short meta context reply".to_string()));
                    }
                    let id = u32::from_be_bytes([
                        reply.data[0],
                        reply.data[1],
                        reply.data[2],
                        reply.data[3],
                    ]);
                    self.allocation_context = Some(id);
                }
                proto::REP_ACK => return Ok(()),
                proto::REP_ERR_UNSUP => {
                    self.allocation_context = None;
                    return Ok(());
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected reply {other:#x} to meta context option"
                    )))
                }
            }
        }
    }

    fn negotiate_go(&mut self, export: &str) -> Result<()> {
        let mut data = Vec::with_capacity(export.len() + 6);
        data.write_u32::<BE>(export.len() as u32)?;
        data.write_all(export.as_bytes())?;
        data.write_u16::<BE>(0)?;
        proto::send_option(&mut self.stream, proto::OPT_GO, &data)?;

        let mut have_export_info = false;
        loop {
            let reply = proto::recv_option_reply(&mut self.stream, proto::OPT_GO)?;
            match reply.reply_type {
                proto::REP_INFO => {
                    if reply.data.len() < 2 {
                        return Err(Error::Protocol("short info reply".to_string()));
                    }
                    let info_type = u16::from_be_bytes([reply.data[0], reply.data[1]]);
                    match info_type {
                        proto::INFO_EXPORT if reply.data.len() >= 12 => {
                            self.export_size = u64::from_be_bytes(
                                reply.data[2..10].try_into().expect("sized slice"),
                            );
                            let raw = u16::from_be_bytes([reply.data[10], reply.data[11]]);
                            self.flags = TransmissionFlags::from_bits_truncate(raw);
                            have_export_info = true;
                        }
                        proto::INFO_BLOCK_SIZE if reply.data.len() >= 14 => {
                            // minimum, preferred, maximum; we keep preferred.
                            self.preferred_block_size = u32::from_be_bytes(
                                reply.data[6..10].try_into().expect("sized slice"),
                            );
                        }
                        _ => {}
                    }
                }
                proto::REP_ACK => {
                    if !have_export_info {
                        return Err(Error::Protocol(
                            "server acknowledged GO without export info".to_string(),
                        ));
                    }
                    return Ok(());
                }
                proto::REP_ERR_UNSUP => {
                    return Err(Error::Unsupported("NBD_OPT_GO".to_string()));
                }
                other => {
                    let (errno, message) = proto::parse_error_chunk(&reply.data)
                        .unwrap_or((0, String::new()));
                    return Err(Error::Protocol(format!(
                        "GO failed with reply {other:#x} errno {errno}: {message}"
                    )));
                }
            }
        }
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        self.check_bounds(offset, buf.len() as u64)?;
        let cookie =
            self.send_request(CommandFlags::empty(), proto::CMD_READ, offset, buf.len() as u32)?;

        let mut error: Option<Error> = None;
        loop {
            match self.read_reply(cookie)? {
                Reply::Simple { errno } => {
                    if errno != 0 {
                        return Err(Error::Server {
                            errno,
                            message: String::new(),
                        });
                    }
                    self.stream.read_exact(buf)?;
                    return Ok(());
                }
                Reply::Chunk(header) => {
                    self.consume_read_chunk(&header, offset, buf, &mut error)?;
                    if header.done() {
                        break;
                    }
                }
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn consume_read_chunk(
        &mut self,
        header: &ChunkHeader,
        offset: u64,
        buf: &mut [u8],
        error: &mut Option<Error>,
    ) -> Result<()> {
        let end = offset + buf.len() as u64;
        match header.chunk_type {
            proto::REPLY_TYPE_OFFSET_DATA => {
                if header.length < 8 {
                    return Err(Error::Protocol("short offset-data chunk".to_string()));
                }
                let chunk_offset = self.stream.read_u64::<BE>()?;
                let data_len = u64::from(header.length) - 8;
                if chunk_offset < offset || chunk_offset + data_len > end {
                    return Err(Error::Protocol(format!(
                        "data chunk [{chunk_offset}, {}) outside read [{offset}, {end})",
                        chunk_offset + data_len
                    )));
                }
                let start = (chunk_offset - offset) as usize;
                self.stream
                    .read_exact(&mut buf[start..start + data_len as usize])?;
            }
            proto::REPLY_TYPE_OFFSET_HOLE => {
                if header.length != 12 {
                    return Err(Error::Protocol("bad offset-hole chunk".to_string()));
                }
                let chunk_offset = self.stream.read_u64::<BE>()?;
                let hole_len = u64::from(self.stream.read_u32::<BE>()?);
                if chunk_offset < offset || chunk_offset + hole_len > end {
                    return Err(Error::Protocol(format!(
                        "hole chunk [{chunk_offset}, {}) outside read [{offset}, {end})",
                        chunk_offset + hole_len
                    )));
                }
                let start = (chunk_offset - offset) as usize;
                buf[start..start + hole_len as usize].fill(0);
            }
            proto::REPLY_TYPE_NONE => {
                if header.length != 0 {
                    return Err(Error::Protocol("NONE chunk with payload".to_string()));
                }
            }
            _ if header.is_error() => {
                let mut data = vec![0u8; header.length as usize];
                self.stream.read_exact(&mut data)?;
                let (errno, message) = proto::parse_error_chunk(&data)?;
                error.get_or_insert(Error::Server { errno, message });
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected chunk type {other} in read reply"
                )));
            }
        }
        Ok(())
    }

    /// Writes the whole buffer at `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_bounds(offset, buf.len() as u64)?;
        for (i, chunk) in buf.chunks(MAX_COMMAND_LENGTH as usize).enumerate() {
            let chunk_offset = offset + i as u64 * MAX_COMMAND_LENGTH;
            let cookie = self.send_request(
                CommandFlags::empty(),
                proto::CMD_WRITE,
                chunk_offset,
                chunk.len() as u32,
            )?;
            self.stream.write_all(chunk)?;
            self.stream.flush()?;
            self.read_command_reply(cookie)?;
        }
        Ok(())
    }

    /// Writes `length` zero bytes at `offset`.
    ///
    /// With `punch_hole` the server may deallocate the range; without it the
    /// range stays allocated, matching dense zeroing.
    pub fn zero(&mut self, offset: u64, length: u64, punch_hole: bool) -> Result<()> {
        self.check_open()?;
        self.check_bounds(offset, length)?;
        if !self.can_zero() {
            return Err(Error::Unsupported("NBD_CMD_WRITE_ZEROES".to_string()));
        }
        let flags = if punch_hole {
            CommandFlags::empty()
        } else {
            CommandFlags::NO_HOLE
        };
        self.ranged_command(proto::CMD_WRITE_ZEROES, flags, offset, length)
    }

    /// Discards `length` bytes at `offset`. Advisory; the server may ignore.
    pub fn trim(&mut self, offset: u64, length: u64) -> Result<()> {
        self.check_open()?;
        self.check_bounds(offset, length)?;
        if !self.can_trim() {
            return Err(Error::Unsupported("NBD_CMD_TRIM".to_string()));
        }
        self.ranged_command(proto::CMD_TRIM, CommandFlags::empty(), offset, length)
    }

    /// Flushes the server's caches to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.can_flush() {
            // A server without flush persists on write; nothing to do.
            return Ok(());
        }
        let cookie = self.send_request(CommandFlags::empty(), proto::CMD_FLUSH, 0, 0)?;
        self.read_command_reply(cookie)
    }

    /// Queries `base:allocation` extents for `[offset, offset + length)`.
    ///
    /// The reply may be shorter or slightly longer than requested; callers
    /// normalize with [`crate::extents::extents`].
    pub fn block_status(&mut self, offset: u64, length: u64) -> Result<Vec<RawExtent>> {
        self.check_open()?;
        self.check_bounds(offset, length)?;
        let context = self
            .allocation_context
            .ok_or_else(|| Error::Unsupported("base:allocation".to_string()))?;
        let length = u32::try_from(length)
            .map_err(|_| Error::Protocol(format!("block status length {length} too large")))?;
        let cookie =
            self.send_request(CommandFlags::empty(), proto::CMD_BLOCK_STATUS, offset, length)?;

        let mut extents = Vec::new();
        let mut error: Option<Error> = None;
        loop {
            let header = match self.read_reply(cookie)? {
                Reply::Simple { errno } if errno != 0 => {
                    return Err(Error::Server {
                        errno,
                        message: String::new(),
                    });
                }
                Reply::Simple { .. } => {
                    return Err(Error::Protocol(
                        "simple reply to block status".to_string(),
                    ));
                }
                Reply::Chunk(header) => header,
            };
            if header.is_error() {
                let mut data = vec![0u8; header.length as usize];
                self.stream.read_exact(&mut data)?;
                let (errno, message) = proto::parse_error_chunk(&data)?;
                error.get_or_insert(Error::Server { errno, message });
            } else if header.chunk_type == proto::REPLY_TYPE_BLOCK_STATUS {
                if header.length < 4 || (header.length - 4) % 8 != 0 {
                    return Err(Error::Protocol(format!(
                        "bad block status payload length {}",
                        header.length
                    )));
                }
                let reply_context = self.stream.read_u32::<BE>()?;
                let pairs = (header.length - 4) / 8;
                for _ in 0..pairs {
                    let extent_length = self.stream.read_u32::<BE>()?;
                    let flags = self.stream.read_u32::<BE>()?;
                    if reply_context == context {
                        extents.push(RawExtent {
                            length: u64::from(extent_length),
                            flags,
                        });
                    }
                }
            } else if header.chunk_type == proto::REPLY_TYPE_NONE {
                if header.length != 0 {
                    return Err(Error::Protocol("NONE chunk with payload".to_string()));
                }
            } else {
                proto::skip_payload(&mut self.stream, u64::from(header.length))?;
            }
            if header.done() {
                break;
            }
        }
        if let Some(err) = error {
            return Err(err);
        }
        if extents.is_empty() {
            return Err(Error::Protocol(
                "block status reply with no extents".to_string(),
            ));
        }
        Ok(extents)
    }

    /// Sends `NBD_CMD_DISC` and shuts the connection down.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Best effort; the server terminates without replying.
        let _ = self.send_request(CommandFlags::empty(), proto::CMD_DISC, 0, 0);
        Ok(())
    }

    fn ranged_command(
        &mut self,
        command: u16,
        flags: CommandFlags,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let mut done = 0u64;
        while done < length {
            let step = (length - done).min(MAX_COMMAND_LENGTH) as u32;
            let cookie = self.send_request(flags, command, offset + done, step)?;
            self.read_command_reply(cookie)?;
            done += u64::from(step);
        }
        Ok(())
    }

    fn send_request(
        &mut self,
        flags: CommandFlags,
        command: u16,
        offset: u64,
        length: u32,
    ) -> Result<u64> {
        self.cookie = self.cookie.wrapping_add(1);
        let mut header = [0u8; 28];
        {
            let mut w = &mut header[..];
            w.write_u32::<BE>(proto::REQUEST_MAGIC)?;
            w.write_u16::<BE>(flags.bits())?;
            w.write_u16::<BE>(command)?;
            w.write_u64::<BE>(self.cookie)?;
            w.write_u64::<BE>(offset)?;
            w.write_u32::<BE>(length)?;
        }
        self.stream.write_all(&header)?;
        if command != proto::CMD_WRITE {
            self.stream.flush()?;
        }
        Ok(self.cookie)
    }

    // Reads one reply frame of either form and validates its cookie.
    fn read_reply(&mut self, cookie: u64) -> Result<Reply> {
        let magic = self.stream.read_u32::<BE>()?;
        match magic {
            proto::SIMPLE_REPLY_MAGIC => {
                let errno = self.stream.read_u32::<BE>()?;
                let replied_cookie = self.stream.read_u64::<BE>()?;
                if replied_cookie != cookie {
                    return Err(Error::Protocol(format!(
                        "reply cookie {replied_cookie} does not match request {cookie}"
                    )));
                }
                Ok(Reply::Simple { errno })
            }
            proto::STRUCTURED_REPLY_MAGIC => {
                let header = ChunkHeader {
                    flags: self.stream.read_u16::<BE>()?,
                    chunk_type: self.stream.read_u16::<BE>()?,
                    cookie: self.stream.read_u64::<BE>()?,
                    length: self.stream.read_u32::<BE>()?,
                };
                if header.cookie != cookie {
                    return Err(Error::Protocol(format!(
                        "chunk cookie {} does not match request {cookie}",
                        header.cookie
                    )));
                }
                Ok(Reply::Chunk(header))
            }
            other => Err(Error::Protocol(format!("bad reply magic {other:#x}"))),
        }
    }

    // Reads one reply for commands with no payload, accepting either form.
    fn read_command_reply(&mut self, cookie: u64) -> Result<()> {
        let mut error: Option<Error> = None;
        loop {
            match self.read_reply(cookie)? {
                Reply::Simple { errno } => {
                    if errno != 0 {
                        return Err(Error::Server {
                            errno,
                            message: String::new(),
                        });
                    }
                    return Ok(());
                }
                Reply::Chunk(header) => {
                    if header.is_error() {
                        let mut data = vec![0u8; header.length as usize];
                        self.stream.read_exact(&mut data)?;
                        let (errno, message) = proto::parse_error_chunk(&data)?;
                        error.get_or_insert(Error::Server { errno, message });
                    } else {
                        proto::skip_payload(&mut self.stream, u64::from(header.length))?;
                    }
                    if header.done() {
                        break;
                    }
                }
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "closed nbd connection",
            )));
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, length: u64) -> Result<()> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| Error::Protocol("offset + length overflows".to_string()))?;
        if end > self.export_size {
            return Err(Error::Protocol(format!(
                "request [{offset}, {end}) outside export of {} bytes",
                self.export_size
            )));
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
