//! NBD wire constants and reply framing.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description. Only the client side of the fixed-newstyle
//! handshake is implemented here.

use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::{Error, Result};

/// Handshake magic: `b"NBDMAGIC"`.
pub const NBDMAGIC: u64 = 0x4e42444d41474943;
/// Option haggling magic: `b"IHAVEOPT"`.
pub const IHAVEOPT: u64 = 0x4948_4156_454F_5054;
/// Magic prefixing every option reply.
pub const OPTION_REPLY_MAGIC: u64 = 0x3e88_9045_565a9;

/// Magic prefixing transmission requests.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Magic prefixing simple replies.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
/// Magic prefixing structured reply chunks.
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

/// The allocation metadata context negotiated for block status.
pub const BASE_ALLOCATION: &str = "base:allocation";

// Options sent during haggling.
pub(crate) const OPT_GO: u32 = 7;
pub(crate) const OPT_STRUCTURED_REPLY: u32 = 8;
pub(crate) const OPT_SET_META_CONTEXT: u32 = 10;

// Option reply types.
pub(crate) const REP_ACK: u32 = 1;
pub(crate) const REP_INFO: u32 = 3;
pub(crate) const REP_META_CONTEXT: u32 = 4;
pub(crate) const REP_ERR_UNSUP: u32 = (1 << 31) + 1;

// Info types carried by REP_INFO.
pub(crate) const INFO_EXPORT: u16 = 0;
pub(crate) const INFO_BLOCK_SIZE: u16 = 3;

// Transmission commands.
pub(crate) const CMD_READ: u16 = 0;
pub(crate) const CMD_WRITE: u16 = 1;
pub(crate) const CMD_DISC: u16 = 2;
pub(crate) const CMD_FLUSH: u16 = 3;
pub(crate) const CMD_TRIM: u16 = 4;
pub(crate) const CMD_WRITE_ZEROES: u16 = 6;
pub(crate) const CMD_BLOCK_STATUS: u16 = 7;

// Structured reply chunk types.
pub(crate) const REPLY_TYPE_NONE: u16 = 0;
pub(crate) const REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub(crate) const REPLY_TYPE_OFFSET_HOLE: u16 = 2;
pub(crate) const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
pub(crate) const REPLY_FLAG_DONE: u16 = 1;
pub(crate) const REPLY_TYPE_ERROR_BIT: u16 = 1 << 15;

/// `base:allocation` status bit: the extent is a hole (unallocated).
pub const STATE_HOLE: u32 = 1;
/// `base:allocation` status bit: the extent reads as zeroes.
pub const STATE_ZERO: u32 = 2;

bitflags! {
    /// Flags announced by the server in the handshake.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct HandshakeFlags: u16 {
        /// The server speaks the fixed newstyle protocol.
        const FIXED_NEWSTYLE = 1 << 0;
        /// The server can omit the 124 byte zero pad after export info.
        const NO_ZEROES = 1 << 1;
    }
}

bitflags! {
    /// Flags the client echoes back during the handshake.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ClientFlags: u32 {
        /// We speak the fixed newstyle protocol.
        const FIXED_NEWSTYLE = 1 << 0;
        /// Ask the server to skip the zero pad.
        const NO_ZEROES = 1 << 1;
    }
}

bitflags! {
    /// Per-export transmission flags negotiated by `NBD_OPT_GO`.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TransmissionFlags: u16 {
        /// Always set by compliant servers.
        const HAS_FLAGS = 1 << 0;
        /// Export is read-only.
        const READ_ONLY = 1 << 1;
        /// `NBD_CMD_FLUSH` is supported.
        const SEND_FLUSH = 1 << 2;
        /// Forced unit access is supported.
        const SEND_FUA = 1 << 3;
        /// `NBD_CMD_TRIM` is supported.
        const SEND_TRIM = 1 << 5;
        /// `NBD_CMD_WRITE_ZEROES` is supported.
        const SEND_WRITE_ZEROES = 1 << 6;
        /// Multiple connections may be used safely.
        const CAN_MULTI_CONN = 1 << 8;
    }
}

bitflags! {
    /// Per-command flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CommandFlags: u16 {
        /// Forced unit access.
        const FUA = 1 << 0;
        /// For write-zeroes: do not punch a hole, allocate the range.
        const NO_HOLE = 1 << 1;
        /// For block-status: one extent per context is enough.
        const REQ_ONE = 1 << 3;
    }
}

/// One reply to an option sent during haggling.
#[derive(Debug)]
pub(crate) struct OptionReply {
    pub reply_type: u32,
    pub data: Vec<u8>,
}

// Option replies carry small payloads; anything bigger is a protocol error.
const MAX_OPTION_DATA: u32 = 64 * 1024;

pub(crate) fn send_option<W: Write>(mut w: W, option: u32, data: &[u8]) -> Result<()> {
    w.write_u64::<BE>(IHAVEOPT)?;
    w.write_u32::<BE>(option)?;
    w.write_u32::<BE>(data.len() as u32)?;
    w.write_all(data)?;
    w.flush()?;
    Ok(())
}

pub(crate) fn recv_option_reply<R: Read>(mut r: R, option: u32) -> Result<OptionReply> {
    let magic = r.read_u64::<BE>()?;
    if magic != OPTION_REPLY_MAGIC {
        return Err(Error::Protocol(format!(
            "unexpected option reply magic {magic:#x}"
        )));
    }
    let replied_option = r.read_u32::<BE>()?;
    if replied_option != option {
        return Err(Error::Protocol(format!(
            "reply for option {replied_option}, expected {option}"
        )));
    }
    let reply_type = r.read_u32::<BE>()?;
    let length = r.read_u32::<BE>()?;
    if length > MAX_OPTION_DATA {
        return Err(Error::Protocol(format!(
            "option reply data too large: {length}"
        )));
    }
    let mut data = vec![0u8; length as usize];
    r.read_exact(&mut data)?;
    Ok(OptionReply { reply_type, data })
}

/// Header of one structured reply chunk.
#[derive(Debug)]
pub(crate) struct ChunkHeader {
    pub flags: u16,
    pub chunk_type: u16,
    pub cookie: u64,
    pub length: u32,
}

impl ChunkHeader {
    pub fn done(&self) -> bool {
        self.flags & REPLY_FLAG_DONE != 0
    }

    pub fn is_error(&self) -> bool {
        self.chunk_type & REPLY_TYPE_ERROR_BIT != 0
    }
}

/// Reads and discards `length` payload bytes of an unwanted chunk.
pub(crate) fn skip_payload<R: Read>(mut r: R, length: u64) -> Result<()> {
    let copied = std::io::copy(&mut r.by_ref().take(length), &mut std::io::sink())?;
    if copied != length {
        return Err(Error::Protocol("short chunk payload".to_string()));
    }
    Ok(())
}

/// Parses the payload of an error chunk: errno, message, optional offset.
pub(crate) fn parse_error_chunk(data: &[u8]) -> Result<(u32, String)> {
    if data.len() < 6 {
        return Err(Error::Protocol("short error chunk".to_string()));
    }
    let errno = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let message_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let message_end = (6 + message_len).min(data.len());
    let message = String::from_utf8_lossy(&data[6..message_end]).into_owned();
    Ok((errno, message))
}
