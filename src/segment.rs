//! Wire-format definitions for transport segments.
//!
//! Every unit handed to the network layer by the transport is a [`Segment`].
//! This module is responsible for:
//! - Defining the on-wire binary layout (addresses, flags, sequence bit,
//!   fragmentation bit, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning
//!   [`CodecError`] for malformed or truncated input.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Layout (big-endian)
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┬──────────┬──────────┐
//! │ len: u8 │ src vip │ len: u8 │ dst vip │ src port │ dst port │
//! ├─────────┼─────────┼─────────┼─────────┼──────────┴──────────┤
//! │ flags   │ seq     │ more    │ reserved│ payload len: u32    │
//! ├─────────┴─────────┴─────────┴─────────┴─────────────────────┤
//! │ payload …                                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::addr::{Port, VirtualAddr};

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise — handshake initiation.
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement of the segment carrying the same sequence bit.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish — sender is closing the connection.
    pub const FIN: u8 = 0b0000_0100;
    /// All bits with a defined meaning.
    pub const MASK: u8 = SYN | ACK | FIN;
}

/// Errors that can arise when decoding a raw segment, packet, or frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before the layout was complete.
    #[error("buffer truncated")]
    Truncated,
    /// Bytes remained after the declared payload.
    #[error("trailing bytes after payload")]
    TrailingBytes,
    /// A field held a value outside its legal range.
    #[error("illegal field value: {0}")]
    BadValue(&'static str),
    /// CRC trailer did not match the recomputed value.
    #[error("checksum mismatch")]
    CrcMismatch,
}

/// The transport PDU.
///
/// A segment is either a *control segment* (some combination of SYN/ACK/FIN,
/// empty payload) or a *data segment* (no flags; carries up to MSS payload
/// bytes).  Data and acknowledgements are distinct segments — this transport
/// does not piggyback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Originating endpoint.
    pub source: VirtualAddr,
    /// Destination endpoint.
    pub dest: VirtualAddr,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// One-bit alternating sequence number (0 or 1).
    pub seq: u8,
    /// `true` ⇒ another fragment of the same message follows.
    pub more: bool,
    /// Payload bytes; empty for control segments.
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a control segment (SYN / SYN+ACK / ACK / FIN) with no payload.
    pub fn control(source: VirtualAddr, dest: VirtualAddr, flags: u8, seq: u8) -> Self {
        debug_assert_eq!(flags & !flags::MASK, 0);
        Self {
            source,
            dest,
            flags,
            seq,
            more: false,
            payload: Vec::new(),
        }
    }

    /// Build a data segment carrying one fragment of a message.
    pub fn data(source: VirtualAddr, dest: VirtualAddr, seq: u8, more: bool, payload: Vec<u8>) -> Self {
        Self {
            source,
            dest,
            flags: 0,
            seq,
            more,
            payload,
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    /// Serialise this segment into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let src_vip = self.source.vip.as_str().as_bytes();
        let dst_vip = self.dest.vip.as_str().as_bytes();
        let mut buf = Vec::with_capacity(2 + src_vip.len() + dst_vip.len() + 12 + self.payload.len());

        buf.push(src_vip.len() as u8);
        buf.extend_from_slice(src_vip);
        buf.push(dst_vip.len() as u8);
        buf.extend_from_slice(dst_vip);
        buf.extend_from_slice(&self.source.port.get().to_be_bytes());
        buf.extend_from_slice(&self.dest.port.get().to_be_bytes());
        buf.push(self.flags);
        buf.push(self.seq);
        buf.push(u8::from(self.more));
        buf.push(0); // reserved
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a [`Segment`] from a raw byte slice.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);

        let src_vip = read_vip(&mut r)?;
        let dst_vip = read_vip(&mut r)?;
        let src_port = Port::new(r.u16()?).map_err(|_| CodecError::BadValue("source port"))?;
        let dst_port = Port::new(r.u16()?).map_err(|_| CodecError::BadValue("dest port"))?;

        let flags = r.u8()?;
        if flags & !flags::MASK != 0 {
            return Err(CodecError::BadValue("flags"));
        }
        let seq = r.u8()?;
        if seq > 1 {
            return Err(CodecError::BadValue("seq"));
        }
        let more = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(CodecError::BadValue("more")),
        };
        if r.u8()? != 0 {
            return Err(CodecError::BadValue("reserved"));
        }

        let payload_len = r.u32()? as usize;
        let payload = r.bytes(payload_len)?.to_vec();
        r.finish()?;

        Ok(Self {
            source: VirtualAddr::new(src_vip, src_port),
            dest: VirtualAddr::new(dst_vip, dst_port),
            flags,
            seq,
            more,
            payload,
        })
    }
}

pub(crate) fn read_vip(r: &mut Reader<'_>) -> Result<crate::addr::Vip, CodecError> {
    let len = r.u8()? as usize;
    let raw = r.bytes(len)?;
    let label = std::str::from_utf8(raw).map_err(|_| CodecError::BadValue("vip utf-8"))?;
    label.parse().map_err(|_| CodecError::BadValue("vip label"))
}

/// Cursor over a byte slice with bounds-checked reads.
///
/// Shared by the segment, packet, and frame codecs.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    /// Fail with [`CodecError::TrailingBytes`] unless the buffer is exhausted.
    pub(crate) fn finish(&self) -> Result<(), CodecError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes)
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
