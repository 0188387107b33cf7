//! Link layer: framing with CRC-32 integrity and static ARP resolution.
//!
//! A [`Frame`] wraps the network-layer packet bytes between the MAC
//! addressing header and a CRC-32 trailer.  Frames whose CRC does not match
//! on arrival are silently dropped ([`SimpleLink::receive`] returns
//! `Ok(None)`) — this is the only way bit corruption injected by the
//! physical layer becomes visible.
//!
//! ARP is static: the table is built once from the topology and read-only
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crc::Crc;
use thiserror::Error;

use crate::addr::{Mac, Vip};
use crate::physical::{PhysError, Physical};
use crate::segment::{CodecError, Reader};

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Errors that can arise from link-layer operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The next-hop VIP has no ARP entry.
    #[error("no ARP entry for VIP {0}")]
    NoArpEntry(Vip),
    /// Substrate failure.
    #[error(transparent)]
    Phys(#[from] PhysError),
}

/// The link PDU: MAC header, length-prefixed packet bytes, CRC-32 trailer.
///
/// The CRC covers every byte that precedes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src_mac: Mac,
    pub dst_mac: Mac,
    pub packet: Vec<u8>,
}

impl Frame {
    /// Serialise this frame, appending the freshly computed CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + 6 + 4 + self.packet.len() + 4);
        buf.extend_from_slice(&self.src_mac.octets());
        buf.extend_from_slice(&self.dst_mac.octets());
        buf.extend_from_slice(&(self.packet.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.packet);
        let crc = CRC32.checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parse a [`Frame`], verifying the CRC trailer.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let (body, trailer) = buf.split_at(buf.len() - 4);
        let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if CRC32.checksum(body) != stored {
            return Err(CodecError::CrcMismatch);
        }

        let mut r = Reader::new(body);
        let src_mac = read_mac(&mut r)?;
        let dst_mac = read_mac(&mut r)?;
        let len = r.u32()? as usize;
        let packet = r.bytes(len)?.to_vec();
        r.finish()?;

        Ok(Self {
            src_mac,
            dst_mac,
            packet,
        })
    }
}

fn read_mac(r: &mut Reader<'_>) -> Result<Mac, CodecError> {
    let raw = r.bytes(6)?;
    let mut octets = [0u8; 6];
    octets.copy_from_slice(raw);
    Ok(Mac::new(octets))
}

/// Link interface: packet bytes toward a next-hop VIP, frames off the wire.
#[async_trait]
pub trait Link: Send + Sync {
    /// Frame `packet` and transmit it toward `next_hop`.
    async fn send(&self, next_hop: &Vip, packet: &[u8]) -> Result<(), LinkError>;

    /// Block until the next frame arrives.
    ///
    /// Returns `Ok(None)` when the frame was dropped for an integrity or
    /// layout error; callers loop.
    async fn receive(&self) -> Result<Option<Vec<u8>>, LinkError>;
}

/// The straightforward link implementation over a [`Physical`] substrate.
pub struct SimpleLink {
    physical: Arc<dyn Physical>,
    local_mac: Mac,
    arp_table: HashMap<Vip, Mac>,
}

impl SimpleLink {
    pub fn new(physical: Arc<dyn Physical>, local_mac: Mac, arp_table: HashMap<Vip, Mac>) -> Self {
        Self {
            physical,
            local_mac,
            arp_table,
        }
    }
}

#[async_trait]
impl Link for SimpleLink {
    async fn send(&self, next_hop: &Vip, packet: &[u8]) -> Result<(), LinkError> {
        let dst_mac = *self
            .arp_table
            .get(next_hop)
            .ok_or_else(|| LinkError::NoArpEntry(next_hop.clone()))?;

        let frame = Frame {
            src_mac: self.local_mac,
            dst_mac,
            packet: packet.to_vec(),
        };
        log::trace!(
            "[link] {} -> {dst_mac}  frame sent ({} packet bytes)",
            self.local_mac,
            packet.len()
        );
        self.physical.send(dst_mac, &frame.encode()).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, LinkError> {
        let data = self.physical.receive().await?;
        match Frame::decode(&data) {
            Ok(frame) => {
                log::trace!(
                    "[link] {} <- {}  frame received ({} packet bytes)",
                    self.local_mac,
                    frame.src_mac,
                    frame.packet.len()
                );
                Ok(Some(frame.packet))
            }
            Err(CodecError::CrcMismatch) => {
                log::warn!("[link] {}  frame dropped: CRC mismatch", self.local_mac);
                Ok(None)
            }
            Err(e) => {
                log::warn!("[link] {}  frame dropped: {e}", self.local_mac);
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
