//! Network layer: packets with a hop budget, host delivery, router forwarding.
//!
//! A [`Packet`] carries opaque segment bytes between virtual IPs with a TTL
//! that only routers inspect.  Hosts implement [`PacketService`] — the seam
//! the transport multiplexer sits on — while [`RouterNetwork`] never
//! surfaces data upward: forwarding is a side effect of processing.
//!
//! Routing tables are static data, injected at construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::addr::Vip;
use crate::link::{Link, LinkError};
use crate::segment::{read_vip, CodecError, Reader};

/// Hop budget stamped on every packet a host originates.
///
/// Anything larger than the topology diameter works; the transport has no
/// dependency on the exact value.
pub const DEFAULT_TTL: u8 = 4;

/// Errors that can arise from network-layer operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// The destination VIP has no routing-table entry.
    #[error("no route toward VIP {0}")]
    NoRoute(Vip),
    /// Link-layer failure.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// The network PDU: addressing, hop budget, and the embedded segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_vip: Vip,
    pub dst_vip: Vip,
    pub ttl: u8,
    pub segment: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let src = self.src_vip.as_str().as_bytes();
        let dst = self.dst_vip.as_str().as_bytes();
        let mut buf = Vec::with_capacity(2 + src.len() + dst.len() + 5 + self.segment.len());
        buf.push(src.len() as u8);
        buf.extend_from_slice(src);
        buf.push(dst.len() as u8);
        buf.extend_from_slice(dst);
        buf.push(self.ttl);
        buf.extend_from_slice(&(self.segment.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.segment);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);
        let src_vip = read_vip(&mut r)?;
        let dst_vip = read_vip(&mut r)?;
        let ttl = r.u8()?;
        let len = r.u32()? as usize;
        let segment = r.bytes(len)?.to_vec();
        r.finish()?;
        Ok(Self {
            src_vip,
            dst_vip,
            ttl,
            segment,
        })
    }
}

/// The lower packet service the transport runs over: opaque segments
/// addressed by VIP, silent loss and delay below, never corruption.
#[async_trait]
pub trait PacketService: Send + Sync {
    /// Wrap `segment` into a packet and forward it toward `dest`.
    async fn send(&self, dest: &Vip, segment: &[u8]) -> Result<(), NetError>;

    /// Block until a segment addressed to the local VIP arrives.
    async fn receive(&self) -> Result<Vec<u8>, NetError>;
}

// ---------------------------------------------------------------------------
// HostNetwork
// ---------------------------------------------------------------------------

/// Network layer for end hosts (Alice, Bob, the chat server).
///
/// The routing table of a host typically holds a single entry per
/// destination, all pointing at the router.
pub struct HostNetwork {
    link: Arc<dyn Link>,
    local_vip: Vip,
    routing_table: HashMap<Vip, Vip>,
}

impl HostNetwork {
    pub fn new(link: Arc<dyn Link>, local_vip: Vip, routing_table: HashMap<Vip, Vip>) -> Self {
        Self {
            link,
            local_vip,
            routing_table,
        }
    }

    pub fn local_vip(&self) -> &Vip {
        &self.local_vip
    }
}

#[async_trait]
impl PacketService for HostNetwork {
    async fn send(&self, dest: &Vip, segment: &[u8]) -> Result<(), NetError> {
        let next_hop = self
            .routing_table
            .get(dest)
            .ok_or_else(|| NetError::NoRoute(dest.clone()))?;

        let packet = Packet {
            src_vip: self.local_vip.clone(),
            dst_vip: dest.clone(),
            ttl: DEFAULT_TTL,
            segment: segment.to_vec(),
        };
        log::debug!(
            "[network] {} -> {dest}  packet sent (next_hop={next_hop} ttl={})",
            self.local_vip,
            packet.ttl
        );
        self.link.send(next_hop, &packet.encode()).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, NetError> {
        loop {
            let Some(bytes) = self.link.receive().await? else {
                continue; // frame dropped at the link layer
            };

            let packet = match Packet::decode(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("[network] {}  packet dropped: {e}", self.local_vip);
                    continue;
                }
            };

            if packet.dst_vip != self.local_vip {
                log::warn!(
                    "[network] {} -> {}  packet dropped: not addressed to us",
                    packet.src_vip,
                    packet.dst_vip
                );
                continue;
            }

            log::debug!(
                "[network] {} -> {}  segment delivered (ttl={})",
                packet.src_vip,
                self.local_vip,
                packet.ttl
            );
            return Ok(packet.segment);
        }
    }
}

// ---------------------------------------------------------------------------
// RouterNetwork
// ---------------------------------------------------------------------------

/// Snapshot of the router's operating statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: u64,
    pub dropped_ttl: u64,
    pub dropped_unknown: u64,
}

impl RouterStats {
    /// Total packets processed.
    pub fn total(&self) -> u64 {
        self.forwarded + self.dropped_ttl + self.dropped_unknown
    }
}

/// Network layer for the router.
///
/// Receives packets from the link, decrements the TTL, consults the routing
/// table and forwards.  Routers are never a destination, so nothing is
/// delivered upward.
pub struct RouterNetwork {
    link: Arc<dyn Link>,
    local_vip: Vip,
    routing_table: HashMap<Vip, Vip>,
    forwarded: AtomicU64,
    dropped_ttl: AtomicU64,
    dropped_unknown: AtomicU64,
}

impl RouterNetwork {
    pub fn new(link: Arc<dyn Link>, local_vip: Vip, routing_table: HashMap<Vip, Vip>) -> Self {
        Self {
            link,
            local_vip,
            routing_table,
            forwarded: AtomicU64::new(0),
            dropped_ttl: AtomicU64::new(0),
            dropped_unknown: AtomicU64::new(0),
        }
    }

    pub fn local_vip(&self) -> &Vip {
        &self.local_vip
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_ttl: self.dropped_ttl.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
        }
    }

    /// Receive one packet from the link and forward it (or drop it).
    ///
    /// Blocks until the link delivers a frame; dropped frames complete the
    /// call without forwarding anything.
    pub async fn process_one(&self) -> Result<(), NetError> {
        let Some(bytes) = self.link.receive().await? else {
            return Ok(()); // frame dropped at the link layer
        };

        let mut packet = match Packet::decode(&bytes) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[router] {}  packet dropped: {e}", self.local_vip);
                return Ok(());
            }
        };

        if packet.ttl == 0 {
            log::warn!(
                "[router] {} -> {}  packet dropped: hop budget exhausted",
                packet.src_vip,
                packet.dst_vip
            );
            self.dropped_ttl.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        packet.ttl -= 1;

        let Some(next_hop) = self.routing_table.get(&packet.dst_vip) else {
            log::error!(
                "[router] {} -> ?  no route toward VIP {}",
                packet.src_vip,
                packet.dst_vip
            );
            self.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        log::debug!(
            "[router] {} -> {}  packet forwarded (next_hop={next_hop} ttl={})",
            packet.src_vip,
            packet.dst_vip,
            packet.ttl
        );
        self.link.send(next_hop, &packet.encode()).await?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
