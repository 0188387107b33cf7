//! Physical layer: datagram I/O over a simulated noisy substrate.
//!
//! [`UdpPhysical`] carries link-layer frames as UDP datagrams on loopback
//! and injects faults *at send time* according to a [`ChannelConfig`]:
//!
//! | Fault       | Description                                          |
//! |-------------|------------------------------------------------------|
//! | Packet loss | Drop a frame with probability `loss_rate`.           |
//! | Corruption  | Flip one random bit with probability `corrupt_rate`. |
//! | Latency     | Delay delivery by up to `max_delay`.                 |
//!
//! Corruption is observable upstream only as a CRC mismatch at the link
//! layer, so the transport never sees torn payloads — only absences.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::addr::Mac;

/// Maximum UDP payload size on loopback.
const MAX_DATAGRAM: usize = 65_507;

/// Errors that can arise from substrate operations.
#[derive(Debug, Error)]
pub enum PhysError {
    /// The destination MAC has no substrate address.
    #[error("unknown MAC in substrate table: {0}")]
    UnknownMac(Mac),
    /// The frame does not fit in a single datagram.
    #[error("frame too large for the substrate: {0} bytes")]
    FrameTooLarge(usize),
    /// Underlying I/O error from the OS.
    #[error("substrate I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fault-injection parameters for the simulated channel.
///
/// Probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Probability that any given frame is silently dropped.
    pub loss_rate: f64,
    /// Probability that one bit of the frame is flipped.
    pub corrupt_rate: f64,
    /// Upper bound of the uniform random delivery delay.
    pub max_delay: Duration,
}

impl ChannelConfig {
    /// A transparent pass-through channel (no faults).
    pub fn reliable() -> Self {
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for ChannelConfig {
    /// The lossy profile the retransmission timeout is calibrated against.
    fn default() -> Self {
        Self {
            loss_rate: 0.10,
            corrupt_rate: 0.05,
            max_delay: Duration::from_millis(500),
        }
    }
}

/// Datagram substrate interface: fire-and-forget send, blocking receive.
#[async_trait]
pub trait Physical: Send + Sync {
    /// Transmit one frame toward the node owning `dest`.
    ///
    /// Returns `Ok(())` even when the channel decides to drop or delay the
    /// frame — loss is invisible to the sender, as on a real wire.
    async fn send(&self, dest: Mac, frame: &[u8]) -> Result<(), PhysError>;

    /// Block until the next frame arrives and return its bytes.
    async fn receive(&self) -> Result<Vec<u8>, PhysError>;
}

/// The UDP-backed substrate.
///
/// All methods take `&self`; the socket is shared with delayed-delivery
/// tasks through an `Arc`.
pub struct UdpPhysical {
    socket: Arc<UdpSocket>,
    mac_table: HashMap<Mac, SocketAddr>,
    channel: ChannelConfig,
}

impl UdpPhysical {
    /// Bind the substrate socket to `local` and wire it to the static
    /// MAC → socket-address table.
    pub async fn bind(
        local: SocketAddr,
        mac_table: HashMap<Mac, SocketAddr>,
        channel: ChannelConfig,
    ) -> Result<Self, PhysError> {
        let socket = UdpSocket::bind(local).await?;
        log::debug!("[physical] bound {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            mac_table,
            channel,
        })
    }

    /// The socket address the substrate actually bound (relevant when the
    /// requested port was 0).
    pub fn local_addr(&self) -> Result<SocketAddr, PhysError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Physical for UdpPhysical {
    async fn send(&self, dest: Mac, frame: &[u8]) -> Result<(), PhysError> {
        if frame.len() > MAX_DATAGRAM {
            return Err(PhysError::FrameTooLarge(frame.len()));
        }
        let dest_addr = *self
            .mac_table
            .get(&dest)
            .ok_or(PhysError::UnknownMac(dest))?;

        // Draw every fault decision up front; ThreadRng must not be held
        // across an await point.
        let (lost, flipped_bit, delay) = {
            let mut rng = rand::rng();
            let lost = self.channel.loss_rate > 0.0 && rng.random_bool(self.channel.loss_rate);
            let flipped_bit = (!frame.is_empty()
                && self.channel.corrupt_rate > 0.0
                && rng.random_bool(self.channel.corrupt_rate))
            .then(|| rng.random_range(0..frame.len() * 8));
            let delay_ms = self.channel.max_delay.as_millis() as u64;
            let delay = if delay_ms > 0 {
                Duration::from_millis(rng.random_range(0..=delay_ms))
            } else {
                Duration::ZERO
            };
            (lost, flipped_bit, delay)
        };

        if lost {
            log::debug!("[physical] -> {dest}  frame lost in the channel ({} bytes)", frame.len());
            return Ok(());
        }

        let mut bytes = frame.to_vec();
        if let Some(bit) = flipped_bit {
            bytes[bit / 8] ^= 1 << (bit % 8);
            log::debug!("[physical] -> {dest}  bit {bit} flipped in transit");
        }

        if delay.is_zero() {
            self.socket.send_to(&bytes, dest_addr).await?;
            log::trace!("[physical] -> {dest}  frame sent ({} bytes)", bytes.len());
        } else {
            let socket = Arc::clone(&self.socket);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = socket.send_to(&bytes, dest_addr).await {
                    log::warn!("[physical] delayed send failed: {e}");
                }
            });
            log::trace!("[physical] -> {dest}  frame delayed {delay:?}");
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, PhysError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        log::trace!("[physical] <- {from}  frame received ({n} bytes)");
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> Mac {
        s.parse().unwrap()
    }

    async fn bound_pair() -> (UdpPhysical, UdpPhysical) {
        let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a_sock.local_addr().unwrap();
        let b_addr = b_sock.local_addr().unwrap();
        drop((a_sock, b_sock));

        let table: HashMap<Mac, SocketAddr> = [
            (mac("AA:AA:AA:AA:AA:AA"), a_addr),
            (mac("BB:BB:BB:BB:BB:BB"), b_addr),
        ]
        .into_iter()
        .collect();

        let a = UdpPhysical::bind(a_addr, table.clone(), ChannelConfig::reliable())
            .await
            .unwrap();
        let b = UdpPhysical::bind(b_addr, table, ChannelConfig::reliable())
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn frame_crosses_reliable_channel_intact() {
        let (a, b) = bound_pair().await;
        a.send(mac("BB:BB:BB:BB:BB:BB"), b"frame bytes").await.unwrap();
        let got = b.receive().await.unwrap();
        assert_eq!(got, b"frame bytes");
    }

    #[tokio::test]
    async fn unknown_mac_is_an_error() {
        let (a, _b) = bound_pair().await;
        let result = a.send(mac("00:00:00:00:00:01"), b"x").await;
        assert!(matches!(result, Err(PhysError::UnknownMac(_))));
    }

    #[tokio::test]
    async fn total_loss_delivers_nothing() {
        let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a_sock.local_addr().unwrap();
        let b_addr = b_sock.local_addr().unwrap();
        drop((a_sock, b_sock));

        let table: HashMap<Mac, SocketAddr> = [
            (mac("AA:AA:AA:AA:AA:AA"), a_addr),
            (mac("BB:BB:BB:BB:BB:BB"), b_addr),
        ]
        .into_iter()
        .collect();

        let black_hole = ChannelConfig {
            loss_rate: 1.0,
            ..ChannelConfig::reliable()
        };
        let a = UdpPhysical::bind(a_addr, table.clone(), black_hole).await.unwrap();
        let b = UdpPhysical::bind(b_addr, table, ChannelConfig::reliable()).await.unwrap();

        a.send(mac("BB:BB:BB:BB:BB:BB"), b"doomed").await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), b.receive()).await;
        assert!(got.is_err(), "lost frame must never arrive");
    }
}
