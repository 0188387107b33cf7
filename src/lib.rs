//! `netstack-sim` — a didactic network stack over a deliberately lossy UDP
//! substrate, terminated by a small chat application.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────┐  JSON envelope  ┌───────────────┐
//!  │  Chat client  │◀───────────────▶│  Chat server  │
//!  └──────┬────────┘                 └──────┬────────┘
//!         │ send(msg) / receive()           │ accept()
//!  ┌──────▼──────────────────────────────────▼──────┐
//!  │   ReliableTransport  (multiplexer + reader)    │
//!  │     └── ReliableConnection (stop-and-wait)     │
//!  └──────┬─────────────────────────────────────────┘
//!         │ segments
//!  ┌──────▼──────┐  packets (TTL)  ┌─────────────┐
//!  │ HostNetwork │────────────────▶│RouterNetwork│
//!  └──────┬──────┘                 └──────┬──────┘
//!         │ frames (CRC32)                │
//!  ┌──────▼────────────────────────────── ▼──────┐
//!  │  SimpleLink  (static ARP, drops bad CRC)    │
//!  └──────┬──────────────────────────────────────┘
//!         │ datagrams + injected loss/corruption/delay
//!  ┌──────▼──────┐
//!  │ UdpPhysical │  (tokio UdpSocket on loopback)
//!  └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`addr`]       — validated address value types (port, VIP, MAC)
//! - [`segment`]    — transport PDU wire format
//! - [`connection`] — per-peer stop-and-wait endpoint
//! - [`transport`]  — connection multiplexer and dispatch
//! - [`network`]    — packet codec, host and router network layers
//! - [`link`]       — frame codec with CRC, static ARP
//! - [`physical`]   — UDP substrate with fault injection
//! - [`chat`]       — application message envelope
//! - [`topology`]   — the static LAN table and stack builders
//! - [`ui`]         — console chat UI
//! - [`client`] / [`server`] / [`router`] — the four runnable roles

pub mod addr;
pub mod chat;
pub mod client;
pub mod connection;
pub mod link;
pub mod network;
pub mod physical;
pub mod router;
pub mod segment;
pub mod server;
pub mod topology;
pub mod transport;
pub mod ui;
