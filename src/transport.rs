//! Transport multiplexer: connection table, background reader, lifecycle.
//!
//! One [`ReliableTransport`] per host owns the packet service.  A single
//! reader task drains it, decodes segments, and dispatches each to the
//! connection owning its [`ConnectionKey`] — or, for unknown keys, applies
//! the flag rules: a pure SYN feeds the accept queue, a FIN gets a
//! synthesised ACK (the peer is retransmitting a FIN whose ACK we sent
//! before forgetting the connection), anything else is dropped.
//!
//! The table is guarded by a mutex held only across membership checks and
//! insert/remove, never across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::addr::{Port, VirtualAddr, Vip};
use crate::connection::ReliableConnection;
use crate::network::PacketService;
use crate::segment::{flags, Segment};

/// The four-tuple identifying a connection at one endpoint:
/// `(remote_vip, remote_port, local_port)` — the local VIP is implicit.
pub type ConnectionKey = (Vip, Port, Port);

/// Transport-layer error taxonomy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// `connect` on a key that already has a live connection.
    #[error("a connection with this key already exists")]
    DuplicateConnection,
    /// Operation requires an established connection.
    #[error("connection is not established")]
    NotConnected,
    /// Handshake retries exhausted (only with a configured retry cap).
    #[error("handshake failed")]
    HandshakeFailed,
    /// Data retransmission retries exhausted (only with a configured cap).
    #[error("retransmission retries exhausted")]
    TimedOut,
    /// The lower layer is permanently unavailable.
    #[error("channel closed")]
    ChannelClosed,
}

/// Tunable transport parameters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Retransmission timeout `T`; calibrated as
    /// `2 × max simulated latency + 0.5 s` for the default channel profile.
    pub retransmit_timeout: Duration,
    /// Cap on handshake/data retransmissions; `None` retransmits forever
    /// (delivery is guaranteed only while the peer stays reachable).
    pub max_retries: Option<u32>,
    /// FIN retransmission cap; teardown force-completes afterwards so a
    /// vanished peer cannot wedge `close`.
    pub fin_max_retries: u32,
    /// Maximum payload per data segment.
    pub mss: usize,
    /// Capacity of each per-connection queue and of the accept queue.
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: Duration::from_millis(1500),
            max_retries: None,
            fin_max_retries: 8,
            mss: 4096,
            queue_depth: 64,
        }
    }
}

/// Stop-and-wait transport multiplexer for one host.
pub struct ReliableTransport {
    service: Arc<dyn PacketService>,
    local: VirtualAddr,
    config: TransportConfig,
    connections: StdMutex<HashMap<ConnectionKey, Arc<ReliableConnection>>>,
    accept_rx: Mutex<mpsc::Receiver<Segment>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ReliableTransport {
    /// Build the transport and start its reader task.
    pub fn new(
        service: Arc<dyn PacketService>,
        local: VirtualAddr,
        config: TransportConfig,
    ) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(config.queue_depth);
        let transport = Arc::new(Self {
            service: Arc::clone(&service),
            local,
            config,
            connections: StdMutex::new(HashMap::new()),
            accept_rx: Mutex::new(accept_rx),
            reader: StdMutex::new(None),
            shutting_down: AtomicBool::new(false),
        });

        let handle = tokio::spawn(reader_loop(
            service,
            Arc::downgrade(&transport),
            accept_tx,
        ));
        *transport.reader.lock().expect("reader lock poisoned") = Some(handle);
        log::debug!("[transport] {}  reader started", transport.local);
        transport
    }

    pub fn local_addr(&self) -> &VirtualAddr {
        &self.local
    }

    /// Number of live connections in the table.
    pub fn active_connections(&self) -> usize {
        self.connections.lock().expect("table lock poisoned").len()
    }

    /// Whether a connection to `remote` is currently in the table.
    pub fn is_active(&self, remote: &VirtualAddr) -> bool {
        let key = (remote.vip.clone(), remote.port, self.local.port);
        self.connections
            .lock()
            .expect("table lock poisoned")
            .contains_key(&key)
    }

    /// Active open toward `remote`.
    ///
    /// The connection is entered into the table before the handshake runs
    /// (so the reader can dispatch the SYN+ACK to it) and removed again if
    /// the handshake fails.
    pub async fn connect(
        self: &Arc<Self>,
        remote: VirtualAddr,
    ) -> Result<Arc<ReliableConnection>, TransportError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(TransportError::ChannelClosed);
        }
        let key = (remote.vip.clone(), remote.port, self.local.port);
        let connection = self.make_connection(remote.clone(), key.clone());

        {
            let mut table = self.connections.lock().expect("table lock poisoned");
            if table.contains_key(&key) {
                return Err(TransportError::DuplicateConnection);
            }
            table.insert(key.clone(), Arc::clone(&connection));
        }

        match connection.connect().await {
            Ok(()) => {
                log::debug!("[transport] {} -> {remote}  connection established", self.local);
                Ok(connection)
            }
            Err(e) => {
                self.remove(&key);
                Err(e)
            }
        }
    }

    /// Block until an inbound handshake completes and return the
    /// established connection.
    pub async fn accept(self: &Arc<Self>) -> Result<Arc<ReliableConnection>, TransportError> {
        loop {
            let syn = {
                let mut rx = self.accept_rx.lock().await;
                rx.recv().await.ok_or(TransportError::ChannelClosed)?
            };
            let remote = syn.source.clone();
            let key = (remote.vip.clone(), remote.port, syn.dest.port);

            let connection = self.make_connection(remote.clone(), key.clone());
            {
                let mut table = self.connections.lock().expect("table lock poisoned");
                if table.contains_key(&key) {
                    // Retransmitted SYN for a handshake already in progress.
                    log::debug!("[transport] {}  duplicate SYN from {remote} ignored", self.local);
                    continue;
                }
                table.insert(key.clone(), Arc::clone(&connection));
            }

            match connection.accept_from(syn).await {
                Ok(()) => {
                    log::debug!("[transport] {}  connection accepted from {remote}", self.local);
                    return Ok(connection);
                }
                Err(TransportError::ChannelClosed) => {
                    self.remove(&key);
                    return Err(TransportError::ChannelClosed);
                }
                Err(e) => {
                    // Handshake never completed; forget it and serve the
                    // next SYN.
                    log::warn!("[transport] {}  inbound handshake from {remote} failed: {e}", self.local);
                    self.remove(&key);
                }
            }
        }
    }

    /// Close every live connection in parallel, then stop the reader.
    ///
    /// The reader keeps running while the closes are in flight — the
    /// four-way teardown needs inbound ACKs and FINs dispatched.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Relaxed);
        log::debug!("[transport] {}  shutting down", self.local);

        let live: Vec<Arc<ReliableConnection>> = {
            let table = self.connections.lock().expect("table lock poisoned");
            table.values().cloned().collect()
        };
        let mut closes = JoinSet::new();
        for connection in live {
            closes.spawn(async move {
                if let Err(e) = connection.close().await {
                    log::warn!("[transport] close during shutdown failed: {e}");
                }
            });
        }
        while closes.join_next().await.is_some() {}

        if let Some(handle) = self.reader.lock().expect("reader lock poisoned").take() {
            handle.abort();
        }

        // Unblock anything still waiting on a queue.
        let table = self.connections.lock().expect("table lock poisoned");
        for connection in table.values() {
            connection.cancel();
        }
        log::debug!("[transport] {}  shut down", self.local);
    }

    /// Build a connection wired back to this transport through a non-owning
    /// handle: the packet service for sends, a weak reference for the
    /// on-close table removal.
    fn make_connection(self: &Arc<Self>, remote: VirtualAddr, key: ConnectionKey) -> Arc<ReliableConnection> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let on_close = Box::new(move || {
            if let Some(transport) = weak.upgrade() {
                transport.remove(&key);
            }
        });
        Arc::new(ReliableConnection::new(
            Arc::clone(&self.service),
            self.local.clone(),
            remote,
            self.config.clone(),
            on_close,
        ))
    }

    fn remove(&self, key: &ConnectionKey) {
        self.connections
            .lock()
            .expect("table lock poisoned")
            .remove(key);
        log::debug!("[transport] {}  connection removed (key={key:?})", self.local);
    }
}

/// Background reader: drain the packet service and dispatch by key.
async fn reader_loop(
    service: Arc<dyn PacketService>,
    transport: Weak<ReliableTransport>,
    accept_tx: mpsc::Sender<Segment>,
) {
    loop {
        let bytes = match service.receive().await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("[transport] reader: lower layer failed: {e}");
                if let Some(transport) = transport.upgrade() {
                    transport.fail_all();
                }
                return;
            }
        };
        let Some(transport) = transport.upgrade() else {
            return; // transport dropped
        };
        transport.route(bytes, &accept_tx).await;
    }
}

impl ReliableTransport {
    /// Dispatch one raw segment from the reader.
    async fn route(&self, bytes: Vec<u8>, accept_tx: &mpsc::Sender<Segment>) {
        let segment = match Segment::decode(&bytes) {
            Ok(segment) => segment,
            Err(e) => {
                log::debug!("[transport] {}  segment dropped: {e}", self.local);
                return;
            }
        };

        // The key from the receiver's perspective.
        let key = (
            segment.source.vip.clone(),
            segment.source.port,
            segment.dest.port,
        );
        let known = {
            let table = self.connections.lock().expect("table lock poisoned");
            table.get(&key).cloned()
        };

        if let Some(connection) = known {
            connection.dispatch(segment).await;
            return;
        }

        if segment.is_syn() && !segment.is_ack() {
            if self.shutting_down.load(Ordering::Relaxed) {
                log::debug!("[transport] {}  SYN ignored during shutdown", self.local);
                return;
            }
            log::debug!(
                "[transport] {}  SYN from {} awaiting accept",
                self.local,
                segment.source
            );
            let _ = accept_tx.send(segment).await;
            return;
        }

        if segment.is_fin() {
            // The peer is retransmitting a FIN for a connection we already
            // forgot; its ACK was lost. Re-acknowledge without creating
            // state.
            let ack = Segment::control(
                self.local.clone(),
                segment.source.clone(),
                flags::ACK,
                segment.seq,
            );
            log::debug!(
                "[transport] {}  re-ACK of FIN toward {} (no connection)",
                self.local,
                segment.source
            );
            if let Err(e) = self.service.send(&ack.dest.vip, &ack.encode()).await {
                log::warn!("[transport] {}  re-ACK of FIN failed: {e}", self.local);
            }
            return;
        }

        log::debug!(
            "[transport] {}  segment from {} dropped (no connection)",
            self.local,
            segment.source
        );
    }

    /// Propagate a terminal lower-layer failure to every blocked operation.
    fn fail_all(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let table = self.connections.lock().expect("table lock poisoned");
        for connection in table.values() {
            connection.cancel();
        }
    }
}
