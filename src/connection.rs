//! Per-peer reliable connection: stop-and-wait over the packet service.
//!
//! A [`ReliableConnection`] owns the complete state for one logical
//! peer-to-peer session:
//! - the connection state machine (three-way open, four-way close),
//! - the four inbound queues the multiplexer dispatches into
//!   (`ack`, `syn_ack`, `fin`, `data`),
//! - the stop-and-wait data path: fragmentation on send, reassembly and
//!   duplicate re-acknowledgement on receive.
//!
//! Every public operation appears synchronous to its caller; all waiting
//! happens on the queues and on the retransmission timer.  At most one
//! data segment is unacknowledged at any time.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::addr::VirtualAddr;
use crate::network::PacketService;
use crate::segment::{flags, Segment};
use crate::transport::{TransportConfig, TransportError};

/// All states of the connection state machine.
///
/// ```text
///  CLOSED ──SYN sent──▶ SYN_SENT ───SYN+ACK──▶ ESTABLISHED
///  CLOSED ──SYN rcvd──▶ SYN_RECEIVED ──ACK───▶ ESTABLISHED
///
///  ESTABLISHED ──FIN sent──▶ (ACK) ──▶ FIN_WAIT ──peer FIN──▶ CLOSED
///  ESTABLISHED ──peer FIN──▶ CLOSE_WAIT ──FIN sent──▶ LAST_ACK ──ACK──▶ CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No session; initial and final state.
    Closed,
    /// SYN sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received, SYN+ACK sent; waiting for the ACK of SYN.
    SynReceived,
    /// Handshake complete; data transfer legal.
    Established,
    /// Our FIN was acknowledged; waiting for the peer's FIN.
    FinWait,
    /// Peer's FIN observed; local close pending.
    CloseWait,
    /// Our FIN sent after the peer's; waiting for its ACK.
    LastAck,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Called exactly once when the connection finishes teardown, so the
/// multiplexer can drop its table entry.
pub(crate) type OnClose = Box<dyn FnOnce() + Send>;

/// Send-side state: the alternating bit and the ACK queue consumer.
///
/// Lives behind one async mutex so a second `send` (or a `close`) cannot
/// start until the previous operation returns.
struct SendHalf {
    seq: u8,
    ack_rx: mpsc::Receiver<Segment>,
}

/// Receive-side state: the expected bit and the data queue consumer.
struct RecvHalf {
    seq: u8,
    data_rx: mpsc::Receiver<Option<Segment>>,
}

/// A reliable stop-and-wait endpoint bound to one remote peer.
pub struct ReliableConnection {
    local: VirtualAddr,
    remote: VirtualAddr,
    service: Arc<dyn PacketService>,
    config: TransportConfig,
    state: StdMutex<ConnState>,
    /// Cooperative cancel flag; checked at every retransmission wake-up.
    cancelled: AtomicBool,

    ack_tx: mpsc::Sender<Segment>,
    syn_ack_tx: mpsc::Sender<Segment>,
    fin_tx: mpsc::Sender<Segment>,
    data_tx: mpsc::Sender<Option<Segment>>,

    send_half: Mutex<SendHalf>,
    recv_half: Mutex<RecvHalf>,
    fin_rx: Mutex<mpsc::Receiver<Segment>>,
    /// Taken by `connect`; `None` afterwards (the drainer task owns it).
    syn_ack_rx: StdMutex<Option<mpsc::Receiver<Segment>>>,
    on_close: StdMutex<Option<OnClose>>,
}

impl ReliableConnection {
    pub(crate) fn new(
        service: Arc<dyn PacketService>,
        local: VirtualAddr,
        remote: VirtualAddr,
        config: TransportConfig,
        on_close: OnClose,
    ) -> Self {
        let depth = config.queue_depth;
        let (ack_tx, ack_rx) = mpsc::channel(depth);
        let (syn_ack_tx, syn_ack_rx) = mpsc::channel(depth);
        let (fin_tx, fin_rx) = mpsc::channel(depth);
        let (data_tx, data_rx) = mpsc::channel(depth);

        Self {
            local,
            remote,
            service,
            config,
            state: StdMutex::new(ConnState::Closed),
            cancelled: AtomicBool::new(false),
            ack_tx,
            syn_ack_tx,
            fin_tx,
            data_tx,
            // The handshake exchanges its control segments on bit 0, so the
            // data path starts on bit 1 in both directions.
            send_half: Mutex::new(SendHalf { seq: 1, ack_rx }),
            recv_half: Mutex::new(RecvHalf { seq: 1, data_rx }),
            fin_rx: Mutex::new(fin_rx),
            syn_ack_rx: StdMutex::new(Some(syn_ack_rx)),
            on_close: StdMutex::new(Some(on_close)),
        }
    }

    pub fn local_addr(&self) -> &VirtualAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &VirtualAddr {
        &self.remote
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: ConnState) {
        let mut st = self.state.lock().expect("state lock poisoned");
        log::debug!("[transport] {} -> {}  state {} -> {next}", self.local, self.remote, *st);
        *st = next;
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Set the cooperative cancel flag and wake a blocked `receive`.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        let _ = self.data_tx.try_send(None);
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Active open: send SYN, retransmit until a SYN+ACK arrives, answer it
    /// with the ACK of SYN, and enter `Established`.
    pub(crate) async fn connect(&self) -> Result<(), TransportError> {
        self.set_state(ConnState::SynSent);
        let mut syn_ack_rx = self
            .syn_ack_rx
            .lock()
            .expect("syn_ack lock poisoned")
            .take()
            .ok_or(TransportError::ChannelClosed)?;

        let syn = Segment::control(self.local.clone(), self.remote.clone(), flags::SYN, 0);
        let mut attempts = 0u32;
        let syn_ack = loop {
            if self.is_cancelled() {
                return Err(TransportError::ChannelClosed);
            }
            self.emit(&syn).await;
            log::debug!("[transport] {} -> {}  SYN sent", self.local, self.remote);

            match tokio::time::timeout(self.config.retransmit_timeout, syn_ack_rx.recv()).await {
                Ok(Some(syn_ack)) => break syn_ack,
                Ok(None) => return Err(TransportError::ChannelClosed),
                Err(_) => {
                    attempts += 1;
                    if self.retries_exhausted(attempts) {
                        self.set_state(ConnState::Closed);
                        return Err(TransportError::HandshakeFailed);
                    }
                    log::warn!(
                        "[transport] {} -> {}  timeout waiting SYN+ACK, retransmitting",
                        self.local,
                        self.remote
                    );
                }
            }
        };

        self.emit_ack(syn_ack.seq).await;
        self.set_state(ConnState::Established);

        // The passive side retransmits its SYN+ACK until our ACK gets
        // through; keep a drainer on the queue that answers each duplicate.
        let service = Arc::clone(&self.service);
        let local = self.local.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            while let Some(dup) = syn_ack_rx.recv().await {
                let ack = Segment::control(local.clone(), remote.clone(), flags::ACK, dup.seq);
                log::debug!("[transport] {local} -> {remote}  duplicate SYN+ACK, ACK re-emitted");
                if service.send(&remote.vip, &ack.encode()).await.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    /// Passive open, driven by the multiplexer with the SYN it dequeued:
    /// send SYN+ACK, retransmit until the ACK of SYN arrives, and enter
    /// `Established`.
    pub(crate) async fn accept_from(&self, syn: Segment) -> Result<(), TransportError> {
        self.set_state(ConnState::SynReceived);
        let mut half = self.send_half.lock().await;

        let syn_ack = Segment::control(
            self.local.clone(),
            self.remote.clone(),
            flags::SYN | flags::ACK,
            syn.seq,
        );
        let mut attempts = 0u32;
        loop {
            if self.is_cancelled() {
                return Err(TransportError::ChannelClosed);
            }
            self.emit(&syn_ack).await;
            log::debug!("[transport] {} -> {}  SYN+ACK sent", self.local, self.remote);

            let deadline = Instant::now() + self.config.retransmit_timeout;
            if self.await_matching_ack(&mut half.ack_rx, syn.seq, deadline).await? {
                self.set_state(ConnState::Established);
                return Ok(());
            }
            attempts += 1;
            if self.retries_exhausted(attempts) {
                self.set_state(ConnState::Closed);
                return Err(TransportError::HandshakeFailed);
            }
            log::warn!(
                "[transport] {} -> {}  timeout waiting ACK of SYN, retransmitting",
                self.local,
                self.remote
            );
        }
    }

    // -----------------------------------------------------------------------
    // Data path
    // -----------------------------------------------------------------------

    /// Send one message reliably: fragment into MSS-sized chunks, transmit
    /// each with the alternating bit, and wait for its acknowledgement.
    ///
    /// Synchronous and delivery-confirmed: does not return until the last
    /// fragment has been acknowledged.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.state() != ConnState::Established {
            return Err(TransportError::NotConnected);
        }
        let mut half = self.send_half.lock().await;
        log::debug!(
            "[transport] {} -> {}  sending {} byte(s)",
            self.local,
            self.remote,
            data.len()
        );

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(self.config.mss).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.send_chunk(&mut half, chunk, i < last).await?;
        }
        Ok(())
    }

    async fn send_chunk(
        &self,
        half: &mut SendHalf,
        chunk: &[u8],
        more: bool,
    ) -> Result<(), TransportError> {
        let segment = Segment::data(
            self.local.clone(),
            self.remote.clone(),
            half.seq,
            more,
            chunk.to_vec(),
        );
        let mut attempts = 0u32;
        loop {
            if self.is_cancelled() {
                return Err(TransportError::ChannelClosed);
            }
            self.emit(&segment).await;

            let deadline = Instant::now() + self.config.retransmit_timeout;
            if self.await_matching_ack(&mut half.ack_rx, half.seq, deadline).await? {
                log::debug!(
                    "[transport] {} -> {}  chunk confirmed (seq={})",
                    self.local,
                    self.remote,
                    half.seq
                );
                half.seq ^= 1;
                return Ok(());
            }
            attempts += 1;
            if self.retries_exhausted(attempts) {
                return Err(TransportError::TimedOut);
            }
            log::warn!(
                "[transport] {} -> {}  timeout, retransmitting (seq={})",
                self.local,
                self.remote,
                half.seq
            );
        }
    }

    /// Receive one message: accept in-sequence fragments (acknowledging
    /// each), re-acknowledge duplicates without buffering, and return the
    /// reassembled bytes once a fragment with `more = false` is consumed.
    ///
    /// Returns `Ok(None)` once the peer has closed.
    pub async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if !matches!(self.state(), ConnState::Established | ConnState::CloseWait) {
            return Err(TransportError::NotConnected);
        }
        let mut half = self.recv_half.lock().await;
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let item = half.data_rx.recv().await.ok_or(TransportError::ChannelClosed)?;
            let Some(segment) = item else {
                if self.is_cancelled() {
                    return Err(TransportError::ChannelClosed);
                }
                log::debug!("[transport] {}  peer closed, receive drained", self.local);
                return Ok(None);
            };

            if segment.seq != half.seq {
                // Duplicate of the previous fragment: its ACK was lost.
                log::debug!(
                    "[transport] {}  duplicate discarded (got={} expected={})",
                    self.local,
                    segment.seq,
                    half.seq
                );
                self.emit_ack(half.seq ^ 1).await;
                continue;
            }

            self.emit_ack(segment.seq).await;
            half.seq ^= 1;
            buffer.extend_from_slice(&segment.payload);
            if !segment.more {
                break;
            }
        }

        log::debug!("[transport] {}  {} byte(s) received", self.local, buffer.len());
        Ok(Some(buffer))
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Graceful four-way close.
    ///
    /// Active path: FIN → (ACK) → `FinWait` → peer FIN (acknowledged by
    /// dispatch) → `Closed`.  Passive path (peer's FIN already observed):
    /// FIN → `LastAck` → (ACK) → `Closed`.  The `on_close` callback fires
    /// exactly once at the end of either path.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.state() == ConnState::Closed {
            return Ok(());
        }
        let mut half = self.send_half.lock().await;
        // Re-check: a concurrent close may have finished while we waited.
        let entry_state = self.state();
        if entry_state == ConnState::Closed {
            return Ok(());
        }
        let passive = entry_state == ConnState::CloseWait;
        if passive {
            self.set_state(ConnState::LastAck);
        }

        let fin = Segment::control(self.local.clone(), self.remote.clone(), flags::FIN, half.seq);
        let mut acked = false;
        for attempt in 1..=self.config.fin_max_retries {
            if self.is_cancelled() {
                break;
            }
            self.emit(&fin).await;
            log::debug!(
                "[transport] {} -> {}  FIN sent (seq={})",
                self.local,
                self.remote,
                fin.seq
            );

            let deadline = Instant::now() + self.config.retransmit_timeout;
            match self.await_matching_ack(&mut half.ack_rx, fin.seq, deadline).await {
                Ok(true) => {
                    acked = true;
                    break;
                }
                Ok(false) => log::warn!(
                    "[transport] {} -> {}  timeout waiting ACK of FIN ({attempt}/{})",
                    self.local,
                    self.remote,
                    self.config.fin_max_retries
                ),
                Err(_) => break,
            }
        }
        if !acked {
            log::warn!(
                "[transport] {} -> {}  FIN unacknowledged after {} attempt(s), closing anyway",
                self.local,
                self.remote,
                self.config.fin_max_retries
            );
        }

        if !passive && acked && !self.is_cancelled() {
            self.set_state(ConnState::FinWait);
            // The peer's FIN is acknowledged by dispatch the moment it
            // arrives; here we only wait to observe it.
            let mut fin_rx = self.fin_rx.lock().await;
            let patience = self.config.retransmit_timeout * self.config.fin_max_retries;
            match tokio::time::timeout(patience, fin_rx.recv()).await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => log::warn!(
                    "[transport] {} -> {}  peer FIN never arrived, closing anyway",
                    self.local,
                    self.remote
                ),
            }
        }

        self.set_state(ConnState::Closed);
        log::debug!("[transport] {} -> {}  connection closed", self.local, self.remote);
        self.fire_on_close();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch (called by the multiplexer reader)
    // -----------------------------------------------------------------------

    /// Classify an inbound segment and route it to the matching queue.
    ///
    /// This is the single place that observes peer FINs: each one is
    /// acknowledged immediately, independent of whether the application has
    /// called `close` yet.
    pub(crate) async fn dispatch(&self, segment: Segment) {
        if segment.is_fin() {
            self.emit_ack(segment.seq).await;
            log::debug!("[transport] {}  FIN received from {}", self.local, self.remote);
            if self.state() == ConnState::Established {
                self.set_state(ConnState::CloseWait);
            }
            let _ = self.fin_tx.send(segment).await;
            // Unblock a pending receive: end of stream.
            let _ = self.data_tx.send(None).await;
            return;
        }

        if segment.is_syn() && segment.is_ack() {
            let _ = self.syn_ack_tx.send(segment).await;
        } else if segment.is_syn() {
            log::debug!("[transport] {}  stray SYN dropped (state={})", self.local, self.state());
        } else if segment.is_ack() {
            let _ = self.ack_tx.send(segment).await;
        } else {
            let _ = self.data_tx.send(Some(segment)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Wait until `deadline` for an ACK carrying `seq`.
    ///
    /// Non-matching acknowledgements (duplicates from the previous bit) are
    /// discarded without resetting the deadline.  Returns `Ok(false)` on
    /// timeout.
    async fn await_matching_ack(
        &self,
        ack_rx: &mut mpsc::Receiver<Segment>,
        seq: u8,
        deadline: Instant,
    ) -> Result<bool, TransportError> {
        loop {
            match tokio::time::timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(ack)) if ack.seq == seq => return Ok(true),
                Ok(Some(ack)) => log::debug!(
                    "[transport] {}  duplicate ACK discarded (got={} expected={seq})",
                    self.local,
                    ack.seq
                ),
                Ok(None) => return Err(TransportError::ChannelClosed),
                Err(_) => return Ok(false),
            }
        }
    }

    async fn emit_ack(&self, seq: u8) {
        let ack = Segment::control(self.local.clone(), self.remote.clone(), flags::ACK, seq);
        self.emit(&ack).await;
        log::debug!("[transport] {} -> {}  ACK sent (seq={seq})", self.local, self.remote);
    }

    /// Hand a segment to the packet service.  Failures are logged and
    /// otherwise treated like channel loss: retransmission recovers the
    /// transient ones and the cancel flag ends the terminal ones.
    async fn emit(&self, segment: &Segment) {
        if let Err(e) = self.service.send(&segment.dest.vip, &segment.encode()).await {
            log::warn!(
                "[transport] {} -> {}  lower layer refused segment: {e}",
                self.local,
                self.remote
            );
        }
    }

    fn retries_exhausted(&self, attempts: u32) -> bool {
        self.config.max_retries.is_some_and(|cap| attempts >= cap)
    }

    fn fire_on_close(&self) {
        let callback = self.on_close.lock().expect("on_close lock poisoned").take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
