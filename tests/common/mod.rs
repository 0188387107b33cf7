//! Shared test helpers: an in-memory packet service pair with scripted
//! fault injection, so transport scenarios can drop, record, or pass
//! specific segments deterministically.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use netstack_sim::addr::{Port, VirtualAddr, Vip};
use netstack_sim::network::{NetError, PacketService};
use netstack_sim::segment::Segment;
use netstack_sim::transport::{ReliableTransport, TransportConfig};

/// Decision a fault hook makes for one outbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Drop,
}

/// Inspects the `n`-th outbound segment of one direction and decides its
/// fate.  Hooks run synchronously inside `send`.
pub type FaultHook = Arc<dyn Fn(u64, &Segment) -> Verdict + Send + Sync>;

pub fn deliver_all() -> FaultHook {
    Arc::new(|_, _| Verdict::Deliver)
}

pub fn drop_all() -> FaultHook {
    Arc::new(|_, _| Verdict::Drop)
}

/// Drop every second segment of the direction (a half-loss channel).
pub fn drop_every_other() -> FaultHook {
    Arc::new(|n, _| if n % 2 == 1 { Verdict::Drop } else { Verdict::Deliver })
}

/// Drop the first segment matching `predicate`; deliver everything else.
pub fn drop_first_matching(
    predicate: impl Fn(&Segment) -> bool + Send + Sync + 'static,
) -> FaultHook {
    let tripped = AtomicU64::new(0);
    Arc::new(move |_, segment| {
        if predicate(segment) && tripped.fetch_add(1, Ordering::Relaxed) == 0 {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    })
}

/// A recorder that can be shared between hooks and assertions.
#[derive(Clone, Default)]
pub struct Tape {
    entries: Arc<StdMutex<Vec<(&'static str, Segment)>>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, direction: &'static str, segment: &Segment) {
        self.entries
            .lock()
            .unwrap()
            .push((direction, segment.clone()));
    }

    pub fn entries(&self) -> Vec<(&'static str, Segment)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Record everything in `direction`, delivering it unchanged.
    pub fn hook(&self, direction: &'static str) -> FaultHook {
        let tape = self.clone();
        Arc::new(move |_, segment| {
            tape.record(direction, segment);
            Verdict::Deliver
        })
    }
}

/// One endpoint of an in-memory packet service pair.
pub struct MemService {
    peer_tx: mpsc::Sender<Vec<u8>>,
    inbox: Mutex<mpsc::Receiver<Vec<u8>>>,
    hook: FaultHook,
    counter: AtomicU64,
}

#[async_trait]
impl PacketService for MemService {
    async fn send(&self, _dest: &Vip, segment: &[u8]) -> Result<(), NetError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let decoded = Segment::decode(segment).expect("transport emits well-formed segments");
        match (self.hook)(n, &decoded) {
            Verdict::Drop => Ok(()), // silent loss, like the real channel
            Verdict::Deliver => {
                let _ = self.peer_tx.send(segment.to_vec()).await;
                Ok(())
            }
        }
    }

    async fn receive(&self) -> Result<Vec<u8>, NetError> {
        let mut rx = self.inbox.lock().await;
        match rx.recv().await {
            Some(bytes) => Ok(bytes),
            // Peer dropped: behave like a silent channel, not an error.
            None => std::future::pending().await,
        }
    }
}

/// Two packet services wired back to back, each direction with its own
/// fault hook.
pub fn service_pair(a_to_b: FaultHook, b_to_a: FaultHook) -> (Arc<MemService>, Arc<MemService>) {
    let (tx_ab, rx_ab) = mpsc::channel(256);
    let (tx_ba, rx_ba) = mpsc::channel(256);
    let a = Arc::new(MemService {
        peer_tx: tx_ab,
        inbox: Mutex::new(rx_ba),
        hook: a_to_b,
        counter: AtomicU64::new(0),
    });
    let b = Arc::new(MemService {
        peer_tx: tx_ba,
        inbox: Mutex::new(rx_ab),
        hook: b_to_a,
        counter: AtomicU64::new(0),
    });
    (a, b)
}

pub fn endpoint(label: &str, port: u16) -> VirtualAddr {
    VirtualAddr::new(Vip::new(label).unwrap(), Port::new(port).unwrap())
}

/// A transport config with a short timeout so lossy-channel tests converge
/// quickly (while leaving enough slack that a fault-free exchange never
/// retransmits).
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        retransmit_timeout: Duration::from_millis(250),
        ..TransportConfig::default()
    }
}

/// A client transport (HOST_A:10000) and a server transport (HOST_S:10002)
/// talking through the in-memory pair.
pub fn transport_pair(
    client_hook: FaultHook,
    server_hook: FaultHook,
    config: TransportConfig,
) -> (Arc<ReliableTransport>, Arc<ReliableTransport>) {
    let (client_service, server_service) = service_pair(client_hook, server_hook);
    let client = ReliableTransport::new(client_service, endpoint("HOST_A", 10000), config.clone());
    let server = ReliableTransport::new(server_service, endpoint("HOST_S", 10002), config);
    (client, server)
}
