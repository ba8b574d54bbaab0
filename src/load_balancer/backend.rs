//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server
//! - Track in-flight forwards and the backend's position in the pool
//! - Own the tunnel slots and pick one per request, round-robin
//! - Evict broken tunnels with a compare-and-swap so exactly one forwarder
//!   reports the failure

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::load_balancer::forwarder::ForwardError;
use crate::load_balancer::pool::{HeapIndexed, NOT_IN_POOL};
use crate::load_balancer::session::Session;
use crate::net::connection::BoxedIo;
use crate::observability::metrics;
use crate::tunnel::Tunnel;

/// When and how tunnels are replaced before their stream ids run out.
#[derive(Debug, Clone, Copy)]
pub struct TunnelPolicy {
    /// Minimum time between two inspections of one backend's tunnels.
    pub check_interval: Duration,
    /// Next stream id above which a tunnel gets replaced.
    pub high_water: u32,
}

/// One tunnel position of a backend.
#[derive(Default)]
pub struct TunnelSlot {
    tunnel: ArcSwapOption<Tunnel>,
    replacing: AtomicBool,
}

impl TunnelSlot {
    /// Current tunnel, if any.
    pub fn load(&self) -> Option<Arc<Tunnel>> {
        self.tunnel.load_full()
    }

    pub fn is_replacing(&self) -> bool {
        self.replacing.load(Ordering::Acquire)
    }

    /// Set the replacing flag. Returns false if it was already set.
    pub fn mark_replacing(&self) -> bool {
        !self.replacing.swap(true, Ordering::AcqRel)
    }
}

/// A single backend server.
pub struct Backend {
    addr: String,
    /// Ordering key in failover mode. Assigned once.
    weight: u64,
    /// In-flight forwards. Only the scheduler task writes this.
    ongoing: AtomicUsize,
    heap_index: AtomicUsize,
    tunnels: Box<[TunnelSlot]>,
    /// Dispatch counter, drives round-robin slot selection.
    requests: AtomicU64,
    last_tunnel_check: Mutex<Option<Instant>>,
    retired: AtomicBool,
    fail_tx: mpsc::UnboundedSender<Session>,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

impl Backend {
    /// Create a new backend with `tunnel_count` empty slots.
    pub fn new(
        addr: impl Into<String>,
        tunnel_count: usize,
        weight: u64,
        fail_tx: mpsc::UnboundedSender<Session>,
    ) -> Self {
        Self {
            addr: addr.into(),
            weight,
            ongoing: AtomicUsize::new(0),
            heap_index: AtomicUsize::new(NOT_IN_POOL),
            tunnels: (0..tunnel_count).map(|_| TunnelSlot::default()).collect(),
            requests: AtomicU64::new(0),
            last_tunnel_check: Mutex::new(None),
            retired: AtomicBool::new(false),
            fail_tx,
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn ongoing(&self) -> usize {
        self.ongoing.load(Ordering::Relaxed)
    }

    pub fn inc_ongoing(&self) {
        self.ongoing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_ongoing(&self) {
        let _ = self
            .ongoing
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Whether the backend currently sits in the pool.
    pub fn in_pool(&self) -> bool {
        self.heap_index() != NOT_IN_POOL
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn slot(&self, index: usize) -> Option<&TunnelSlot> {
        self.tunnels.get(index)
    }

    /// Number of slots holding a tunnel right now.
    pub fn open_tunnels(&self) -> usize {
        self.tunnels.iter().filter(|s| s.load().is_some()).count()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Mark the backend destroyed and close every tunnel.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        for slot in self.tunnels.iter() {
            if let Some(tunnel) = slot.tunnel.swap(None) {
                tunnel.close();
            }
        }
    }

    pub fn record_bytes(&self, rx: u64, tx: u64) {
        self.rx_bytes.fetch_add(rx, Ordering::Relaxed);
        self.tx_bytes.fetch_add(tx, Ordering::Relaxed);
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Install `tunnel` into `slot`, closing whatever was there before.
    pub fn switch_tunnel(&self, slot: usize, tunnel: Arc<Tunnel>) {
        let Some(target) = self.tunnels.get(slot) else {
            tunnel.close();
            return;
        };
        if let Some(previous) = target.tunnel.swap(Some(tunnel)) {
            previous.close();
        }
        target.replacing.store(false, Ordering::Release);
    }

    /// Count a dispatch and, at most once per check interval, request
    /// replacement of tunnels close to running out of stream ids.
    pub fn check_tunnel_health(&self, policy: &TunnelPolicy, mut on_replace: impl FnMut(usize)) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.tunnels.is_empty() {
            return;
        }

        {
            let now = Instant::now();
            let mut last = self
                .last_tunnel_check
                .lock()
                .expect("tunnel check mutex poisoned");
            if matches!(*last, Some(at) if now.duration_since(at) < policy.check_interval) {
                return;
            }
            *last = Some(now);
        }

        for (index, slot) in self.tunnels.iter().enumerate() {
            let Some(tunnel) = slot.load() else { continue };
            if tunnel.next_stream_id() > policy.high_water && slot.mark_replacing() {
                tracing::info!(
                    backend = %self.addr,
                    slot = index,
                    next_stream_id = tunnel.next_stream_id(),
                    "Tunnel nearly exhausted, replacing"
                );
                metrics::record_session("replaced");
                on_replace(index);
            }
        }
    }

    /// Empty `slot` if it still holds `tunnel`. Returns whether this call won.
    pub fn evict_tunnel(&self, slot: usize, tunnel: &Arc<Tunnel>) -> bool {
        let Some(target) = self.tunnels.get(slot) else {
            return false;
        };
        let current = Some(Arc::clone(tunnel));
        let previous = target.tunnel.compare_and_swap(&current, None);
        matches!(&*previous, Some(p) if Arc::ptr_eq(p, tunnel))
    }

    /// Open a byte stream to the backend.
    ///
    /// Tries every tunnel slot round-robin; falls back to a direct TCP dial
    /// when no tunnel yields a stream.
    pub async fn open_upstream(self: &Arc<Self>) -> Result<BoxedIo, ForwardError> {
        let count = self.tunnels.len();
        let start = self.requests.load(Ordering::Relaxed) as usize;

        for i in 0..count {
            let index = (start + i) % count;
            let Some(tunnel) = self.tunnels[index].load() else {
                continue;
            };

            match tunnel.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) if !e.breaks_session() => {
                    // The agent is up but its service is not; other tunnels would say the same.
                    tracing::debug!(backend = %self.addr, slot = index, error = %e, "Tunnel stream refused");
                    break;
                }
                Err(e) => {
                    tracing::warn!(backend = %self.addr, slot = index, error = %e, "Tunnel stream failed");
                    if self.evict_tunnel(index, &tunnel) {
                        tunnel.close();
                        metrics::record_session("evicted");
                        let _ = self.fail_tx.send(Session::failed(Arc::clone(self), index, tunnel));
                    }
                }
            }
        }

        let stream = TcpStream::connect(self.addr.as_str())
            .await
            .map_err(|source| ForwardError::Dial {
                addr: self.addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

impl HeapIndexed for Backend {
    fn heap_index(&self) -> usize {
        self.heap_index.load(Ordering::Relaxed)
    }

    fn set_heap_index(&self, index: usize) {
        self.heap_index.store(index, Ordering::Relaxed);
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("addr", &self.addr)
            .field("weight", &self.weight)
            .field("ongoing", &self.ongoing())
            .field("heap_index", &self.heap_index())
            .field("open_tunnels", &self.open_tunnels())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Least-loaded ordering: fewer in-flight forwards first.
pub fn by_ongoing(a: &Arc<Backend>, b: &Arc<Backend>) -> bool {
    a.ongoing() < b.ongoing()
}

/// Failover ordering: lowest weight first, regardless of load.
pub fn by_weight(a: &Arc<Backend>, b: &Arc<Backend>) -> bool {
    a.weight < b.weight
}
