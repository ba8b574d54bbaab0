//! The scheduler: a single task owning every piece of balancing state.
//!
//! # Responsibilities
//! - Keep the backend table, the priority pool and the pending queue
//! - Apply health snapshots (add, remove, bring back up)
//! - Dispatch requests to the best backend and spawn forwarders
//! - React to forward completions, tunnel failures and new tunnels
//! - Answer stats queries and tear everything down on shutdown
//!
//! Events from different channels arrive in any order, so every transition
//! re-checks membership (table identity, pool index, retired flag) instead
//! of assuming a sequence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::{BalancerConfig, ScheduleMode};
use crate::health::HealthSnapshot;
use crate::lifecycle::Shutdown;
use crate::load_balancer::backend::{by_ongoing, by_weight, Backend, TunnelPolicy};
use crate::load_balancer::forwarder::{forward, Finished, Outcome, Request};
use crate::load_balancer::pool::{HeapIndexed, Pool};
use crate::load_balancer::session::{Session, SessionManager, SessionSettings};
use crate::net::connection::ConnectionTracker;
use crate::observability::metrics;
use crate::tunnel::Dialer;

const JOB_QUEUE_CAPACITY: usize = 1024;
const STATUS_QUEUE_CAPACITY: usize = 16;
const STATS_QUEUE_CAPACITY: usize = 16;

/// Scheduling knobs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub mode: ScheduleMode,
    pub shuffle: bool,
    pub max_backends: usize,
    pub max_forwarders_per_backend: usize,
    pub tunnel_count: usize,
    pub tunnel_policy: TunnelPolicy,
    pub session: SessionSettings,
}

impl SchedulerSettings {
    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            mode: config.scheduler.mode,
            shuffle: config.scheduler.shuffle,
            max_backends: config.scheduler.max_backends,
            max_forwarders_per_backend: config.scheduler.max_forwarders_per_backend,
            tunnel_count: config.tunnel.count,
            tunnel_policy: TunnelPolicy {
                check_interval: Duration::from_secs(config.tunnel.check_interval_secs),
                high_water: config.tunnel.stream_id_high_water,
            },
            session: SessionSettings {
                agent_port: config.tunnel.agent_port.clone(),
                dial_timeout: Duration::from_millis(config.tunnel.dial_timeout_ms),
                retry_interval: Duration::from_millis(config.tunnel.retry_interval_ms),
            },
        }
    }
}

/// Per-backend view returned by a stats query.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub address: String,
    pub ongoing: usize,
    pub in_pool: bool,
    /// Still waiting for its first tunnel.
    pub connecting: bool,
    pub weight: u64,
    pub open_tunnels: usize,
    pub tunnel_slots: usize,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Scheduler state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub pool_size: usize,
    pub pending: usize,
    pub forwarders: u64,
    pub backends: Vec<BackendStats>,
}

/// Cloneable entry points into a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    jobs: mpsc::Sender<Request>,
    status: mpsc::Sender<HealthSnapshot>,
    stats: mpsc::Sender<oneshot::Sender<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Sender for accepted connections.
    pub fn jobs(&self) -> mpsc::Sender<Request> {
        self.jobs.clone()
    }

    /// Sender for health snapshots.
    pub fn status(&self) -> mpsc::Sender<HealthSnapshot> {
        self.status.clone()
    }

    /// Ask the scheduler for its current state. `None` once it stopped.
    pub async fn stats(&self) -> Option<SchedulerStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.stats.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }
}

/// The scheduler task.
pub struct Scheduler {
    settings: SchedulerSettings,
    /// Schedulable backends by address (in the pool unless evicted).
    backends: HashMap<String, Arc<Backend>>,
    /// Backends waiting for their first tunnel.
    connecting: HashMap<String, Arc<Backend>>,
    pool: Pool<Arc<Backend>>,
    pending: VecDeque<Request>,
    next_weight: u64,
    sessions: SessionManager,
    tracker: ConnectionTracker,
    shutdown: Shutdown,

    done_tx: mpsc::UnboundedSender<Finished>,
    done_rx: mpsc::UnboundedReceiver<Finished>,
    fail_tx: mpsc::UnboundedSender<Session>,
    fail_rx: mpsc::UnboundedReceiver<Session>,
    ready_rx: mpsc::UnboundedReceiver<Session>,
    jobs_rx: mpsc::Receiver<Request>,
    status_rx: mpsc::Receiver<HealthSnapshot>,
    stats_rx: mpsc::Receiver<oneshot::Sender<SchedulerStats>>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        dialer: Arc<dyn Dialer>,
        tracker: ConnectionTracker,
        shutdown: Shutdown,
    ) -> (Self, SchedulerHandle) {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(STATUS_QUEUE_CAPACITY);
        let (stats_tx, stats_rx) = mpsc::channel(STATS_QUEUE_CAPACITY);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        let sessions = SessionManager::new(dialer, settings.session.clone(), ready_tx, shutdown.clone());
        let less: fn(&Arc<Backend>, &Arc<Backend>) -> bool = match settings.mode {
            ScheduleMode::LeastLoaded => by_ongoing,
            ScheduleMode::Failover => by_weight,
        };

        let scheduler = Self {
            settings,
            backends: HashMap::new(),
            connecting: HashMap::new(),
            pool: Pool::new(less),
            pending: VecDeque::new(),
            next_weight: 0,
            sessions,
            tracker,
            shutdown,
            done_tx,
            done_rx,
            fail_tx,
            fail_rx,
            ready_rx,
            jobs_rx,
            status_rx,
            stats_rx,
        };
        let handle = SchedulerHandle {
            jobs: jobs_tx,
            status: status_tx,
            stats: stats_tx,
        };
        (scheduler, handle)
    }

    /// Event loop. Returns after shutdown, once every backend is torn down.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(
            mode = ?self.settings.mode,
            tunnels = self.settings.tunnel_count,
            max_forwarders_per_backend = self.settings.max_forwarders_per_backend,
            "Scheduler started"
        );

        while !self.shutdown.is_triggered() {
            tokio::select! {
                Some(finished) = self.done_rx.recv() => self.on_finished(finished),
                Some(snapshot) = self.status_rx.recv() => self.on_status(snapshot),
                Some(session) = self.fail_rx.recv() => self.on_session_failed(session),
                Some(session) = self.ready_rx.recv() => self.on_session_ready(session),
                Some(request) = self.jobs_rx.recv() => self.on_request(request),
                Some(reply) = self.stats_rx.recv() => {
                    let _ = reply.send(self.stats());
                }
                _ = shutdown.recv() => break,
            }
            self.publish_gauges();
        }

        self.on_shutdown();
    }

    fn on_request(&mut self, request: Request) {
        if self.pool.is_empty() {
            tracing::debug!(connection_id = %request.id(), pending = self.pending.len() + 1, "No backend available, queueing");
            self.pending.push_back(request);
            return;
        }
        self.dispatch(request);
    }

    fn dispatch(&mut self, request: Request) {
        let Some(backend) = self.pool.pop() else {
            self.pending.push_back(request);
            return;
        };

        if backend.ongoing() >= self.settings.max_forwarders_per_backend {
            tracing::warn!(
                backend = %backend.addr(),
                ongoing = backend.ongoing(),
                connection_id = %request.id(),
                "Backend at forwarder ceiling, refusing connection"
            );
            self.pool.push(backend);
            metrics::record_rejected();
            return;
        }

        backend.inc_ongoing();
        self.pool.push(Arc::clone(&backend));

        let sessions = &self.sessions;
        backend.check_tunnel_health(&self.settings.tunnel_policy, |slot| {
            sessions.request(Session::new(Arc::clone(&backend), slot));
        });

        tracing::debug!(connection_id = %request.id(), backend = %backend.addr(), ongoing = backend.ongoing(), "Dispatched");
        metrics::record_backend_ongoing(backend.addr(), backend.ongoing());

        let guard = self.tracker.track(request.id());
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let finished = forward(backend, request).await;
            drop(guard);
            let _ = done_tx.send(finished);
        });
    }

    fn on_finished(&mut self, finished: Finished) {
        let Finished { backend, outcome } = finished;
        backend.dec_ongoing();
        metrics::record_request(outcome.label());
        metrics::record_backend_ongoing(backend.addr(), backend.ongoing());

        match outcome {
            Outcome::DialFailed { request, error } => {
                tracing::warn!(
                    backend = %backend.addr(),
                    connection_id = %request.id(),
                    error = %error,
                    "Backend unreachable, rescheduling"
                );
                if backend.in_pool() {
                    self.pool.remove(backend.heap_index());
                }
                metrics::record_rescheduled();
                self.on_request(request);
            }
            Outcome::Failed(error) => {
                tracing::info!(backend = %backend.addr(), error = %error, "Forward ended with error");
                self.resort(&backend);
            }
            Outcome::Completed(_) => self.resort(&backend),
        }
    }

    fn resort(&mut self, backend: &Arc<Backend>) {
        if backend.in_pool() {
            self.pool.fix(backend.heap_index());
        }
    }

    fn on_status(&mut self, snapshot: HealthSnapshot) {
        let healthy: HashSet<&str> = snapshot
            .iter()
            .filter(|(_, flag)| flag.is_up())
            .map(|(addr, _)| addr.as_str())
            .collect();

        if healthy.is_empty() {
            tracing::warn!(tracked = self.backends.len() + self.connecting.len(), "Empty health snapshot ignored");
            return;
        }

        let gone: Vec<String> = self
            .backends
            .keys()
            .chain(self.connecting.keys())
            .filter(|addr| !healthy.contains(addr.as_str()))
            .cloned()
            .collect();
        for addr in gone {
            self.remove_backend(&addr);
        }

        for addr in &healthy {
            if let Some(backend) = self.backends.get(*addr) {
                if !backend.in_pool() {
                    tracing::info!(backend = %addr, "Backend brought back up");
                    self.pool.push(Arc::clone(backend));
                }
            }
        }

        let mut fresh: Vec<String> = healthy
            .iter()
            .filter(|addr| !self.backends.contains_key(**addr) && !self.connecting.contains_key(**addr))
            .map(|addr| addr.to_string())
            .collect();
        fresh.sort();
        if self.settings.mode == ScheduleMode::LeastLoaded && self.settings.shuffle {
            fastrand::shuffle(&mut fresh);
        }

        for addr in fresh {
            if self.backends.len() + self.connecting.len() >= self.settings.max_backends {
                tracing::warn!(backend = %addr, max_backends = self.settings.max_backends, "Too many backends, ignoring");
                continue;
            }
            self.add_backend(addr);
        }

        self.drain_pending();
    }

    fn add_backend(&mut self, addr: String) {
        let weight = self.next_weight;
        self.next_weight += 1;
        let backend = Arc::new(Backend::new(
            addr.clone(),
            self.settings.tunnel_count,
            weight,
            self.fail_tx.clone(),
        ));

        if self.settings.tunnel_count == 0 {
            tracing::info!(backend = %addr, weight, "Backend added");
            self.make_schedulable(backend);
            return;
        }

        tracing::info!(backend = %addr, weight, tunnels = self.settings.tunnel_count, "Backend connecting");
        for slot in 0..self.settings.tunnel_count {
            self.sessions.request(Session::new(Arc::clone(&backend), slot));
        }
        self.connecting.insert(addr, backend);
    }

    fn make_schedulable(&mut self, backend: Arc<Backend>) {
        self.pool.push(Arc::clone(&backend));
        self.backends.insert(backend.addr().to_string(), backend);
    }

    fn remove_backend(&mut self, addr: &str) {
        let Some(backend) = self.backends.remove(addr).or_else(|| self.connecting.remove(addr)) else {
            return;
        };
        if backend.in_pool() {
            self.pool.remove(backend.heap_index());
        }
        backend.retire();
        tracing::info!(backend = %addr, ongoing = backend.ongoing(), "Backend removed");
        metrics::record_backend_ongoing(addr, 0);
    }

    /// Whether `backend` is the instance currently tracked for its address.
    fn is_current(&self, backend: &Arc<Backend>) -> bool {
        self.backends
            .get(backend.addr())
            .or_else(|| self.connecting.get(backend.addr()))
            .is_some_and(|tracked| Arc::ptr_eq(tracked, backend))
    }

    fn on_session_failed(&mut self, session: Session) {
        let backend = session.backend;
        if backend.is_retired() || !self.is_current(&backend) {
            return;
        }
        let Some(slot) = backend.slot(session.slot) else {
            return;
        };
        if let (Some(failed), Some(current)) = (&session.tunnel, slot.load()) {
            if !Arc::ptr_eq(failed, &current) {
                tracing::debug!(backend = %backend.addr(), slot = session.slot, "Failed tunnel already replaced");
                return;
            }
        }
        if slot.mark_replacing() {
            tracing::info!(backend = %backend.addr(), slot = session.slot, "Re-establishing tunnel");
            self.sessions.request(Session::new(Arc::clone(&backend), session.slot));
        } else {
            tracing::debug!(backend = %backend.addr(), slot = session.slot, "Tunnel already being replaced");
        }
    }

    fn on_session_ready(&mut self, session: Session) {
        let Session {
            backend,
            slot,
            tunnel,
        } = session;
        let Some(tunnel) = tunnel else {
            return;
        };

        if backend.is_retired() || !self.is_current(&backend) {
            tracing::debug!(backend = %backend.addr(), slot, "Dropping tunnel for removed backend");
            tunnel.close();
            return;
        }

        backend.switch_tunnel(slot, tunnel);
        tracing::debug!(backend = %backend.addr(), slot, open_tunnels = backend.open_tunnels(), "Tunnel installed");

        if let Some(ready) = self.connecting.remove(backend.addr()) {
            tracing::info!(backend = %ready.addr(), weight = ready.weight(), "Backend added");
            self.make_schedulable(ready);
            self.drain_pending();
        }
    }

    fn drain_pending(&mut self) {
        while !self.pool.is_empty() {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(request);
        }
    }

    fn stats(&self) -> SchedulerStats {
        let describe = |backend: &Arc<Backend>, connecting: bool| BackendStats {
            address: backend.addr().to_string(),
            ongoing: backend.ongoing(),
            in_pool: backend.in_pool(),
            connecting,
            weight: backend.weight(),
            open_tunnels: backend.open_tunnels(),
            tunnel_slots: backend.tunnel_count(),
            rx_bytes: backend.rx_bytes(),
            tx_bytes: backend.tx_bytes(),
        };

        let mut backends: Vec<BackendStats> = self
            .backends
            .values()
            .map(|b| describe(b, false))
            .chain(self.connecting.values().map(|b| describe(b, true)))
            .collect();
        backends.sort_by(|a, b| a.address.cmp(&b.address));

        SchedulerStats {
            pool_size: self.pool.len(),
            pending: self.pending.len(),
            forwarders: self.tracker.active_count(),
            backends,
        }
    }

    fn publish_gauges(&self) {
        metrics::record_scheduler_state(
            self.backends.len() + self.connecting.len(),
            self.pool.len(),
            self.pending.len(),
        );
    }

    fn on_shutdown(&mut self) {
        let addrs: Vec<String> = self
            .backends
            .keys()
            .chain(self.connecting.keys())
            .cloned()
            .collect();
        for addr in addrs {
            self.remove_backend(&addr);
        }
        if !self.pending.is_empty() {
            tracing::info!(pending = self.pending.len(), "Dropping queued connections");
            self.pending.clear();
        }
        self.publish_gauges();
        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthFlag;
    use crate::load_balancer::testing::FakeTunnel;
    use crate::tunnel::{Tunnel, TunnelError};
    use futures_util::future::BoxFuture;

    struct NeverDialer;

    impl Dialer for NeverDialer {
        fn dial(&self, _agent: String) -> BoxFuture<'static, Result<Tunnel, TunnelError>> {
            Box::pin(futures_util::future::pending())
        }
    }

    struct FakeDialer;

    impl Dialer for FakeDialer {
        fn dial(&self, _agent: String) -> BoxFuture<'static, Result<Tunnel, TunnelError>> {
            Box::pin(async { Ok(FakeTunnel::healthy().0) })
        }
    }

    fn settings(tunnels: usize, mode: ScheduleMode) -> SchedulerSettings {
        let mut config = BalancerConfig::default();
        config.tunnel.count = tunnels;
        config.scheduler.mode = mode;
        SchedulerSettings::from_config(&config)
    }

    fn scheduler(tunnels: usize, dialer: Arc<dyn Dialer>) -> Scheduler {
        Scheduler::new(
            settings(tunnels, ScheduleMode::LeastLoaded),
            dialer,
            ConnectionTracker::new(),
            Shutdown::new(),
        )
        .0
    }

    fn snapshot(addrs: &[&str]) -> HealthSnapshot {
        addrs.iter().map(|a| (a.to_string(), HealthFlag::Up)).collect()
    }

    fn request() -> Request {
        Request::new(Box::new(tokio::io::duplex(8).0), "test")
    }

    fn assert_pool_consistent(s: &Scheduler) {
        for (pos, backend) in s.pool.iter().enumerate() {
            assert_eq!(backend.heap_index(), pos);
            assert!(s.is_current(backend));
        }
    }

    #[tokio::test]
    async fn snapshot_adds_and_removes() {
        let mut s = scheduler(0, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306", "10.0.0.2:3306"]));
        assert_eq!(s.pool.len(), 2);

        let removed = s.backends["10.0.0.1:3306"].clone();
        s.on_status(snapshot(&["10.0.0.2:3306"]));
        assert_eq!(s.pool.len(), 1);
        assert!(removed.is_retired());
        assert!(!removed.in_pool());
        assert_pool_consistent(&s);
    }

    #[tokio::test]
    async fn down_flags_count_as_absent() {
        let mut s = scheduler(0, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306", "10.0.0.2:3306"]));

        let mut next = snapshot(&["10.0.0.1:3306"]);
        next.insert("10.0.0.2:3306".into(), HealthFlag::Down);
        s.on_status(next);
        assert_eq!(s.backends.len(), 1);
    }

    #[tokio::test]
    async fn empty_snapshot_changes_nothing() {
        let mut s = scheduler(0, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        s.on_status(HealthSnapshot::new());
        assert_eq!(s.backends.len(), 1);
        assert_eq!(s.pool.len(), 1);
    }

    #[tokio::test]
    async fn evicted_backend_is_brought_back_once() {
        let mut s = scheduler(0, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        let backend = s.backends["10.0.0.1:3306"].clone();
        s.pool.remove(backend.heap_index());

        s.on_status(snapshot(&["10.0.0.1:3306"]));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        assert_eq!(s.pool.len(), 1);
        assert!(backend.in_pool());
        assert_pool_consistent(&s);
    }

    #[tokio::test]
    async fn max_backends_is_enforced() {
        let mut config = BalancerConfig::default();
        config.scheduler.max_backends = 2;
        let (mut s, _handle) = Scheduler::new(
            SchedulerSettings::from_config(&config),
            Arc::new(NeverDialer),
            ConnectionTracker::new(),
            Shutdown::new(),
        );
        s.on_status(snapshot(&["a:1", "b:1", "c:1"]));
        assert_eq!(s.backends.len(), 2);
    }

    #[tokio::test]
    async fn failover_weights_follow_address_order() {
        let (mut s, _handle) = Scheduler::new(
            settings(0, ScheduleMode::Failover),
            Arc::new(NeverDialer),
            ConnectionTracker::new(),
            Shutdown::new(),
        );
        s.on_status(snapshot(&["c:1", "a:1", "b:1"]));
        assert_eq!(s.backends["a:1"].weight(), 0);
        assert_eq!(s.backends["b:1"].weight(), 1);
        assert_eq!(s.backends["c:1"].weight(), 2);
        assert_eq!(s.pool.peek().unwrap().addr(), "a:1");
    }

    #[tokio::test]
    async fn requests_queue_while_pool_is_empty() {
        let mut s = scheduler(0, Arc::new(NeverDialer));
        let first = request();
        let second = request();
        let ids = [first.id(), second.id()];
        s.on_request(first);
        s.on_request(second);

        assert_eq!(s.pending.len(), 2);
        let queued: Vec<_> = s.pending.iter().map(|r| r.id()).collect();
        assert_eq!(queued, ids);
    }

    #[tokio::test]
    async fn dispatch_refuses_at_ceiling() {
        let mut config = BalancerConfig::default();
        config.scheduler.max_forwarders_per_backend = 1;
        let (mut s, _handle) = Scheduler::new(
            SchedulerSettings::from_config(&config),
            Arc::new(NeverDialer),
            ConnectionTracker::new(),
            Shutdown::new(),
        );
        s.on_status(snapshot(&["127.0.0.1:1"]));
        let backend = s.backends["127.0.0.1:1"].clone();
        backend.inc_ongoing();

        s.on_request(request());
        assert_eq!(backend.ongoing(), 1);
        assert!(s.pending.is_empty());
        assert!(backend.in_pool());
    }

    #[tokio::test]
    async fn connecting_backend_joins_pool_on_first_tunnel() {
        let mut s = scheduler(2, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        assert!(s.pool.is_empty());
        assert_eq!(s.connecting.len(), 1);

        let backend = s.connecting["10.0.0.1:3306"].clone();
        let mut session = Session::new(backend.clone(), 1);
        session.tunnel = Some(Arc::new(FakeTunnel::healthy().0));
        s.on_session_ready(session);

        assert!(s.connecting.is_empty());
        assert!(backend.in_pool());
        assert_eq!(backend.open_tunnels(), 1);
    }

    #[tokio::test]
    async fn tunnel_for_superseded_backend_is_closed() {
        let mut s = scheduler(1, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        let stale = s.connecting["10.0.0.1:3306"].clone();
        s.on_status(snapshot(&["10.0.0.2:3306"]));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        assert!(stale.is_retired());

        let (tunnel, state) = FakeTunnel::healthy();
        let mut session = Session::new(stale, 0);
        session.tunnel = Some(Arc::new(tunnel));
        s.on_session_ready(session);

        assert_eq!(state.closes(), 1);
        assert!(s.backends.is_empty());
    }

    #[tokio::test]
    async fn session_failure_requests_one_replacement() {
        let mut s = scheduler(1, Arc::new(FakeDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        let ready = s.ready_rx.recv().await.unwrap();
        s.on_session_ready(ready);
        let backend = s.backends["10.0.0.1:3306"].clone();

        s.on_session_failed(Session::new(backend.clone(), 0));
        s.on_session_failed(Session::new(backend.clone(), 0));
        assert!(backend.slot(0).unwrap().is_replacing());

        let replacement = s.ready_rx.recv().await.unwrap();
        s.on_session_ready(replacement);
        assert!(!backend.slot(0).unwrap().is_replacing());
        assert!(tokio::time::timeout(Duration::from_millis(50), s.ready_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn failure_of_already_replaced_tunnel_is_ignored() {
        let mut s = scheduler(1, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        let backend = s.connecting["10.0.0.1:3306"].clone();

        let old = Arc::new(FakeTunnel::healthy().0);
        let mut first = Session::new(backend.clone(), 0);
        first.tunnel = Some(old.clone());
        s.on_session_ready(first);
        assert!(backend.evict_tunnel(0, &old));

        // The replacement lands before the scheduler sees the failure.
        let (fresh, fresh_state) = FakeTunnel::healthy();
        let mut replacement = Session::new(backend.clone(), 0);
        replacement.tunnel = Some(Arc::new(fresh));
        s.on_session_ready(replacement);

        s.on_session_failed(Session::failed(backend.clone(), 0, old));
        let slot = backend.slot(0).unwrap();
        assert!(!slot.is_replacing());
        assert!(slot.load().is_some());
        assert_eq!(fresh_state.closes(), 0);
    }

    #[tokio::test]
    async fn failure_of_evicted_tunnel_requests_replacement() {
        let mut s = scheduler(1, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        let backend = s.connecting["10.0.0.1:3306"].clone();

        let old = Arc::new(FakeTunnel::healthy().0);
        let mut first = Session::new(backend.clone(), 0);
        first.tunnel = Some(old.clone());
        s.on_session_ready(first);
        assert!(backend.evict_tunnel(0, &old));

        s.on_session_failed(Session::failed(backend.clone(), 0, old));
        assert!(backend.slot(0).unwrap().is_replacing());
    }

    #[tokio::test]
    async fn stats_report_backends() {
        let mut s = scheduler(0, Arc::new(NeverDialer));
        s.on_status(snapshot(&["b:1", "a:1"]));
        s.on_request(request());
        let stats = s.stats();
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.backends[0].address, "a:1");
        assert_eq!(stats.backends.iter().map(|b| b.ongoing).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn shutdown_retires_everything() {
        let mut s = scheduler(1, Arc::new(NeverDialer));
        s.on_status(snapshot(&["10.0.0.1:3306"]));
        let backend = s.connecting["10.0.0.1:3306"].clone();
        s.on_request(request());

        s.on_shutdown();
        assert!(backend.is_retired());
        assert!(s.connecting.is_empty());
        assert!(s.pending.is_empty());
    }
}
