//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Start background tasks (scheduler, health checks, admin API, metrics)
//! - Bind listeners and begin accepting traffic
//! - Tear everything down again in reverse order
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::RecommendedWatcher;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::admin::{serve_admin, AdminState};
use crate::config::listen::ListenError;
use crate::config::watcher::ConfigWatcher;
use crate::config::BalancerConfig;
use crate::health::{HealthMonitor, Probe, ProbeError};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{Scheduler, SchedulerHandle, SchedulerSettings};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::observability::init_metrics;
use crate::tunnel::Dialer;

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid listen address: {0}")]
    Listen(#[from] ListenError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("health check setup failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("failed to watch config: {0}")]
    Watch(#[from] notify::Error),
    #[error("failed to bind admin API: {0}")]
    Admin(#[source] std::io::Error),
    #[error("invalid metrics address {0}")]
    MetricsAddress(String),
}

/// A started balancer.
pub struct Running {
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    listen_addrs: Vec<String>,
    admin_addr: Option<SocketAddr>,
    _watcher: Option<RecommendedWatcher>,
}

/// Start every subsystem described by `config`.
///
/// `config_path` enables hot reload of the backend list.
pub async fn start(
    config: &BalancerConfig,
    config_path: Option<&Path>,
    dialer: Arc<dyn Dialer>,
) -> Result<Running, StartupError> {
    let listen = config.listen_addrs()?;
    let shutdown = Shutdown::new();
    let tracker = ConnectionTracker::new();

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        init_metrics(addr);
    }

    let probe = Probe::from_config(&config.health_check)?;

    // 1. Scheduler
    let (scheduler, handle) = Scheduler::new(
        SchedulerSettings::from_config(config),
        dialer,
        tracker.clone(),
        shutdown.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());
    let mut tasks = Vec::new();

    // 2. Health monitor (+ reload)
    let mut monitor = HealthMonitor::new(
        config.backends.clone(),
        probe,
        &config.health_check,
        handle.status(),
    );
    let watcher = match config_path {
        Some(path) => {
            let (watcher, reload_rx) = ConfigWatcher::new(path);
            monitor = monitor.with_reloads(reload_rx);
            match watcher.run() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    abandon(&shutdown, tasks, scheduler_task).await;
                    return Err(e.into());
                }
            }
        }
        None => None,
    };
    tasks.push(tokio::spawn(monitor.run(shutdown.subscribe())));

    // 3. Admin API
    let admin_addr = if config.admin.enabled {
        let bound = match TcpListener::bind(&config.admin.bind_address).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                abandon(&shutdown, tasks, scheduler_task).await;
                return Err(StartupError::Admin(e));
            }
        };
        let state = AdminState::new(handle.clone(), &config.admin.api_key);
        let admin_shutdown = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve_admin(listener, state, admin_shutdown).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
        Some(addr)
    } else {
        None
    };

    // 4. Listeners
    let connection_limit = Arc::new(Semaphore::new(config.scheduler.max_forwarders));
    let mut listen_addrs = Vec::new();
    for addr in listen {
        let listener = match Listener::bind(&addr, connection_limit.clone()).await {
            Ok(listener) => listener,
            Err(e) => {
                abandon(&shutdown, tasks, scheduler_task).await;
                return Err(e.into());
            }
        };
        listen_addrs.push(listener.local_addr());
        tasks.push(tokio::spawn(listener.run(handle.jobs(), shutdown.subscribe())));
    }

    tracing::info!(listeners = ?listen_addrs, backends = config.backends.len(), "Balancer started");

    Ok(Running {
        shutdown,
        tracker,
        scheduler: handle,
        scheduler_task,
        tasks,
        listen_addrs,
        admin_addr,
        _watcher: watcher,
    })
}

/// Stop whatever a failed startup already spawned.
///
/// Listeners unlink their unix sockets when their task ends.
async fn abandon(shutdown: &Shutdown, tasks: Vec<JoinHandle<()>>, scheduler_task: JoinHandle<()>) {
    tracing::warn!(started = tasks.len(), "Startup failed, stopping started tasks");
    shutdown.trigger();
    for task in tasks {
        let _ = task.await;
    }
    let _ = scheduler_task.await;
}

impl Running {
    /// Bound listener addresses (`tcp://ip:port` or `unix://path`).
    pub fn listen_addrs(&self) -> &[String] {
        &self.listen_addrs
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Stop accepting, tear down the scheduler and wait for forwarders.
    ///
    /// Returns false if forwarders were still running at the deadline.
    pub async fn shutdown(self, drain_timeout: Duration) -> bool {
        self.shutdown.trigger();

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Task ended abnormally");
            }
        }
        if let Err(e) = self.scheduler_task.await {
            tracing::warn!(error = %e, "Scheduler ended abnormally");
        }

        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, timeout_secs = drain_timeout.as_secs(), "Draining forwarders");
        }
        let drained = self.tracker.drain(drain_timeout).await;
        if !drained {
            tracing::warn!(remaining = self.tracker.active_count(), "Drain timeout reached");
        }
        drained
    }
}
