//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every configured backend
//! - Push snapshots of the healthy ones to the scheduler
//! - Pick up backend list changes from the config watcher

use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::health::probe::Probe;
use crate::health::state::{HealthFlag, HealthSnapshot, HealthState};

pub struct HealthMonitor {
    backends: Vec<String>,
    probe: Probe,
    interval: Duration,
    timeout: Duration,
    startup_retry: Duration,
    status_tx: mpsc::Sender<HealthSnapshot>,
    reload_rx: Option<mpsc::UnboundedReceiver<Vec<String>>>,
    state: HealthState,
}

impl HealthMonitor {
    pub fn new(
        backends: Vec<String>,
        probe: Probe,
        config: &HealthCheckConfig,
        status_tx: mpsc::Sender<HealthSnapshot>,
    ) -> Self {
        Self {
            backends,
            probe,
            interval: Duration::from_secs(config.interval_secs),
            timeout: Duration::from_millis(config.timeout_ms),
            startup_retry: Duration::from_millis(config.startup_retry_ms),
            status_tx,
            reload_rx: None,
            state: HealthState::new(),
        }
    }

    /// Accept replacement backend lists (from the config watcher).
    pub fn with_reloads(mut self, reload_rx: mpsc::UnboundedReceiver<Vec<String>>) -> Self {
        self.reload_rx = Some(reload_rx);
        self
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            driver = self.probe.kind(),
            backends = self.backends.len(),
            interval_secs = self.interval.as_secs(),
            "Health monitor starting"
        );

        // Eager startup rounds until at least one backend answers.
        loop {
            if self.check_all().await {
                break;
            }
            tracing::warn!(retry_ms = self.startup_retry.as_millis() as u64, "No healthy backend yet");
            tokio::select! {
                _ = time::sleep(self.startup_retry) => {}
                _ = shutdown.recv() => return,
            }
        }

        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                Some(backends) = recv_reload(&mut self.reload_rx) => {
                    tracing::info!(backends = backends.len(), "Backend list reloaded");
                    self.backends = backends;
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every backend once. Returns whether a snapshot was sent.
    async fn check_all(&mut self) -> bool {
        let timeout = self.timeout;
        let results = match &self.probe {
            // Backends are directors; the cluster reports its own members.
            Probe::Galera(galera) => galera.discover(&mut self.backends, timeout).await,
            probe => {
                let probes = self.backends.iter().map(|addr| async move {
                    let flag = match probe.check(addr, timeout).await {
                        Ok(()) => HealthFlag::Up,
                        Err(e) => {
                            tracing::debug!(backend = %addr, error = %e, "Health probe failed");
                            HealthFlag::Down
                        }
                    };
                    (addr.clone(), flag)
                });
                join_all(probes).await
            }
        };

        let snapshot = self.state.observe(results);
        if snapshot.is_empty() {
            tracing::warn!(probed = self.backends.len(), "No healthy backends, snapshot not sent");
            return false;
        }

        if self.status_tx.send(snapshot).await.is_err() {
            tracing::debug!("Scheduler gone, dropping health snapshot");
            return false;
        }
        true
    }
}

async fn recv_reload(rx: &mut Option<mpsc::UnboundedReceiver<Vec<String>>>) -> Option<Vec<String>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
