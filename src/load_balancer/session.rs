//! Tunnel session establishment.
//!
//! # Responsibilities
//! - Dial a backend's agent for one tunnel slot, off the scheduler task
//! - Retry forever at a fixed interval until the dial succeeds, the
//!   backend is retired or shutdown is signalled
//! - Hand established tunnels back to the scheduler

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::lifecycle::Shutdown;
use crate::load_balancer::backend::Backend;
use crate::observability::metrics;
use crate::resilience::retry_delay;
use crate::tunnel::{agent_address, Dialer, Tunnel, TunnelError};

/// A tunnel request for one slot of one backend, filled in once dialed.
///
/// On the failure channel `tunnel` is the tunnel that broke.
pub struct Session {
    pub backend: Arc<Backend>,
    pub slot: usize,
    pub tunnel: Option<Arc<Tunnel>>,
}

impl Session {
    pub fn new(backend: Arc<Backend>, slot: usize) -> Self {
        Self {
            backend,
            slot,
            tunnel: None,
        }
    }

    /// Report that `tunnel` in `slot` broke and was evicted.
    pub fn failed(backend: Arc<Backend>, slot: usize, tunnel: Arc<Tunnel>) -> Self {
        Self {
            backend,
            slot,
            tunnel: Some(tunnel),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.addr())
            .field("slot", &self.slot)
            .field("established", &self.tunnel.is_some())
            .finish()
    }
}

/// Settings for session workers.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub agent_port: String,
    pub dial_timeout: Duration,
    pub retry_interval: Duration,
}

/// Spawns one worker per requested session.
#[derive(Clone)]
pub struct SessionManager {
    dialer: Arc<dyn Dialer>,
    settings: Arc<SessionSettings>,
    ready_tx: mpsc::UnboundedSender<Session>,
    shutdown: Shutdown,
}

impl SessionManager {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        settings: SessionSettings,
        ready_tx: mpsc::UnboundedSender<Session>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            dialer,
            settings: Arc::new(settings),
            ready_tx,
            shutdown,
        }
    }

    /// Establish a tunnel for `session` in the background.
    pub fn request(&self, session: Session) {
        let worker = self.clone();
        tokio::spawn(async move { worker.establish(session).await });
    }

    async fn establish(self, mut session: Session) {
        let agent = agent_address(session.backend.addr(), &self.settings.agent_port);
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if session.backend.is_retired() || self.shutdown.is_triggered() {
                tracing::debug!(backend = %session.backend.addr(), slot = session.slot, "Session no longer wanted");
                return;
            }
            attempt = attempt.saturating_add(1);

            let dial = tokio::time::timeout(self.settings.dial_timeout, self.dialer.dial(agent.clone()));
            let result = tokio::select! {
                res = dial => res.unwrap_or(Err(TunnelError::Timeout(self.settings.dial_timeout))),
                _ = shutdown.recv() => return,
            };

            match result {
                Ok(tunnel) => {
                    tracing::info!(
                        backend = %session.backend.addr(),
                        agent = %agent,
                        slot = session.slot,
                        attempt,
                        local_addr = ?tunnel.local_addr(),
                        "Tunnel session established"
                    );
                    metrics::record_session("established");
                    session.tunnel = Some(Arc::new(tunnel));
                    if let Err(mpsc::error::SendError(session)) = self.ready_tx.send(session) {
                        if let Some(tunnel) = session.tunnel {
                            tunnel.close();
                        }
                    }
                    return;
                }
                Err(e) => {
                    metrics::record_session("failed");
                    tracing::warn!(
                        backend = %session.backend.addr(),
                        agent = %agent,
                        slot = session.slot,
                        attempt,
                        error = %e,
                        "Tunnel session failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry_delay(self.settings.retry_interval)) => {}
                _ = shutdown.recv() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::testing::FakeTunnel;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` dials, then succeeds.
    struct FlakyDialer {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Dialer for FlakyDialer {
        fn dial(&self, agent: String) -> BoxFuture<'static, Result<Tunnel, TunnelError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let failures = self.failures;
            Box::pin(async move {
                assert!(agent.ends_with(":6900"));
                if call < failures {
                    Err(TunnelError::Dial(std::io::ErrorKind::ConnectionRefused.into()))
                } else {
                    Ok(FakeTunnel::healthy().0)
                }
            })
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            agent_port: "6900".into(),
            dial_timeout: Duration::from_millis(200),
            retry_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retries_until_established() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dialer = Arc::new(FlakyDialer {
            failures: 3,
            calls: calls.clone(),
        });
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(dialer, settings(), ready_tx, Shutdown::new());

        let backend = Arc::new(Backend::new("127.0.0.1:3306", 1, 0, fail_tx));
        manager.request(Session::new(backend.clone(), 0));

        let session = ready_rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&session.backend, &backend));
        assert!(session.tunnel.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retired_backend_stops_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dialer = Arc::new(FlakyDialer {
            failures: usize::MAX,
            calls: calls.clone(),
        });
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(dialer, settings(), ready_tx, Shutdown::new());

        let backend = Arc::new(Backend::new("127.0.0.1:3306", 1, 0, fail_tx));
        manager.request(Session::new(backend.clone(), 0));
        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.retire();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        drop(manager);
        assert!(ready_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dialer = Arc::new(FlakyDialer {
            failures: usize::MAX,
            calls: calls.clone(),
        });
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();
        let manager = SessionManager::new(dialer, settings(), ready_tx, shutdown.clone());

        let backend = Arc::new(Backend::new("127.0.0.1:3306", 1, 0, fail_tx));
        manager.request(Session::new(backend, 0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        drop(manager);

        assert!(ready_rx.recv().await.is_none());
    }
}
