//! TCP and unix-socket listeners with backpressure.
//!
//! # Responsibilities
//! - Bind to configured address(es)
//! - Accept incoming connections and hand them to the scheduler as requests
//! - Enforce the system-wide forwarder limit via a shared semaphore
//! - Unlink unix socket files when the listener goes away

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::config::ListenAddr;
use crate::load_balancer::Request;
use crate::net::connection::BoxedIo;
use crate::resilience::calculate_backoff;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: ListenAddr,
        #[source]
        source: io::Error,
    },
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] io::Error),
}

enum Inner {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// A bound listener feeding accepted connections into the job channel.
///
/// Every accepted connection takes a permit from the shared semaphore; the
/// permit travels with the request and is released when the request is
/// dropped, which bounds the number of in-flight forwarders across all
/// listeners.
pub struct Listener {
    inner: Inner,
    addr: ListenAddr,
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind to the given address.
    pub async fn bind(
        addr: &ListenAddr,
        connection_limit: Arc<Semaphore>,
    ) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            addr: addr.clone(),
            source,
        };

        let inner = match addr {
            ListenAddr::Tcp(host_port) => {
                Inner::Tcp(TcpListener::bind(host_port.as_str()).await.map_err(bind_err)?)
            }
            ListenAddr::Unix(path) => Inner::Unix {
                listener: UnixListener::bind(path).map_err(bind_err)?,
                path: path.clone(),
            },
        };

        let listener = Self {
            inner,
            addr: addr.clone(),
            connection_limit,
        };

        tracing::info!(
            address = %listener.local_addr(),
            available_permits = listener.connection_limit.available_permits(),
            "Listener bound"
        );

        Ok(listener)
    }

    /// Human readable bound address (resolves `:0` ports).
    pub fn local_addr(&self) -> String {
        match &self.inner {
            Inner::Tcp(l) => l
                .local_addr()
                .map(|a| format!("tcp://{}", a))
                .unwrap_or_else(|_| self.addr.to_string()),
            Inner::Unix { path, .. } => format!("unix://{}", path.display()),
        }
    }

    /// Accept a new connection.
    ///
    /// Returns the erased stream and a peer label for logging.
    pub async fn accept(&self) -> Result<(BoxedIo, String), ListenerError> {
        match &self.inner {
            Inner::Tcp(l) => {
                let (stream, peer) = l.accept().await.map_err(ListenerError::Accept)?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), peer.to_string()))
            }
            Inner::Unix { listener, path } => {
                let (stream, _) = listener.accept().await.map_err(ListenerError::Accept)?;
                Ok((Box::new(stream), format!("unix:{}", path.display())))
            }
        }
    }

    /// Accept loop: runs until shutdown or until the scheduler goes away.
    pub async fn run(self, jobs: mpsc::Sender<Request>, mut shutdown: broadcast::Receiver<()>) {
        let local = self.local_addr();
        let mut accept_failures = 0u32;

        loop {
            let accepted = tokio::select! {
                res = self.accept() => res,
                _ = shutdown.recv() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    accept_failures = 0;
                    // No further accepts until a forwarder slot frees up (backpressure).
                    let permit = tokio::select! {
                        permit = self.connection_limit.clone().acquire_owned() => match permit {
                            Ok(p) => p,
                            Err(_) => break,
                        },
                        _ = shutdown.recv() => break,
                    };
                    let request = Request::new(stream, peer).with_permit(permit);
                    tracing::debug!(
                        listener = %local,
                        peer = %request.peer(),
                        connection_id = %request.id(),
                        "Connection accepted"
                    );
                    if jobs.send(request).await.is_err() {
                        tracing::warn!(listener = %local, "Scheduler gone, closing listener");
                        break;
                    }
                }
                Err(e) => {
                    // EMFILE and friends: back off briefly instead of spinning.
                    accept_failures = accept_failures.saturating_add(1);
                    tracing::warn!(listener = %local, error = %e, failures = accept_failures, "Accept failed");
                    tokio::time::sleep(calculate_backoff(accept_failures, 10, 1000)).await;
                }
            }
        }

        tracing::info!(listener = %local, "Stopped listening");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Inner::Unix { path, .. } = &self.inner {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to unlink socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpStream, UnixStream};

    #[tokio::test]
    async fn tcp_listener_forwards_requests() {
        let limit = Arc::new(Semaphore::new(4));
        let addr: ListenAddr = "tcp://127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(&addr, limit.clone()).await.unwrap();
        let bound = listener.local_addr().trim_start_matches("tcp://").to_string();

        let (job_tx, mut job_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(job_tx, shutdown_rx));

        let mut client = TcpStream::connect(&bound).await.unwrap();
        client.write_all(b"hi").await.unwrap();

        let request = job_rx.recv().await.unwrap();
        assert_eq!(limit.available_permits(), 3);
        drop(request);
        assert_eq!(limit.available_permits(), 4);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn idle_listener_holds_no_permit() {
        let limit = Arc::new(Semaphore::new(1));
        let addr: ListenAddr = "tcp://127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(&addr, limit.clone()).await.unwrap();
        let bound = listener.local_addr().trim_start_matches("tcp://").to_string();

        let (job_tx, mut job_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(job_tx, shutdown_rx));

        tokio::task::yield_now().await;
        assert_eq!(limit.available_permits(), 1);

        let _first = TcpStream::connect(&bound).await.unwrap();
        let request = job_rx.recv().await.unwrap();
        assert_eq!(limit.available_permits(), 0);

        // The second connection waits for the first forward to finish.
        let _second = TcpStream::connect(&bound).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(job_rx.try_recv().is_err());

        drop(request);
        let second = job_rx.recv().await.unwrap();
        assert_eq!(limit.available_permits(), 0);
        drop(second);
        assert_eq!(limit.available_permits(), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unix_socket_is_unlinked_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balancer.sock");
        let addr = ListenAddr::Unix(path.clone());
        let listener = Listener::bind(&addr, Arc::new(Semaphore::new(4))).await.unwrap();
        assert!(path.exists());

        let (job_tx, mut job_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(job_tx, shutdown_rx));

        let _client = UnixStream::connect(&path).await.unwrap();
        assert!(job_rx.recv().await.is_some());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let limit = Arc::new(Semaphore::new(1));
        let first = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap(), limit.clone())
            .await
            .unwrap();
        let taken: ListenAddr = first.local_addr().parse().unwrap();

        let err = Listener::bind(&taken, limit).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }
}
