//! Per-connection forwarding task.
//!
//! # Responsibilities
//! - Open an upstream for the chosen backend (tunnel stream or direct dial)
//! - Splice client and upstream until both sides are done
//! - Report exactly one [`Finished`] back to the scheduler

use std::io;
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use crate::load_balancer::backend::Backend;
use crate::net::connection::{BoxedIo, ConnectionId};
use crate::net::splice::{splice, SpliceStats};
use crate::observability::metrics;

/// Error type for forwarding.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// No upstream could be opened; the client was not touched.
    #[error("failed to dial backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The splice broke after the upstream was open.
    #[error("forwarding failed: {0}")]
    Io(#[from] io::Error),
}

impl ForwardError {
    pub fn is_dial(&self) -> bool {
        matches!(self, ForwardError::Dial { .. })
    }
}

/// One accepted client connection waiting to be forwarded.
pub struct Request {
    id: ConnectionId,
    peer: String,
    client: BoxedIo,
    /// Slot in the global forwarder limit, released on drop.
    permit: Option<OwnedSemaphorePermit>,
}

impl Request {
    pub fn new(client: BoxedIo, peer: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer: peer.into(),
            client,
            permit: None,
        }
    }

    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// How a forward ended.
#[derive(Debug)]
pub enum Outcome {
    Completed(SpliceStats),
    Failed(ForwardError),
    /// Upstream could not be opened; the request comes back for redispatch.
    DialFailed { request: Request, error: ForwardError },
}

impl Outcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::DialFailed { .. } => "dial_failed",
        }
    }
}

/// Completion report sent to the scheduler.
#[derive(Debug)]
pub struct Finished {
    pub backend: Arc<Backend>,
    pub outcome: Outcome,
}

/// Forward `request` to `backend`.
pub async fn forward(backend: Arc<Backend>, request: Request) -> Finished {
    let upstream = match backend.open_upstream().await {
        Ok(upstream) => upstream,
        Err(error) => {
            return Finished {
                backend,
                outcome: Outcome::DialFailed { request, error },
            }
        }
    };

    let Request {
        id,
        peer,
        client,
        permit,
    } = request;
    tracing::debug!(connection_id = %id, peer = %peer, backend = %backend.addr(), "Forwarding");

    let outcome = match splice(client, upstream).await {
        Ok(stats) => {
            // a = client, b = upstream
            backend.record_bytes(stats.b_to_a, stats.a_to_b);
            metrics::record_bytes(stats.b_to_a, stats.a_to_b);
            tracing::debug!(
                connection_id = %id,
                backend = %backend.addr(),
                rx_bytes = stats.b_to_a,
                tx_bytes = stats.a_to_b,
                "Forward finished"
            );
            Outcome::Completed(stats)
        }
        Err(e) => {
            tracing::debug!(connection_id = %id, backend = %backend.addr(), error = %e, "Forward aborted");
            Outcome::Failed(ForwardError::Io(e))
        }
    };
    drop(permit);

    Finished { backend, outcome }
}
