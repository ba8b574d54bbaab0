//! Multiplexed tunnel transport.
//!
//! # Data Flow
//! ```text
//! Session manager
//!     → Dialer::dial(agent address)        (connect + handshake + ping)
//!     → Tunnel (one multiplexed connection)
//!
//! Forwarder
//!     → Tunnel::open_stream()              (one logical stream per client)
//!     → BoxedIo spliced against the client
//!
//! Agent (next to the backend)
//!     → agent.rs accepts tunnels, splices each stream to the local service
//! ```
//!
//! # Design Decisions
//! - The scheduler only sees the `Multiplexer` boundary: open, ping,
//!   next stream id, close
//! - HTTP/2 via hyper is the shipped transport: streams are `CONNECT`
//!   requests upgraded into byte pipes
//! - Stream ids are tracked locally so exhaustion can be predicted

pub mod agent;
pub mod h2;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::net::connection::BoxedIo;

/// Largest stream id a multiplexed connection can ever allocate.
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Default id above which a tunnel is replaced before it runs dry.
pub const STREAM_ID_HIGH_WATER: u32 = MAX_STREAM_ID - (1 << 20);

/// Error type for tunnel operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to dial agent: {0}")]
    Dial(#[source] std::io::Error),
    #[error("tunnel handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("dial to agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream ids used up")]
    StreamsExhausted,
    #[error("failed to create stream: {0}")]
    Stream(#[source] hyper::Error),
    #[error("agent refused stream with status {0}")]
    Refused(hyper::StatusCode),
    #[error("invalid tunnel request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("tunnel closed")]
    Closed,
}

impl TunnelError {
    /// Whether the tunnel this error came from must be thrown away.
    ///
    /// A refusal means the agent is alive but could not reach its service;
    /// the tunnel itself is fine.
    pub fn breaks_session(&self) -> bool {
        !matches!(self, TunnelError::Refused(_) | TunnelError::Request(_))
    }
}

/// One multiplexed connection to an agent.
pub trait Multiplexer: Send + Sync + 'static {
    /// Open a new logical stream.
    fn open_stream(&self) -> BoxFuture<'_, Result<BoxedIo, TunnelError>>;

    /// Round-trip liveness probe.
    fn ping(&self) -> BoxFuture<'_, Result<Duration, TunnelError>>;

    /// Id the next opened stream will get. Never blocks.
    fn next_stream_id(&self) -> u32;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// Establishes tunnels to agents.
pub trait Dialer: Send + Sync + 'static {
    /// Dial `agent` (`host:port`), handshake and ping.
    fn dial(&self, agent: String) -> BoxFuture<'static, Result<Tunnel, TunnelError>>;
}

/// An established tunnel plus the local address it was realized on.
pub struct Tunnel {
    conn: Box<dyn Multiplexer>,
    local_addr: Option<SocketAddr>,
}

impl Tunnel {
    pub fn new(conn: Box<dyn Multiplexer>, local_addr: Option<SocketAddr>) -> Self {
        Self { conn, local_addr }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn open_stream(&self) -> Result<BoxedIo, TunnelError> {
        self.conn.open_stream().await
    }

    pub async fn ping(&self) -> Result<Duration, TunnelError> {
        self.conn.ping().await
    }

    pub fn next_stream_id(&self) -> u32 {
        self.conn.next_stream_id()
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_addr", &self.local_addr)
            .field("next_stream_id", &self.next_stream_id())
            .finish()
    }
}

/// Agent address for a backend: the backend host with the agent port.
pub fn agent_address(backend: &str, agent_port: &str) -> String {
    let host = backend
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(backend);
    format!("{}:{}", host, agent_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_address_swaps_port() {
        assert_eq!(agent_address("10.0.0.1:3306", "6900"), "10.0.0.1:6900");
        assert_eq!(agent_address("[::1]:3306", "6900"), "[::1]:6900");
        assert_eq!(agent_address("db-1", "6900"), "db-1:6900");
    }

    #[test]
    fn refusal_keeps_session() {
        assert!(!TunnelError::Refused(hyper::StatusCode::BAD_GATEWAY).breaks_session());
        assert!(TunnelError::StreamsExhausted.breaks_session());
        assert!(TunnelError::Closed.breaks_session());
    }

    #[test]
    fn high_water_below_max() {
        assert!(STREAM_ID_HIGH_WATER < MAX_STREAM_ID);
    }
}
