//! HTTP/2 tunnel transport.
//!
//! One tunnel is one HTTP/2 client connection to the agent. Each logical
//! stream is a `CONNECT` request that the agent answers with `200` and then
//! upgrades into a raw byte pipe. Liveness is a `GET /ping` round-trip.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use futures_util::future::BoxFuture;
use hyper::client::conn::http2::{self, SendRequest};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;

use crate::net::connection::BoxedIo;
use crate::tunnel::{Dialer, Multiplexer, Tunnel, TunnelError, MAX_STREAM_ID};

/// Path answered by the agent for liveness probes.
pub const PING_PATH: &str = "/ping";

/// Dials agents over plain TCP and speaks HTTP/2 to them.
#[derive(Debug, Default, Clone, Copy)]
pub struct H2Dialer;

impl Dialer for H2Dialer {
    fn dial(&self, agent: String) -> BoxFuture<'static, Result<Tunnel, TunnelError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(agent.as_str())
                .await
                .map_err(TunnelError::Dial)?;
            let _ = stream.set_nodelay(true);
            let local_addr = stream.local_addr().ok();

            let (sender, connection) =
                http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                    .await
                    .map_err(TunnelError::Handshake)?;

            let peer = agent.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::debug!(agent = %peer, error = %e, "Tunnel connection ended");
                }
            });

            let conn = H2Conn::new(sender, agent);
            let rtt = conn.ping().await?;
            tracing::debug!(agent = %conn.authority, rtt = ?rtt, local_addr = ?local_addr, "Tunnel established");

            Ok(Tunnel::new(Box::new(conn), local_addr))
        })
    }
}

/// A live HTTP/2 connection to an agent.
pub struct H2Conn {
    /// `None` once closed; in-flight streams keep the connection alive until they end.
    sender: Mutex<Option<SendRequest<Body>>>,
    authority: String,
    /// Client-initiated HTTP/2 streams use odd ids, starting at 1.
    next_id: AtomicU32,
}

impl H2Conn {
    fn new(sender: SendRequest<Body>, authority: String) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            authority,
            next_id: AtomicU32::new(1),
        }
    }

    /// Reserve a stream id and hand out a sender for it.
    fn allocate(&self) -> Result<SendRequest<Body>, TunnelError> {
        let sender = self
            .sender
            .lock()
            .expect("tunnel sender mutex poisoned")
            .clone()
            .ok_or(TunnelError::Closed)?;
        if sender.is_closed() {
            return Err(TunnelError::Closed);
        }

        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        if id > MAX_STREAM_ID {
            return Err(TunnelError::StreamsExhausted);
        }
        Ok(sender)
    }
}

impl Multiplexer for H2Conn {
    fn open_stream(&self) -> BoxFuture<'_, Result<BoxedIo, TunnelError>> {
        Box::pin(async move {
            let mut sender = self.allocate()?;
            sender.ready().await.map_err(TunnelError::Stream)?;

            let request = Request::builder()
                .method(Method::CONNECT)
                .uri(self.authority.as_str())
                .body(Body::empty())?;

            let mut response = sender
                .send_request(request)
                .await
                .map_err(TunnelError::Stream)?;
            if response.status() != StatusCode::OK {
                return Err(TunnelError::Refused(response.status()));
            }

            let upgraded = hyper::upgrade::on(&mut response)
                .await
                .map_err(TunnelError::Stream)?;
            Ok(Box::new(TokioIo::new(upgraded)) as BoxedIo)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<Duration, TunnelError>> {
        Box::pin(async move {
            let started = Instant::now();
            let mut sender = self.allocate()?;
            sender.ready().await.map_err(TunnelError::Stream)?;

            let request = Request::builder()
                .method(Method::GET)
                .uri(format!("http://{}{}", self.authority, PING_PATH))
                .body(Body::empty())?;

            let response = sender
                .send_request(request)
                .await
                .map_err(TunnelError::Stream)?;
            if !response.status().is_success() {
                return Err(TunnelError::Refused(response.status()));
            }
            Ok(started.elapsed())
        })
    }

    fn next_stream_id(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed)
    }

    fn close(&self) {
        if self
            .sender
            .lock()
            .expect("tunnel sender mutex poisoned")
            .take()
            .is_some()
        {
            tracing::debug!(agent = %self.authority, "Tunnel closed");
        }
    }
}
