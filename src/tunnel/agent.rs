//! Tunnel agent: the far end of a tunnel, running next to a backend.
//!
//! # Responsibilities
//! - Accept HTTP/2 connections from balancers
//! - Answer `CONNECT` streams by dialing the local service and splicing
//! - Answer every other request with `200 pong` for liveness probes

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::ListenAddr;
use crate::net::splice;

/// Default port agents listen on.
pub const DEFAULT_AGENT_PORT: u16 = 6900;

/// Serves tunnels and relays their streams to one local service.
#[derive(Debug, Clone)]
pub struct Agent {
    target: Arc<ListenAddr>,
}

impl Agent {
    pub fn new(target: ListenAddr) -> Self {
        Self {
            target: Arc::new(target),
        }
    }

    pub fn target(&self) -> &ListenAddr {
        &self.target
    }

    /// Accept loop. Returns when shutdown is signalled.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(listen = %local, service = %self.target, "Agent serving tunnels");

        loop {
            let (stream, peer) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Agent accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            };
            let _ = stream.set_nodelay(true);
            tracing::debug!(peer = %peer, "Tunnel accepted");

            let target = self.target.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, target.clone()));
                if let Err(e) = http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(peer = %peer, error = %e, "Tunnel connection ended");
                }
            });
        }

        tracing::info!(listen = %local, "Agent stopped");
    }
}

async fn handle(
    req: Request<Incoming>,
    target: Arc<ListenAddr>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::CONNECT {
        return Ok(Response::new(Body::from("pong")));
    }

    // Dial before accepting the stream so a dead service shows up as a refusal.
    let upstream = match target.connect().await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(service = %target, error = %e, "Failed to reach service");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            return Ok(response);
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => match splice(TokioIo::new(upgraded), upstream).await {
                Ok(stats) => tracing::trace!(
                    service = %target,
                    rx_bytes = stats.a_to_b,
                    tx_bytes = stats.b_to_a,
                    "Stream finished"
                ),
                Err(e) => tracing::debug!(service = %target, error = %e, "Stream aborted"),
            },
            Err(e) => tracing::debug!(service = %target, error = %e, "Stream upgrade failed"),
        }
    });

    Ok(Response::new(Body::empty()))
}
