//! Health probe drivers.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::config::{HealthCheckConfig, ServiceKind};
use crate::health::galera::GaleraProbe;

/// Error type for a failed probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("http request failed: {0}")]
    Http(#[from] hyper_util::client::legacy::Error),
    #[error("invalid probe request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("unhealthy status {0}")]
    Status(StatusCode),
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("command exited with {0}")]
    Exit(ExitStatus),
    #[error("ext health check needs ext_command")]
    MissingCommand,
    #[error("mysql query failed: {0}")]
    Mysql(#[from] mysql_async::Error),
    #[error("galera node not connected to the cluster")]
    NotConnected,
    #[error("invalid node address {0}")]
    InvalidAddress(String),
}

/// A configured health probe.
#[derive(Debug, Clone)]
pub enum Probe {
    /// Healthy when a TCP connection can be opened.
    Tcp,
    /// Healthy when `GET http://addr{path}` answers 2xx.
    Http {
        client: Client<HttpConnector, Body>,
        path: String,
    },
    /// Healthy when `command addr` exits with status 0.
    Ext { command: String },
    /// Galera node reporting `wsrep_connected = ON`; also discovers the
    /// cluster members from the configured directors.
    Galera(GaleraProbe),
}

impl Probe {
    pub fn from_config(config: &HealthCheckConfig) -> Result<Self, ProbeError> {
        match config.service {
            ServiceKind::Tcp => Ok(Probe::Tcp),
            ServiceKind::Http => Ok(Probe::Http {
                client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
                path: config.http_path.clone(),
            }),
            ServiceKind::Ext => config
                .ext_command
                .clone()
                .filter(|c| !c.is_empty())
                .map(|command| Probe::Ext { command })
                .ok_or(ProbeError::MissingCommand),
            ServiceKind::Galera => Ok(Probe::Galera(GaleraProbe::new(
                config.user.clone(),
                config.pass.clone(),
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Probe::Tcp => "tcp",
            Probe::Http { .. } => "http",
            Probe::Ext { .. } => "ext",
            Probe::Galera(_) => "galera",
        }
    }

    /// Probe `addr`, failing if no verdict arrives within `timeout`.
    pub async fn check(&self, addr: &str, timeout: Duration) -> Result<(), ProbeError> {
        tokio::time::timeout(timeout, self.run(addr))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
    }

    async fn run(&self, addr: &str) -> Result<(), ProbeError> {
        match self {
            Probe::Tcp => {
                TcpStream::connect(addr).await.map_err(ProbeError::Connect)?;
                Ok(())
            }
            Probe::Http { client, path } => {
                let request = Request::builder()
                    .method("GET")
                    .uri(format!("http://{}{}", addr, path))
                    .header("user-agent", "tunnel-balancer-health-check")
                    .body(Body::empty())?;
                let response = client.request(request).await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(ProbeError::Status(response.status()))
                }
            }
            Probe::Ext { command } => {
                let status = Command::new(command)
                    .arg(addr)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await
                    .map_err(|source| ProbeError::Spawn {
                        command: command.clone(),
                        source,
                    })?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ProbeError::Exit(status))
                }
            }
            Probe::Galera(galera) => galera.node_status(addr).await.map(|_| ()),
        }
    }
}
