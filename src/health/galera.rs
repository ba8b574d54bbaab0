//! Galera cluster discovery.
//!
//! The configured backends act as directors. The first director that answers
//! `SHOW STATUS LIKE 'wsrep_%'` with `wsrep_connected = ON` supplies the
//! cluster membership (`wsrep_incoming_addresses`); every member is then
//! queried the same way and the connected ones make up the snapshot.

use std::time::Duration;

use futures_util::future::join_all;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};

use crate::health::probe::ProbeError;
use crate::health::state::HealthFlag;

pub const WSREP_CONNECTED: &str = "wsrep_connected";
pub const WSREP_INCOMING_ADDRESSES: &str = "wsrep_incoming_addresses";

const STATUS_QUERY: &str = "SHOW STATUS LIKE 'wsrep_%'";
const DEFAULT_MYSQL_PORT: u16 = 3306;

/// The `wsrep_*` variables the balancer cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsrepStatus {
    pub connected: bool,
    pub incoming_addresses: Vec<String>,
}

impl WsrepStatus {
    /// Build from `(Variable_name, Value)` rows.
    pub fn from_rows(rows: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut status = WsrepStatus::default();
        for (name, value) in rows {
            match name.as_str() {
                WSREP_CONNECTED => status.connected = value.eq_ignore_ascii_case("ON"),
                WSREP_INCOMING_ADDRESSES => {
                    status.incoming_addresses = parse_incoming_addresses(&value)
                }
                _ => {}
            }
        }
        status
    }
}

/// Split a `wsrep_incoming_addresses` value (`host:port,host:port,...`).
pub fn parse_incoming_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_host_port(addr: &str) -> Result<(String, u16), ProbeError> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Ok((addr.to_string(), DEFAULT_MYSQL_PORT));
    };
    let port = port
        .parse()
        .map_err(|_| ProbeError::InvalidAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProbeError::InvalidAddress(addr.to_string()));
    }
    Ok((host.to_string(), port))
}

/// MySQL credentials used to query cluster nodes.
#[derive(Debug, Clone)]
pub struct GaleraProbe {
    user: String,
    pass: String,
}

impl GaleraProbe {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }

    /// Query `addr` and require it to be connected to the cluster.
    pub async fn node_status(&self, addr: &str) -> Result<WsrepStatus, ProbeError> {
        let (host, port) = split_host_port(addr)?;
        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .prefer_socket(false)
            .user(Some(self.user.clone()))
            .pass(Some(self.pass.clone()));

        let mut conn = Conn::new(opts).await?;
        let rows: Vec<(String, String)> = conn.query(STATUS_QUERY).await?;
        if let Err(e) = conn.disconnect().await {
            tracing::debug!(node = %addr, error = %e, "Disconnect failed");
        }

        let status = WsrepStatus::from_rows(rows);
        if status.connected {
            Ok(status)
        } else {
            Err(ProbeError::NotConnected)
        }
    }

    async fn node_status_within(&self, addr: &str, timeout: Duration) -> Result<WsrepStatus, ProbeError> {
        tokio::time::timeout(timeout, self.node_status(addr))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
    }

    /// Discover the healthy cluster members.
    ///
    /// The director that answered is moved to the front of `directors` so
    /// the next round asks it first.
    pub async fn discover(&self, directors: &mut [String], timeout: Duration) -> Vec<(String, HealthFlag)> {
        let mut results = Vec::new();

        for index in 0..directors.len() {
            let director = directors[index].clone();
            let status = match self.node_status_within(&director, timeout).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::debug!(director = %director, error = %e, "Director check failed");
                    results.push((director, HealthFlag::Down));
                    continue;
                }
            };
            results.push((director.clone(), HealthFlag::Up));

            if status.incoming_addresses.is_empty() {
                tracing::warn!(director = %director, "No {} in status, trying next director", WSREP_INCOMING_ADDRESSES);
                continue;
            }

            if index != 0 {
                directors.swap(0, index);
                tracing::info!(director = %director, "Promoted to first director");
            }

            let members = status
                .incoming_addresses
                .iter()
                .filter(|member| **member != director)
                .map(|member| async move {
                    let flag = match self.node_status_within(member, timeout).await {
                        Ok(_) => HealthFlag::Up,
                        Err(e) => {
                            tracing::debug!(node = %member, error = %e, "Galera node check failed");
                            HealthFlag::Down
                        }
                    };
                    (member.clone(), flag)
                });
            results.extend(join_all(members).await);
            break;
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn row(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn incoming_addresses_are_split() {
        assert_eq!(
            parse_incoming_addresses("10.100.91.74:3306,10.100.91.72:3306, 10.100.91.71:3306"),
            vec!["10.100.91.74:3306", "10.100.91.72:3306", "10.100.91.71:3306"]
        );
        assert!(parse_incoming_addresses("").is_empty());
        assert_eq!(parse_incoming_addresses("db1:3306,,"), vec!["db1:3306"]);
    }

    #[test]
    fn status_rows_are_interpreted() {
        let status = WsrepStatus::from_rows(vec![
            row("wsrep_local_state_comment", "Synced"),
            row("wsrep_incoming_addresses", "10.0.0.1:3306,10.0.0.2:3306"),
            row("wsrep_cluster_size", "2"),
            row("wsrep_connected", "ON"),
        ]);
        assert!(status.connected);
        assert_eq!(status.incoming_addresses, vec!["10.0.0.1:3306", "10.0.0.2:3306"]);

        let status = WsrepStatus::from_rows(vec![row("wsrep_connected", "OFF")]);
        assert!(!status.connected);
        assert!(status.incoming_addresses.is_empty());
    }

    #[test]
    fn host_and_port_are_split() {
        assert_eq!(split_host_port("10.0.0.1:3307").unwrap(), ("10.0.0.1".to_string(), 3307));
        assert_eq!(split_host_port("[::1]:3306").unwrap(), ("::1".to_string(), 3306));
        assert_eq!(split_host_port("db1").unwrap(), ("db1".to_string(), 3306));
        assert!(matches!(split_host_port("db1:mysql"), Err(ProbeError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn unreachable_directors_yield_no_members() {
        let closed = |listener: TcpListener| listener.local_addr().unwrap().to_string();
        let first = closed(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let second = closed(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let mut directors = vec![first.clone(), second.clone()];

        let galera = GaleraProbe::new("monitor", "secret");
        let results = galera.discover(&mut directors, Duration::from_millis(500)).await;

        assert_eq!(
            results,
            vec![(first.clone(), HealthFlag::Down), (second.clone(), HealthFlag::Down)]
        );
        assert_eq!(directors, vec![first, second]);
    }
}
