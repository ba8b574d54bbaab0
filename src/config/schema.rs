//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::config::listen::{ListenAddr, ListenError};

/// Root configuration for the balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// Listen specifications (`tcp://host:port`, `unix://path`).
    pub listen: Vec<String>,

    /// Legacy listen host; combined with `port` into an extra tcp listener.
    pub addr: Option<String>,

    /// Legacy listen port.
    pub port: Option<String>,

    /// Backend addresses handed to the health monitor.
    pub backends: Vec<String>,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Scheduling settings.
    pub scheduler: SchedulerConfig,

    /// Tunnel (multiplexed session) settings.
    pub tunnel: TunnelConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Process lifecycle settings.
    pub lifecycle: LifecycleConfig,
}

impl BalancerConfig {
    /// All listen addresses, including the legacy `addr`/`port` pair.
    pub fn listen_addrs(&self) -> Result<Vec<ListenAddr>, ListenError> {
        let mut addrs = self
            .listen
            .iter()
            .map(|spec| spec.parse())
            .collect::<Result<Vec<ListenAddr>, _>>()?;

        if let Some(legacy) = self.legacy_listen() {
            if !addrs.contains(&legacy) {
                addrs.push(legacy);
            }
        }
        Ok(addrs)
    }

    fn legacy_listen(&self) -> Option<ListenAddr> {
        match (&self.addr, &self.port) {
            (Some(addr), Some(port)) if !addr.is_empty() && !port.is_empty() => {
                Some(ListenAddr::Tcp(format!("{}:{}", addr, port)))
            }
            _ => None,
        }
    }

    /// One-line summary for startup logs.
    pub fn listen_info(&self) -> String {
        format!("listen on {:?}, backends: {:?}", self.listen, self.backends)
    }
}

/// Health check driver.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// TCP connect probe.
    Tcp,
    /// HTTP GET probe.
    Http,
    /// External command probe (`command <addr>`).
    Ext,
    /// Galera status query (`SHOW STATUS LIKE 'wsrep_%'`) with member discovery.
    Galera,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe driver.
    pub service: ServiceKind,

    /// Interval between snapshots in seconds.
    pub interval_secs: u64,

    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Retry interval while no backend is healthy at startup.
    pub startup_retry_ms: u64,

    /// Path requested by the http driver.
    pub http_path: String,

    /// Command run by the ext driver.
    pub ext_command: Option<String>,

    /// MySQL user for the galera driver.
    pub user: String,

    /// MySQL password for the galera driver.
    pub pass: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            service: ServiceKind::Tcp,
            interval_secs: 60,
            timeout_ms: 1000,
            startup_retry_ms: 1000,
            http_path: "/".to_string(),
            ext_command: None,
            user: String::new(),
            pass: String::new(),
        }
    }
}

/// Pool ordering.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Prefer the backend with the fewest in-flight connections.
    #[default]
    LeastLoaded,
    /// Prefer the backend that came up first; others take over when it is evicted.
    Failover,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pool ordering.
    pub mode: ScheduleMode,

    /// Shuffle newly reported backends before adding them.
    pub shuffle: bool,

    /// Maximum number of distinct backends.
    pub max_backends: usize,

    /// Maximum in-flight forwarded connections, all backends together.
    pub max_forwarders: usize,

    /// Maximum in-flight forwarded connections per backend (admission ceiling).
    pub max_forwarders_per_backend: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::LeastLoaded,
            shuffle: true,
            max_backends: 128,
            max_forwarders: 8192,
            max_forwarders_per_backend: 4096,
        }
    }
}

/// Tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnels per backend; 0 disables tunneling.
    pub count: usize,

    /// Port of the agent running next to each backend.
    pub agent_port: String,

    /// Per-attempt dial + ping timeout in milliseconds.
    pub dial_timeout_ms: u64,

    /// Delay between session establishment attempts in milliseconds.
    pub retry_interval_ms: u64,

    /// Minimum seconds between stream id checks of one backend.
    pub check_interval_secs: u64,

    /// Stream id above which a tunnel gets replaced pre-emptively.
    pub stream_id_high_water: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            count: 0,
            agent_port: "6900".to_string(),
            dial_timeout_ms: 1000,
            retry_interval_ms: 1000,
            check_interval_secs: 5,
            stream_id_high_water: crate::tunnel::STREAM_ID_HIGH_WATER,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Process lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Optional pidfile path.
    pub pidfile: Option<String>,

    /// Seconds to wait for in-flight forwarders after shutdown.
    pub drain_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            pidfile: None,
            drain_timeout_secs: 10,
        }
    }
}
