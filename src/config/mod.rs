//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BalancerConfig (validated, immutable)
//!     → sections handed to the scheduler, monitor, listeners
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new backend list sent to the health monitor
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the backend list reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod listen;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use listen::{ListenAddr, DEFAULT_UNIX_SOCKET};
pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, BalancerConfig, HealthCheckConfig, LifecycleConfig, LogFormat,
    ObservabilityConfig, ScheduleMode, SchedulerConfig, ServiceKind, TunnelConfig,
};
