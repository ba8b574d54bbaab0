//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Startup: probe every startup_retry_ms until something is up
//!     Then: periodic timer
//!     → probe.rs (tcp connect / http GET / external command), concurrently
//!       or galera.rs (ask a director for the members, then probe them)
//!     → state.rs (log transitions, build snapshot)
//!     → non-empty snapshot sent to the scheduler
//!
//! Config reload:
//!     watcher → new backend list → active.rs probes it next round
//! ```
//!
//! # Design Decisions
//! - The scheduler only ever sees full snapshots, never single verdicts
//! - Empty rounds are not sent; the scheduler keeps its last view
//! - Every probe has a deadline

pub mod active;
pub mod galera;
pub mod probe;
pub mod state;

pub use active::HealthMonitor;
pub use galera::{GaleraProbe, WsrepStatus};
pub use probe::{Probe, ProbeError};
pub use state::{HealthFlag, HealthSnapshot, HealthState};
