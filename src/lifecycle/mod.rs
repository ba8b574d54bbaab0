//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Metrics → Scheduler → Health monitor, config watcher → Admin API → Listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Scheduler drops backends → Drain → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when the scheduler runs)
//! - Shutdown has timeout: forwarders still running after the drain deadline are abandoned

pub mod pidfile;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use pidfile::{Pidfile, PidfileError};
pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
pub use startup::{start, Running, StartupError};
