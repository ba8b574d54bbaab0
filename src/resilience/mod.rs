//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Tunnel session attempt fails:
//!     → backoff.rs (fixed retry interval plus jitter)
//!     → session worker sleeps, then dials again
//! ```
//!
//! # Design Decisions
//! - Session establishment retries forever; the interval never grows
//! - Jitter keeps many sessions to one restarted agent from dialing in lockstep

pub mod backoff;

pub use backoff::{calculate_backoff, retry_delay};
