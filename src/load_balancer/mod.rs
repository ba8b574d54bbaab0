//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Listener → Request → scheduler.rs (single task, owns all state)
//!     → pool.rs (pop least-loaded / lowest-weight backend)
//!     → backend.rs (ceiling check, tunnel health check)
//!     → forwarder.rs (spawned: open upstream, splice)
//!     → Finished → scheduler.rs (decrement, re-sort or evict + redispatch)
//!
//! Health snapshot → scheduler.rs
//!     → new backend: session.rs dials one tunnel per slot
//!     → session ready → backend.rs switch_tunnel → backend schedulable
//!
//! Broken tunnel (forwarder) → CAS eviction → session failed → session.rs
//! ```
//!
//! # Design Decisions
//! - One task owns the pool and tables; other tasks talk to it over channels
//! - Backends carry their own heap index so they can be re-sorted in place
//! - Tunnel slots are the only state touched concurrently (arc-swap CAS)
//! - Requests wait in a FIFO while no backend is schedulable

pub mod backend;
pub mod forwarder;
pub mod pool;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Backend, TunnelPolicy, TunnelSlot};
pub use forwarder::{ForwardError, Finished, Outcome, Request};
pub use pool::{HeapIndexed, Pool, NOT_IN_POOL};
pub use scheduler::{BackendStats, Scheduler, SchedulerHandle, SchedulerSettings, SchedulerStats};
pub use session::{Session, SessionManager, SessionSettings};
