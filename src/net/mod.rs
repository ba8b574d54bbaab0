//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming tcp/unix connection
//!     → listener.rs (accept loop, shared forwarder limit)
//!     → connection.rs (type erasure, connection id)
//!     → Request handed to the scheduler job channel
//! ```
//!
//! # Design Decisions
//! - One accept loop per configured listen address, one shared job channel
//! - Permits travel with the request, so the limit covers the whole forward
//! - Unix socket files are removed when the listener is dropped

pub mod connection;
pub mod listener;
pub mod splice;

pub use connection::{BoxedIo, ConnectionGuard, ConnectionId, ConnectionTracker, Io};
pub use listener::{Listener, ListenerError};
pub use splice::{splice, SpliceStats};
