//! TCP/unix-socket load balancer with optional multiplexed tunnels to
//! per-backend agents.

pub mod admin;
pub mod config;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod tunnel;

pub use config::schema::BalancerConfig;
pub use lifecycle::Shutdown;
pub use load_balancer::{Scheduler, SchedulerHandle};
