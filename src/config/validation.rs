//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, limits consistent)
//! - Check that every listen spec parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::{BalancerConfig, ServiceKind};
use crate::tunnel::MAX_STREAM_ID;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match config.listen_addrs() {
        Ok(addrs) if addrs.is_empty() => {
            errors.push(ValidationError::new("listen", "no listen address configured"));
        }
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::new("listen", e.to_string())),
    }

    if config.backends.is_empty() {
        errors.push(ValidationError::new("backends", "empty backend list"));
    }
    if config.backends.len() > config.scheduler.max_backends {
        errors.push(ValidationError::new(
            "backends",
            format!(
                "{} backends configured, max_backends is {}",
                config.backends.len(),
                config.scheduler.max_backends
            ),
        ));
    }

    let health = &config.health_check;
    if health.service == ServiceKind::Ext
        && health.ext_command.as_deref().map_or(true, str::is_empty)
    {
        errors.push(ValidationError::new(
            "health_check.ext_command",
            "required for the ext service",
        ));
    }
    if health.interval_secs == 0 {
        errors.push(ValidationError::new("health_check.interval_secs", "must be > 0"));
    }
    if health.timeout_ms == 0 {
        errors.push(ValidationError::new("health_check.timeout_ms", "must be > 0"));
    }

    let scheduler = &config.scheduler;
    if scheduler.max_forwarders_per_backend == 0 {
        errors.push(ValidationError::new(
            "scheduler.max_forwarders_per_backend",
            "must be > 0",
        ));
    }
    if scheduler.max_forwarders_per_backend > scheduler.max_forwarders {
        errors.push(ValidationError::new(
            "scheduler.max_forwarders_per_backend",
            "exceeds scheduler.max_forwarders",
        ));
    }

    let tunnel = &config.tunnel;
    if tunnel.count > 0 {
        if tunnel.agent_port.parse::<u16>().is_err() {
            errors.push(ValidationError::new(
                "tunnel.agent_port",
                format!("invalid port {:?}", tunnel.agent_port),
            ));
        }
        if tunnel.dial_timeout_ms == 0 {
            errors.push(ValidationError::new("tunnel.dial_timeout_ms", "must be > 0"));
        }
        if tunnel.retry_interval_ms == 0 {
            errors.push(ValidationError::new("tunnel.retry_interval_ms", "must be > 0"));
        }
        if tunnel.stream_id_high_water == 0 || tunnel.stream_id_high_water >= MAX_STREAM_ID {
            errors.push(ValidationError::new(
                "tunnel.stream_id_high_water",
                format!("must be between 1 and {}", MAX_STREAM_ID - 1),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
