use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::load_balancer::BackendStats;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub pool_size: usize,
    pub pending: usize,
    pub backends: usize,
    pub forwarders: u64,
}

pub async fn get_status(
    State(state): State<AdminState>,
) -> Result<Json<SystemStatus>, StatusCode> {
    let stats = state
        .scheduler
        .stats()
        .await
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if stats.pool_size > 0 { "operational" } else { "degraded" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        pool_size: stats.pool_size,
        pending: stats.pending,
        backends: stats.backends.len(),
        forwarders: stats.forwarders,
    }))
}

pub async fn get_backends(
    State(state): State<AdminState>,
) -> Result<Json<Vec<BackendStats>>, StatusCode> {
    let stats = state
        .scheduler
        .stats()
        .await
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(stats.backends))
}
