use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, JSend};
use crate::provider::ProviderKind;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub configured_providers: Vec<ProviderKind>,
    pub refreshes_in_flight: usize,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub users_deleted: u64,
    pub registrations_deleted: u64,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        configured_providers: state.manager.registry().configured_kinds(),
        refreshes_in_flight: state.manager.refreshes_in_flight(),
    })
}

pub async fn admin_purge(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<PurgeResponse>>, ApiError> {
    let stats = state
        .db
        .purge_all()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    tracing::warn!(
        users = stats.users,
        registrations = stats.registrations,
        "Purged all registrations"
    );

    Ok(JSend::success(PurgeResponse {
        users_deleted: stats.users,
        registrations_deleted: stats.registrations,
    }))
}
