use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{parse_kind, ProviderQuery, UserId};
use crate::api::response::{ApiError, AppJson, AppQuery, JSend};
use crate::manager::ProviderAvailability;
use crate::provider::{ProviderKind, Quota, TokenSet};
use crate::storage::ProviderRegistration;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

/// A registration as shown to its owner. Tokens never leave the server.
#[derive(Debug, Serialize)]
pub struct RegistrationResponse {
    pub id: String,
    pub provider: ProviderKind,
    pub display_name: String,
    pub is_default: bool,
    pub quota: Quota,
    pub quota_synced_at: Option<String>,
    pub token_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRegistrationRequest {
    pub provider: ProviderKind,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub provider: ProviderKind,
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    user: UserId,
) -> Result<Json<JSend<Vec<ProviderAvailability>>>, ApiError> {
    Ok(JSend::success(state.manager.list_available(&user.0)?))
}

/// Start a consent flow. The state is issued here and bound to the caller.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(provider): Path<String>,
) -> Result<Json<JSend<AuthorizeResponse>>, ApiError> {
    let kind = parse_kind(&provider)?;
    let request = state
        .manager
        .start_authorization(&user.0, kind)?
        .ok_or_else(|| ApiError::bad_request(format!("{kind} does not use OAuth")))?;

    Ok(JSend::success(AuthorizeResponse {
        provider: kind,
        authorization_url: request.url,
        state: request.state,
    }))
}

/// Exchange the code, then register the resulting tokens for the caller.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(provider): Path<String>,
    AppQuery(params): AppQuery<CallbackParams>,
) -> Result<Json<JSend<RegistrationResponse>>, ApiError> {
    let kind = parse_kind(&provider)?;
    let tokens = state
        .manager
        .handle_callback(&user.0, kind, &params.code, &params.state)
        .await?;
    let registration = state
        .manager
        .register(&user.0, kind, tokens, params.display_name)
        .await?;
    Ok(JSend::success(registration_to_response(&registration)))
}

pub async fn list_registrations(
    State(state): State<Arc<AppState>>,
    user: UserId,
) -> Result<Json<JSend<Vec<RegistrationResponse>>>, ApiError> {
    let registrations = state.manager.registrations(&user.0)?;
    Ok(JSend::success(
        registrations.iter().map(registration_to_response).collect(),
    ))
}

pub async fn create_registration(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppJson(req): AppJson<CreateRegistrationRequest>,
) -> Result<Json<JSend<RegistrationResponse>>, ApiError> {
    let tokens = TokenSet {
        access_token: req.access_token,
        refresh_token: req.refresh_token,
        expires_at: req.expires_at,
    };
    let registration = state
        .manager
        .register(&user.0, req.provider, tokens, req.display_name)
        .await?;
    Ok(JSend::success(registration_to_response(&registration)))
}

pub async fn set_default_registration(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
) -> Result<Json<JSend<RegistrationResponse>>, ApiError> {
    let registration = state.manager.set_default(&user.0, &id)?;
    Ok(JSend::success(registration_to_response(&registration)))
}

pub async fn delete_registration(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.manager.remove(&user.0, &id)?;
    Ok(JSend::success(()))
}

pub async fn sync_registration_quota(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
) -> Result<Json<JSend<Quota>>, ApiError> {
    let quota = state.manager.sync_quota(&user.0, &id).await?;
    Ok(JSend::success(quota))
}

/// Live quota of the resolved backend. Does not touch the cached snapshot.
pub async fn get_quota(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(query): AppQuery<ProviderQuery>,
) -> Result<Json<JSend<Quota>>, ApiError> {
    let quota = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.get_quota().await
        })
        .await?;
    Ok(JSend::success(quota))
}

// ============================================================================
// Helpers
// ============================================================================

fn registration_to_response(registration: &ProviderRegistration) -> RegistrationResponse {
    RegistrationResponse {
        id: registration.id.clone(),
        provider: registration.provider_kind,
        display_name: registration.display_name.clone(),
        is_default: registration.is_default,
        quota: registration.quota(),
        quota_synced_at: registration.quota_synced_at.map(|t| t.to_rfc3339()),
        token_expires_at: registration.expires_at.map(|t| t.to_rfc3339()),
        created_at: registration.created_at.to_rfc3339(),
        updated_at: registration.updated_at.to_rfc3339(),
    }
}
