mod admin;
mod files;
mod folders;
mod providers;
mod shares;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::Deserialize;

use crate::api::response::ApiError;
use crate::provider::ProviderKind;

pub use admin::{admin_purge, health};
pub use files::{
    batch_copy, batch_delete, batch_move, create_share, delete_file, download_file, get_file,
    get_thumbnail, list_files, revoke_share, search_files, upload_file,
};
pub use folders::{create_folder, delete_folder, get_folder};
pub use providers::{
    authorize, create_registration, delete_registration, get_quota, list_providers,
    list_registrations, oauth_callback, set_default_registration, sync_registration_quota,
};
pub use shares::serve_share;

/// Header carrying the caller's identity, set by the authentication layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The calling user. Only presence is checked here.
pub struct UserId(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| ApiError::unauthorized("Missing X-User-Id header"))
    }
}

/// Optional explicit backend selection, `?provider=s3`.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderQuery {
    #[serde(default)]
    pub provider: Option<ProviderKind>,
}

fn parse_kind(raw: &str) -> Result<ProviderKind, ApiError> {
    raw.parse::<ProviderKind>()
        .map_err(|_| ApiError::bad_request(format!("Unknown provider '{raw}'")))
}
