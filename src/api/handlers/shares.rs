use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::response::{ApiError, AppQuery};
use crate::provider::LocalProvider;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ShareParams {
    #[serde(default)]
    pub password: Option<String>,
}

/// Serve a share link issued by the local backend. No user header needed.
/// Route: GET /share/:token
pub async fn serve_share(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    AppQuery(params): AppQuery<ShareParams>,
) -> Result<Response, ApiError> {
    let (item, data) = LocalProvider::open_share(
        &state.config.local.storage_path,
        &token,
        params.password.as_deref(),
    )
    .await?;

    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        item.mime_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(item.size));

    if let Ok(value) = format!("inline; filename=\"{}\"", item.name.replace('"', "")).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    // Links are revocable.
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("private, no-store"),
    );

    Ok(response)
}
