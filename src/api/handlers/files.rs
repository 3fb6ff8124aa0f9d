use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ProviderQuery, UserId};
use crate::api::response::{ApiError, AppJson, AppQuery, BatchResult, JSend, Pagination};
use crate::provider::{
    guess_mime, ByteRange, ProviderKind, SearchOptions, ShareLink, ShareOptions, StorageFolder,
    StorageItem, ThumbnailSize, UploadOptions,
};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct ListingResponse {
    pub folders: Vec<StorageFolder>,
    pub files: Vec<StorageItem>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
}

#[derive(Debug, Deserialize)]
pub struct ThumbnailParams {
    #[serde(default)]
    pub size: ThumbnailSize,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub target_folder_id: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSend<ListingResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let folder_id = params.folder_id.as_deref();
    let (limit, offset) = (params.limit, params.offset);
    let listing = state
        .manager
        .execute(&user.0, params.provider, |provider| async move {
            provider.list_files(folder_id, limit, offset).await
        })
        .await?;

    Ok(JSend::success(ListingResponse {
        folders: listing.folders,
        files: listing.files,
        pagination: Pagination {
            limit: params.limit,
            offset: params.offset,
            total: listing.total,
        },
    }))
}

/// Multipart upload. Fields: `file` (required), `folder_id`, `overwrite`.
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(query): AppQuery<ProviderQuery>,
    mut multipart: Multipart,
) -> Result<Json<JSend<StorageItem>>, ApiError> {
    let mut file_data: Option<Bytes> = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;
    let mut folder_id: Option<String> = None;
    let mut overwrite = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                file_content_type = field.content_type().map(|s| s.to_string());

                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

                if data.len() as u64 > state.config.max_upload_size {
                    return Err(ApiError::payload_too_large(format!(
                        "File exceeds maximum upload size of {} bytes",
                        state.config.max_upload_size
                    )));
                }
                file_data = Some(data);
            }
            "folder_id" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid folder_id: {e}")))?;
                folder_id = Some(value).filter(|v| !v.trim().is_empty());
            }
            "overwrite" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid overwrite: {e}")))?;
                overwrite = matches!(value.trim(), "true" | "1");
            }
            _ => {}
        }
    }

    let data = file_data.ok_or_else(|| ApiError::bad_request("Missing 'file' field"))?;
    let file_name = file_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Uploaded file has no file name"))?;
    let mime_type = file_content_type
        .filter(|m| !m.is_empty() && m != "application/octet-stream")
        .unwrap_or_else(|| guess_mime(&file_name));

    let mut options = UploadOptions::new(file_name, mime_type, data.len() as u64).overwrite(overwrite);
    if let Some(folder_id) = folder_id {
        options = options.in_folder(folder_id);
    }

    let item = state
        .manager
        .execute(&user.0, query.provider, |provider| {
            let data = data.clone();
            let options = options.clone();
            async move { provider.upload_file(data, options).await }
        })
        .await?;

    tracing::debug!(user_id = %user.0, file_id = %item.id, size = item.size, "Uploaded file");
    Ok(JSend::success(item))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<ProviderQuery>,
) -> Result<Json<JSend<StorageItem>>, ApiError> {
    let id = id.as_str();
    let item = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.get_file(id).await
        })
        .await?;
    Ok(JSend::success(item))
}

/// Stream file content, honouring a single `Range` header.
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<ProviderQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(ByteRange::parse_header)
        .transpose()?;

    let id = id.as_str();
    let (item, data) = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            let item = provider.get_file(id).await?;
            let data = provider.download_file(id, range).await?;
            Ok((item, data))
        })
        .await?;

    let mut response = match range {
        Some(range) => {
            let (start, end) = range.resolve(item.size)?;
            let mut response = (StatusCode::PARTIAL_CONTENT, data.clone()).into_response();
            if let Ok(value) = format!("bytes {start}-{end}/{}", item.size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        }
        None => (StatusCode::OK, data.clone()).into_response(),
    };

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        item.mime_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        header::HeaderValue::from(data.len() as u64),
    );
    headers.insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
    if let Ok(value) = format!("attachment; filename=\"{}\"", item.name.replace('"', "")).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<ProviderQuery>,
) -> Result<Json<JSend<()>>, ApiError> {
    let id = id.as_str();
    state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.delete_file(id).await
        })
        .await?;

    tracing::debug!(user_id = %user.0, file_id = %id, "Deleted file");
    Ok(JSend::success(()))
}

/// Thumbnail bytes, or 404 when the backend has none for this item.
pub async fn get_thumbnail(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
    AppQuery(params): AppQuery<ThumbnailParams>,
) -> Result<Response, ApiError> {
    let id = id.as_str();
    let size = params.size;
    let thumbnail = state
        .manager
        .execute(&user.0, params.provider, |provider| async move {
            provider.get_thumbnail(id, size).await
        })
        .await?
        .ok_or_else(|| ApiError::not_found("No thumbnail available"))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/jpeg")],
        thumbnail,
    )
        .into_response())
}

pub async fn create_share(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<ProviderQuery>,
    AppJson(options): AppJson<ShareOptions>,
) -> Result<Json<JSend<ShareLink>>, ApiError> {
    let id = id.as_str();
    let link = state
        .manager
        .execute(&user.0, query.provider, |provider| {
            let options = options.clone();
            async move { provider.create_share_link(id, options).await }
        })
        .await?;
    Ok(JSend::success(link))
}

pub async fn revoke_share(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path((id, share_id)): Path<(String, String)>,
    AppQuery(query): AppQuery<ProviderQuery>,
) -> Result<Json<JSend<()>>, ApiError> {
    let (id, share_id) = (id.as_str(), share_id.as_str());
    state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.revoke_share_link(id, share_id).await
        })
        .await?;
    Ok(JSend::success(()))
}

pub async fn search_files(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(params): AppQuery<SearchParams>,
) -> Result<Json<JSend<Vec<StorageItem>>>, ApiError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::bad_request("q must not be empty"));
    }

    let query = params.q.as_str();
    let options = SearchOptions {
        folder_id: params.folder_id.clone(),
        mime_type: params.mime_type.clone(),
        limit: params.limit,
    };
    let items = state
        .manager
        .execute(&user.0, params.provider, |provider| {
            let options = options.clone();
            async move { provider.search_files(query, options).await }
        })
        .await?;
    Ok(JSend::success(items))
}

pub async fn batch_delete(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(query): AppQuery<ProviderQuery>,
    AppJson(req): AppJson<BatchRequest>,
) -> Result<Json<JSend<BatchResult>>, ApiError> {
    let ids = validate_batch(&req)?;
    let report = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.batch_delete(ids).await
        })
        .await?;
    Ok(JSend::success(report.into()))
}

pub async fn batch_move(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(query): AppQuery<ProviderQuery>,
    AppJson(req): AppJson<BatchRequest>,
) -> Result<Json<JSend<BatchResult>>, ApiError> {
    let ids = validate_batch(&req)?;
    let target = req.target_folder_id.as_deref();
    let report = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.batch_move(ids, target).await
        })
        .await?;
    Ok(JSend::success(report.into()))
}

pub async fn batch_copy(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(query): AppQuery<ProviderQuery>,
    AppJson(req): AppJson<BatchRequest>,
) -> Result<Json<JSend<BatchResult>>, ApiError> {
    let ids = validate_batch(&req)?;
    let target = req.target_folder_id.as_deref();
    let report = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.batch_copy(ids, target).await
        })
        .await?;
    Ok(JSend::success(report.into()))
}

// ============================================================================
// Helpers
// ============================================================================

const MAX_BATCH_ITEMS: usize = 1000;

fn validate_batch(req: &BatchRequest) -> Result<&[String], ApiError> {
    if req.ids.is_empty() {
        return Err(ApiError::bad_request("ids must not be empty"));
    }
    if req.ids.len() > MAX_BATCH_ITEMS {
        return Err(ApiError::bad_request(format!(
            "at most {MAX_BATCH_ITEMS} ids per batch"
        )));
    }
    Ok(&req.ids)
}
