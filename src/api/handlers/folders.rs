use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::{ProviderQuery, UserId};
use crate::api::response::{ApiError, AppJson, AppQuery, JSend};
use crate::provider::StorageFolder;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

pub async fn create_folder(
    State(state): State<Arc<AppState>>,
    user: UserId,
    AppQuery(query): AppQuery<ProviderQuery>,
    AppJson(req): AppJson<CreateFolderRequest>,
) -> Result<Json<JSend<StorageFolder>>, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    let parent_id = req.parent_id.as_deref().filter(|p| !p.is_empty());

    let folder = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.create_folder(name, parent_id).await
        })
        .await?;

    tracing::debug!(user_id = %user.0, folder_id = %folder.id, "Created folder");
    Ok(JSend::success(folder))
}

pub async fn get_folder(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<ProviderQuery>,
) -> Result<Json<JSend<StorageFolder>>, ApiError> {
    let id = id.as_str();
    let folder = state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.get_folder(id).await
        })
        .await?;
    Ok(JSend::success(folder))
}

pub async fn delete_folder(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<ProviderQuery>,
) -> Result<Json<JSend<()>>, ApiError> {
    let id = id.as_str();
    state
        .manager
        .execute(&user.0, query.provider, |provider| async move {
            provider.delete_folder(id).await
        })
        .await?;

    tracing::debug!(user_id = %user.0, folder_id = %id, "Deleted folder");
    Ok(JSend::success(()))
}
