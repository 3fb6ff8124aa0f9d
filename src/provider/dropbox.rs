use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{self, HttpSettings};
use super::oauth::{OAuthClient, OAuthEndpoints, OAuthSettings};
use super::upload::{Chunk, ChunkProtocol, UploadSession};
use super::{
    guess_mime, validate_name, ByteRange, Listing, ProviderKind, Quota, SearchOptions, ShareLink,
    ShareOptions, StorageError, StorageFolder, StorageItem, StorageProvider, ThumbnailSize,
    TokenSet, UploadLimits, UploadOptions,
};

/// Dropbox v2 backend.
///
/// Ids are Dropbox file ids (`id:...`), which the API accepts anywhere a path
/// is expected. Share link ids are the link URLs themselves.
pub struct DropboxProvider {
    http: HttpSettings,
    oauth: OAuthClient,
    api_base: String,
    content_base: String,
    limits: UploadLimits,
}

#[derive(Debug, Clone, Deserialize)]
struct Metadata {
    /// Absent on endpoints that return a concrete file or folder type.
    #[serde(rename = ".tag", default)]
    tag: String,
    name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    path_lower: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    client_modified: Option<String>,
    #[serde(default)]
    server_modified: Option<String>,
}

impl Metadata {
    fn is_folder(&self) -> bool {
        self.tag == "folder"
    }

    fn parent_lower(&self) -> String {
        self.path_lower
            .as_deref()
            .and_then(|p| p.rsplit_once('/'))
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct MetadataResult {
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    matches: Vec<SearchMatch>,
}

#[derive(Debug, Deserialize)]
struct SearchMatch {
    metadata: SearchMatchMetadata,
}

#[derive(Debug, Deserialize)]
struct SearchMatchMetadata {
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct SpaceUsage {
    used: u64,
    allocation: Allocation,
}

#[derive(Debug, Deserialize)]
struct Allocation {
    #[serde(default)]
    allocated: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SharedLink {
    url: String,
    #[serde(default)]
    expires: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
}

impl DropboxProvider {
    pub const DEFAULT_LIMITS: UploadLimits = UploadLimits::new(150 * 1024 * 1024, 8 * 1024 * 1024);

    pub fn new(settings: OAuthSettings, http: HttpSettings) -> Self {
        Self::build(
            settings,
            http,
            "https://api.dropboxapi.com".to_string(),
            "https://content.dropboxapi.com".to_string(),
        )
    }

    pub fn with_base_url(settings: OAuthSettings, http: HttpSettings, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        Self::build(settings, http, base.clone(), base)
    }

    fn build(settings: OAuthSettings, http: HttpSettings, api: String, content: String) -> Self {
        Self {
            oauth: OAuthClient::new(
                settings,
                OAuthEndpoints {
                    authorize_url: "https://www.dropbox.com/oauth2/authorize".to_string(),
                    token_url: format!("{api}/oauth2/token"),
                    scope: "",
                    extra: &[("token_access_type", "offline")],
                },
            ),
            api_base: format!("{api}/2"),
            content_base: format!("{content}/2"),
            http,
            limits: Self::DEFAULT_LIMITS,
        }
    }

    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    async fn rpc_request(&self, endpoint: &str, arg: &Value) -> Result<RequestBuilder, StorageError> {
        let token = self.oauth.access_token().await?;
        Ok(self
            .http
            .client
            .post(format!("{}/{endpoint}", self.api_base))
            .bearer_auth(token)
            .json(arg))
    }

    async fn content_request(
        &self,
        endpoint: &str,
        arg: &Value,
    ) -> Result<RequestBuilder, StorageError> {
        let token = self.oauth.access_token().await?;
        Ok(self
            .http
            .client
            .post(format!("{}/{endpoint}", self.content_base))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", api_arg(arg)))
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response, StorageError> {
        let response = self.http.send(request, context).await?;
        check(response, context).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<T, StorageError> {
        let response = self.send(request, context).await?;
        http::read_json(response, context).await
    }

    async fn rpc<T: DeserializeOwned>(&self, endpoint: &str, arg: Value) -> Result<T, StorageError> {
        let request = self.rpc_request(endpoint, &arg).await?;
        self.call(request, endpoint).await
    }

    async fn metadata(&self, id: &str) -> Result<Metadata, StorageError> {
        self.rpc("files/get_metadata", json!({ "path": id })).await
    }

    /// Dropbox path of a folder id; the root is the empty string.
    async fn folder_path(&self, folder_id: Option<&str>) -> Result<String, StorageError> {
        match folder_id.filter(|f| !f.is_empty() && *f != "/") {
            None => Ok(String::new()),
            Some(path) if path.starts_with('/') => Ok(path.trim_end_matches('/').to_string()),
            Some(id) => {
                let folder = self.metadata(id).await?;
                if !folder.is_folder() {
                    return Err(StorageError::NotFound(format!("folder '{id}'")));
                }
                Ok(folder.path_display.or(folder.path_lower).unwrap_or_default())
            }
        }
    }

    fn to_item(&self, meta: Metadata) -> StorageItem {
        let updated_at = meta
            .server_modified
            .as_deref()
            .and_then(http::parse_rfc3339)
            .unwrap_or_else(Utc::now);
        StorageItem {
            mime_type: guess_mime(&meta.name),
            path: meta
                .path_display
                .clone()
                .unwrap_or_else(|| format!("/{}", meta.name)),
            size: meta.size,
            url: None,
            thumbnail_url: None,
            created_at: meta
                .client_modified
                .as_deref()
                .and_then(http::parse_rfc3339)
                .unwrap_or(updated_at),
            updated_at,
            name: meta.name,
            id: meta.id,
        }
    }

    fn to_folder(&self, meta: Metadata) -> StorageFolder {
        let now = Utc::now();
        let parent = meta.parent_lower();
        StorageFolder {
            path: meta
                .path_display
                .clone()
                .unwrap_or_else(|| format!("/{}", meta.name)),
            parent_id: (!parent.is_empty()).then_some(parent),
            created_at: now,
            updated_at: now,
            name: meta.name,
            id: meta.id,
        }
    }
}

/// Upload-session glue: start, append at explicit offsets, finish with commit.
struct DropboxSession<'a> {
    provider: &'a DropboxProvider,
    path: String,
    mode: &'static str,
}

#[async_trait]
impl ChunkProtocol for DropboxSession<'_> {
    type Part = ();

    async fn open(&self) -> Result<String, StorageError> {
        let request = self
            .provider
            .content_request("files/upload_session/start", &json!({ "close": false }))
            .await?
            .header("Content-Type", "application/octet-stream");
        let started: SessionStart = self
            .provider
            .call(request, "files/upload_session/start")
            .await?;
        Ok(started.session_id)
    }

    async fn append(&self, session_id: &str, chunk: Chunk) -> Result<(), StorageError> {
        let arg = json!({
            "cursor": { "session_id": session_id, "offset": chunk.offset },
            "close": chunk.is_last(),
        });
        let request = self
            .provider
            .content_request("files/upload_session/append_v2", &arg)
            .await?
            .header("Content-Type", "application/octet-stream")
            .body(chunk.data);
        self.provider
            .send(request, "files/upload_session/append_v2")
            .await?;
        Ok(())
    }

    async fn commit(
        &self,
        session_id: &str,
        _parts: Vec<()>,
        total: u64,
    ) -> Result<StorageItem, StorageError> {
        let arg = json!({
            "cursor": { "session_id": session_id, "offset": total },
            "commit": { "path": self.path, "mode": self.mode, "autorename": true },
        });
        let request = self
            .provider
            .content_request("files/upload_session/finish", &arg)
            .await?
            .header("Content-Type", "application/octet-stream");
        let meta: Metadata = self
            .provider
            .call(request, "files/upload_session/finish")
            .await?;
        Ok(self.provider.to_item(meta))
    }

    /// Dropbox expires unfinished sessions on its own.
    async fn abort(&self, session_id: &str) -> Result<(), StorageError> {
        tracing::debug!(path = %self.path, session = %session_id, "Abandoning upload session");
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for DropboxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dropbox
    }

    async fn authenticate(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StorageError> {
        self.oauth.bind(access_token, refresh_token).await
    }

    async fn refresh_access_token(&self) -> Result<TokenSet, StorageError> {
        self.oauth.refresh(&self.http).await
    }

    fn authorization_url(&self, state: &str) -> Option<String> {
        Some(self.oauth.authorization_url(state))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, StorageError> {
        self.oauth.exchange_code(&self.http, code).await
    }

    async fn upload_file(
        &self,
        data: Bytes,
        options: UploadOptions,
    ) -> Result<StorageItem, StorageError> {
        validate_name(&options.file_name)?;
        let path = format!(
            "{}/{}",
            self.folder_path(options.folder_id.as_deref()).await?,
            options.file_name.trim()
        );
        let mode = if options.overwrite { "overwrite" } else { "add" };

        if self.limits.is_chunked(data.len() as u64) {
            let protocol = DropboxSession {
                provider: self,
                path: path.clone(),
                mode,
            };
            let mut session =
                UploadSession::new(ProviderKind::Dropbox, path, self.limits.chunk_size);
            return session
                .run(&protocol, data, 1, options.cancel.as_ref())
                .await;
        }

        let arg = json!({ "path": path, "mode": mode, "autorename": true, "mute": true });
        let request = self
            .content_request("files/upload", &arg)
            .await?
            .header("Content-Type", "application/octet-stream")
            .body(data);
        let meta: Metadata = self.call(request, "files/upload").await?;
        Ok(self.to_item(meta))
    }

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        let mut request = self
            .content_request("files/download", &json!({ "path": id }))
            .await?;
        if let Some(range) = range {
            request = request.header("Range", range.header_value());
        }
        let response = self.http.send(request, "files/download").await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(StorageError::InvalidArgument(format!(
                "range not satisfiable for '{id}'"
            )));
        }
        let response = check(response, "files/download").await?;
        http::read_bytes(response, "files/download").await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let _: MetadataResult = self.rpc("files/delete_v2", json!({ "path": id })).await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<StorageItem, StorageError> {
        let meta = self.metadata(id).await?;
        if meta.is_folder() {
            return Err(StorageError::InvalidArgument(format!("'{id}' is a folder")));
        }
        Ok(self.to_item(meta))
    }

    async fn list_files(
        &self,
        folder_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Listing, StorageError> {
        let path = match folder_id.filter(|f| !f.is_empty() && *f != "/") {
            Some(id) => id.to_string(),
            None => String::new(),
        };
        let mut page: ListFolderResult = self
            .rpc(
                "files/list_folder",
                json!({ "path": path, "recursive": false, "limit": 2000 }),
            )
            .await?;
        let mut entries = std::mem::take(&mut page.entries);
        while page.has_more {
            page = self
                .rpc(
                    "files/list_folder/continue",
                    json!({ "cursor": page.cursor }),
                )
                .await?;
            entries.append(&mut page.entries);
        }

        let (folders, files): (Vec<Metadata>, Vec<Metadata>) = entries
            .into_iter()
            .filter(|m| m.tag != "deleted")
            .partition(Metadata::is_folder);

        Ok(Listing::paged(
            folders.into_iter().map(|f| self.to_folder(f)).collect(),
            files.into_iter().map(|f| self.to_item(f)).collect(),
            limit,
            offset,
        ))
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<StorageFolder, StorageError> {
        validate_name(name)?;
        let path = format!("{}/{}", self.folder_path(parent_id).await?, name.trim());
        let created: MetadataResult = self
            .rpc(
                "files/create_folder_v2",
                json!({ "path": path, "autorename": false }),
            )
            .await?;
        let mut meta = created.metadata;
        meta.tag = "folder".to_string();
        Ok(self.to_folder(meta))
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        if !self.metadata(id).await?.is_folder() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        let _: MetadataResult = self.rpc("files/delete_v2", json!({ "path": id })).await?;
        Ok(())
    }

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError> {
        let meta = self.metadata(id).await?;
        if !meta.is_folder() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        Ok(self.to_folder(meta))
    }

    async fn move_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let current = self.metadata(id).await?;
        let target = self.folder_path(target_folder_id).await?;
        if current.parent_lower() == target.to_lowercase() {
            return Ok(self.to_item(current));
        }
        let moved: MetadataResult = self
            .rpc(
                "files/move_v2",
                json!({
                    "from_path": id,
                    "to_path": format!("{target}/{}", current.name),
                    "autorename": true,
                }),
            )
            .await?;
        Ok(self.to_item(moved.metadata))
    }

    async fn copy_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let current = self.metadata(id).await?;
        let target = self.folder_path(target_folder_id).await?;
        let copied: MetadataResult = self
            .rpc(
                "files/copy_v2",
                json!({
                    "from_path": id,
                    "to_path": format!("{target}/{}", current.name),
                    "autorename": true,
                }),
            )
            .await?;
        Ok(self.to_item(copied.metadata))
    }

    async fn create_share_link(
        &self,
        id: &str,
        options: ShareOptions,
    ) -> Result<ShareLink, StorageError> {
        let mut settings = json!({
            "requested_visibility": if options.password.is_some() { "password" } else { "public" },
            "access": if options.allow_edit { "editor" } else { "viewer" },
        });
        if let Some(ref password) = options.password {
            settings["link_password"] = json!(password);
        }
        if let Some(expires_at) = options.expires_at {
            settings["expires"] = json!(expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }
        let link: SharedLink = self
            .rpc(
                "sharing/create_shared_link_with_settings",
                json!({ "path": id, "settings": settings }),
            )
            .await?;
        Ok(ShareLink {
            id: link.url.clone(),
            url: link.url,
            expires_at: link
                .expires
                .as_deref()
                .and_then(http::parse_rfc3339)
                .or(options.expires_at),
        })
    }

    async fn revoke_share_link(&self, _id: &str, share_id: &str) -> Result<(), StorageError> {
        let request = self
            .rpc_request("sharing/revoke_shared_link", &json!({ "url": share_id }))
            .await?;
        self.send(request, "sharing/revoke_shared_link").await?;
        Ok(())
    }

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError> {
        let limit = options.effective_limit();
        let mut search_options = json!({
            "max_results": limit.min(1000),
            "file_status": "active",
            "filename_only": true,
        });
        if options.folder_id.is_some() {
            search_options["path"] = json!(self.folder_path(options.folder_id.as_deref()).await?);
        }
        let result: SearchResult = self
            .rpc(
                "files/search_v2",
                json!({ "query": query.trim(), "options": search_options }),
            )
            .await?;

        Ok(result
            .matches
            .into_iter()
            .map(|m| m.metadata.metadata)
            .filter(|m| !m.is_folder())
            .map(|m| self.to_item(m))
            .filter(|item| options.matches_mime(&item.mime_type))
            .take(limit)
            .collect())
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        let usage: SpaceUsage = self.rpc("users/get_space_usage", Value::Null).await?;
        Ok(match usage.allocation.allocated {
            Some(total) => Quota::limited(total, usage.used),
            None => Quota::unlimited(usage.used),
        })
    }

    async fn get_thumbnail(
        &self,
        id: &str,
        size: ThumbnailSize,
    ) -> Result<Option<Bytes>, StorageError> {
        let size = match size {
            ThumbnailSize::Small => "w128h128",
            ThumbnailSize::Medium => "w256h256",
            ThumbnailSize::Large => "w1024h768",
        };
        let arg = json!({
            "resource": { ".tag": "path", "path": id },
            "format": "jpeg",
            "size": size,
        });
        let request = self.content_request("files/get_thumbnail_v2", &arg).await?;
        let response = self.http.send(request, "files/get_thumbnail_v2").await?;
        // 409 here means the file type has no thumbnail.
        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            if body.contains("not_found") {
                return Err(StorageError::NotFound(format!("file '{id}'")));
            }
            return Ok(None);
        }
        let response = check(response, "files/get_thumbnail_v2").await?;
        Ok(Some(
            http::read_bytes(response, "files/get_thumbnail_v2").await?,
        ))
    }
}

/// Dropbox reports endpoint-specific failures as 409 with an error summary.
async fn check(response: Response, context: &str) -> Result<Response, StorageError> {
    if response.status() != StatusCode::CONFLICT {
        return http::check(response, context).await;
    }
    let body = response.text().await.unwrap_or_default();
    let summary = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.error_summary)
        .unwrap_or(body);
    Err(classify(&summary, context))
}

fn classify(summary: &str, context: &str) -> StorageError {
    let message = format!("{context} failed: {summary}");
    if summary.contains("not_found") {
        StorageError::NotFound(message)
    } else if summary.contains("insufficient_space") {
        StorageError::QuotaExceeded(message)
    } else if summary.contains("conflict") || summary.contains("already_exists") {
        StorageError::Conflict(message)
    } else if summary.contains("too_many_write_operations") {
        StorageError::Transient(message)
    } else {
        StorageError::Backend {
            status: 409,
            message,
        }
    }
}

/// `Dropbox-API-Arg` must be ASCII; escape everything else as `\uXXXX`.
fn api_arg(value: &Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_arg_escapes_non_ascii() {
        let arg = api_arg(&json!({ "path": "/café/😀.txt" }));
        assert_eq!(arg, r#"{"path":"/caf\u00e9/\ud83d\ude00.txt"}"#);
    }

    #[test]
    fn test_classify_error_summaries() {
        assert!(classify("path/not_found/..", "x").is_not_found());
        assert!(matches!(
            classify("path/conflict/file/..", "x"),
            StorageError::Conflict(_)
        ));
        assert!(matches!(
            classify("path/insufficient_space/", "x"),
            StorageError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify("something_else/", "x"),
            StorageError::Backend { status: 409, .. }
        ));
    }

    #[test]
    fn test_parent_of_metadata() {
        let meta: Metadata = serde_json::from_value(json!({
            ".tag": "file",
            "name": "a.txt",
            "id": "id:1",
            "path_lower": "/docs/a.txt",
        }))
        .unwrap();
        assert_eq!(meta.parent_lower(), "/docs");
    }
}
