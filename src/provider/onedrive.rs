use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::http::{self, encode_path, header_str, HttpSettings};
use super::oauth::{OAuthClient, OAuthEndpoints, OAuthSettings};
use super::upload::{Chunk, ChunkProtocol, UploadSession};
use super::{
    guess_mime, validate_name, ByteRange, Listing, ProviderKind, Quota, SearchOptions, ShareLink,
    ShareOptions, StorageError, StorageFolder, StorageItem, StorageProvider, ThumbnailSize,
    TokenSet, UploadLimits, UploadOptions,
};

const COPY_POLL_ATTEMPTS: u32 = 30;

/// OneDrive backend on Microsoft Graph, scoped to the signed-in user's drive.
pub struct OneDriveProvider {
    http: HttpSettings,
    oauth: OAuthClient,
    drive_base: String,
    limits: UploadLimits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    file: Option<FileFacet>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(default)]
    parent_reference: Option<ParentReference>,
    #[serde(default)]
    created_date_time: Option<String>,
    #[serde(default)]
    last_modified_date_time: Option<String>,
    #[serde(default)]
    web_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ParentReference {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct DriveQuota {
    quota: QuotaFacet,
}

#[derive(Debug, Deserialize)]
struct QuotaFacet {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    used: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedLink {
    id: String,
    link: LinkFacet,
    #[serde(default)]
    expiration_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkFacet {
    web_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyStatus {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

impl OneDriveProvider {
    /// Session chunks must be multiples of 320 KiB.
    pub const DEFAULT_LIMITS: UploadLimits = UploadLimits::new(4 * 1024 * 1024, 5 * 1024 * 1024);

    pub fn new(settings: OAuthSettings, http: HttpSettings) -> Self {
        Self::build(
            settings,
            http,
            "https://graph.microsoft.com/v1.0".to_string(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
        )
    }

    pub fn with_base_url(settings: OAuthSettings, http: HttpSettings, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        let token_url = format!("{base}/token");
        Self::build(settings, http, base, token_url)
    }

    fn build(settings: OAuthSettings, http: HttpSettings, base: String, token_url: String) -> Self {
        Self {
            oauth: OAuthClient::new(
                settings,
                OAuthEndpoints {
                    authorize_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
                        .to_string(),
                    token_url,
                    scope: "Files.ReadWrite.All offline_access",
                    extra: &[],
                },
            ),
            drive_base: format!("{base}/me/drive"),
            http,
            limits: Self::DEFAULT_LIMITS,
        }
    }

    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    fn item_url(&self, id: Option<&str>) -> String {
        match id.filter(|i| !i.is_empty()) {
            Some(id) => format!("{}/items/{id}", self.drive_base),
            None => format!("{}/root", self.drive_base),
        }
    }

    /// Path-addressed child of a folder: `.../items/{id}:/{name}:`.
    fn child_url(&self, parent: Option<&str>, name: &str) -> String {
        format!("{}:/{}:", self.item_url(parent), encode_path(name))
    }

    async fn authed(&self, method: Method, url: &str) -> Result<RequestBuilder, StorageError> {
        let token = self.oauth.access_token().await?;
        Ok(self.http.client.request(method, url).bearer_auth(token))
    }

    async fn fetch(&self, id: &str) -> Result<DriveItem, StorageError> {
        let request = self.authed(Method::GET, &self.item_url(Some(id))).await?;
        self.http.json(request, "OneDrive get item").await
    }

    async fn children(&self, folder_id: Option<&str>) -> Result<Vec<DriveItem>, StorageError> {
        let mut items = Vec::new();
        let mut next = Some(format!("{}/children?$top=200", self.item_url(folder_id)));
        while let Some(url) = next {
            let request = self.authed(Method::GET, &url).await?;
            let page: ItemPage = self.http.json(request, "OneDrive list children").await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }

    fn to_item(&self, item: DriveItem) -> StorageItem {
        let updated_at = item
            .last_modified_date_time
            .as_deref()
            .and_then(http::parse_rfc3339)
            .unwrap_or_else(Utc::now);
        let parent_path = item
            .parent_reference
            .as_ref()
            .and_then(|p| p.path.as_deref())
            .map(|p| p.split_once(':').map(|(_, rest)| rest).unwrap_or(p))
            .unwrap_or("");
        StorageItem {
            mime_type: item
                .file
                .as_ref()
                .and_then(|f| f.mime_type.clone())
                .unwrap_or_else(|| guess_mime(&item.name)),
            path: format!("{}/{}", parent_path.trim_end_matches('/'), item.name),
            size: item.size,
            url: item.web_url,
            thumbnail_url: None,
            created_at: item
                .created_date_time
                .as_deref()
                .and_then(http::parse_rfc3339)
                .unwrap_or(updated_at),
            updated_at,
            name: item.name,
            id: item.id,
        }
    }

    fn to_folder(&self, item: DriveItem) -> StorageFolder {
        let file = self.to_item(item.clone());
        StorageFolder {
            id: file.id,
            name: file.name,
            path: file.path,
            parent_id: item.parent_reference.and_then(|p| p.id),
            created_at: file.created_at,
            updated_at: file.updated_at,
        }
    }

    async fn wait_for_copy(&self, monitor_url: &str) -> Result<StorageItem, StorageError> {
        for _ in 0..COPY_POLL_ATTEMPTS {
            // Monitor URLs are pre-authenticated.
            let status: CopyStatus = self
                .http
                .json(self.http.client.get(monitor_url), "OneDrive copy status")
                .await?;
            match status.status.as_deref() {
                Some("completed") | None => {
                    let id = status.resource_id.or(status.id).ok_or_else(|| {
                        StorageError::Backend {
                            status: 200,
                            message: "OneDrive copy finished without a resource id".to_string(),
                        }
                    })?;
                    return self.get_file(&id).await;
                }
                Some("failed") => {
                    return Err(StorageError::Transient("OneDrive copy failed".to_string()))
                }
                Some(_) => tokio::time::sleep(StdDuration::from_millis(500)).await,
            }
        }
        Err(StorageError::Timeout(
            "OneDrive copy did not complete".to_string(),
        ))
    }
}

/// Upload-session glue. The session URL is pre-authenticated; the final
/// chunk's response is the created item.
struct OneDriveSession<'a> {
    provider: &'a OneDriveProvider,
    target_url: String,
    conflict_behavior: &'static str,
}

#[async_trait]
impl ChunkProtocol for OneDriveSession<'_> {
    type Part = Option<DriveItem>;

    async fn open(&self) -> Result<String, StorageError> {
        let request = self
            .provider
            .authed(
                Method::POST,
                &format!("{}/createUploadSession", self.target_url),
            )
            .await?
            .json(&json!({
                "item": { "@microsoft.graph.conflictBehavior": self.conflict_behavior }
            }));
        let session: UploadSessionResponse = self
            .provider
            .http
            .json(request, "OneDrive create upload session")
            .await?;
        Ok(session.upload_url)
    }

    async fn append(&self, session_id: &str, chunk: Chunk) -> Result<Option<DriveItem>, StorageError> {
        let request = self
            .provider
            .http
            .client
            .put(session_id)
            .header("Content-Range", chunk.content_range())
            .body(chunk.data);
        let response = self
            .provider
            .http
            .send_checked(request, "OneDrive upload chunk")
            .await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(None);
        }
        Ok(Some(
            http::read_json(response, "OneDrive upload chunk").await?,
        ))
    }

    async fn commit(
        &self,
        _session_id: &str,
        parts: Vec<Option<DriveItem>>,
        _total: u64,
    ) -> Result<StorageItem, StorageError> {
        parts
            .into_iter()
            .flatten()
            .last()
            .map(|item| self.provider.to_item(item))
            .ok_or_else(|| StorageError::Backend {
                status: 202,
                message: "OneDrive never returned the uploaded item".to_string(),
            })
    }

    async fn abort(&self, session_id: &str) -> Result<(), StorageError> {
        self.provider
            .http
            .send_checked(
                self.provider.http.client.delete(session_id),
                "OneDrive cancel upload session",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for OneDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OneDrive
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
        let target_url = self.child_url(options.folder_id.as_deref(), options.file_name.trim());
        let conflict_behavior = if options.overwrite { "replace" } else { "fail" };

        if self.limits.is_chunked(data.len() as u64) {
            let protocol = OneDriveSession {
                provider: self,
                target_url,
                conflict_behavior,
            };
            let mut session = UploadSession::new(
                ProviderKind::OneDrive,
                options.file_name.trim(),
                self.limits.chunk_size,
            );
            return session
                .run(&protocol, data, 1, options.cancel.as_ref())
                .await;
        }

        let request = self
            .authed(Method::PUT, &format!("{target_url}/content"))
            .await?
            .query(&[("@microsoft.graph.conflictBehavior", conflict_behavior)])
            .header("Content-Type", options.mime_type.clone())
            .body(data);
        let item: DriveItem = self.http.json(request, "OneDrive upload").await?;
        Ok(self.to_item(item))
    }

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        let mut request = self
            .authed(Method::GET, &format!("{}/content", self.item_url(Some(id))))
            .await?;
        if let Some(range) = range {
            request = request.header("Range", range.header_value());
        }
        let response = self.http.send(request, "OneDrive download").await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(StorageError::InvalidArgument(format!(
                "range not satisfiable for '{id}'"
            )));
        }
        let response = http::check(response, "OneDrive download").await?;
        http::read_bytes(response, "OneDrive download").await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let request = self.authed(Method::DELETE, &self.item_url(Some(id))).await?;
        self.http.send_checked(request, "OneDrive delete item").await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<StorageItem, StorageError> {
        let item = self.fetch(id).await?;
        if item.folder.is_some() {
            return Err(StorageError::InvalidArgument(format!("'{id}' is a folder")));
        }
        Ok(self.to_item(item))
    }

    async fn list_files(
        &self,
        folder_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Listing, StorageError> {
        let (folders, files): (Vec<DriveItem>, Vec<DriveItem>) = self
            .children(folder_id)
            .await?
            .into_iter()
            .partition(|item| item.folder.is_some());

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
        let request = self
            .authed(
                Method::POST,
                &format!("{}/children", self.item_url(parent_id)),
            )
            .await?
            .json(&json!({
                "name": name.trim(),
                "folder": {},
                "@microsoft.graph.conflictBehavior": "fail",
            }));
        let item: DriveItem = self.http.json(request, "OneDrive create folder").await?;
        Ok(self.to_folder(item))
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        if self.fetch(id).await?.folder.is_none() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        let request = self.authed(Method::DELETE, &self.item_url(Some(id))).await?;
        self.http
            .send_checked(request, "OneDrive delete folder")
            .await?;
        Ok(())
    }

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError> {
        let item = self.fetch(id).await?;
        if item.folder.is_none() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        Ok(self.to_folder(item))
    }

    async fn move_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let parent_id = match target_folder_id {
            Some(target) => target.to_string(),
            None => {
                let request = self.authed(Method::GET, &self.item_url(None)).await?;
                let root: DriveItem = self.http.json(request, "OneDrive get root").await?;
                root.id
            }
        };
        let request = self
            .authed(Method::PATCH, &self.item_url(Some(id)))
            .await?
            .json(&json!({ "parentReference": { "id": parent_id } }));
        let item: DriveItem = self.http.json(request, "OneDrive move item").await?;
        Ok(self.to_item(item))
    }

    async fn copy_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let mut body = json!({ "@microsoft.graph.conflictBehavior": "rename" });
        if let Some(target) = target_folder_id {
            body["parentReference"] = json!({ "id": target });
        }
        let request = self
            .authed(Method::POST, &format!("{}/copy", self.item_url(Some(id))))
            .await?
            .json(&body);
        let response = self.http.send_checked(request, "OneDrive copy item").await?;
        let monitor = header_str(&response, "location")
            .map(str::to_string)
            .ok_or_else(|| StorageError::Backend {
                status: response.status().as_u16(),
                message: "OneDrive copy returned no monitor URL".to_string(),
            })?;
        self.wait_for_copy(&monitor).await
    }

    async fn create_share_link(
        &self,
        id: &str,
        options: ShareOptions,
    ) -> Result<ShareLink, StorageError> {
        let mut body = json!({
            "type": if options.allow_edit { "edit" } else { "view" },
            "scope": "anonymous",
        });
        if let Some(expires_at) = options.expires_at {
            body["expirationDateTime"] = json!(expires_at.to_rfc3339());
        }
        if let Some(password) = options.password {
            body["password"] = json!(password);
        }
        let request = self
            .authed(
                Method::POST,
                &format!("{}/createLink", self.item_url(Some(id))),
            )
            .await?
            .json(&body);
        let link: CreatedLink = self.http.json(request, "OneDrive create link").await?;
        Ok(ShareLink {
            id: link.id,
            url: link.link.web_url,
            expires_at: link
                .expiration_date_time
                .as_deref()
                .and_then(http::parse_rfc3339)
                .or(options.expires_at),
        })
    }

    async fn revoke_share_link(&self, id: &str, share_id: &str) -> Result<(), StorageError> {
        let request = self
            .authed(
                Method::DELETE,
                &format!("{}/permissions/{share_id}", self.item_url(Some(id))),
            )
            .await?;
        self.http
            .send_checked(request, "OneDrive delete permission")
            .await?;
        Ok(())
    }

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError> {
        let escaped = query.trim().replace('\'', "''");
        let url = format!(
            "{}/search(q='{}')",
            self.item_url(options.folder_id.as_deref()),
            urlencoding::encode(&escaped)
        );
        let limit = options.effective_limit();
        let request = self
            .authed(Method::GET, &url)
            .await?
            .query(&[("$top", limit.to_string())]);
        let page: ItemPage = self.http.json(request, "OneDrive search").await?;

        Ok(page
            .value
            .into_iter()
            .filter(|item| item.folder.is_none())
            .map(|item| self.to_item(item))
            .filter(|item| options.matches_mime(&item.mime_type))
            .take(limit)
            .collect())
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        let request = self
            .authed(Method::GET, &self.drive_base)
            .await?
            .query(&[("$select", "quota")]);
        let drive: DriveQuota = self.http.json(request, "OneDrive quota").await?;
        Ok(match drive.quota.total {
            Some(total) => Quota::limited(total, drive.quota.used),
            None => Quota::unlimited(drive.quota.used),
        })
    }

    async fn get_thumbnail(
        &self,
        id: &str,
        size: ThumbnailSize,
    ) -> Result<Option<Bytes>, StorageError> {
        let label = match size {
            ThumbnailSize::Small => "small",
            ThumbnailSize::Medium => "medium",
            ThumbnailSize::Large => "large",
        };
        let url = format!("{}/thumbnails/0/{label}/content", self.item_url(Some(id)));
        let response = self
            .http
            .send(self.authed(Method::GET, &url).await?, "OneDrive thumbnail")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = http::check(response, "OneDrive thumbnail").await?;
        Ok(Some(http::read_bytes(response, "OneDrive thumbnail").await?))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn provider() -> OneDriveProvider {
        OneDriveProvider::with_base_url(
            OAuthSettings {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                redirect_uri: "http://localhost/callback".to_string(),
            },
            HttpSettings::new(Duration::from_secs(5)).unwrap(),
            "http://graph.test/v1.0",
        )
    }

    #[test]
    fn test_item_urls() {
        let p = provider();
        assert_eq!(p.item_url(None), "http://graph.test/v1.0/me/drive/root");
        assert_eq!(
            p.item_url(Some("ABC")),
            "http://graph.test/v1.0/me/drive/items/ABC"
        );
        assert_eq!(
            p.child_url(None, "my report.pdf"),
            "http://graph.test/v1.0/me/drive/root:/my%20report.pdf:"
        );
    }

    #[test]
    fn test_default_chunk_is_multiple_of_320_kib() {
        assert_eq!(OneDriveProvider::DEFAULT_LIMITS.chunk_size % (320 * 1024), 0);
    }

    #[test]
    fn test_item_path_strips_drive_prefix() {
        let item: DriveItem = serde_json::from_value(json!({
            "id": "1",
            "name": "a.txt",
            "size": 3,
            "file": { "mimeType": "text/plain" },
            "parentReference": { "id": "P", "path": "/drive/root:/docs" },
        }))
        .unwrap();
        let item = provider().to_item(item);
        assert_eq!(item.path, "/docs/a.txt");
        assert_eq!(item.mime_type, "text/plain");
    }
}
