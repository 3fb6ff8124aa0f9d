use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::http::{self, header_str, HttpSettings};
use super::oauth::{OAuthClient, OAuthEndpoints, OAuthSettings};
use super::upload::{Chunk, ChunkProtocol, UploadSession};
use super::{
    validate_name, ByteRange, Listing, ProviderKind, Quota, SearchOptions, ShareLink,
    ShareOptions, StorageError, StorageFolder, StorageItem, StorageProvider, ThumbnailSize,
    TokenSet, UploadLimits, UploadOptions,
};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str =
    "id,name,mimeType,size,parents,createdTime,modifiedTime,thumbnailLink,webViewLink";
const ROOT: &str = "root";
const MAX_PAGE_SIZE: usize = 1000;

/// Google Drive v3 backend.
///
/// Ids are Drive file ids. Drive allows several files with the same name in
/// one folder, so uploads without `overwrite` never conflict.
pub struct GoogleDriveProvider {
    http: HttpSettings,
    oauth: OAuthClient,
    api_base: String,
    upload_base: String,
    limits: UploadLimits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    created_time: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    thumbnail_link: Option<String>,
    #[serde(default)]
    web_view_link: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    storage_quota: StorageQuota,
}

#[derive(Debug, Deserialize)]
struct StorageQuota {
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    usage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Permission {
    id: String,
}

impl GoogleDriveProvider {
    /// Resumable chunks must be multiples of 256 KiB.
    pub const DEFAULT_LIMITS: UploadLimits = UploadLimits::new(5 * 1024 * 1024, 8 * 1024 * 1024);

    pub fn new(settings: OAuthSettings, http: HttpSettings) -> Self {
        Self::build(
            settings,
            http,
            "https://www.googleapis.com".to_string(),
            "https://oauth2.googleapis.com/token".to_string(),
        )
    }

    /// Point every endpoint at `base_url`; used against test doubles.
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
                    authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                    token_url,
                    scope: "https://www.googleapis.com/auth/drive",
                    extra: &[("access_type", "offline"), ("prompt", "consent")],
                },
            ),
            api_base: format!("{base}/drive/v3"),
            upload_base: format!("{base}/upload/drive/v3"),
            http,
            limits: Self::DEFAULT_LIMITS,
        }
    }

    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    async fn authed(&self, method: Method, url: &str) -> Result<RequestBuilder, StorageError> {
        let token = self.oauth.access_token().await?;
        Ok(self.http.client.request(method, url).bearer_auth(token))
    }

    async fn fetch(&self, id: &str) -> Result<DriveFile, StorageError> {
        let request = self
            .authed(Method::GET, &format!("{}/files/{id}", self.api_base))
            .await?
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")]);
        self.http.json(request, "Drive get file").await
    }

    async fn query_page(
        &self,
        q: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<FileList, StorageError> {
        let mut params = vec![
            ("q", q.to_string()),
            ("fields", format!("nextPageToken,files({FILE_FIELDS})")),
            ("pageSize", page_size.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("orderBy", "folder,name".to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let request = self
            .authed(Method::GET, &format!("{}/files", self.api_base))
            .await?
            .query(&params);
        self.http.json(request, "Drive list files").await
    }

    /// Files matching `q` that pass `keep`, following `nextPageToken` only
    /// until `max_results` of them are collected.
    async fn query_files(
        &self,
        q: &str,
        max_results: usize,
        keep: impl Fn(&DriveFile) -> bool,
    ) -> Result<Vec<DriveFile>, StorageError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        while files.len() < max_results {
            let page = self
                .query_page(q, max_results - files.len(), page_token.as_deref())
                .await?;
            files.extend(page.files.into_iter().filter(|f| keep(f)));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        files.truncate(max_results);
        Ok(files)
    }

    /// First file named `name` directly under `parent`. Reads one page.
    async fn find_by_name(&self, name: &str, parent: &str) -> Result<Option<DriveFile>, StorageError> {
        let q = format!(
            "name = '{}' and '{}' in parents and trashed = false and mimeType != '{FOLDER_MIME}'",
            escape(name),
            escape(parent)
        );
        Ok(self.query_page(&q, 1, None).await?.files.into_iter().next())
    }

    fn multipart_body(metadata: &serde_json::Value, mime_type: &str, data: &[u8]) -> (String, Bytes) {
        let boundary = format!("drive-{}", uuid::Uuid::new_v4().simple());
        let mut body = BytesMut::with_capacity(data.len() + 512);
        body.put_slice(
            format!(
                "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
                 --{boundary}\r\nContent-Type: {mime_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.put_slice(data);
        body.put_slice(format!("\r\n--{boundary}--").as_bytes());
        (boundary, body.freeze())
    }

    /// Open a resumable session; returns the session URI.
    async fn open_resumable(
        &self,
        existing: Option<&str>,
        metadata: &serde_json::Value,
        mime_type: &str,
        size: usize,
    ) -> Result<String, StorageError> {
        let request = match existing {
            Some(id) => self
                .authed(Method::PATCH, &format!("{}/files/{id}", self.upload_base))
                .await?
                .json(&json!({})),
            None => self
                .authed(Method::POST, &format!("{}/files", self.upload_base))
                .await?
                .json(metadata),
        };
        let response = self
            .http
            .send_checked(
                request
                    .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
                    .header("X-Upload-Content-Type", mime_type)
                    .header("X-Upload-Content-Length", size.to_string()),
                "Drive open resumable upload",
            )
            .await?;
        header_str(&response, "location")
            .map(str::to_string)
            .ok_or_else(|| StorageError::Backend {
                status: response.status().as_u16(),
                message: "Drive resumable upload returned no session URI".to_string(),
            })
    }

    fn to_item(&self, file: DriveFile) -> StorageItem {
        let updated_at = file
            .modified_time
            .as_deref()
            .and_then(http::parse_rfc3339)
            .unwrap_or_else(Utc::now);
        StorageItem {
            size: file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
            path: format!("/{}", file.name),
            url: file.web_view_link,
            thumbnail_url: file.thumbnail_link,
            created_at: file
                .created_time
                .as_deref()
                .and_then(http::parse_rfc3339)
                .unwrap_or(updated_at),
            updated_at,
            mime_type: file.mime_type,
            name: file.name,
            id: file.id,
        }
    }

    fn to_folder(&self, file: DriveFile) -> StorageFolder {
        let updated_at = file
            .modified_time
            .as_deref()
            .and_then(http::parse_rfc3339)
            .unwrap_or_else(Utc::now);
        StorageFolder {
            path: format!("/{}", file.name),
            parent_id: file.parents.into_iter().next(),
            created_at: file
                .created_time
                .as_deref()
                .and_then(http::parse_rfc3339)
                .unwrap_or(updated_at),
            updated_at,
            name: file.name,
            id: file.id,
        }
    }
}

/// Resumable session glue. Drive answers the final chunk with the file
/// resource, so that response is the committed item.
struct DriveResumable<'a> {
    provider: &'a GoogleDriveProvider,
    existing: Option<String>,
    metadata: serde_json::Value,
    mime_type: String,
    size: usize,
}

#[async_trait]
impl ChunkProtocol for DriveResumable<'_> {
    type Part = Option<DriveFile>;

    async fn open(&self) -> Result<String, StorageError> {
        self.provider
            .open_resumable(
                self.existing.as_deref(),
                &self.metadata,
                &self.mime_type,
                self.size,
            )
            .await
    }

    async fn append(&self, session_id: &str, chunk: Chunk) -> Result<Option<DriveFile>, StorageError> {
        let request = self
            .provider
            .authed(Method::PUT, session_id)
            .await?
            .header("Content-Range", chunk.content_range())
            .body(chunk.data);
        let response = self
            .provider
            .http
            .send(request, "Drive upload chunk")
            .await?;
        // 308 Resume Incomplete acknowledges an intermediate chunk.
        if response.status() == StatusCode::PERMANENT_REDIRECT {
            return Ok(None);
        }
        let response = http::check(response, "Drive upload chunk").await?;
        Ok(Some(http::read_json(response, "Drive upload chunk").await?))
    }

    async fn commit(
        &self,
        _session_id: &str,
        parts: Vec<Option<DriveFile>>,
        _total: u64,
    ) -> Result<StorageItem, StorageError> {
        parts
            .into_iter()
            .flatten()
            .last()
            .map(|file| self.provider.to_item(file))
            .ok_or_else(|| StorageError::Backend {
                status: 308,
                message: "Drive never acknowledged the final chunk".to_string(),
            })
    }

    async fn abort(&self, session_id: &str) -> Result<(), StorageError> {
        let request = self.provider.authed(Method::DELETE, session_id).await?;
        // Drive answers a cancelled session with 499; any answer is fine.
        self.provider
            .http
            .send(request, "Drive cancel upload")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for GoogleDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
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
        let parent = options.folder_id.clone().unwrap_or_else(|| ROOT.to_string());
        let name = options.file_name.trim().to_string();

        let existing = if options.overwrite {
            self.find_by_name(&name, &parent).await?.map(|f| f.id)
        } else {
            None
        };
        let metadata = json!({
            "name": name,
            "mimeType": options.mime_type,
            "parents": [parent],
        });

        if self.limits.is_chunked(data.len() as u64) {
            let protocol = DriveResumable {
                provider: self,
                existing,
                metadata,
                mime_type: options.mime_type.clone(),
                size: data.len(),
            };
            let mut session =
                UploadSession::new(ProviderKind::GoogleDrive, name, self.limits.chunk_size);
            return session
                .run(&protocol, data, 1, options.cancel.as_ref())
                .await;
        }

        let request = match existing {
            Some(id) => self
                .authed(Method::PATCH, &format!("{}/files/{id}", self.upload_base))
                .await?
                .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
                .header("Content-Type", options.mime_type.clone())
                .body(data),
            None => {
                let (boundary, body) = Self::multipart_body(&metadata, &options.mime_type, &data);
                self.authed(Method::POST, &format!("{}/files", self.upload_base))
                    .await?
                    .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                    .header(
                        "Content-Type",
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body)
            }
        };
        let file: DriveFile = self.http.json(request, "Drive upload").await?;
        Ok(self.to_item(file))
    }

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        let mut request = self
            .authed(Method::GET, &format!("{}/files/{id}", self.api_base))
            .await?
            .query(&[("alt", "media")]);
        if let Some(range) = range {
            request = request.header("Range", range.header_value());
        }
        let response = self.http.send(request, "Drive download").await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(StorageError::InvalidArgument(format!(
                "range not satisfiable for '{id}'"
            )));
        }
        let response = http::check(response, "Drive download").await?;
        http::read_bytes(response, "Drive download").await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let request = self
            .authed(Method::DELETE, &format!("{}/files/{id}", self.api_base))
            .await?;
        self.http.send_checked(request, "Drive delete file").await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<StorageItem, StorageError> {
        let file = self.fetch(id).await?;
        if file.is_folder() {
            return Err(StorageError::InvalidArgument(format!("'{id}' is a folder")));
        }
        Ok(self.to_item(file))
    }

    async fn list_files(
        &self,
        folder_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Listing, StorageError> {
        let parent = folder_id.unwrap_or(ROOT);
        let q = format!("'{}' in parents and trashed = false", escape(parent));
        let (folders, files): (Vec<DriveFile>, Vec<DriveFile>) = self
            .query_files(&q, usize::MAX, |_| true)
            .await?
            .into_iter()
            .partition(DriveFile::is_folder);

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
            .authed(Method::POST, &format!("{}/files", self.api_base))
            .await?
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({
                "name": name.trim(),
                "mimeType": FOLDER_MIME,
                "parents": [parent_id.unwrap_or(ROOT)],
            }));
        let folder: DriveFile = self.http.json(request, "Drive create folder").await?;
        Ok(self.to_folder(folder))
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        if id == ROOT {
            return Err(StorageError::InvalidArgument(
                "the root folder cannot be deleted".to_string(),
            ));
        }
        if !self.fetch(id).await?.is_folder() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        let request = self
            .authed(Method::DELETE, &format!("{}/files/{id}", self.api_base))
            .await?;
        self.http.send_checked(request, "Drive delete folder").await?;
        Ok(())
    }

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError> {
        let file = self.fetch(id).await?;
        if !file.is_folder() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        Ok(self.to_folder(file))
    }

    async fn move_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let current = self.fetch(id).await?;
        let target = target_folder_id.unwrap_or(ROOT);
        let previous = current.parents.join(",");
        let request = self
            .authed(Method::PATCH, &format!("{}/files/{id}", self.api_base))
            .await?
            .query(&[
                ("addParents", target),
                ("removeParents", previous.as_str()),
                ("fields", FILE_FIELDS),
            ])
            .json(&json!({}));
        let file: DriveFile = self.http.json(request, "Drive move file").await?;
        Ok(self.to_item(file))
    }

    async fn copy_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let mut body = json!({});
        if let Some(target) = target_folder_id {
            body["parents"] = json!([target]);
        }
        let request = self
            .authed(Method::POST, &format!("{}/files/{id}/copy", self.api_base))
            .await?
            .query(&[("fields", FILE_FIELDS)])
            .json(&body);
        let file: DriveFile = self.http.json(request, "Drive copy file").await?;
        Ok(self.to_item(file))
    }

    async fn create_share_link(
        &self,
        id: &str,
        options: ShareOptions,
    ) -> Result<ShareLink, StorageError> {
        if options.password.is_some() {
            return Err(StorageError::Unsupported(
                "Drive links cannot be password protected".to_string(),
            ));
        }
        if options.expires_at.is_some() {
            return Err(StorageError::Unsupported(
                "Drive public links cannot expire".to_string(),
            ));
        }
        let role = if options.allow_edit { "writer" } else { "reader" };
        let request = self
            .authed(
                Method::POST,
                &format!("{}/files/{id}/permissions", self.api_base),
            )
            .await?
            .json(&json!({ "type": "anyone", "role": role }));
        let permission: Permission = self.http.json(request, "Drive create permission").await?;

        let file = self.fetch(id).await?;
        let url = file
            .web_view_link
            .unwrap_or_else(|| format!("https://drive.google.com/file/d/{id}/view"));
        Ok(ShareLink {
            id: permission.id,
            url,
            expires_at: None,
        })
    }

    async fn revoke_share_link(&self, id: &str, share_id: &str) -> Result<(), StorageError> {
        let request = self
            .authed(
                Method::DELETE,
                &format!("{}/files/{id}/permissions/{share_id}", self.api_base),
            )
            .await?;
        self.http
            .send_checked(request, "Drive delete permission")
            .await?;
        Ok(())
    }

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError> {
        let mut q = format!(
            "name contains '{}' and trashed = false and mimeType != '{FOLDER_MIME}'",
            escape(query.trim())
        );
        if let Some(ref folder) = options.folder_id {
            q.push_str(&format!(" and '{}' in parents", escape(folder)));
        }
        if let Some(clause) = options.mime_type.as_deref().and_then(mime_clause) {
            q.push_str(&clause);
        }
        let limit = options.effective_limit();

        Ok(self
            .query_files(&q, limit, |f| options.matches_mime(&f.mime_type))
            .await?
            .into_iter()
            .map(|f| self.to_item(f))
            .collect())
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        let request = self
            .authed(Method::GET, &format!("{}/about", self.api_base))
            .await?
            .query(&[("fields", "storageQuota")]);
        let about: About = self.http.json(request, "Drive about").await?;
        let used = about
            .storage_quota
            .usage
            .as_deref()
            .and_then(|u| u.parse().ok())
            .unwrap_or(0);
        Ok(
            match about.storage_quota.limit.as_deref().and_then(|l| l.parse().ok()) {
                Some(total) => Quota::limited(total, used),
                None => Quota::unlimited(used),
            },
        )
    }

    async fn get_thumbnail(
        &self,
        id: &str,
        size: ThumbnailSize,
    ) -> Result<Option<Bytes>, StorageError> {
        let Some(link) = self.fetch(id).await?.thumbnail_link else {
            return Ok(None);
        };
        let url = sized_thumbnail(&link, size.pixels());
        let response = self
            .http
            .send(self.authed(Method::GET, &url).await?, "Drive thumbnail")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = http::check(response, "Drive thumbnail").await?;
        Ok(Some(http::read_bytes(response, "Drive thumbnail").await?))
    }
}

/// Quote a value for a Drive `q` expression.
/// Drive query clause for a MIME filter; `type/*` becomes a prefix match.
fn mime_clause(filter: &str) -> Option<String> {
    let filter = filter.trim();
    if filter.is_empty() {
        return None;
    }
    let prefix = filter.trim_end_matches('*');
    Some(if prefix.ends_with('/') {
        format!(" and mimeType contains '{}'", escape(prefix))
    } else {
        format!(" and mimeType = '{}'", escape(filter))
    })
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Drive thumbnail links end in `=s<px>`; swap in the requested size.
fn sized_thumbnail(link: &str, pixels: u32) -> String {
    match link.rfind("=s") {
        Some(idx) if link[idx + 2..].chars().all(|c| c.is_ascii_digit()) => {
            format!("{}=s{pixels}", &link[..idx])
        }
        _ => link.to_string(),
    }
}
