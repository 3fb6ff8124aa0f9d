use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use ring::hmac;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::http::{self, encode_path, header_str, HttpSettings};
use super::upload::{Chunk, ChunkProtocol, UploadSession};
use super::{
    guess_mime, renamed, validate_name, ByteRange, Listing, ProviderKind, Quota, SearchOptions,
    ShareLink, ShareOptions, StorageError, StorageFolder, StorageItem, StorageProvider,
    ThumbnailSize, TokenSet, UploadLimits, UploadOptions,
};

const API_VERSION: &str = "2020-12-06";
const FOLDER_MARKER: &str = ".folder";
const DEFAULT_SHARE_SECS: i64 = 3600;
const COPY_POLL_ATTEMPTS: u32 = 20;

/// Deployment-level Azure Blob settings, authorized with the account key.
#[derive(Debug, Clone)]
pub struct AzureSettings {
    pub account: String,
    /// Base64 account key.
    pub access_key: String,
    pub container: String,
    /// Blob service endpoint; defaults to `https://<account>.blob.core.windows.net`.
    pub endpoint: Option<String>,
}

/// Azure Blob Storage backend.
///
/// Large payloads are staged as uncommitted blocks and become visible only
/// when the block list is committed. Folders are `<path>/.folder` marker blobs.
pub struct AzureBlobProvider {
    http: HttpSettings,
    settings: AzureSettings,
    endpoint: String,
    key: Vec<u8>,
    prefix: String,
    limits: UploadLimits,
    access_token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "$value", default)]
    entries: Vec<BlobEntry>,
}

#[derive(Debug, Deserialize)]
enum BlobEntry {
    Blob(BlobItem),
    BlobPrefix(BlobPrefix),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Content-Length", default)]
    content_length: u64,
    #[serde(rename = "Content-Type", default)]
    content_type: Option<String>,
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
    #[serde(rename = "Creation-Time", default)]
    creation_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobPrefix {
    name: String,
}

/// Request shape handed to the SharedKey signer.
struct BlobRequest<'a> {
    method: Method,
    key: &'a str,
    query: Vec<(String, String)>,
    headers: Vec<(&'static str, String)>,
    body: Option<Bytes>,
}

impl<'a> BlobRequest<'a> {
    fn new(method: Method, key: &'a str) -> Self {
        Self {
            method,
            key,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

impl AzureBlobProvider {
    pub const DEFAULT_LIMITS: UploadLimits = UploadLimits::new(100 * 1024 * 1024, 8 * 1024 * 1024);

    pub fn new(
        settings: AzureSettings,
        http: HttpSettings,
        user_id: &str,
    ) -> Result<Self, StorageError> {
        if user_id.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "user id must not be empty".to_string(),
            ));
        }
        let key = BASE64.decode(settings.access_key.trim()).map_err(|e| {
            StorageError::InvalidArgument(format!("Azure access key is not base64: {e}"))
        })?;
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", settings.account))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            prefix: format!("users/{}/", urlencoding::encode(user_id.trim())),
            http,
            settings,
            endpoint,
            key,
            limits: Self::DEFAULT_LIMITS,
            access_token: RwLock::new(None),
        })
    }

    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    fn blob_url(&self, key: &str) -> String {
        if key.is_empty() {
            format!("{}/{}", self.endpoint, self.settings.container)
        } else {
            format!(
                "{}/{}/{}",
                self.endpoint,
                self.settings.container,
                encode_path(key)
            )
        }
    }

    fn full_key(&self, id: &str) -> Result<String, StorageError> {
        if id.split('/').any(|s| s == "..") {
            return Err(StorageError::InvalidArgument(format!("invalid id '{id}'")));
        }
        Ok(format!("{}{}", self.prefix, id.trim_start_matches('/')))
    }

    fn folder_prefix(&self, folder_id: Option<&str>) -> Result<String, StorageError> {
        match folder_id.map(|f| f.trim_matches('/')).filter(|f| !f.is_empty()) {
            Some(folder) => self.full_key(&format!("{folder}/")),
            None => Ok(self.prefix.clone()),
        }
    }

    fn relative(&self, key: &str) -> String {
        key.strip_prefix(&self.prefix).unwrap_or(key).to_string()
    }

    fn build(&self, request: BlobRequest<'_>) -> Result<RequestBuilder, StorageError> {
        let url = self.blob_url(request.key);
        let path = reqwest::Url::parse(&url)
            .map_err(|e| StorageError::InvalidArgument(format!("invalid blob url '{url}': {e}")))?
            .path()
            .to_string();

        let mut headers = request.headers;
        headers.push(("x-ms-date", http_date(Utc::now())));
        headers.push(("x-ms-version", API_VERSION.to_string()));

        let content_length = request.body.as_ref().map(|b| b.len()).unwrap_or(0);
        let is_put = request.method == Method::PUT;
        let string_to_sign = string_to_sign(
            request.method.as_str(),
            content_length,
            &headers,
            &format!("/{}{path}", self.settings.account),
            &request.query,
        );
        let signature = BASE64.encode(hmac::sign(
            &hmac::Key::new(hmac::HMAC_SHA256, &self.key),
            string_to_sign.as_bytes(),
        ));

        let mut builder = self
            .http
            .client
            .request(request.method, url)
            .query(&request.query)
            .header(
                "authorization",
                format!("SharedKey {}:{signature}", self.settings.account),
            );
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        } else if is_put {
            builder = builder.header("content-length", "0");
        }
        Ok(builder)
    }

    async fn send(&self, request: BlobRequest<'_>, context: &str) -> Result<Response, StorageError> {
        self.http.send_checked(self.build(request)?, context).await
    }

    async fn head(&self, key: &str) -> Result<Option<Response>, StorageError> {
        let response = self
            .http
            .send(
                self.build(BlobRequest::new(Method::HEAD, key))?,
                "Azure get blob properties",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            http::check(response, "Azure get blob properties").await?,
        ))
    }

    async fn stat(&self, key: &str) -> Result<StorageItem, StorageError> {
        let response = self
            .head(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("blob '{}'", self.relative(key))))?;
        Ok(self.item_from_head(key, &response))
    }

    fn item_from_head(&self, key: &str, response: &Response) -> StorageItem {
        let id = self.relative(key);
        let name = id.rsplit('/').next().unwrap_or(&id).to_string();
        let updated_at = header_str(response, "last-modified")
            .and_then(http::parse_http_date)
            .unwrap_or_else(Utc::now);
        let created_at = header_str(response, "x-ms-creation-time")
            .and_then(http::parse_http_date)
            .unwrap_or(updated_at);
        StorageItem {
            size: header_str(response, "content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            mime_type: header_str(response, "content-type")
                .map(str::to_string)
                .unwrap_or_else(|| guess_mime(&name)),
            path: format!("/{id}"),
            url: None,
            thumbnail_url: None,
            created_at,
            updated_at,
            name,
            id,
        }
    }

    fn item_from_listing(&self, blob: &BlobItem) -> StorageItem {
        let id = self.relative(&blob.name);
        let name = id.rsplit('/').next().unwrap_or(&id).to_string();
        let updated_at = blob
            .properties
            .last_modified
            .as_deref()
            .and_then(http::parse_http_date)
            .unwrap_or_else(Utc::now);
        StorageItem {
            size: blob.properties.content_length,
            mime_type: blob
                .properties
                .content_type
                .clone()
                .unwrap_or_else(|| guess_mime(&name)),
            path: format!("/{id}"),
            url: None,
            thumbnail_url: None,
            created_at: blob
                .properties
                .creation_time
                .as_deref()
                .and_then(http::parse_http_date)
                .unwrap_or(updated_at),
            updated_at,
            name,
            id,
        }
    }

    fn folder_from_prefix(&self, prefix: &str) -> StorageFolder {
        let id = self.relative(prefix);
        let trimmed = id.trim_end_matches('/');
        let (parent, name) = match trimmed.rsplit_once('/') {
            Some((parent, name)) => (Some(format!("{parent}/")), name.to_string()),
            None => (None, trimmed.to_string()),
        };
        let now = Utc::now();
        StorageFolder {
            path: format!("/{trimmed}"),
            parent_id: parent,
            name,
            id,
            created_at: now,
            updated_at: now,
        }
    }

    async fn list_all(
        &self,
        prefix: &str,
        delimited: bool,
    ) -> Result<(Vec<BlobItem>, Vec<String>), StorageError> {
        let mut blobs = Vec::new();
        let mut prefixes = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = BlobRequest::new(Method::GET, "")
                .query("restype", "container")
                .query("comp", "list")
                .query("prefix", prefix);
            if delimited {
                request = request.query("delimiter", "/");
            }
            if let Some(ref m) = marker {
                request = request.query("marker", m.clone());
            }

            let body = self
                .send(request, "Azure list blobs")
                .await?
                .text()
                .await
                .map_err(|e| http::from_reqwest(e, "Azure list blobs"))?;
            let page: EnumerationResults = http::read_xml(&body, "Azure list blobs")?;

            for entry in page.blobs.entries {
                match entry {
                    BlobEntry::Blob(blob) => blobs.push(blob),
                    BlobEntry::BlobPrefix(p) => prefixes.push(p.name),
                }
            }

            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok((blobs, prefixes))
    }

    async fn delete_key(&self, key: &str) -> Result<(), StorageError> {
        self.send(BlobRequest::new(Method::DELETE, key), "Azure delete blob")
            .await?;
        Ok(())
    }

    async fn free_key(&self, dir: &str, name: &str) -> Result<String, StorageError> {
        for attempt in 0..100u32 {
            let candidate = if attempt == 0 {
                format!("{dir}{name}")
            } else {
                format!("{dir}{}", renamed(name, attempt))
            };
            if self.head(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(StorageError::Conflict(format!("no free blob name for '{name}'")))
    }

    /// Server-side copy, waiting out the rare asynchronous case.
    async fn server_copy(&self, source_key: &str, target_key: &str) -> Result<(), StorageError> {
        let response = self
            .send(
                BlobRequest::new(Method::PUT, target_key)
                    .header("x-ms-copy-source", self.blob_url(source_key)),
                "Azure copy blob",
            )
            .await?;
        let mut status = header_str(&response, "x-ms-copy-status")
            .unwrap_or("success")
            .to_string();

        let mut attempts = 0;
        while status == "pending" && attempts < COPY_POLL_ATTEMPTS {
            tokio::time::sleep(StdDuration::from_millis(500)).await;
            attempts += 1;
            status = match self.head(target_key).await? {
                Some(r) => header_str(&r, "x-ms-copy-status")
                    .unwrap_or("success")
                    .to_string(),
                None => "failed".to_string(),
            };
        }

        match status.as_str() {
            "success" => Ok(()),
            "pending" => Err(StorageError::Timeout(format!(
                "copy of '{}' still pending",
                self.relative(source_key)
            ))),
            other => Err(StorageError::Transient(format!(
                "copy of '{}' ended with status {other}",
                self.relative(source_key)
            ))),
        }
    }

    /// Service SAS query string for one blob.
    fn sas_query(&self, key: &str, permissions: &str, expiry: DateTime<Utc>) -> String {
        let expiry = expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let resource = format!("/blob/{}/{}/{key}", self.settings.account, self.settings.container);
        let string_to_sign = [
            permissions,
            "",
            expiry.as_str(),
            resource.as_str(),
            "",
            "",
            "https,http",
            API_VERSION,
            "b",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n");
        let signature = BASE64.encode(hmac::sign(
            &hmac::Key::new(hmac::HMAC_SHA256, &self.key),
            string_to_sign.as_bytes(),
        ));

        [
            ("sv", API_VERSION),
            ("sp", permissions),
            ("se", expiry.as_str()),
            ("spr", "https,http"),
            ("sr", "b"),
            ("sig", signature.as_str()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
    }
}

/// Block-blob glue: blocks are staged under ids derived from the session id.
struct AzureBlocks<'a> {
    provider: &'a AzureBlobProvider,
    key: String,
    mime_type: String,
    overwrite: bool,
}

fn block_id(session_id: &str, index: usize) -> String {
    BASE64.encode(format!("{session_id}-{index:06}"))
}

#[async_trait]
impl ChunkProtocol for AzureBlocks<'_> {
    type Part = String;

    /// Blocks need no server-side session; the id only namespaces block ids.
    async fn open(&self) -> Result<String, StorageError> {
        Ok(uuid::Uuid::new_v4().simple().to_string())
    }

    async fn append(&self, session_id: &str, chunk: Chunk) -> Result<String, StorageError> {
        let id = block_id(session_id, chunk.index);
        self.provider
            .send(
                BlobRequest::new(Method::PUT, &self.key)
                    .query("comp", "block")
                    .query("blockid", id.clone())
                    .body(chunk.data),
                "Azure put block",
            )
            .await?;
        Ok(id)
    }

    async fn commit(
        &self,
        _session_id: &str,
        parts: Vec<String>,
        _total: u64,
    ) -> Result<StorageItem, StorageError> {
        let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
        for id in &parts {
            body.push_str(&format!("<Latest>{id}</Latest>"));
        }
        body.push_str("</BlockList>");

        let mut request = BlobRequest::new(Method::PUT, &self.key)
            .query("comp", "blocklist")
            .header("x-ms-blob-content-type", self.mime_type.clone())
            .body(body);
        if !self.overwrite {
            request = request.header("if-none-match", "*");
        }
        self.provider.send(request, "Azure put block list").await?;
        self.provider.stat(&self.key).await
    }

    /// Uncommitted blocks are discarded by the service; nothing to release.
    async fn abort(&self, session_id: &str) -> Result<(), StorageError> {
        tracing::debug!(
            blob = %self.key,
            session = %session_id,
            "Discarding uncommitted blocks"
        );
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for AzureBlobProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureBlob
    }

    async fn authenticate(
        &self,
        access_token: &str,
        _refresh_token: Option<&str>,
    ) -> Result<(), StorageError> {
        if access_token.trim().is_empty() {
            return Err(StorageError::Auth("empty_access_token".to_string()));
        }
        *self.access_token.write().await = Some(access_token.to_string());
        Ok(())
    }

    async fn refresh_access_token(&self) -> Result<TokenSet, StorageError> {
        let token = self
            .access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| StorageError::Auth("not_authenticated".to_string()))?;
        Ok(TokenSet {
            access_token: token,
            refresh_token: None,
            expires_at: None,
        })
    }

    async fn upload_file(
        &self,
        data: Bytes,
        options: UploadOptions,
    ) -> Result<StorageItem, StorageError> {
        validate_name(&options.file_name)?;
        let key = format!(
            "{}{}",
            self.folder_prefix(options.folder_id.as_deref())?,
            options.file_name.trim()
        );

        if self.limits.is_chunked(data.len() as u64) {
            if !options.overwrite && self.head(&key).await?.is_some() {
                return Err(StorageError::Conflict(format!(
                    "blob '{}' already exists",
                    self.relative(&key)
                )));
            }
            let protocol = AzureBlocks {
                provider: self,
                key: key.clone(),
                mime_type: options.mime_type.clone(),
                overwrite: options.overwrite,
            };
            let mut session = UploadSession::new(
                ProviderKind::AzureBlob,
                self.relative(&key),
                self.limits.chunk_size,
            );
            return session
                .run(&protocol, data, 1, options.cancel.as_ref())
                .await;
        }

        let mut request = BlobRequest::new(Method::PUT, &key)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-blob-content-type", options.mime_type.clone())
            .body(data);
        if !options.overwrite {
            request = request.header("if-none-match", "*");
        }
        self.send(request, "Azure put blob").await?;
        self.stat(&key).await
    }

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        let key = self.full_key(id)?;
        let mut request = BlobRequest::new(Method::GET, &key);
        if let Some(range) = range {
            request = request.header("x-ms-range", range.header_value());
        }
        let response = self.http.send(self.build(request)?, "Azure get blob").await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(StorageError::InvalidArgument(format!(
                "range not satisfiable for '{id}'"
            )));
        }
        let response = http::check(response, "Azure get blob").await?;
        http::read_bytes(response, "Azure get blob").await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        self.delete_key(&self.full_key(id)?).await
    }

    async fn get_file(&self, id: &str) -> Result<StorageItem, StorageError> {
        self.stat(&self.full_key(id)?).await
    }

    async fn list_files(
        &self,
        folder_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Listing, StorageError> {
        let prefix = self.folder_prefix(folder_id)?;
        let (blobs, prefixes) = self.list_all(&prefix, true).await?;

        let folders = prefixes
            .iter()
            .map(|p| self.folder_from_prefix(p))
            .collect();
        let files = blobs
            .iter()
            .filter(|b| !is_marker(&b.name))
            .map(|b| self.item_from_listing(b))
            .collect();

        Ok(Listing::paged(folders, files, limit, offset))
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<StorageFolder, StorageError> {
        validate_name(name)?;
        let prefix = format!("{}{}/", self.folder_prefix(parent_id)?, name.trim());
        let marker = format!("{prefix}{FOLDER_MARKER}");
        self.send(
            BlobRequest::new(Method::PUT, &marker)
                .header("x-ms-blob-type", "BlockBlob")
                .header("if-none-match", "*")
                .body(Bytes::new()),
            "Azure create folder",
        )
        .await?;
        Ok(self.folder_from_prefix(&prefix))
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        if id.trim_matches('/').is_empty() {
            return Err(StorageError::InvalidArgument(
                "the root folder cannot be deleted".to_string(),
            ));
        }
        let prefix = self.folder_prefix(Some(id))?;
        let (blobs, _) = self.list_all(&prefix, false).await?;
        if blobs.is_empty() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        for blob in blobs {
            self.delete_key(&blob.name).await?;
        }
        Ok(())
    }

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError> {
        let prefix = self.folder_prefix(Some(id))?;
        if let Some(response) = self.head(&format!("{prefix}{FOLDER_MARKER}")).await? {
            let mut folder = self.folder_from_prefix(&prefix);
            if let Some(created) = header_str(&response, "x-ms-creation-time")
                .and_then(http::parse_http_date)
            {
                folder.created_at = created;
                folder.updated_at = created;
            }
            return Ok(folder);
        }
        let (blobs, prefixes) = self.list_all(&prefix, true).await?;
        if blobs.is_empty() && prefixes.is_empty() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        Ok(self.folder_from_prefix(&prefix))
    }

    async fn move_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let source = self.full_key(id)?;
        let item = self.stat(&source).await?;
        let dir = self.folder_prefix(target_folder_id)?;
        if source.rsplit_once('/').map(|(d, _)| format!("{d}/")) == Some(dir.clone()) {
            return Ok(item);
        }
        let target = self.free_key(&dir, &item.name).await?;
        self.server_copy(&source, &target).await?;
        self.delete_key(&source).await?;
        self.stat(&target).await
    }

    async fn copy_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let source = self.full_key(id)?;
        let item = self.stat(&source).await?;
        let target = self
            .free_key(&self.folder_prefix(target_folder_id)?, &item.name)
            .await?;
        self.server_copy(&source, &target).await?;
        self.stat(&target).await
    }

    async fn create_share_link(
        &self,
        id: &str,
        options: ShareOptions,
    ) -> Result<ShareLink, StorageError> {
        if options.password.is_some() {
            return Err(StorageError::Unsupported(
                "Azure SAS links cannot be password protected".to_string(),
            ));
        }
        let key = self.full_key(id)?;
        self.stat(&key).await?;

        let now = Utc::now();
        let expires_at = options
            .expires_at
            .unwrap_or(now + Duration::seconds(DEFAULT_SHARE_SECS));
        if expires_at <= now {
            return Err(StorageError::InvalidArgument(
                "share link expiry must be in the future".to_string(),
            ));
        }
        let permissions = if options.allow_edit { "rw" } else { "r" };

        Ok(ShareLink {
            id: uuid::Uuid::new_v4().to_string(),
            url: format!(
                "{}?{}",
                self.blob_url(&key),
                self.sas_query(&key, permissions, expires_at)
            ),
            expires_at: Some(expires_at),
        })
    }

    async fn revoke_share_link(&self, _id: &str, _share_id: &str) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(
            "Azure SAS links cannot be revoked individually".to_string(),
        ))
    }

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError> {
        let prefix = self.folder_prefix(options.folder_id.as_deref())?;
        let needle = query.trim().to_lowercase();
        let (blobs, _) = self.list_all(&prefix, false).await?;

        Ok(blobs
            .iter()
            .filter(|b| !is_marker(&b.name))
            .map(|b| self.item_from_listing(b))
            .filter(|item| item.name.to_lowercase().contains(&needle))
            .filter(|item| options.matches_mime(&item.mime_type))
            .take(options.effective_limit())
            .collect())
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        let (blobs, _) = self.list_all(&self.prefix, false).await?;
        Ok(Quota::unlimited(
            blobs.iter().map(|b| b.properties.content_length).sum(),
        ))
    }

    async fn get_thumbnail(
        &self,
        id: &str,
        _size: ThumbnailSize,
    ) -> Result<Option<Bytes>, StorageError> {
        self.stat(&self.full_key(id)?).await?;
        Ok(None)
    }
}

fn is_marker(name: &str) -> bool {
    name.rsplit('/').next() == Some(FOLDER_MARKER)
}

fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// SharedKey string-to-sign for the blob service.
fn string_to_sign(
    method: &str,
    content_length: usize,
    headers: &[(&str, String)],
    canonical_resource: &str,
    query: &[(String, String)],
) -> String {
    let standard = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    };
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut ms_headers: Vec<(String, &str)> = headers
        .iter()
        .filter(|(k, _)| k.to_ascii_lowercase().starts_with("x-ms-"))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .collect();
    ms_headers.sort();
    let canonical_headers: String = ms_headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();

    let mut params: Vec<(String, &str)> = query
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    params.sort();
    let mut resource = canonical_resource.to_string();
    for (k, v) in params {
        resource.push_str(&format!("\n{k}:{v}"));
    }

    format!(
        "{method}\n{}\n{}\n{length}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{canonical_headers}{resource}",
        standard("content-encoding"),
        standard("content-language"),
        standard("content-md5"),
        standard("content-type"),
        standard("date"),
        standard("if-modified-since"),
        standard("if-match"),
        standard("if-none-match"),
        standard("if-unmodified-since"),
        standard("range"),
    )
}
