use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use ring::{digest, hmac};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::http::{self, encode_path, header_str, HttpSettings};
use super::upload::{Chunk, ChunkProtocol, UploadSession};
use super::{
    renamed, validate_name, ByteRange, Listing, ProviderKind, Quota, SearchOptions, ShareLink,
    ShareOptions, StorageError, StorageFolder, StorageItem, StorageProvider, ThumbnailSize,
    TokenSet, UploadLimits, UploadOptions,
};

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const MAX_PRESIGN_SECS: i64 = 7 * 24 * 3600;
const DEFAULT_SHARE_SECS: i64 = 3600;

/// Deployment-level S3 settings. Objects for each user live under
/// `users/<user>/` in the configured bucket.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Path-style endpoint; defaults to the regional AWS endpoint.
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Amazon S3 (and S3-compatible) backend.
///
/// Folders are prefixes with a zero-byte `name/` marker object. Payloads over
/// the threshold go through multipart upload with parts sent concurrently;
/// an incomplete multipart upload is never listed and is aborted on failure.
pub struct S3Provider {
    http: HttpSettings,
    settings: S3Settings,
    endpoint: String,
    host: String,
    prefix: String,
    signer: SigV4,
    limits: UploadLimits,
    access_token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<S3Object>,
    #[serde(default)]
    common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct S3Object {
    key: String,
    size: u64,
    last_modified: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    prefix: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

impl S3Provider {
    pub const DEFAULT_LIMITS: UploadLimits =
        UploadLimits::new(100 * 1024 * 1024, 10 * 1024 * 1024).with_parallelism(4);

    pub fn new(settings: S3Settings, http: HttpSettings, user_id: &str) -> Result<Self, StorageError> {
        if user_id.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "user id must not be empty".to_string(),
            ));
        }
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", settings.region))
            .trim_end_matches('/')
            .to_string();
        let host = host_header(&endpoint)?;

        Ok(Self {
            signer: SigV4 {
                access_key_id: settings.access_key_id.clone(),
                secret_access_key: settings.secret_access_key.clone(),
                region: settings.region.clone(),
            },
            prefix: format!("users/{}/", urlencoding::encode(user_id.trim())),
            http,
            settings,
            endpoint,
            host,
            limits: Self::DEFAULT_LIMITS,
            access_token: RwLock::new(None),
        })
    }

    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    fn object_uri(&self, key: &str) -> String {
        format!("/{}/{}", self.settings.bucket, encode_path(key))
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

    fn signed(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        headers: &[(&str, String)],
    ) -> RequestBuilder {
        let now = Utc::now();
        let uri = self.object_uri(key);
        let mut signed_headers: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        signed_headers.push(("host".to_string(), self.host.clone()));
        signed_headers.push((
            "x-amz-content-sha256".to_string(),
            UNSIGNED_PAYLOAD.to_string(),
        ));
        signed_headers.push(("x-amz-date".to_string(), amz_date(now)));

        let authorization = self.signer.authorization(
            method.as_str(),
            &uri,
            query,
            &signed_headers,
            UNSIGNED_PAYLOAD,
            now,
        );

        let query_string = canonical_query(query);
        let url = if query_string.is_empty() {
            format!("{}{uri}", self.endpoint)
        } else {
            format!("{}{uri}?{query_string}", self.endpoint)
        };

        let mut request = self
            .http
            .client
            .request(method, url)
            .header("authorization", authorization);
        for (name, value) in signed_headers.into_iter().filter(|(k, _)| k != "host") {
            request = request.header(name, value);
        }
        request
    }

    fn item_from_head(&self, key: &str, response: &Response) -> StorageItem {
        let id = self.relative(key);
        let name = id.rsplit('/').next().unwrap_or(&id).to_string();
        let updated_at = header_str(response, "last-modified")
            .and_then(http::parse_http_date)
            .unwrap_or_else(Utc::now);
        StorageItem {
            size: header_str(response, "content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            mime_type: header_str(response, "content-type")
                .unwrap_or("application/octet-stream")
                .to_string(),
            path: format!("/{id}"),
            url: None,
            thumbnail_url: None,
            created_at: updated_at,
            updated_at,
            name,
            id,
        }
    }

    fn item_from_listing(&self, object: &S3Object) -> StorageItem {
        let id = self.relative(&object.key);
        let name = id.rsplit('/').next().unwrap_or(&id).to_string();
        let updated_at = http::parse_rfc3339(&object.last_modified).unwrap_or_else(Utc::now);
        StorageItem {
            mime_type: super::guess_mime(&name),
            size: object.size,
            path: format!("/{id}"),
            url: None,
            thumbnail_url: None,
            created_at: updated_at,
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

    async fn head(&self, key: &str) -> Result<Option<Response>, StorageError> {
        let response = self
            .http
            .send(self.signed(Method::HEAD, key, &[], &[]), "S3 head object")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(http::check(response, "S3 head object").await?))
    }

    /// Every object and common prefix under `prefix`, following continuation tokens.
    async fn list_all(
        &self,
        prefix: &str,
        delimited: bool,
    ) -> Result<(Vec<S3Object>, Vec<String>), StorageError> {
        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if delimited {
                query.push(("delimiter".to_string(), "/".to_string()));
            }
            if let Some(ref token) = continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self
                .http
                .send_checked(self.signed(Method::GET, "", &query, &[]), "S3 list objects")
                .await?;
            let body = response
                .text()
                .await
                .map_err(|e| http::from_reqwest(e, "S3 list objects"))?;
            let page: ListBucketResult = http::read_xml(&body, "S3 list objects")?;

            objects.extend(page.contents);
            prefixes.extend(page.common_prefixes.into_iter().map(|p| p.prefix));

            match page.next_continuation_token {
                Some(token) if page.is_truncated => continuation = Some(token),
                _ => break,
            }
        }

        Ok((objects, prefixes))
    }

    async fn delete_key(&self, key: &str) -> Result<(), StorageError> {
        self.http
            .send_checked(self.signed(Method::DELETE, key, &[], &[]), "S3 delete object")
            .await?;
        Ok(())
    }

    /// First key in `dir` not taken by an existing object, starting with `name`.
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
        Err(StorageError::Conflict(format!("no free key for '{name}'")))
    }

    async fn server_copy(&self, source_key: &str, target_key: &str) -> Result<(), StorageError> {
        let copy_source = format!("/{}/{}", self.settings.bucket, encode_path(source_key));
        let response = self
            .http
            .send_checked(
                self.signed(
                    Method::PUT,
                    target_key,
                    &[],
                    &[("x-amz-copy-source", copy_source)],
                ),
                "S3 copy object",
            )
            .await?;
        // CopyObject can report failure inside a 200 body.
        let body = response.text().await.unwrap_or_default();
        if body.contains("<Error>") {
            return Err(StorageError::Transient(format!("S3 copy object failed: {body}")));
        }
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<StorageItem, StorageError> {
        match self.head(key).await? {
            Some(response) => Ok(self.item_from_head(key, &response)),
            None => Err(StorageError::NotFound(format!("object '{}'", self.relative(key)))),
        }
    }
}

/// Multipart upload glue: parts are `(part_number, etag)`.
struct S3Multipart<'a> {
    provider: &'a S3Provider,
    key: String,
    mime_type: String,
    overwrite: bool,
}

#[async_trait]
impl ChunkProtocol for S3Multipart<'_> {
    type Part = (usize, String);

    async fn open(&self) -> Result<String, StorageError> {
        let query = [("uploads".to_string(), String::new())];
        let response = self
            .provider
            .http
            .send_checked(
                self.provider.signed(
                    Method::POST,
                    &self.key,
                    &query,
                    &[("content-type", self.mime_type.clone())],
                ),
                "S3 create multipart upload",
            )
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| http::from_reqwest(e, "S3 create multipart upload"))?;
        let result: InitiateMultipartUploadResult =
            http::read_xml(&body, "S3 create multipart upload")?;
        Ok(result.upload_id)
    }

    async fn append(&self, session_id: &str, chunk: Chunk) -> Result<(usize, String), StorageError> {
        let part_number = chunk.index + 1;
        let query = [
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), session_id.to_string()),
        ];
        let response = self
            .provider
            .http
            .send_checked(
                self.provider
                    .signed(Method::PUT, &self.key, &query, &[])
                    .body(chunk.data),
                "S3 upload part",
            )
            .await?;
        let etag = header_str(&response, "etag")
            .ok_or_else(|| StorageError::Backend {
                status: response.status().as_u16(),
                message: format!("S3 upload part {part_number} returned no ETag"),
            })?
            .to_string();
        Ok((part_number, etag))
    }

    async fn commit(
        &self,
        session_id: &str,
        parts: Vec<(usize, String)>,
        _total: u64,
    ) -> Result<StorageItem, StorageError> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (number, etag) in &parts {
            body.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let query = [("uploadId".to_string(), session_id.to_string())];
        let mut headers = vec![("content-type", "application/xml".to_string())];
        if !self.overwrite {
            headers.push(("if-none-match", "*".to_string()));
        }
        let response = self
            .provider
            .http
            .send_checked(
                self.provider
                    .signed(Method::POST, &self.key, &query, &headers)
                    .body(body),
                "S3 complete multipart upload",
            )
            .await?;
        let text = response.text().await.unwrap_or_default();
        if text.contains("<Error>") {
            return Err(StorageError::Transient(format!(
                "S3 complete multipart upload failed: {text}"
            )));
        }
        self.provider.stat(&self.key).await
    }

    async fn abort(&self, session_id: &str) -> Result<(), StorageError> {
        let query = [("uploadId".to_string(), session_id.to_string())];
        self.provider
            .http
            .send_checked(
                self.provider.signed(Method::DELETE, &self.key, &query, &[]),
                "S3 abort multipart upload",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::S3
    }

    /// Requests are signed with the deployment keys; the registration token
    /// only has to be present.
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
        let dir = self.folder_prefix(options.folder_id.as_deref())?;
        let key = format!("{dir}{}", options.file_name.trim());

        if self.limits.is_chunked(data.len() as u64) {
            // Fail fast; completion is conditional as well.
            if !options.overwrite && self.head(&key).await?.is_some() {
                return Err(StorageError::Conflict(format!(
                    "object '{}' already exists",
                    self.relative(&key)
                )));
            }
            let protocol = S3Multipart {
                provider: self,
                key: key.clone(),
                mime_type: options.mime_type.clone(),
                overwrite: options.overwrite,
            };
            let mut session =
                UploadSession::new(ProviderKind::S3, self.relative(&key), self.limits.chunk_size);
            return session
                .run(
                    &protocol,
                    data,
                    self.limits.parallelism,
                    options.cancel.as_ref(),
                )
                .await;
        }

        let mut headers = vec![("content-type", options.mime_type.clone())];
        if !options.overwrite {
            headers.push(("if-none-match", "*".to_string()));
        }
        self.http
            .send_checked(
                self.signed(Method::PUT, &key, &[], &headers).body(data),
                "S3 put object",
            )
            .await?;
        self.stat(&key).await
    }

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        let key = self.full_key(id)?;
        let headers: Vec<(&str, String)> = range
            .map(|r| vec![("range", r.header_value())])
            .unwrap_or_default();
        let response = self
            .http
            .send(self.signed(Method::GET, &key, &[], &headers), "S3 get object")
            .await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(StorageError::InvalidArgument(format!(
                "range not satisfiable for '{id}'"
            )));
        }
        let response = http::check(response, "S3 get object").await?;
        http::read_bytes(response, "S3 get object").await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let key = self.full_key(id)?;
        self.stat(&key).await?;
        self.delete_key(&key).await
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
        let (objects, prefixes) = self.list_all(&prefix, true).await?;

        let folders = prefixes
            .iter()
            .map(|p| self.folder_from_prefix(p))
            .collect();
        let files = objects
            .iter()
            .filter(|o| o.key != prefix && !o.key.ends_with('/'))
            .map(|o| self.item_from_listing(o))
            .collect();

        Ok(Listing::paged(folders, files, limit, offset))
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<StorageFolder, StorageError> {
        validate_name(name)?;
        let marker = format!("{}{}/", self.folder_prefix(parent_id)?, name.trim());
        if self.head(&marker).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "folder '{}' already exists",
                self.relative(&marker)
            )));
        }
        self.http
            .send_checked(
                self.signed(Method::PUT, &marker, &[], &[]).body(Bytes::new()),
                "S3 create folder",
            )
            .await?;
        Ok(self.folder_from_prefix(&marker))
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        if id.trim_matches('/').is_empty() {
            return Err(StorageError::InvalidArgument(
                "the root folder cannot be deleted".to_string(),
            ));
        }
        let prefix = self.folder_prefix(Some(id))?;
        let (objects, _) = self.list_all(&prefix, false).await?;
        if objects.is_empty() {
            return Err(StorageError::NotFound(format!("folder '{id}'")));
        }
        for object in objects {
            self.delete_key(&object.key).await?;
        }
        Ok(())
    }

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError> {
        let prefix = self.folder_prefix(Some(id))?;
        if self.head(&prefix).await?.is_some() {
            return Ok(self.folder_from_prefix(&prefix));
        }
        let (objects, prefixes) = self.list_all(&prefix, true).await?;
        if objects.is_empty() && prefixes.is_empty() {
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
                "S3 presigned URLs cannot be password protected".to_string(),
            ));
        }
        if options.allow_edit {
            return Err(StorageError::Unsupported(
                "S3 share links are read-only".to_string(),
            ));
        }
        let key = self.full_key(id)?;
        self.stat(&key).await?;

        let now = Utc::now();
        let expires_secs = options
            .expires_at
            .map(|at| (at - now).num_seconds())
            .unwrap_or(DEFAULT_SHARE_SECS);
        if expires_secs <= 0 {
            return Err(StorageError::InvalidArgument(
                "share link expiry must be in the future".to_string(),
            ));
        }
        let expires_secs = expires_secs.min(MAX_PRESIGN_SECS);

        let uri = self.object_uri(&key);
        let query = self
            .signer
            .presign("GET", &uri, &self.host, expires_secs, now);
        Ok(ShareLink {
            id: uuid::Uuid::new_v4().to_string(),
            url: format!("{}{uri}?{query}", self.endpoint),
            expires_at: Some(now + Duration::seconds(expires_secs)),
        })
    }

    async fn revoke_share_link(&self, _id: &str, _share_id: &str) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(
            "S3 presigned URLs cannot be revoked before expiry".to_string(),
        ))
    }

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError> {
        let prefix = self.folder_prefix(options.folder_id.as_deref())?;
        let needle = query.trim().to_lowercase();
        let (objects, _) = self.list_all(&prefix, false).await?;

        Ok(objects
            .iter()
            .filter(|o| !o.key.ends_with('/'))
            .map(|o| self.item_from_listing(o))
            .filter(|item| item.name.to_lowercase().contains(&needle))
            .filter(|item| options.matches_mime(&item.mime_type))
            .take(options.effective_limit())
            .collect())
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        let (objects, _) = self.list_all(&self.prefix, false).await?;
        Ok(Quota::unlimited(objects.iter().map(|o| o.size).sum()))
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

// ============================================================================
// AWS Signature Version 4
// ============================================================================

struct SigV4 {
    access_key_id: String,
    secret_access_key: String,
    region: String,
}

impl SigV4 {
    fn scope(&self, now: DateTime<Utc>) -> String {
        format!("{}/{}/s3/aws4_request", now.format("%Y%m%d"), self.region)
    }

    fn signing_key(&self, now: DateTime<Utc>) -> hmac::Key {
        let date = now.format("%Y%m%d").to_string();
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            date.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hmac::Key::new(hmac::HMAC_SHA256, &k_signing)
    }

    fn signature(&self, canonical_request: &str, now: DateTime<Utc>) -> String {
        let hashed = hex::encode(digest::digest(&digest::SHA256, canonical_request.as_bytes()));
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{hashed}",
            amz_date(now),
            self.scope(now)
        );
        hex::encode(hmac::sign(&self.signing_key(now), string_to_sign.as_bytes()))
    }

    /// `Authorization` header value. Header names must already be lowercase.
    fn authorization(
        &self,
        method: &str,
        uri: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let mut headers = headers.to_vec();
        headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{method}\n{uri}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            canonical_query(query)
        );

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={signed_headers}, Signature={}",
            self.access_key_id,
            self.scope(now),
            self.signature(&canonical_request, now)
        )
    }

    /// Query string for a presigned URL signing only the host header.
    fn presign(
        &self,
        method: &str,
        uri: &str,
        host: &str,
        expires_secs: i64,
        now: DateTime<Utc>,
    ) -> String {
        let mut query = vec![
            (
                "X-Amz-Algorithm".to_string(),
                "AWS4-HMAC-SHA256".to_string(),
            ),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.access_key_id, self.scope(now)),
            ),
            ("X-Amz-Date".to_string(), amz_date(now)),
            ("X-Amz-Expires".to_string(), expires_secs.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        let canonical_request = format!(
            "{method}\n{uri}\n{}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}",
            canonical_query(&query)
        );
        query.push((
            "X-Amz-Signature".to_string(),
            self.signature(&canonical_request, now),
        ));
        canonical_query(&query)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn amz_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// `Host` header value for an endpoint URL, port included when non-default.
fn host_header(endpoint: &str) -> Result<String, StorageError> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| StorageError::InvalidArgument(format!("invalid endpoint '{endpoint}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| StorageError::InvalidArgument(format!("endpoint '{endpoint}' has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
