use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, pbkdf2};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;

use super::{
    guess_mime, renamed, validate_name, ByteRange, Listing, ProviderKind, Quota, SearchOptions,
    ShareLink, ShareOptions, StorageError, StorageFolder, StorageItem, StorageProvider,
    ThumbnailSize, TokenSet, UploadOptions,
};

const STAGING_DIR: &str = ".staging";
const SHARES_DIR: &str = ".shares";
const USERS_DIR: &str = "users";
const MAX_RENAME_ATTEMPTS: u32 = 1000;
const PBKDF2_ITERATIONS: u32 = 100_000;
const PASSWORD_SALT_LEN: usize = 16;

/// Local filesystem backend. One real file per item under
/// `<base>/users/<user>/`; ids are slash-separated paths relative to that root.
///
/// Uploads are staged under `<base>/.staging` and linked into place, so a
/// failed write is never visible to listings. Range reads seek natively.
pub struct LocalProvider {
    base_path: PathBuf,
    root: PathBuf,
    quota_bytes: u64,
    public_base_url: String,
    access_token: RwLock<Option<String>>,
}

/// Persisted state of a local share link, one JSON file per token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShareRecord {
    token: String,
    owner_dir: String,
    file_id: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    password_salt: Option<String>,
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    allow_edit: bool,
}

impl LocalProvider {
    pub fn new<P: AsRef<Path>>(
        base_path: P,
        user_id: &str,
        quota_bytes: u64,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        if user_id.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "user id must not be empty".to_string(),
            ));
        }
        let owner = owner_dir(user_id);
        if owner == "." || owner == ".." {
            return Err(StorageError::InvalidArgument(format!(
                "invalid user id '{user_id}'"
            )));
        }
        let base_path = base_path.as_ref().to_path_buf();
        let root = base_path.join(USERS_DIR).join(owner);
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(base_path.join(STAGING_DIR))?;
        std::fs::create_dir_all(base_path.join(SHARES_DIR))?;

        Ok(Self {
            base_path,
            root,
            quota_bytes,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
        })
    }

    /// Resolve a share token to its file for anonymous serving. Expired links
    /// are removed and reported as not found.
    pub async fn open_share<P: AsRef<Path>>(
        base_path: P,
        token: &str,
        password: Option<&str>,
    ) -> Result<(StorageItem, Bytes), StorageError> {
        let base_path = base_path.as_ref();
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StorageError::NotFound("share link".to_string()));
        }
        let record_path = base_path.join(SHARES_DIR).join(format!("{token}.json"));
        let record: ShareRecord = match tokio::fs::read(&record_path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StorageError::Io(format!("corrupt share record: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound("share link".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if record.expires_at.is_some_and(|at| at <= Utc::now()) {
            let _ = tokio::fs::remove_file(&record_path).await;
            return Err(StorageError::NotFound("share link expired".to_string()));
        }

        if let Some(ref expected) = record.password_hash {
            let salt = record.password_salt.as_deref().unwrap_or_default();
            if !password.is_some_and(|p| verify_password(salt, expected, p)) {
                return Err(StorageError::Auth("invalid_share_password".to_string()));
            }
        }

        let provider = Self {
            base_path: base_path.to_path_buf(),
            root: base_path.join(USERS_DIR).join(&record.owner_dir),
            quota_bytes: 0,
            public_base_url: String::new(),
            access_token: RwLock::new(None),
        };
        let item = provider.get_file(&record.file_id).await?;
        let data = provider.download_file(&record.file_id, None).await?;
        Ok((item, data))
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for segment in id.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." || segment.contains('\\') {
                return Err(StorageError::InvalidArgument(format!("invalid id '{id}'")));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn relative_id(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn parent_id(&self, path: &Path) -> Option<String> {
        path.parent()
            .map(|p| self.relative_id(p))
            .filter(|id| !id.is_empty())
    }

    async fn folder_path(&self, folder_id: Option<&str>) -> Result<PathBuf, StorageError> {
        let path = self.resolve(folder_id.unwrap_or(""))?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(StorageError::InvalidArgument(format!(
                "'{}' is not a folder",
                folder_id.unwrap_or_default()
            ))),
            Err(_) => Err(StorageError::NotFound(format!(
                "folder '{}'",
                folder_id.unwrap_or_default()
            ))),
        }
    }

    async fn file_path(&self, id: &str) -> Result<(PathBuf, std::fs::Metadata), StorageError> {
        let path = self.resolve(id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok((path, meta)),
            _ => Err(StorageError::NotFound(format!("file '{id}'"))),
        }
    }

    fn item_from(&self, path: &Path, meta: &std::fs::Metadata) -> StorageItem {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = self.relative_id(path);
        let updated_at: DateTime<Utc> = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
        let created_at: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(updated_at);
        StorageItem {
            mime_type: guess_mime(&name),
            path: format!("/{id}"),
            id,
            name,
            size: meta.len(),
            url: None,
            thumbnail_url: None,
            created_at,
            updated_at,
        }
    }

    fn folder_from(&self, path: &Path, meta: &std::fs::Metadata) -> StorageFolder {
        let id = self.relative_id(path);
        let updated_at: DateTime<Utc> = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
        let created_at: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(updated_at);
        StorageFolder {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: format!("/{id}"),
            parent_id: self.parent_id(path),
            id,
            created_at,
            updated_at,
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.base_path
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Hard-link `source` into `dir` under the first free variant of `name`.
    /// Linking fails on an existing target, so concurrent writers never clobber.
    async fn link_free_name(
        &self,
        source: &Path,
        dir: &Path,
        name: &str,
    ) -> Result<PathBuf, StorageError> {
        for attempt in 0..MAX_RENAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                dir.join(name)
            } else {
                dir.join(renamed(name, attempt))
            };
            match tokio::fs::hard_link(source, &candidate).await {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorageError::Conflict(format!(
            "no free name for '{name}' after {MAX_RENAME_ATTEMPTS} attempts"
        )))
    }

    /// Move a staged file into `dir`, auto-renaming on collision unless
    /// `overwrite` is set. The staged file is consumed either way.
    async fn place(
        &self,
        staged: &Path,
        dir: &Path,
        name: &str,
        overwrite: bool,
    ) -> Result<PathBuf, StorageError> {
        let placed = if overwrite {
            let target = dir.join(name);
            if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
                Err(StorageError::Conflict(format!("'{name}' is a folder")))
            } else {
                tokio::fs::rename(staged, &target)
                    .await
                    .map(|_| target)
                    .map_err(StorageError::from)
            }
        } else {
            self.link_free_name(staged, dir, name).await
        };

        let _ = tokio::fs::remove_file(staged).await;
        placed
    }

    /// Every file under `dir`, depth-first.
    async fn walk_files(
        &self,
        dir: &Path,
    ) -> Result<Vec<(PathBuf, std::fs::Metadata)>, StorageError> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.is_file() {
                    files.push((entry.path(), meta));
                }
            }
        }
        Ok(files)
    }

    async fn used_bytes(&self) -> Result<u64, StorageError> {
        Ok(self
            .walk_files(&self.root)
            .await?
            .iter()
            .map(|(_, meta)| meta.len())
            .sum())
    }

    fn share_record_path(&self, token: &str) -> PathBuf {
        self.base_path.join(SHARES_DIR).join(format!("{token}.json"))
    }

    fn owner_dir_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn authenticate(
        &self,
        access_token: &str,
        _refresh_token: Option<&str>,
    ) -> Result<(), StorageError> {
        if access_token.is_empty() {
            return Err(StorageError::Auth("empty_access_token".to_string()));
        }
        *self.access_token.write().await = Some(access_token.to_string());
        Ok(())
    }

    /// Local storage never expires credentials; refresh echoes the bound token.
    async fn refresh_access_token(&self) -> Result<TokenSet, StorageError> {
        let token = self.access_token.read().await.clone().unwrap_or_default();
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
        let dir = self.folder_path(options.folder_id.as_deref()).await?;

        let used = self.used_bytes().await?;
        if used.saturating_add(data.len() as u64) > self.quota_bytes {
            return Err(StorageError::QuotaExceeded(format!(
                "upload of {} bytes exceeds local quota ({used} of {} used)",
                data.len(),
                self.quota_bytes
            )));
        }

        let staged = self.staging_path();
        if let Err(e) = tokio::fs::write(&staged, &data).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }

        let target = self
            .place(&staged, &dir, options.file_name.trim(), options.overwrite)
            .await?;
        let meta = tokio::fs::metadata(&target).await?;
        let mut item = self.item_from(&target, &meta);
        if options.mime_type != "application/octet-stream" && !options.mime_type.is_empty() {
            item.mime_type = options.mime_type;
        }

        tracing::debug!(file_id = %item.id, bytes = item.size, "Stored local file");
        Ok(item)
    }

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        let (path, meta) = self.file_path(id).await?;
        let Some(range) = range else {
            return Ok(Bytes::from(tokio::fs::read(&path).await?));
        };

        let (start, end) = range.resolve(meta.len())?;
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start + 1) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let (path, _) = self.file_path(id).await?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<StorageItem, StorageError> {
        let (path, meta) = self.file_path(id).await?;
        Ok(self.item_from(&path, &meta))
    }

    async fn list_files(
        &self,
        folder_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Listing, StorageError> {
        let dir = self.folder_path(folder_id).await?;
        let mut folders = Vec::new();
        let mut files = Vec::new();

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                folders.push(self.folder_from(&entry.path(), &meta));
            } else if meta.is_file() {
                files.push(self.item_from(&entry.path(), &meta));
            }
        }
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Listing::paged(folders, files, limit, offset))
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<StorageFolder, StorageError> {
        validate_name(name)?;
        let parent = self.folder_path(parent_id).await?;
        let path = parent.join(name.trim());
        tokio::fs::create_dir(&path).await?;
        let meta = tokio::fs::metadata(&path).await?;
        Ok(self.folder_from(&path, &meta))
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        if id.trim_matches('/').is_empty() {
            return Err(StorageError::InvalidArgument(
                "the root folder cannot be deleted".to_string(),
            ));
        }
        let path = self.folder_path(Some(id)).await?;
        tokio::fs::remove_dir_all(&path).await?;
        Ok(())
    }

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError> {
        let path = self.folder_path(Some(id)).await?;
        let meta = tokio::fs::metadata(&path).await?;
        Ok(self.folder_from(&path, &meta))
    }

    async fn move_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let (source, meta) = self.file_path(id).await?;
        let dir = self.folder_path(target_folder_id).await?;
        if source.parent() == Some(dir.as_path()) {
            return Ok(self.item_from(&source, &meta));
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let target = self.link_free_name(&source, &dir, &name).await?;
        tokio::fs::remove_file(&source).await?;
        let meta = tokio::fs::metadata(&target).await?;
        Ok(self.item_from(&target, &meta))
    }

    async fn copy_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        let (source, meta) = self.file_path(id).await?;
        let dir = self.folder_path(target_folder_id).await?;

        let used = self.used_bytes().await?;
        if used.saturating_add(meta.len()) > self.quota_bytes {
            return Err(StorageError::QuotaExceeded(format!(
                "copy of {} bytes exceeds local quota",
                meta.len()
            )));
        }

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staged = self.staging_path();
        tokio::fs::copy(&source, &staged).await?;
        let target = self.place(&staged, &dir, &name, false).await?;
        let meta = tokio::fs::metadata(&target).await?;
        Ok(self.item_from(&target, &meta))
    }

    async fn create_share_link(
        &self,
        id: &str,
        options: ShareOptions,
    ) -> Result<ShareLink, StorageError> {
        let item = self.get_file(id).await?;
        if options.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(StorageError::InvalidArgument(
                "share link expiry must be in the future".to_string(),
            ));
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let (password_salt, password_hash) = match options.password.as_deref() {
            Some(password) => {
                let (salt, hash) = hash_password(password)?;
                (Some(salt), Some(hash))
            }
            None => (None, None),
        };
        let record = ShareRecord {
            token: token.clone(),
            owner_dir: self.owner_dir_name(),
            file_id: item.id,
            created_at: Utc::now(),
            expires_at: options.expires_at,
            password_salt,
            password_hash,
            allow_edit: options.allow_edit,
        };
        let raw = serde_json::to_vec_pretty(&record)
            .map_err(|e| StorageError::Io(format!("failed to encode share record: {e}")))?;
        tokio::fs::write(self.share_record_path(&token), raw).await?;

        Ok(ShareLink {
            url: format!("{}/share/{token}", self.public_base_url),
            id: token,
            expires_at: options.expires_at,
        })
    }

    async fn revoke_share_link(&self, id: &str, share_id: &str) -> Result<(), StorageError> {
        if share_id.is_empty() || !share_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StorageError::NotFound(format!("share '{share_id}'")));
        }
        let path = self.share_record_path(share_id);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|_| StorageError::NotFound(format!("share '{share_id}'")))?;
        let record: ShareRecord = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Io(format!("corrupt share record: {e}")))?;

        if record.owner_dir != self.owner_dir_name() || record.file_id != id {
            return Err(StorageError::NotFound(format!("share '{share_id}'")));
        }
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError> {
        let dir = self.folder_path(options.folder_id.as_deref()).await?;
        let needle = query.trim().to_lowercase();

        let mut matches: Vec<StorageItem> = self
            .walk_files(&dir)
            .await?
            .iter()
            .map(|(path, meta)| self.item_from(path, meta))
            .filter(|item| item.name.to_lowercase().contains(&needle))
            .filter(|item| options.matches_mime(&item.mime_type))
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.truncate(options.effective_limit());
        Ok(matches)
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        Ok(Quota::limited(self.quota_bytes, self.used_bytes().await?))
    }

    async fn get_thumbnail(
        &self,
        id: &str,
        _size: ThumbnailSize,
    ) -> Result<Option<Bytes>, StorageError> {
        self.file_path(id).await?;
        Ok(None)
    }
}

/// Directory name for a user id; percent-encoding keeps it a single segment.
fn owner_dir(user_id: &str) -> String {
    urlencoding::encode(user_id.trim()).into_owned()
}

fn pbkdf2_iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

/// Salted PBKDF2 digest of a share password as hex `(salt, hash)`.
fn hash_password(password: &str) -> Result<(String, String), StorageError> {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| StorageError::Io("failed to generate share password salt".to_string()))?;
    let mut hash = [0u8; digest::SHA256_OUTPUT_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        pbkdf2_iterations(),
        &salt,
        password.as_bytes(),
        &mut hash,
    );
    Ok((hex::encode(salt), hex::encode(hash)))
}

/// Constant-time check of `supplied` against a stored salt and hash.
fn verify_password(salt: &str, hash: &str, supplied: &str) -> bool {
    let (Ok(salt), Ok(hash)) = (hex::decode(salt), hex::decode(hash)) else {
        return false;
    };
    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        pbkdf2_iterations(),
        &salt,
        supplied.as_bytes(),
        &hash,
    )
    .is_ok()
}
