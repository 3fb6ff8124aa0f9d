mod azure;
mod batch;
mod dropbox;
mod google_drive;
mod http;
mod local;
mod oauth;
mod onedrive;
mod s3;
mod types;
mod upload;

pub use azure::{AzureBlobProvider, AzureSettings};
pub use batch::DEFAULT_BATCH_CONCURRENCY;
pub use dropbox::DropboxProvider;
pub use google_drive::GoogleDriveProvider;
pub use http::HttpSettings;
pub use local::LocalProvider;
pub use oauth::OAuthSettings;
pub use onedrive::OneDriveProvider;
pub use s3::{S3Provider, S3Settings};
pub use types::*;
pub use upload::UploadLimits;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Error taxonomy shared by every adapter. Backend context travels as text so
/// one result can be handed to several waiters.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Provider not configured: {0}")]
    UnconfiguredProvider(ProviderKind),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Transient backend error: {0}")]
    Transient(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
    #[error("Batch partially failed: {} of {} items failed", .0.failed.len(), .0.total())]
    PartialBatchFailure(BatchReport),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },
    #[error("Credential store error: {0}")]
    Store(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl StorageError {
    pub fn is_auth(&self) -> bool {
        matches!(self, StorageError::Auth(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Stable machine-readable name of the variant.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Auth(_) => "auth",
            StorageError::UnconfiguredProvider(_) => "unconfigured_provider",
            StorageError::NotFound(_) => "not_found",
            StorageError::Conflict(_) => "conflict",
            StorageError::QuotaExceeded(_) => "quota_exceeded",
            StorageError::Transient(_) => "transient",
            StorageError::Timeout(_) => "timeout",
            StorageError::Cancelled(_) => "cancelled",
            StorageError::PartialBatchFailure(_) => "partial_batch_failure",
            StorageError::Unsupported(_) => "unsupported",
            StorageError::InvalidArgument(_) => "invalid_argument",
            StorageError::Backend { .. } => "backend",
            StorageError::Store(_) => "store",
            StorageError::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => StorageError::Conflict(e.to_string()),
            _ => StorageError::Io(e.to_string()),
        }
    }
}

/// The operation set every backend implements.
///
/// Adapters are bound to one user's credentials through [`authenticate`] and
/// are cheap to construct; the manager builds a fresh one per resolution.
///
/// [`authenticate`]: StorageProvider::authenticate
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Bind credentials into this instance. Idempotent.
    async fn authenticate(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Exchange the bound refresh token for a new access token and rebind.
    async fn refresh_access_token(&self) -> Result<TokenSet, StorageError>;

    /// OAuth consent URL for this backend, if it uses OAuth.
    fn authorization_url(&self, _state: &str) -> Option<String> {
        None
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenSet, StorageError> {
        Err(StorageError::Unsupported(format!(
            "{} does not use OAuth authorization codes",
            self.kind()
        )))
    }

    async fn upload_file(
        &self,
        data: Bytes,
        options: UploadOptions,
    ) -> Result<StorageItem, StorageError>;

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError>;

    async fn delete_file(&self, id: &str) -> Result<(), StorageError>;

    async fn get_file(&self, id: &str) -> Result<StorageItem, StorageError>;

    async fn list_files(
        &self,
        folder_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Listing, StorageError>;

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<StorageFolder, StorageError>;

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError>;

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError>;

    /// Move a file; `None` targets the root. The returned item may carry a new id.
    async fn move_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError>;

    async fn copy_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError>;

    async fn create_share_link(
        &self,
        id: &str,
        options: ShareOptions,
    ) -> Result<ShareLink, StorageError>;

    async fn revoke_share_link(&self, id: &str, share_id: &str) -> Result<(), StorageError>;

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError>;

    async fn get_quota(&self) -> Result<Quota, StorageError>;

    /// `Ok(None)` when the backend has no thumbnail for the item.
    async fn get_thumbnail(
        &self,
        id: &str,
        size: ThumbnailSize,
    ) -> Result<Option<Bytes>, StorageError>;

    async fn batch_delete(&self, ids: &[String]) -> Result<BatchReport, StorageError> {
        batch::run(ids, DEFAULT_BATCH_CONCURRENCY, |id| async move {
            self.delete_file(&id).await
        })
        .await
    }

    async fn batch_move(
        &self,
        ids: &[String],
        target_folder_id: Option<&str>,
    ) -> Result<BatchReport, StorageError> {
        batch::run(ids, DEFAULT_BATCH_CONCURRENCY, |id| async move {
            self.move_file(&id, target_folder_id).await
        })
        .await
    }

    async fn batch_copy(
        &self,
        ids: &[String],
        target_folder_id: Option<&str>,
    ) -> Result<BatchReport, StorageError> {
        batch::run(ids, DEFAULT_BATCH_CONCURRENCY, |id| async move {
            self.copy_file(&id, target_folder_id).await
        })
        .await
    }
}

/// Split a display name into stem and extension (`"a.tar.gz"` → `("a.tar", ".gz")`).
pub(crate) fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Candidate name for the `n`th collision: `report (2).pdf`.
pub(crate) fn renamed(name: &str, n: u32) -> String {
    let (stem, ext) = split_extension(name);
    format!("{stem} ({n}){ext}")
}

pub(crate) fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// Reject names that would escape or nest inside the target folder.
pub(crate) fn validate_name(name: &str) -> Result<(), StorageError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(StorageError::InvalidArgument(format!("invalid name '{name}'")));
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(StorageError::InvalidArgument(format!(
            "name '{name}' must not contain path separators"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renamed_keeps_extension() {
        assert_eq!(renamed("report.pdf", 1), "report (1).pdf");
        assert_eq!(renamed("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(renamed("README", 3), "README (3)");
        assert_eq!(renamed(".env", 1), ".env (1)");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("notes.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_io_error_translation() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(StorageError::from(missing).is_not_found());

        let exists = std::io::Error::new(std::io::ErrorKind::AlreadyExists, "dup");
        assert!(matches!(StorageError::from(exists), StorageError::Conflict(_)));
    }
}
