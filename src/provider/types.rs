use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::StorageError;

/// The closed set of backends compiled into this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "azure-blob")]
    AzureBlob,
    #[serde(rename = "google-drive")]
    GoogleDrive,
    #[serde(rename = "onedrive")]
    OneDrive,
    #[serde(rename = "dropbox")]
    Dropbox,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::Local,
        ProviderKind::S3,
        ProviderKind::AzureBlob,
        ProviderKind::GoogleDrive,
        ProviderKind::OneDrive,
        ProviderKind::Dropbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::S3 => "s3",
            ProviderKind::AzureBlob => "azure-blob",
            ProviderKind::GoogleDrive => "google-drive",
            ProviderKind::OneDrive => "onedrive",
            ProviderKind::Dropbox => "dropbox",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Local => "Local Storage",
            ProviderKind::S3 => "Amazon S3",
            ProviderKind::AzureBlob => "Azure Blob Storage",
            ProviderKind::GoogleDrive => "Google Drive",
            ProviderKind::OneDrive => "OneDrive",
            ProviderKind::Dropbox => "Dropbox",
        }
    }

    /// Whether registrations of this kind carry expiring OAuth tokens.
    pub fn uses_oauth(&self) -> bool {
        matches!(
            self,
            ProviderKind::GoogleDrive | ProviderKind::OneDrive | ProviderKind::Dropbox
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| StorageError::InvalidArgument(format!("unknown provider '{s}'")))
    }
}

/// A file as reported by a backend. `id` is backend-native and opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageItem {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub path: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageFolder {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of a folder listing. `total` counts folders and files before paging.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Listing {
    pub files: Vec<StorageItem>,
    pub folders: Vec<StorageFolder>,
    pub total: u64,
}

impl Listing {
    /// Page over folders-then-files, the order every adapter reports in.
    pub fn paged(
        folders: Vec<StorageFolder>,
        files: Vec<StorageItem>,
        limit: u32,
        offset: u32,
    ) -> Self {
        let total = (folders.len() + files.len()) as u64;
        let offset = offset as usize;
        let limit = limit as usize;

        let folder_count = folders.len();
        let folders: Vec<StorageFolder> = folders.into_iter().skip(offset).take(limit).collect();
        let remaining = limit - folders.len();
        let files: Vec<StorageItem> = files
            .into_iter()
            .skip(offset.saturating_sub(folder_count))
            .take(remaining)
            .collect();

        Self {
            files,
            folders,
            total,
        }
    }
}

/// Point-in-time usage snapshot. Backends without a hard limit report
/// [`Quota::UNLIMITED`] for `total` and `available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl Quota {
    pub const UNLIMITED: u64 = u64::MAX;

    pub fn limited(total: u64, used: u64) -> Self {
        Self {
            total,
            used,
            available: total.saturating_sub(used),
        }
    }

    pub fn unlimited(used: u64) -> Self {
        Self {
            total: Self::UNLIMITED,
            used,
            available: Self::UNLIMITED,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.total == Self::UNLIMITED
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self::unlimited(0)
    }
}

/// Byte range with inclusive bounds; `end: None` reads to the end of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Parse a single-range HTTP `Range` header value (`bytes=0-99`, `bytes=100-`).
    pub fn parse_header(value: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidArgument(format!("invalid range '{value}'"));
        let range_spec = value.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        let (start, end) = range_spec.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse::<u64>().map_err(|_| invalid())?),
        };
        if matches!(end, Some(e) if e < start) {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }

    /// Clamp against an object length, returning the inclusive `(start, end)`.
    pub fn resolve(&self, len: u64) -> Result<(u64, u64), StorageError> {
        if len == 0 || self.start >= len {
            return Err(StorageError::InvalidArgument(format!(
                "range start {} beyond object length {len}",
                self.start
            )));
        }
        let end = self.end.map(|e| e.min(len - 1)).unwrap_or(len - 1);
        Ok((self.start, end))
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Parameters for [`StorageProvider::upload_file`](super::StorageProvider::upload_file).
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub folder_id: Option<String>,
    pub overwrite: bool,
    /// Checked between chunks of a chunked upload.
    pub cancel: Option<CancellationToken>,
}

impl UploadOptions {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            size,
            folder_id: None,
            overwrite: false,
            cancel: None,
        }
    }

    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShareOptions {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub allow_edit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareLink {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl SearchOptions {
    pub const DEFAULT_LIMIT: u32 = 50;

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).max(1) as usize
    }

    /// Whether `mime_type` passes the optional filter. A filter ending in `/`
    /// or `/*` matches the whole primary type.
    pub fn matches_mime(&self, mime_type: &str) -> bool {
        match self.mime_type.as_deref() {
            None => true,
            Some(filter) => {
                let prefix = filter.trim_end_matches('*');
                if prefix.ends_with('/') {
                    mime_type.starts_with(prefix)
                } else {
                    mime_type.eq_ignore_ascii_case(filter)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl ThumbnailSize {
    pub fn pixels(&self) -> u32 {
        match self {
            ThumbnailSize::Small => 96,
            ThumbnailSize::Medium => 176,
            ThumbnailSize::Large => 800,
        }
    }
}

/// Credentials produced by a code exchange or a refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a batch operation. Successes are never rolled back.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub id: String,
    pub error: StorageError,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }
}
