//! Shared test helpers for cloud-storage unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::config::{Config, LocalConfig, ServerConfig};
use crate::manager::{ProviderRegistry, StorageManager};
use crate::provider::{
    ByteRange, Listing, LocalProvider, ProviderKind, Quota, SearchOptions, ShareLink,
    ShareOptions, StorageError, StorageFolder, StorageItem, StorageProvider, ThumbnailSize,
    TokenSet, UploadOptions,
};
use crate::storage::Database;
use crate::AppState;

/// Remote-side state of a fake OAuth backend, shared by every adapter
/// instance the registry hands out.
pub struct FakeBackend {
    kind: ProviderKind,
    root: PathBuf,
    valid_token: Mutex<String>,
    refresh_delay: Duration,
    pub refresh_calls: AtomicUsize,
    pub authenticate_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(kind: ProviderKind, root: &Path, valid_token: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            root: root.to_path_buf(),
            valid_token: Mutex::new(valid_token.to_string()),
            refresh_delay: Duration::from_millis(50),
            refresh_calls: AtomicUsize::new(0),
            authenticate_calls: AtomicUsize::new(0),
        })
    }

    /// Invalidate every issued token, as a backend revoking a session would.
    pub fn revoke(&self, replacement: &str) {
        *self.valid_token.lock().unwrap() = replacement.to_string();
    }

    pub fn valid_token(&self) -> String {
        self.valid_token.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Registry factory producing adapters against this backend.
    pub fn factory(
        self: &Arc<Self>,
    ) -> impl Fn(&str) -> Result<Arc<dyn StorageProvider>, StorageError> + Send + Sync + 'static
    {
        let backend = Arc::clone(self);
        move |user_id: &str| -> Result<Arc<dyn StorageProvider>, StorageError> {
            let inner = LocalProvider::new(&backend.root, user_id, 1024 * 1024, "http://fake.test")?;
            Ok(Arc::new(FakeProvider {
                backend: Arc::clone(&backend),
                inner,
                bound: RwLock::new(None),
            }))
        }
    }
}

/// OAuth-style adapter over local disk. Every operation checks the bound
/// token against the backend's current valid token.
pub struct FakeProvider {
    backend: Arc<FakeBackend>,
    inner: LocalProvider,
    bound: RwLock<Option<(String, Option<String>)>>,
}

impl FakeProvider {
    async fn check(&self) -> Result<(), StorageError> {
        let bound = self.bound.read().await;
        match bound.as_ref() {
            Some((token, _)) if *token == self.backend.valid_token() => Ok(()),
            Some(_) => Err(StorageError::Auth("invalid_access_token".to_string())),
            None => Err(StorageError::Auth("not_authenticated".to_string())),
        }
    }

    pub async fn bound_token(&self) -> Option<String> {
        self.bound.read().await.as_ref().map(|(t, _)| t.clone())
    }
}

#[async_trait]
impl StorageProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.backend.kind
    }

    async fn authenticate(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StorageError> {
        if access_token.is_empty() {
            return Err(StorageError::Auth("empty_access_token".to_string()));
        }
        self.backend.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        *self.bound.write().await = Some((
            access_token.to_string(),
            refresh_token.map(str::to_string),
        ));
        Ok(())
    }

    async fn refresh_access_token(&self) -> Result<TokenSet, StorageError> {
        let refresh_token = self
            .bound
            .read()
            .await
            .as_ref()
            .and_then(|(_, r)| r.clone())
            .ok_or_else(|| StorageError::Auth("no_refresh_token".to_string()))?;

        let n = self.backend.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.backend.refresh_delay).await;

        let access_token = format!("access-{n}");
        self.backend.revoke(&access_token);
        *self.bound.write().await = Some((access_token.clone(), Some(refresh_token)));
        Ok(TokenSet {
            access_token,
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    fn authorization_url(&self, state: &str) -> Option<String> {
        Some(format!("https://fake.test/authorize?state={state}"))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, StorageError> {
        if code != "good-code" {
            return Err(StorageError::Auth("invalid_grant".to_string()));
        }
        Ok(TokenSet {
            access_token: self.backend.valid_token(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    async fn upload_file(
        &self,
        data: Bytes,
        options: UploadOptions,
    ) -> Result<StorageItem, StorageError> {
        self.check().await?;
        self.inner.upload_file(data, options).await
    }

    async fn download_file(
        &self,
        id: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, StorageError> {
        self.check().await?;
        self.inner.download_file(id, range).await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        self.check().await?;
        self.inner.delete_file(id).await
    }

    async fn get_file(&self, id: &str) -> Result<StorageItem, StorageError> {
        self.check().await?;
        self.inner.get_file(id).await
    }

    async fn list_files(
        &self,
        folder_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Listing, StorageError> {
        self.check().await?;
        self.inner.list_files(folder_id, limit, offset).await
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<StorageFolder, StorageError> {
        self.check().await?;
        self.inner.create_folder(name, parent_id).await
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        self.check().await?;
        self.inner.delete_folder(id).await
    }

    async fn get_folder(&self, id: &str) -> Result<StorageFolder, StorageError> {
        self.check().await?;
        self.inner.get_folder(id).await
    }

    async fn move_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        self.check().await?;
        self.inner.move_file(id, target_folder_id).await
    }

    async fn copy_file(
        &self,
        id: &str,
        target_folder_id: Option<&str>,
    ) -> Result<StorageItem, StorageError> {
        self.check().await?;
        self.inner.copy_file(id, target_folder_id).await
    }

    async fn create_share_link(
        &self,
        id: &str,
        options: ShareOptions,
    ) -> Result<ShareLink, StorageError> {
        self.check().await?;
        self.inner.create_share_link(id, options).await
    }

    async fn revoke_share_link(&self, id: &str, share_id: &str) -> Result<(), StorageError> {
        self.check().await?;
        self.inner.revoke_share_link(id, share_id).await
    }

    async fn search_files(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<StorageItem>, StorageError> {
        self.check().await?;
        self.inner.search_files(query, options).await
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        self.check().await?;
        self.inner.get_quota().await
    }

    async fn get_thumbnail(
        &self,
        id: &str,
        size: ThumbnailSize,
    ) -> Result<Option<Bytes>, StorageError> {
        self.check().await?;
        self.inner.get_thumbnail(id, size).await
    }
}

/// Config rooted in a temporary directory with only local storage configured.
pub fn test_config(temp_dir: &tempfile::TempDir) -> Config {
    Config {
        server: ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: temp_dir.path().join("data").to_string_lossy().to_string(),
        },
        local: LocalConfig {
            storage_path: temp_dir.path().join("files").to_string_lossy().to_string(),
            quota_bytes: 10 * 1024 * 1024,
            public_base_url: "http://localhost:8080".to_string(),
        },
        test_mode: true,
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
        ..Config::default()
    }
}

pub fn test_database(temp_dir: &tempfile::TempDir) -> Database {
    Database::open(temp_dir.path().join("data")).expect("Failed to open test database")
}

/// Manager over a temp database with the real local factory plus `extra`.
pub fn test_manager(
    temp_dir: &tempfile::TempDir,
    extra: impl FnOnce(ProviderRegistry) -> ProviderRegistry,
) -> (StorageManager, Database) {
    let config = test_config(temp_dir);
    let db = test_database(temp_dir);
    let registry = ProviderRegistry::from_config(&config).expect("Failed to build registry");
    let manager = StorageManager::new(extra(registry), Arc::new(db.clone()));
    (manager, db)
}

/// Create a test AppState with a temporary database and local storage.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    test_state_with(temp_dir, |registry| registry)
}

/// Like [`test_state`] with extra backends registered.
pub fn test_state_with(
    temp_dir: &tempfile::TempDir,
    extra: impl FnOnce(ProviderRegistry) -> ProviderRegistry,
) -> Arc<AppState> {
    let config = test_config(temp_dir);
    let (manager, db) = test_manager(temp_dir, extra);
    Arc::new(AppState {
        config,
        db,
        manager: Arc::new(manager),
    })
}
