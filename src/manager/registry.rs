use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::provider::{
    AzureBlobProvider, AzureSettings, DropboxProvider, GoogleDriveProvider, HttpSettings,
    LocalProvider, OAuthSettings, OneDriveProvider, ProviderKind, S3Provider, S3Settings,
    StorageError, StorageProvider,
};

type Created = Result<Arc<dyn StorageProvider>, StorageError>;

/// Builds an unauthenticated adapter for one user.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, user_id: &str) -> Created;
}

impl<F> ProviderFactory for F
where
    F: Fn(&str) -> Created + Send + Sync,
{
    fn create(&self, user_id: &str) -> Created {
        self(user_id)
    }
}

/// Kind → constructor map. A kind without a factory is unconfigured.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ProviderKind, factory: impl ProviderFactory + 'static) -> Self {
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    /// Wire every kind the deployment has credentials for.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let http = HttpSettings::new(config.request_timeout)?;

        let root = PathBuf::from(&config.local.storage_path);
        let quota = config.local.quota_bytes;
        let public_base_url = config.local.public_base_url.clone();
        let mut registry = Self::new().with(ProviderKind::Local, move |user_id: &str| -> Created {
            let provider = LocalProvider::new(&root, user_id, quota, &public_base_url)?;
            Ok(Arc::new(provider) as Arc<dyn StorageProvider>)
        });

        if let Some(settings) = config.providers.s3.clone() {
            registry = registry.with(ProviderKind::S3, s3_factory(settings, http.clone()));
        }
        if let Some(settings) = config.providers.azure.clone() {
            registry = registry.with(ProviderKind::AzureBlob, azure_factory(settings, http.clone()));
        }
        if let Some(settings) = config.providers.google_drive.clone() {
            let http = http.clone();
            registry = registry.with(ProviderKind::GoogleDrive, move |_: &str| -> Created {
                Ok(Arc::new(GoogleDriveProvider::new(settings.clone(), http.clone()))
                    as Arc<dyn StorageProvider>)
            });
        }
        if let Some(settings) = config.providers.onedrive.clone() {
            let http = http.clone();
            registry = registry.with(ProviderKind::OneDrive, move |_: &str| -> Created {
                Ok(Arc::new(OneDriveProvider::new(settings.clone(), http.clone()))
                    as Arc<dyn StorageProvider>)
            });
        }
        if let Some(settings) = config.providers.dropbox.clone() {
            registry = registry.with(ProviderKind::Dropbox, dropbox_factory(settings, http));
        }

        Ok(registry)
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn configured_kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.is_configured(*kind))
            .collect()
    }

    pub fn create(
        &self,
        kind: ProviderKind,
        user_id: &str,
    ) -> Result<Arc<dyn StorageProvider>, StorageError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or(StorageError::UnconfiguredProvider(kind))?;
        factory.create(user_id)
    }
}

fn s3_factory(settings: S3Settings, http: HttpSettings) -> impl ProviderFactory {
    move |user_id: &str| -> Created {
        let provider = S3Provider::new(settings.clone(), http.clone(), user_id)?;
        Ok(Arc::new(provider) as Arc<dyn StorageProvider>)
    }
}

fn azure_factory(settings: AzureSettings, http: HttpSettings) -> impl ProviderFactory {
    move |user_id: &str| -> Created {
        let provider = AzureBlobProvider::new(settings.clone(), http.clone(), user_id)?;
        Ok(Arc::new(provider) as Arc<dyn StorageProvider>)
    }
}

fn dropbox_factory(settings: OAuthSettings, http: HttpSettings) -> impl ProviderFactory {
    move |_: &str| -> Created {
        Ok(Arc::new(DropboxProvider::new(settings.clone(), http.clone())) as Arc<dyn StorageProvider>)
    }
}
