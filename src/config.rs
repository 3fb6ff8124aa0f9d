use std::time::Duration;

use thiserror::Error;

use crate::provider::{AzureSettings, OAuthSettings, ProviderKind, S3Settings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub local: LocalConfig,
    pub providers: ProvidersConfig,
    /// Deadline applied to every outbound backend call.
    pub request_timeout: Duration,
    /// Tokens expiring within this window are refreshed before use.
    pub token_refresh_skew: Duration,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Root directory of the local backend
    pub storage_path: String,
    pub quota_bytes: u64,
    /// Base for the share URLs the local backend hands out
    pub public_base_url: String,
}

/// Per-kind deployment credentials. `None` means the kind is unconfigured.
#[derive(Debug, Clone, Default)]
pub struct ProvidersConfig {
    pub s3: Option<S3Settings>,
    pub azure: Option<AzureSettings>,
    pub google_drive: Option<OAuthSettings>,
    pub onedrive: Option<OAuthSettings>,
    pub dropbox: Option<OAuthSettings>,
}

impl ProvidersConfig {
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Local => true,
            ProviderKind::S3 => self.s3.is_some(),
            ProviderKind::AzureBlob => self.azure.is_some(),
            ProviderKind::GoogleDrive => self.google_drive.is_some(),
            ProviderKind::OneDrive => self.onedrive.is_some(),
            ProviderKind::Dropbox => self.dropbox.is_some(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            storage_path: "./files".to_string(),
            quota_bytes: 10 * 1024 * 1024 * 1024,
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            local: LocalConfig::default(),
            providers: ProvidersConfig::default(),
            request_timeout: Duration::from_secs(30),
            token_refresh_skew: Duration::from_secs(60),
            test_mode: false,
            max_upload_size: 512 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Config::default();

        let server = ServerConfig {
            bind_address: var("BIND_ADDRESS").unwrap_or(defaults.server.bind_address),
            data_dir: var("DATA_DIR").unwrap_or(defaults.server.data_dir),
        };

        let local = LocalConfig {
            storage_path: var("LOCAL_STORAGE_PATH").unwrap_or(defaults.local.storage_path),
            quota_bytes: parse_number(&var, "LOCAL_QUOTA_BYTES")?
                .unwrap_or(defaults.local.quota_bytes),
            public_base_url: var("PUBLIC_BASE_URL").unwrap_or(defaults.local.public_base_url),
        };

        let request_timeout = parse_number(&var, "REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        let token_refresh_skew = parse_number(&var, "TOKEN_REFRESH_SKEW_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.token_refresh_skew);

        let test_mode = var("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_upload_size =
            parse_number(&var, "MAX_UPLOAD_SIZE")?.unwrap_or(defaults.max_upload_size);

        let s3 = group(
            &var,
            "S3",
            &["S3_BUCKET", "S3_ACCESS_KEY_ID", "S3_SECRET_ACCESS_KEY"],
        )?
        .map(|v| S3Settings {
            bucket: v[0].clone(),
            access_key_id: v[1].clone(),
            secret_access_key: v[2].clone(),
            region: var("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: var("S3_ENDPOINT"),
        });

        let azure = group(
            &var,
            "Azure Blob",
            &["AZURE_STORAGE_ACCOUNT", "AZURE_STORAGE_KEY", "AZURE_CONTAINER"],
        )?
        .map(|v| AzureSettings {
            account: v[0].clone(),
            access_key: v[1].clone(),
            container: v[2].clone(),
            endpoint: var("AZURE_ENDPOINT"),
        });

        let oauth = |name: &str, vars: &[&str]| -> Result<Option<OAuthSettings>, ConfigError> {
            Ok(group(&var, name, vars)?.map(|v| OAuthSettings {
                client_id: v[0].clone(),
                client_secret: v[1].clone(),
                redirect_uri: v[2].clone(),
            }))
        };

        let providers = ProvidersConfig {
            s3,
            azure,
            google_drive: oauth(
                "Google Drive",
                &["GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET", "GOOGLE_REDIRECT_URI"],
            )?,
            onedrive: oauth(
                "OneDrive",
                &[
                    "ONEDRIVE_CLIENT_ID",
                    "ONEDRIVE_CLIENT_SECRET",
                    "ONEDRIVE_REDIRECT_URI",
                ],
            )?,
            dropbox: oauth(
                "Dropbox",
                &["DROPBOX_APP_KEY", "DROPBOX_APP_SECRET", "DROPBOX_REDIRECT_URI"],
            )?,
        };

        let config = Config {
            server,
            local,
            providers,
            request_timeout,
            token_refresh_skew,
            test_mode,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "REQUEST_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        if !self.local.public_base_url.starts_with("http://")
            && !self.local.public_base_url.starts_with("https://")
        {
            return Err(ConfigError::ValidationError(format!(
                "PUBLIC_BASE_URL must be an http(s) URL, got '{}'",
                self.local.public_base_url
            )));
        }

        if self.test_mode {
            tracing::warn!("TEST_MODE is enabled; the purge endpoint is reachable");
        }

        Ok(())
    }

    /// Provider kinds with complete deployment credentials, local included.
    pub fn configured_kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.providers.is_configured(*kind))
            .collect()
    }
}

fn parse_number<F>(var: &F, name: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| {
            v.parse::<u64>().map_err(|_| {
                ConfigError::ValidationError(format!("{name} must be a number, got '{v}'"))
            })
        })
        .transpose()
}

/// All-or-nothing read of one provider's required variables.
fn group<F>(var: &F, provider: &str, names: &[&str]) -> Result<Option<Vec<String>>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let values: Vec<Option<String>> = names.iter().map(|name| var(name)).collect();
    if values.iter().all(Option::is_none) {
        return Ok(None);
    }

    let missing: Vec<&str> = names
        .iter()
        .zip(&values)
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{provider} is partially configured; missing {}",
            missing.join(", ")
        )));
    }

    Ok(Some(values.into_iter().flatten().collect()))
}
