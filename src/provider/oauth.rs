//! Authorization-code and refresh-token plumbing shared by the OAuth backends.

use chrono::{Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::http::{self, HttpSettings};
use super::{StorageError, TokenSet};

/// Application credentials registered with an OAuth backend.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Endpoints and scope for one backend's OAuth flow.
#[derive(Debug, Clone)]
pub(crate) struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub scope: &'static str,
    /// Extra consent-URL parameters, e.g. `access_type=offline`.
    pub extra: &'static [(&'static str, &'static str)],
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
}

pub(crate) struct OAuthClient {
    settings: OAuthSettings,
    endpoints: OAuthEndpoints,
    /// Tokens bound to this adapter instance by `authenticate` or a refresh.
    tokens: RwLock<Option<TokenSet>>,
}

impl OAuthClient {
    pub fn new(settings: OAuthSettings, endpoints: OAuthEndpoints) -> Self {
        Self {
            settings,
            endpoints,
            tokens: RwLock::new(None),
        }
    }

    pub fn authorization_url(&self, state: &str) -> String {
        let mut params = vec![
            ("client_id", self.settings.client_id.as_str()),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("response_type", "code"),
            ("state", state),
        ];
        if !self.endpoints.scope.is_empty() {
            params.push(("scope", self.endpoints.scope));
        }
        params.extend(self.endpoints.extra.iter().copied());

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{query}", self.endpoints.authorize_url)
    }

    pub async fn bind(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), StorageError> {
        if access_token.trim().is_empty() {
            return Err(StorageError::Auth("empty_access_token".to_string()));
        }
        *self.tokens.write().await = Some(TokenSet {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: None,
        });
        Ok(())
    }

    pub async fn access_token(&self) -> Result<String, StorageError> {
        self.tokens
            .read()
            .await
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| StorageError::Auth("not_authenticated".to_string()))
    }

    pub async fn exchange_code(&self, http: &HttpSettings, code: &str) -> Result<TokenSet, StorageError> {
        if code.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "authorization code must not be empty".to_string(),
            ));
        }
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
        ];
        let tokens = self.token_request(http, &form, None).await?;
        *self.tokens.write().await = Some(tokens.clone());
        Ok(tokens)
    }

    /// Redeem the bound refresh token. Backends that do not rotate refresh
    /// tokens omit one from the response; the old one stays valid.
    pub async fn refresh(&self, http: &HttpSettings) -> Result<TokenSet, StorageError> {
        let refresh_token = self
            .tokens
            .read()
            .await
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| StorageError::Auth("no_refresh_token".to_string()))?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];
        let tokens = self
            .token_request(http, &form, Some(refresh_token.clone()))
            .await?;
        *self.tokens.write().await = Some(tokens.clone());
        tracing::debug!(token_url = %self.endpoints.token_url, "Refreshed access token");
        Ok(tokens)
    }

    async fn token_request(
        &self,
        http: &HttpSettings,
        form: &[(&str, &str)],
        previous_refresh: Option<String>,
    ) -> Result<TokenSet, StorageError> {
        let response = http
            .send(
                http.client.post(&self.endpoints.token_url).form(form),
                "OAuth token request",
            )
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| e.error)
                .ok()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "token_rejected".to_string());
            return Err(StorageError::Auth(reason));
        }

        let response = http::check(response, "OAuth token request").await?;
        let token: TokenResponse = http::read_json(response, "OAuth token request").await?;

        Ok(TokenSet {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or(previous_refresh),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}
