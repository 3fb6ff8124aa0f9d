//! Resolution of a user's storage backend and the lifecycle of their
//! provider registrations.

mod refresh;
mod registry;
#[cfg(test)]
mod tests;

pub use refresh::RefreshFlights;
pub use registry::{ProviderFactory, ProviderRegistry};

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::provider::{ProviderKind, Quota, StorageError, StorageProvider, TokenSet};
use crate::storage::{CredentialStore, PendingAuthorization, ProviderRegistration};

/// Adapters built for the OAuth callback are not tied to any user.
const CALLBACK_USER: &str = "oauth-callback";

/// How long a consent flow may take before its state is refused.
pub const OAUTH_STATE_TTL_SECS: i64 = 600;

/// A consent URL and the state it carries.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// One compiled-in backend as reported by [`StorageManager::list_available`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAvailability {
    pub kind: ProviderKind,
    pub display_name: &'static str,
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
}

/// An authenticated adapter plus the registration it was bound from, if any.
struct Binding {
    provider: Arc<dyn StorageProvider>,
    registration: Option<ProviderRegistration>,
}

pub struct StorageManager {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn CredentialStore>,
    flights: RefreshFlights,
    refresh_skew: Duration,
}

impl StorageManager {
    pub fn new(registry: ProviderRegistry, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            flights: RefreshFlights::new(),
            refresh_skew: Duration::seconds(60),
        }
    }

    /// Refresh tokens this long before they expire.
    pub fn with_refresh_skew(mut self, skew: std::time::Duration) -> Self {
        self.refresh_skew = Duration::from_std(skew).unwrap_or(Duration::seconds(60));
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Token refreshes currently running.
    pub fn refreshes_in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Active registrations of a user, oldest first.
    pub fn registrations(&self, user_id: &str) -> Result<Vec<ProviderRegistration>, StorageError> {
        validate_user(user_id)?;
        self.store.active_registrations(user_id)
    }

    /// One active registration of `user_id`. Ids owned by other users are
    /// reported as missing.
    pub fn registration(
        &self,
        user_id: &str,
        registration_id: &str,
    ) -> Result<ProviderRegistration, StorageError> {
        validate_user(user_id)?;
        self.store
            .registration_by_id(registration_id)?
            .filter(|r| r.user_id == user_id && r.is_active)
            .ok_or_else(|| StorageError::NotFound(format!("registration {registration_id}")))
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// The authenticated adapter serving `user_id`.
    ///
    /// An explicit `kind` wins, then the user's default registration, then
    /// the local backend. Stale credentials are refreshed and persisted
    /// before the adapter is returned.
    pub async fn resolve(
        &self,
        user_id: &str,
        kind: Option<ProviderKind>,
    ) -> Result<Arc<dyn StorageProvider>, StorageError> {
        Ok(self.resolve_binding(user_id, kind).await?.provider)
    }

    /// Resolve, run `op`, and on an auth failure refresh once and retry.
    ///
    /// Only OAuth registrations are retried. A second auth failure is
    /// returned unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        user_id: &str,
        kind: Option<ProviderKind>,
        op: F,
    ) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn StorageProvider>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let binding = self.resolve_binding(user_id, kind).await?;
        self.run_bound(user_id, binding, op).await
    }

    async fn resolve_binding(
        &self,
        user_id: &str,
        kind: Option<ProviderKind>,
    ) -> Result<Binding, StorageError> {
        validate_user(user_id)?;
        let registrations = self.store.active_registrations(user_id)?;

        let registration = match kind {
            Some(kind) => {
                if !self.registry.is_configured(kind) {
                    return Err(StorageError::UnconfiguredProvider(kind));
                }
                match registrations.into_iter().find(|r| r.provider_kind == kind) {
                    Some(registration) => Some(registration),
                    None if kind == ProviderKind::Local => None,
                    None => return Err(StorageError::Auth("not_registered".to_string())),
                }
            }
            None => registrations.into_iter().find(|r| r.is_default),
        };

        match registration {
            Some(registration) => self.bind(user_id, registration).await,
            None => Ok(Binding {
                provider: self.registry.create(ProviderKind::Local, user_id)?,
                registration: None,
            }),
        }
    }

    async fn bind(
        &self,
        user_id: &str,
        mut registration: ProviderRegistration,
    ) -> Result<Binding, StorageError> {
        if registration.is_stale(Utc::now(), self.refresh_skew) {
            registration = self
                .refresh(user_id, registration.provider_kind, None)
                .await?;
        }

        let provider = self.registry.create(registration.provider_kind, user_id)?;
        provider
            .authenticate(
                &registration.access_token,
                registration.refresh_token.as_deref(),
            )
            .await?;

        Ok(Binding {
            provider,
            registration: Some(registration),
        })
    }

    async fn run_bound<T, F, Fut>(
        &self,
        user_id: &str,
        binding: Binding,
        op: F,
    ) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn StorageProvider>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let error = match op(Arc::clone(&binding.provider)).await {
            Err(e) if e.is_auth() => e,
            other => return other,
        };

        let registration = match binding.registration {
            Some(r) if r.provider_kind.uses_oauth() => r,
            _ => return Err(error),
        };

        tracing::info!(
            user_id,
            provider = %registration.provider_kind,
            error = %error,
            "Backend rejected credentials, refreshing once"
        );
        let refreshed = self
            .refresh(
                user_id,
                registration.provider_kind,
                Some(registration.access_token),
            )
            .await?;
        let retry = self.bind(user_id, refreshed).await?;
        op(retry.provider).await
    }

    /// Refresh the (user, kind) credentials through the single-flight registry.
    ///
    /// `rejected` is the access token a backend just refused. Inside the
    /// flight the stored registration is re-read: if another caller already
    /// replaced the token (or, without `rejected`, it is no longer stale) the
    /// stored one is returned without calling the backend.
    async fn refresh(
        &self,
        user_id: &str,
        kind: ProviderKind,
        rejected: Option<String>,
    ) -> Result<ProviderRegistration, StorageError> {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let skew = self.refresh_skew;
        let user = user_id.to_string();

        self.flights
            .run(user_id, kind, move || async move {
                let current = store
                    .active_registrations(&user)?
                    .into_iter()
                    .find(|r| r.provider_kind == kind)
                    .ok_or_else(|| StorageError::Auth("not_registered".to_string()))?;

                let already_fresh = match rejected {
                    Some(ref token) => current.access_token != *token,
                    None => !current.is_stale(Utc::now(), skew),
                };
                if already_fresh {
                    return Ok(current);
                }

                let provider = registry.create(kind, &user)?;
                provider
                    .authenticate(&current.access_token, current.refresh_token.as_deref())
                    .await?;
                let tokens = provider.refresh_access_token().await.map_err(|e| {
                    tracing::warn!(user_id = %user, provider = %kind, error = %e, "Token refresh failed");
                    e
                })?;

                let now = Utc::now();
                let mut refreshed = None;
                store.update(&user, &mut |registrations| {
                    if let Some(r) = registrations.iter_mut().find(|r| r.id == current.id) {
                        r.apply_tokens(tokens.clone(), now);
                        refreshed = Some(r.clone());
                    }
                    Ok(())
                })?;

                tracing::info!(user_id = %user, provider = %kind, "Refreshed access token");
                refreshed.ok_or_else(|| {
                    StorageError::NotFound(format!("registration {}", current.id))
                })
            })
            .await
    }

    // ========================================================================
    // Registration lifecycle
    // ========================================================================

    /// Authenticate, fetch the initial quota and persist the binding.
    ///
    /// Registering a kind the user already has active updates that
    /// registration in place. A user's first registration becomes default.
    pub async fn register(
        &self,
        user_id: &str,
        kind: ProviderKind,
        tokens: TokenSet,
        display_name: Option<String>,
    ) -> Result<ProviderRegistration, StorageError> {
        validate_user(user_id)?;
        let provider = self.registry.create(kind, user_id)?;
        provider
            .authenticate(&tokens.access_token, tokens.refresh_token.as_deref())
            .await?;
        let quota = provider.get_quota().await?;

        let now = Utc::now();
        let display_name = display_name.filter(|n| !n.trim().is_empty());
        let mut registration_id = String::new();
        self.store.update(user_id, &mut |registrations| {
            let index = match registrations
                .iter()
                .position(|r| r.is_active && r.provider_kind == kind)
            {
                Some(index) => {
                    let existing = &mut registrations[index];
                    existing.apply_tokens(tokens.clone(), now);
                    if let Some(ref name) = display_name {
                        existing.display_name = name.clone();
                    }
                    index
                }
                None => {
                    registrations.push(ProviderRegistration::new(
                        user_id,
                        kind,
                        display_name.clone(),
                        tokens.clone(),
                        now,
                    ));
                    registrations.len() - 1
                }
            };
            registrations[index].set_quota(quota, now);
            registration_id = registrations[index].id.clone();
            Ok(())
        })?;

        let registration = self.registration(user_id, &registration_id)?;
        tracing::info!(
            user_id,
            provider = %kind,
            registration_id = %registration.id,
            is_default = registration.is_default,
            "Registered storage provider"
        );
        Ok(registration)
    }

    /// Make `registration_id` the user's default in one store update.
    pub fn set_default(
        &self,
        user_id: &str,
        registration_id: &str,
    ) -> Result<ProviderRegistration, StorageError> {
        validate_user(user_id)?;
        let now = Utc::now();
        self.store.update(user_id, &mut |registrations| {
            if !registrations
                .iter()
                .any(|r| r.is_active && r.id == registration_id)
            {
                return Err(StorageError::NotFound(format!(
                    "registration {registration_id}"
                )));
            }
            for r in registrations.iter_mut().filter(|r| r.is_active) {
                let is_target = r.id == registration_id;
                if r.is_default != is_target {
                    r.is_default = is_target;
                    r.updated_at = now;
                }
            }
            Ok(())
        })?;

        tracing::info!(user_id, registration_id, "Changed default storage provider");
        self.registration(user_id, registration_id)
    }

    /// Soft-delete a registration. Removing the default promotes the oldest
    /// remaining active registration in the same update.
    pub fn remove(&self, user_id: &str, registration_id: &str) -> Result<(), StorageError> {
        validate_user(user_id)?;
        let now = Utc::now();
        self.store.update(user_id, &mut |registrations| {
            let target = registrations
                .iter_mut()
                .find(|r| r.is_active && r.id == registration_id)
                .ok_or_else(|| {
                    StorageError::NotFound(format!("registration {registration_id}"))
                })?;
            target.is_active = false;
            target.is_default = false;
            target.updated_at = now;
            Ok(())
        })?;

        tracing::info!(user_id, registration_id, "Removed storage provider");
        Ok(())
    }

    /// Fetch live quota from the backend and overwrite the cached snapshot.
    pub async fn sync_quota(
        &self,
        user_id: &str,
        registration_id: &str,
    ) -> Result<Quota, StorageError> {
        let registration = self.registration(user_id, registration_id)?;
        let binding = self.bind(user_id, registration).await?;
        let quota = self
            .run_bound(user_id, binding, |provider| async move {
                provider.get_quota().await
            })
            .await?;

        let now = Utc::now();
        self.store.update(user_id, &mut |registrations| {
            let target = registrations
                .iter_mut()
                .find(|r| r.id == registration_id)
                .ok_or_else(|| {
                    StorageError::NotFound(format!("registration {registration_id}"))
                })?;
            target.set_quota(quota, now);
            Ok(())
        })?;

        tracing::debug!(user_id, registration_id, used = quota.used, "Synced quota");
        Ok(quota)
    }

    // ========================================================================
    // Discovery and OAuth
    // ========================================================================

    /// Every compiled-in backend, whether it is configured, and for
    /// configured OAuth backends a consent URL whose state is bound to
    /// `user_id`.
    pub fn list_available(&self, user_id: &str) -> Result<Vec<ProviderAvailability>, StorageError> {
        validate_user(user_id)?;
        ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let configured = self.registry.is_configured(kind);
                let authorization_url = if configured {
                    self.start_authorization(user_id, kind)?.map(|a| a.url)
                } else {
                    None
                };
                Ok(ProviderAvailability {
                    kind,
                    display_name: kind.display_name(),
                    configured,
                    authorization_url,
                })
            })
            .collect()
    }

    /// Begin an OAuth consent flow for `user_id`. The returned state is
    /// persisted and must come back through
    /// [`handle_callback`](Self::handle_callback) within [`OAUTH_STATE_TTL_SECS`].
    /// `None` for backends that do not use OAuth.
    pub fn start_authorization(
        &self,
        user_id: &str,
        kind: ProviderKind,
    ) -> Result<Option<AuthorizationRequest>, StorageError> {
        validate_user(user_id)?;
        if !kind.uses_oauth() {
            return Ok(None);
        }
        let provider = self.registry.create(kind, CALLBACK_USER)?;
        let pending = PendingAuthorization::new(
            user_id,
            kind,
            Duration::seconds(OAUTH_STATE_TTL_SECS),
            Utc::now(),
        );
        let Some(url) = provider.authorization_url(&pending.state) else {
            return Ok(None);
        };
        self.store.save_authorization(&pending)?;
        tracing::debug!(user_id, provider = %kind, "Started OAuth authorization");
        Ok(Some(AuthorizationRequest {
            url,
            state: pending.state,
        }))
    }

    /// Exchange an authorization code for tokens. The state must be one
    /// issued to `user_id` for `kind` by
    /// [`start_authorization`](Self::start_authorization) and not yet used
    /// or expired. Nothing is persisted; callers follow up with
    /// [`register`](Self::register).
    pub async fn handle_callback(
        &self,
        user_id: &str,
        kind: ProviderKind,
        code: &str,
        state: &str,
    ) -> Result<TokenSet, StorageError> {
        validate_user(user_id)?;
        if state.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "OAuth state must not be empty".to_string(),
            ));
        }
        let provider = self.registry.create(kind, CALLBACK_USER)?;

        let pending = self.store.take_authorization(state)?;
        if !pending.is_some_and(|p| p.accepts(user_id, kind, Utc::now())) {
            tracing::warn!(user_id, provider = %kind, "Rejected OAuth callback with unknown state");
            return Err(StorageError::InvalidArgument(
                "OAuth state is unknown, expired or was issued to another user".to_string(),
            ));
        }

        let tokens = provider.exchange_code(code).await?;
        tracing::info!(user_id, provider = %kind, "Exchanged OAuth authorization code");
        Ok(tokens)
    }
}

fn validate_user(user_id: &str) -> Result<(), StorageError> {
    if user_id.trim().is_empty() {
        return Err(StorageError::InvalidArgument(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(())
}
