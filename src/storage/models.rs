use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{ProviderKind, Quota, TokenSet};

/// The persisted binding of one user to one authenticated backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRegistration {
    pub id: String,
    pub user_id: String,
    pub provider_kind: ProviderKind,
    pub display_name: String,
    pub is_default: bool,
    pub is_active: bool,

    // Credentials
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    // Cached quota snapshot, refreshed only by an explicit sync
    pub quota_total: u64,
    pub quota_used: u64,
    pub quota_available: u64,
    #[serde(default)]
    pub quota_synced_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderRegistration {
    pub fn new(
        user_id: &str,
        provider_kind: ProviderKind,
        display_name: Option<String>,
        tokens: TokenSet,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            provider_kind,
            display_name: display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| provider_kind.display_name().to_string()),
            is_default: false,
            is_active: true,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            quota_total: 0,
            quota_used: 0,
            quota_available: 0,
            quota_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn quota(&self) -> Quota {
        Quota {
            total: self.quota_total,
            used: self.quota_used,
            available: self.quota_available,
        }
    }

    pub fn set_quota(&mut self, quota: Quota, now: DateTime<Utc>) {
        self.quota_total = quota.total;
        self.quota_used = quota.used;
        self.quota_available = quota.available;
        self.quota_synced_at = Some(now);
        self.updated_at = now;
    }

    /// Replace the credentials. A response without a refresh token keeps
    /// the stored one.
    pub fn apply_tokens(&mut self, tokens: TokenSet, now: DateTime<Utc>) {
        self.access_token = tokens.access_token;
        if tokens.refresh_token.is_some() {
            self.refresh_token = tokens.refresh_token;
        }
        self.expires_at = tokens.expires_at;
        self.updated_at = now;
    }

    /// Whether the access token expires within `skew` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now + skew)
    }
}

/// An OAuth consent flow started by one user for one backend. The `state`
/// sent to the backend is the key; the callback must present it before
/// `expires_at` and from the same user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: String,
    pub user_id: String,
    pub provider_kind: ProviderKind,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn new(user_id: &str, provider_kind: ProviderKind, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            state: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            provider_kind,
            expires_at: now + ttl,
        }
    }

    /// Whether `user_id` may complete this flow for `kind` at `now`.
    pub fn accepts(&self, user_id: &str, kind: ProviderKind, now: DateTime<Utc>) -> bool {
        self.user_id == user_id && self.provider_kind == kind && now < self.expires_at
    }
}

/// Restore the default invariant: among active registrations exactly one is
/// default when any exist. A missing default goes to the oldest active one.
pub fn normalize_default(registrations: &mut [ProviderRegistration]) {
    for r in registrations.iter_mut().filter(|r| !r.is_active) {
        r.is_default = false;
    }

    let mut active: Vec<usize> = (0..registrations.len())
        .filter(|&i| registrations[i].is_active)
        .collect();
    active.sort_by_key(|&i| registrations[i].created_at);

    let keep = active
        .iter()
        .copied()
        .find(|&i| registrations[i].is_default)
        .or_else(|| active.first().copied());

    for &i in &active {
        registrations[i].is_default = Some(i) == keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(kind: ProviderKind, minutes_ago: i64) -> ProviderRegistration {
        ProviderRegistration::new(
            "alice",
            kind,
            None,
            TokenSet {
                access_token: "token".to_string(),
                refresh_token: None,
                expires_at: None,
            },
            Utc::now() - Duration::minutes(minutes_ago),
        )
    }

    #[test]
    fn test_missing_default_goes_to_oldest_active() {
        let mut regs = vec![
            registration(ProviderKind::S3, 5),
            registration(ProviderKind::Local, 10),
            registration(ProviderKind::Dropbox, 20),
        ];
        regs[2].is_active = false;
        normalize_default(&mut regs);

        assert!(regs[1].is_default);
        assert!(!regs[0].is_default);
        assert!(!regs[2].is_default);
    }

    #[test]
    fn test_extra_defaults_are_cleared() {
        let mut regs = vec![
            registration(ProviderKind::S3, 5),
            registration(ProviderKind::Local, 10),
        ];
        regs[0].is_default = true;
        regs[1].is_default = true;
        normalize_default(&mut regs);

        assert_eq!(regs.iter().filter(|r| r.is_default).count(), 1);
        assert!(regs[1].is_default);
    }

    #[test]
    fn test_no_active_means_no_default() {
        let mut regs = vec![registration(ProviderKind::S3, 5)];
        regs[0].is_default = true;
        regs[0].is_active = false;
        normalize_default(&mut regs);
        assert!(!regs[0].is_default);
    }

    #[test]
    fn test_staleness_uses_skew() {
        let now = Utc::now();
        let mut reg = registration(ProviderKind::GoogleDrive, 0);
        assert!(!reg.is_stale(now, Duration::seconds(60)));

        reg.expires_at = Some(now + Duration::seconds(30));
        assert!(reg.is_stale(now, Duration::seconds(60)));

        reg.expires_at = Some(now + Duration::seconds(300));
        assert!(!reg.is_stale(now, Duration::seconds(60)));
    }

    #[test]
    fn test_apply_tokens_keeps_refresh_token() {
        let mut reg = registration(ProviderKind::OneDrive, 0);
        reg.refresh_token = Some("refresh".to_string());
        reg.apply_tokens(
            TokenSet {
                access_token: "new".to_string(),
                refresh_token: None,
                expires_at: None,
            },
            Utc::now(),
        );
        assert_eq!(reg.access_token, "new");
        assert_eq!(reg.refresh_token.as_deref(), Some("refresh"));
    }
}
