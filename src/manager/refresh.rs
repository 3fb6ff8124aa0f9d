use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::provider::{ProviderKind, StorageError};
use crate::storage::ProviderRegistration;

type Key = (String, ProviderKind);
type Flight = Shared<BoxFuture<'static, Result<ProviderRegistration, StorageError>>>;

/// Single-flight registry for credential refreshes, keyed by (user, kind).
///
/// The first caller for a key starts the refresh; later callers await the
/// same shared future. Entries are removed once the flight settles. If every
/// waiter is dropped first, the next caller joins and drives the stale entry.
#[derive(Clone, Default)]
pub struct RefreshFlights {
    flights: Arc<DashMap<Key, Flight>>,
}

impl RefreshFlights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight refresh for `(user_id, kind)` or start one with `start`.
    pub async fn run<F, Fut>(
        &self,
        user_id: &str,
        kind: ProviderKind,
        start: F,
    ) -> Result<ProviderRegistration, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProviderRegistration, StorageError>> + Send + 'static,
    {
        let key = (user_id.to_string(), kind);

        let flight = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(user_id, provider = %kind, "Joining in-flight token refresh");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let flight: Flight = start().boxed().shared();
                entry.insert(flight.clone());
                flight
            }
        };

        let result = flight.clone().await;
        // A newer flight may already hold the key; only ours is removed.
        self.flights
            .remove_if(&key, |_, current| current.ptr_eq(&flight));
        result
    }

    /// Number of refreshes currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::provider::TokenSet;

    fn registration(token: &str) -> ProviderRegistration {
        ProviderRegistration::new(
            "alice",
            ProviderKind::Dropbox,
            None,
            TokenSet {
                access_token: token.to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_flight() {
        let flights = RefreshFlights::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let flights = flights.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    flights
                        .run("alice", ProviderKind::Dropbox, move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(registration("fresh"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let reg = task.await.unwrap().unwrap();
            assert_eq!(reg.access_token, "fresh");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_cleared() {
        let flights = RefreshFlights::new();
        let err = flights
            .run("alice", ProviderKind::OneDrive, || async {
                Err(StorageError::Auth("invalid_grant".to_string()))
            })
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(flights.in_flight(), 0);

        let reg = flights
            .run("alice", ProviderKind::OneDrive, || async { Ok(registration("again")) })
            .await
            .unwrap();
        assert_eq!(reg.access_token, "again");
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let flights = RefreshFlights::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |user: &'static str, kind: ProviderKind| {
            let flights = flights.clone();
            let calls = Arc::clone(&calls);
            async move {
                flights
                    .run(user, kind, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(registration(user))
                    })
                    .await
            }
        };

        let (a, b, c) = tokio::join!(
            run("alice", ProviderKind::Dropbox),
            run("bob", ProviderKind::Dropbox),
            run("alice", ProviderKind::GoogleDrive),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
