use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};

use super::*;
use crate::provider::UploadOptions;
use crate::storage::CredentialStore;
use crate::testutil::{test_manager, FakeBackend};

fn tokens(access: &str, refresh: Option<&str>, expires_in: Option<Duration>) -> TokenSet {
    TokenSet {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_at: expires_in.map(|d| Utc::now() + d),
    }
}

fn default_count(manager: &StorageManager, user: &str) -> usize {
    manager
        .registrations(user)
        .unwrap()
        .iter()
        .filter(|r| r.is_default)
        .count()
}

/// Force the stored token of `user`'s `kind` registration to look expired.
fn expire(store: &dyn CredentialStore, user: &str, kind: ProviderKind) {
    store
        .update(user, &mut |registrations| {
            for r in registrations.iter_mut().filter(|r| r.provider_kind == kind) {
                r.expires_at = Some(Utc::now() - Duration::minutes(5));
            }
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn test_first_registration_becomes_default_and_survives_removal() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::S3, &temp_dir.path().join("s3"), "s3-key");
    let (manager, _db) = test_manager(&temp_dir, |r| r.with(ProviderKind::S3, backend.factory()));

    let local = manager
        .register("alice", ProviderKind::Local, tokens("local", None, None), None)
        .await
        .unwrap();
    assert!(local.is_default);
    assert_eq!(local.display_name, "Local Storage");

    let s3 = manager
        .register(
            "alice",
            ProviderKind::S3,
            tokens("s3-key", None, None),
            Some("Archive bucket".to_string()),
        )
        .await
        .unwrap();
    assert!(!s3.is_default);
    assert!(manager.registration("alice", &local.id).unwrap().is_default);
    assert_eq!(default_count(&manager, "alice"), 1);

    manager.remove("alice", &local.id).unwrap();
    let remaining = manager.registrations("alice").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, s3.id);
    assert!(remaining[0].is_default);

    let provider = manager.resolve("alice", None).await.unwrap();
    assert_eq!(provider.kind(), ProviderKind::S3);
}

#[tokio::test]
async fn test_set_default_swaps_in_one_update() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::Dropbox, &temp_dir.path().join("dbx"), "t0");
    let (manager, _db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::Dropbox, backend.factory()));

    let local = manager
        .register("alice", ProviderKind::Local, tokens("local", None, None), None)
        .await
        .unwrap();
    let dropbox = manager
        .register(
            "alice",
            ProviderKind::Dropbox,
            tokens("t0", Some("refresh"), Some(Duration::hours(1))),
            None,
        )
        .await
        .unwrap();

    let updated = manager.set_default("alice", &dropbox.id).unwrap();
    assert!(updated.is_default);
    assert!(!manager.registration("alice", &local.id).unwrap().is_default);
    assert_eq!(default_count(&manager, "alice"), 1);

    manager.remove("alice", &dropbox.id).unwrap();
    assert!(manager.registration("alice", &local.id).unwrap().is_default);

    let err = manager.set_default("alice", &dropbox.id).unwrap_err();
    assert!(err.is_not_found());
    assert!(manager.remove("alice", "missing").unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_registering_same_kind_updates_in_place() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::OneDrive, &temp_dir.path().join("od"), "t0");
    let (manager, _db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::OneDrive, backend.factory()));

    let first = manager
        .register("alice", ProviderKind::OneDrive, tokens("t0", Some("r0"), None), None)
        .await
        .unwrap();
    backend.revoke("t1");
    let second = manager
        .register("alice", ProviderKind::OneDrive, tokens("t1", None, None), None)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.access_token, "t1");
    assert_eq!(second.refresh_token.as_deref(), Some("r0"));
    assert_eq!(manager.registrations("alice").unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_refresh() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::GoogleDrive, &temp_dir.path().join("gd"), "t0");
    let (manager, db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::GoogleDrive, backend.factory()));
    let manager = Arc::new(manager);

    manager
        .register(
            "alice",
            ProviderKind::GoogleDrive,
            tokens("t0", Some("refresh"), Some(Duration::hours(1))),
            None,
        )
        .await
        .unwrap();
    expire(&db, "alice", ProviderKind::GoogleDrive);

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .execute("alice", Some(ProviderKind::GoogleDrive), |provider| async move {
                        provider.get_quota().await
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(backend.refreshes(), 1);
    assert_eq!(manager.refreshes_in_flight(), 0);

    let stored = manager.registrations("alice").unwrap();
    assert_eq!(stored[0].access_token, "access-1");
    assert_eq!(stored[0].refresh_token.as_deref(), Some("refresh"));
    assert!(!stored[0].is_stale(Utc::now(), Duration::seconds(60)));
}

#[tokio::test]
async fn test_auth_failure_refreshes_once_and_retries() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::Dropbox, &temp_dir.path().join("dbx"), "t0");
    let (manager, _db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::Dropbox, backend.factory()));

    manager
        .register(
            "alice",
            ProviderKind::Dropbox,
            tokens("t0", Some("refresh"), Some(Duration::hours(1))),
            None,
        )
        .await
        .unwrap();

    // The backend revokes the token while it still looks fresh locally.
    backend.revoke("revoked-elsewhere");

    let quota = manager
        .execute("alice", None, |provider| async move { provider.get_quota().await })
        .await
        .unwrap();
    assert_eq!(quota.used, 0);
    assert_eq!(backend.refreshes(), 1);
    assert_eq!(manager.registrations("alice").unwrap()[0].access_token, "access-1");
}

#[tokio::test]
async fn test_second_auth_failure_propagates() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::Dropbox, &temp_dir.path().join("dbx"), "t0");
    let (manager, _db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::Dropbox, backend.factory()));

    manager
        .register(
            "alice",
            ProviderKind::Dropbox,
            tokens("t0", Some("refresh"), Some(Duration::hours(1))),
            None,
        )
        .await
        .unwrap();

    let attempts = std::sync::atomic::AtomicUsize::new(0);
    let err = manager
        .execute("alice", None, |_provider| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StorageError::Auth("still_rejected".to_string())) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Auth(ref r) if r == "still_rejected"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(backend.refreshes(), 1);
}

#[tokio::test]
async fn test_quota_snapshot_changes_only_on_sync() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (manager, _db) = test_manager(&temp_dir, |r| r);

    let registration = manager
        .register("alice", ProviderKind::Local, tokens("local", None, None), None)
        .await
        .unwrap();
    assert_eq!(registration.quota_used, 0);
    assert!(registration.quota_synced_at.is_some());

    let payload = Bytes::from_static(b"twelve bytes");
    manager
        .execute("alice", None, |provider| {
            let payload = payload.clone();
            async move {
                provider
                    .upload_file(payload, UploadOptions::new("notes.txt", "text/plain", 12))
                    .await
            }
        })
        .await
        .unwrap();

    let cached = manager.registration("alice", &registration.id).unwrap();
    assert_eq!(cached.quota_used, 0);

    let live = manager.sync_quota("alice", &registration.id).await.unwrap();
    assert_eq!(live.used, 12);
    let cached = manager.registration("alice", &registration.id).unwrap();
    assert_eq!(cached.quota_used, 12);
    assert_eq!(cached.quota_available, live.available);
}

#[tokio::test]
async fn test_resolution_order_and_errors() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::OneDrive, &temp_dir.path().join("od"), "t0");
    let (manager, _db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::OneDrive, backend.factory()));

    // No registrations: the local backend serves.
    let provider = manager.resolve("bob", None).await.unwrap();
    assert_eq!(provider.kind(), ProviderKind::Local);
    let provider = manager.resolve("bob", Some(ProviderKind::Local)).await.unwrap();
    assert_eq!(provider.kind(), ProviderKind::Local);

    let err = manager.resolve("bob", Some(ProviderKind::S3)).await.err().unwrap();
    assert!(matches!(err, StorageError::UnconfiguredProvider(ProviderKind::S3)));

    let err = manager.resolve("bob", Some(ProviderKind::OneDrive)).await.err().unwrap();
    assert!(matches!(err, StorageError::Auth(ref r) if r == "not_registered"));

    let err = manager.resolve("  ", None).await.err().unwrap();
    assert!(matches!(err, StorageError::InvalidArgument(_)));

    let err = manager
        .register("bob", ProviderKind::AzureBlob, tokens("key", None, None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::UnconfiguredProvider(ProviderKind::AzureBlob)));
    assert!(manager.registrations("bob").unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_registration_is_not_persisted() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::OneDrive, &temp_dir.path().join("od"), "good");
    let (manager, _db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::OneDrive, backend.factory()));

    let err = manager
        .register("bob", ProviderKind::OneDrive, tokens("bad", None, None), None)
        .await
        .unwrap_err();
    assert!(err.is_auth());
    assert!(manager.registrations("bob").unwrap().is_empty());
}

#[tokio::test]
async fn test_list_available_and_callback() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::GoogleDrive, &temp_dir.path().join("gd"), "t0");
    let (manager, _db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::GoogleDrive, backend.factory()));

    let available = manager.list_available("alice").unwrap();
    assert_eq!(available.len(), ProviderKind::ALL.len());
    for entry in &available {
        match entry.kind {
            ProviderKind::Local => {
                assert!(entry.configured);
                assert!(entry.authorization_url.is_none());
            }
            ProviderKind::GoogleDrive => {
                assert!(entry.configured);
                assert!(entry
                    .authorization_url
                    .as_deref()
                    .unwrap()
                    .starts_with("https://fake.test/authorize?state="));
            }
            _ => {
                assert!(!entry.configured);
                assert!(entry.authorization_url.is_none());
            }
        }
    }

    let request = manager
        .start_authorization("alice", ProviderKind::GoogleDrive)
        .unwrap()
        .unwrap();
    assert!(request.url.ends_with(&request.state));
    let tokens = manager
        .handle_callback("alice", ProviderKind::GoogleDrive, "good-code", &request.state)
        .await
        .unwrap();
    assert_eq!(tokens.access_token, "t0");

    let request = manager
        .start_authorization("alice", ProviderKind::GoogleDrive)
        .unwrap()
        .unwrap();
    assert!(manager
        .handle_callback("alice", ProviderKind::GoogleDrive, "bad-code", &request.state)
        .await
        .unwrap_err()
        .is_auth());
    assert!(matches!(
        manager
            .handle_callback("alice", ProviderKind::GoogleDrive, "good-code", "")
            .await
            .unwrap_err(),
        StorageError::InvalidArgument(_)
    ));
    assert!(matches!(
        manager
            .handle_callback("alice", ProviderKind::Dropbox, "good-code", "s")
            .await
            .unwrap_err(),
        StorageError::UnconfiguredProvider(ProviderKind::Dropbox)
    ));
    assert!(manager
        .start_authorization("alice", ProviderKind::Local)
        .unwrap()
        .is_none());
    assert_eq!(backend.authenticate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_callback_requires_state_issued_to_the_caller() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(ProviderKind::GoogleDrive, &temp_dir.path().join("gd"), "t0");
    let (manager, db) =
        test_manager(&temp_dir, |r| r.with(ProviderKind::GoogleDrive, backend.factory()));
    let callback = |user: &'static str, state: String| {
        let manager = &manager;
        async move {
            manager
                .handle_callback(user, ProviderKind::GoogleDrive, "good-code", &state)
                .await
        }
    };

    // Never issued
    assert!(matches!(
        callback("alice", "forged".to_string()).await.unwrap_err(),
        StorageError::InvalidArgument(_)
    ));

    // Issued to someone else
    let mallory = manager
        .start_authorization("mallory", ProviderKind::GoogleDrive)
        .unwrap()
        .unwrap();
    assert!(matches!(
        callback("alice", mallory.state.clone()).await.unwrap_err(),
        StorageError::InvalidArgument(_)
    ));
    // and consumed by the failed attempt
    assert!(callback("mallory", mallory.state).await.is_err());

    // Single use
    let alice = manager
        .start_authorization("alice", ProviderKind::GoogleDrive)
        .unwrap()
        .unwrap();
    assert!(callback("alice", alice.state.clone()).await.is_ok());
    assert!(callback("alice", alice.state).await.is_err());

    // Expired
    let stale = PendingAuthorization::new(
        "alice",
        ProviderKind::GoogleDrive,
        Duration::seconds(-1),
        Utc::now(),
    );
    db.put_pending_authorization(&stale, Utc::now() - Duration::minutes(5))
        .unwrap();
    assert!(matches!(
        callback("alice", stale.state).await.unwrap_err(),
        StorageError::InvalidArgument(_)
    ));

    assert_eq!(backend.authenticate_calls.load(Ordering::SeqCst), 0);
    assert!(manager.registrations("alice").unwrap().is_empty());
}

#[tokio::test]
async fn test_registration_ids_are_scoped_to_their_owner() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (manager, _db) = test_manager(&temp_dir, |r| r);

    let alice = manager
        .register("alice", ProviderKind::Local, tokens("local", None, None), None)
        .await
        .unwrap();
    assert_eq!(manager.registration("alice", &alice.id).unwrap().id, alice.id);

    assert!(manager
        .registration("bob", &alice.id)
        .unwrap_err()
        .is_not_found());
    assert!(manager
        .sync_quota("bob", &alice.id)
        .await
        .unwrap_err()
        .is_not_found());

    manager.remove("alice", &alice.id).unwrap();
    assert!(manager
        .registration("alice", &alice.id)
        .unwrap_err()
        .is_not_found());
}
