use chrono::{Duration, Utc};
use cloud_storage::provider::{ProviderKind, StorageError, TokenSet};
use cloud_storage::storage::models::ProviderRegistration;
use cloud_storage::storage::{CredentialStore, Database, PendingAuthorization};

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

fn tokens(access: &str) -> TokenSet {
    TokenSet {
        access_token: access.to_string(),
        refresh_token: Some(format!("refresh-{access}")),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    }
}

fn sample_registration(user: &str, kind: ProviderKind, age_secs: i64) -> ProviderRegistration {
    ProviderRegistration::new(
        user,
        kind,
        None,
        tokens("access"),
        Utc::now() - Duration::seconds(age_secs),
    )
}

fn insert(db: &Database, registration: ProviderRegistration) -> String {
    let id = registration.id.clone();
    let user = registration.user_id.clone();
    db.update_registrations(&user, move |regs| {
        regs.push(registration);
        Ok(())
    })
    .unwrap();
    id
}

#[test]
fn test_put_and_get_registration() {
    let (_dir, db) = test_db();
    let id = insert(&db, sample_registration("alice", ProviderKind::Dropbox, 0));

    let regs = db.get_registrations("alice").unwrap();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].id, id);
    assert_eq!(regs[0].provider_kind, ProviderKind::Dropbox);
    assert_eq!(regs[0].display_name, "Dropbox");
    assert_eq!(regs[0].refresh_token.as_deref(), Some("refresh-access"));
    assert!(regs[0].is_active);
    assert!(regs[0].is_default);

    let by_id = db.get_registration_by_id(&id).unwrap().expect("registration should exist");
    assert_eq!(by_id.user_id, "alice");
    assert!(db.get_registration_by_id("nope").unwrap().is_none());
}

#[test]
fn test_users_do_not_share_registrations() {
    let (_dir, db) = test_db();
    insert(&db, sample_registration("alice", ProviderKind::S3, 0));
    insert(&db, sample_registration("bob", ProviderKind::AzureBlob, 0));

    let alice = db.get_registrations("alice").unwrap();
    let bob = db.get_registrations("bob").unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].provider_kind, ProviderKind::AzureBlob);
    assert!(alice[0].is_default && bob[0].is_default);
    assert!(db.get_registrations("carol").unwrap().is_empty());
}

#[test]
fn test_failed_update_writes_nothing() {
    let (_dir, db) = test_db();
    let id = insert(&db, sample_registration("alice", ProviderKind::S3, 0));

    let err = db
        .update_registrations("alice", |regs| -> Result<(), StorageError> {
            regs.clear();
            regs.push(sample_registration("alice", ProviderKind::Dropbox, 0));
            Err(StorageError::Conflict("abort".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));

    let regs = db.get_registrations("alice").unwrap();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].id, id);
}

#[test]
fn test_exactly_one_default_after_updates() {
    let (_dir, db) = test_db();
    let oldest = insert(&db, sample_registration("alice", ProviderKind::S3, 30));
    let middle = insert(&db, sample_registration("alice", ProviderKind::Dropbox, 20));
    let newest = insert(&db, sample_registration("alice", ProviderKind::AzureBlob, 10));

    // Two defaults requested; the oldest flagged one wins.
    db.update_registrations("alice", |regs| {
        for r in regs.iter_mut() {
            r.is_default = r.id != oldest;
        }
        Ok(())
    })
    .unwrap();
    let defaults: Vec<String> = db
        .get_registrations("alice")
        .unwrap()
        .into_iter()
        .filter(|r| r.is_default)
        .map(|r| r.id)
        .collect();
    assert_eq!(defaults, vec![middle.clone()]);

    // Deactivating the default promotes the oldest remaining active one.
    let target = middle.clone();
    db.update_registrations("alice", move |regs| {
        for r in regs.iter_mut().filter(|r| r.id == target) {
            r.is_active = false;
        }
        Ok(())
    })
    .unwrap();
    let regs = db.get_registrations("alice").unwrap();
    let default = regs.iter().find(|r| r.is_default).expect("one default");
    assert_eq!(default.id, oldest);
    assert!(!regs.iter().find(|r| r.id == middle).unwrap().is_default);

    let active: Vec<String> = db
        .active_registrations("alice")
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(active, vec![oldest, newest]);
}

#[test]
fn test_update_through_the_trait_object() {
    let (_dir, db) = test_db();
    insert(&db, sample_registration("alice", ProviderKind::OneDrive, 0));
    let store: &dyn CredentialStore = &db;

    store
        .update("alice", &mut |regs| {
            for r in regs.iter_mut() {
                r.apply_tokens(
                    TokenSet {
                        access_token: "rotated".to_string(),
                        refresh_token: None,
                        expires_at: None,
                    },
                    Utc::now(),
                );
            }
            Ok(())
        })
        .unwrap();

    let regs = store.registrations("alice").unwrap();
    assert_eq!(regs[0].access_token, "rotated");
    // A response without a refresh token keeps the stored one.
    assert_eq!(regs[0].refresh_token.as_deref(), Some("refresh-access"));
}

#[test]
fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let db = Database::open(dir.path().join("data")).unwrap();
        insert(&db, sample_registration("alice", ProviderKind::GoogleDrive, 0))
    };

    let db = Database::open(dir.path().join("data")).unwrap();
    let found = db.get_registration_by_id(&id).unwrap().expect("persisted");
    assert_eq!(found.provider_kind, ProviderKind::GoogleDrive);
}

#[test]
fn test_purge_all() {
    let (_dir, db) = test_db();
    insert(&db, sample_registration("alice", ProviderKind::S3, 10));
    insert(&db, sample_registration("alice", ProviderKind::Dropbox, 0));
    let bob = insert(&db, sample_registration("bob", ProviderKind::AzureBlob, 0));

    let stats = db.purge_all().unwrap();
    assert_eq!(stats.users, 2);
    assert_eq!(stats.registrations, 3);

    assert!(db.get_registrations("alice").unwrap().is_empty());
    assert!(db.get_registration_by_id(&bob).unwrap().is_none());
}

#[test]
fn test_pending_authorization_is_single_use() {
    let (_dir, db) = test_db();
    let store: &dyn CredentialStore = &db;
    let pending =
        PendingAuthorization::new("alice", ProviderKind::Dropbox, Duration::minutes(10), Utc::now());
    store.save_authorization(&pending).unwrap();

    let taken = store.take_authorization(&pending.state).unwrap().unwrap();
    assert_eq!(taken, pending);
    assert!(taken.accepts("alice", ProviderKind::Dropbox, Utc::now()));
    assert!(!taken.accepts("bob", ProviderKind::Dropbox, Utc::now()));
    assert!(!taken.accepts("alice", ProviderKind::OneDrive, Utc::now()));
    assert!(!taken.accepts("alice", ProviderKind::Dropbox, Utc::now() + Duration::minutes(11)));

    assert!(store.take_authorization(&pending.state).unwrap().is_none());
}

#[test]
fn test_saving_authorization_drops_expired_ones() {
    let (_dir, db) = test_db();
    let now = Utc::now();
    let old = PendingAuthorization::new("alice", ProviderKind::GoogleDrive, Duration::minutes(10), now);
    db.put_pending_authorization(&old, now).unwrap();

    let fresh = PendingAuthorization::new("bob", ProviderKind::GoogleDrive, Duration::minutes(10), now);
    db.put_pending_authorization(&fresh, now + Duration::minutes(20))
        .unwrap();

    assert!(db.take_pending_authorization(&old.state).unwrap().is_none());
    assert!(db.take_pending_authorization(&fresh.state).unwrap().is_some());
}
