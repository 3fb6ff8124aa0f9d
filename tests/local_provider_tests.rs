use bytes::Bytes;
use chrono::{Duration, Utc};
use cloud_storage::provider::{
    ByteRange, LocalProvider, SearchOptions, ShareOptions, StorageError, StorageProvider,
    UploadOptions,
};

const QUOTA: u64 = 1024 * 1024;

fn provider(dir: &tempfile::TempDir, user: &str) -> LocalProvider {
    LocalProvider::new(dir.path(), user, QUOTA, "http://files.test").unwrap()
}

async fn upload(provider: &LocalProvider, name: &str, data: &'static [u8]) -> String {
    provider
        .upload_file(
            Bytes::from_static(data),
            UploadOptions::new(name, "text/plain", data.len() as u64),
        )
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_upload_download_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");

    let item = local
        .upload_file(
            Bytes::from("hello world"),
            UploadOptions::new("hello.txt", "text/plain", 11),
        )
        .await
        .unwrap();
    assert_eq!(item.id, "hello.txt");
    assert_eq!(item.size, 11);
    assert_eq!(item.mime_type, "text/plain");

    let data = local.download_file(&item.id, None).await.unwrap();
    assert_eq!(data, Bytes::from("hello world"));

    let range = local
        .download_file(&item.id, Some(ByteRange::new(6, None)))
        .await
        .unwrap();
    assert_eq!(range, Bytes::from("world"));

    let err = local
        .download_file(&item.id, Some(ByteRange::new(11, None)))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_name_collision_auto_renames_unless_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");

    assert_eq!(upload(&local, "report.pdf", b"v1").await, "report.pdf");
    assert_eq!(upload(&local, "report.pdf", b"v2").await, "report (1).pdf");

    let replaced = local
        .upload_file(
            Bytes::from_static(b"v3"),
            UploadOptions::new("report.pdf", "application/pdf", 2).overwrite(true),
        )
        .await
        .unwrap();
    assert_eq!(replaced.id, "report.pdf");
    assert_eq!(
        local.download_file("report.pdf", None).await.unwrap(),
        Bytes::from_static(b"v3")
    );
}

#[tokio::test]
async fn test_folders_and_listing() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");

    let docs = local.create_folder("docs", None).await.unwrap();
    assert_eq!(docs.id, "docs");
    assert!(docs.parent_id.is_none());

    let nested = local.create_folder("2024", Some(&docs.id)).await.unwrap();
    assert_eq!(nested.id, "docs/2024");
    assert_eq!(nested.parent_id.as_deref(), Some("docs"));

    local
        .upload_file(
            Bytes::from_static(b"abc"),
            UploadOptions::new("a.txt", "text/plain", 3).in_folder("docs"),
        )
        .await
        .unwrap();

    let listing = local.list_files(Some("docs"), 10, 0).await.unwrap();
    assert_eq!(listing.total, 2);
    assert_eq!(listing.folders[0].id, "docs/2024");
    assert_eq!(listing.files[0].id, "docs/a.txt");

    let err = local.create_folder("docs", None).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
    assert!(local.create_folder("../escape", None).await.is_err());
    assert!(local.get_folder("missing").await.unwrap_err().is_not_found());

    local.delete_folder("docs").await.unwrap();
    assert!(local.get_file("docs/a.txt").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_users_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let alice = provider(&dir, "alice");
    let bob = provider(&dir, "bob");

    upload(&alice, "secret.txt", b"alice only").await;
    assert!(bob.get_file("secret.txt").await.unwrap_err().is_not_found());
    assert!(bob.get_file("../alice/secret.txt").await.is_err());
    assert_eq!(bob.list_files(None, 10, 0).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_move_and_copy() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");
    local.create_folder("archive", None).await.unwrap();
    let id = upload(&local, "notes.txt", b"notes").await;

    let copied = local.copy_file(&id, Some("archive")).await.unwrap();
    assert_eq!(copied.id, "archive/notes.txt");

    let moved = local.move_file(&id, Some("archive")).await.unwrap();
    assert_eq!(moved.id, "archive/notes (1).txt");
    assert!(local.get_file(&id).await.unwrap_err().is_not_found());

    let back = local.move_file(&moved.id, None).await.unwrap();
    assert_eq!(back.id, "notes (1).txt");
}

#[tokio::test]
async fn test_batch_delete_reports_each_failure() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");
    let a = upload(&local, "a.txt", b"a").await;
    let b = upload(&local, "b.txt", b"b").await;
    let c = upload(&local, "c.txt", b"c").await;

    let ids = vec![a.clone(), "missing.txt".to_string(), b.clone(), c.clone()];
    let err = local.batch_delete(&ids).await.unwrap_err();
    let StorageError::PartialBatchFailure(report) = err else {
        panic!("expected a partial batch failure");
    };
    assert_eq!(report.succeeded, vec![a.clone(), b.clone(), c.clone()]);
    assert_eq!(report.failed_ids(), vec!["missing.txt"]);
    assert!(report.failed[0].error.is_not_found());

    for id in [a, b, c] {
        assert!(local.get_file(&id).await.unwrap_err().is_not_found());
    }

    let report = local.batch_delete(&[]).await.unwrap();
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn test_quota_is_enforced_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalProvider::new(dir.path(), "alice", 8, "http://files.test").unwrap();

    upload(&local, "five.txt", b"12345").await;
    let quota = local.get_quota().await.unwrap();
    assert_eq!(quota.total, 8);
    assert_eq!(quota.used, 5);
    assert_eq!(quota.available, 3);

    let err = local
        .upload_file(
            Bytes::from_static(b"6789"),
            UploadOptions::new("more.txt", "text/plain", 4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded(_)));
    assert_eq!(local.list_files(None, 10, 0).await.unwrap().total, 1);
}

#[tokio::test]
async fn test_search_filters_by_name_and_mime() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");
    upload(&local, "Holiday.png", b"png").await;
    upload(&local, "holiday-notes.txt", b"txt").await;
    upload(&local, "budget.txt", b"txt").await;

    let found = local
        .search_files("holiday", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let images = local
        .search_files(
            "holiday",
            SearchOptions {
                mime_type: Some("image/*".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "Holiday.png");

    assert!(local.get_thumbnail("budget.txt", Default::default()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_share_links_open_and_revoke() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");
    let id = upload(&local, "shared.txt", b"shared content").await;

    let link = local
        .create_share_link(
            &id,
            ShareOptions {
                password: Some("hunter2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(link.url, format!("http://files.test/share/{}", link.id));

    let err = LocalProvider::open_share(dir.path(), &link.id, None)
        .await
        .unwrap_err();
    assert!(err.is_auth());

    let (item, data) = LocalProvider::open_share(dir.path(), &link.id, Some("hunter2"))
        .await
        .unwrap();
    assert_eq!(item.name, "shared.txt");
    assert_eq!(data, Bytes::from_static(b"shared content"));

    local.revoke_share_link(&id, &link.id).await.unwrap();
    assert!(LocalProvider::open_share(dir.path(), &link.id, Some("hunter2"))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_share_passwords_are_salted_per_link() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");
    let id = upload(&local, "shared.txt", b"shared content").await;
    let with_password = || ShareOptions {
        password: Some("hunter2".to_string()),
        ..Default::default()
    };

    let first = local.create_share_link(&id, with_password()).await.unwrap();
    let second = local.create_share_link(&id, with_password()).await.unwrap();

    let record = |token: &str| -> serde_json::Value {
        let raw = std::fs::read(dir.path().join(".shares").join(format!("{token}.json"))).unwrap();
        serde_json::from_slice(&raw).unwrap()
    };
    let (a, b) = (record(&first.id), record(&second.id));
    assert!(!a.to_string().contains("hunter2"));
    assert_eq!(a["password_salt"].as_str().unwrap().len(), 32);
    assert_ne!(a["password_salt"], b["password_salt"]);
    assert_ne!(a["password_hash"], b["password_hash"]);

    assert!(LocalProvider::open_share(dir.path(), &first.id, Some("hunter3"))
        .await
        .unwrap_err()
        .is_auth());
    assert!(LocalProvider::open_share(dir.path(), &second.id, Some("hunter2"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_expired_share_links_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let local = provider(&dir, "alice");
    let id = upload(&local, "shared.txt", b"x").await;

    let past = ShareOptions {
        expires_at: Some(Utc::now() - Duration::minutes(1)),
        ..Default::default()
    };
    assert!(local.create_share_link(&id, past).await.is_err());

    let soon = ShareOptions {
        expires_at: Some(Utc::now() + Duration::milliseconds(200)),
        ..Default::default()
    };
    let link = local.create_share_link(&id, soon).await.unwrap();
    assert!(LocalProvider::open_share(dir.path(), &link.id, None).await.is_ok());

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(LocalProvider::open_share(dir.path(), &link.id, None)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_empty_user_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(LocalProvider::new(dir.path(), " ", QUOTA, "http://files.test").is_err());
}
