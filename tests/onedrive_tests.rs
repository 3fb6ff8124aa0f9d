use std::time::Duration;

use bytes::Bytes;
use cloud_storage::provider::{
    HttpSettings, OAuthSettings, OneDriveProvider, Quota, StorageError, StorageProvider,
    UploadLimits, UploadOptions,
};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION_CREATE: &str = "/me/drive/root:/big.bin:/createUploadSession";
const SESSION_URL: &str = "/upload/session-1";

async fn provider(server: &MockServer) -> OneDriveProvider {
    let settings = OAuthSettings {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        redirect_uri: "http://localhost:8080/api/providers/onedrive/callback".to_string(),
    };
    let http = HttpSettings::new(Duration::from_secs(5)).unwrap();
    let onedrive = OneDriveProvider::with_base_url(settings, http, &server.uri())
        .with_upload_limits(UploadLimits::new(4, 4));
    onedrive
        .authenticate("graph-token", Some("graph-refresh"))
        .await
        .unwrap();
    onedrive
}

fn drive_item(id: &str, name: &str, size: u64) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "size": size,
        "file": { "mimeType": "application/octet-stream" },
        "parentReference": { "id": "root-id", "path": "/drive/root:" },
        "createdDateTime": "2024-05-01T09:00:00Z",
        "lastModifiedDateTime": "2024-05-01T10:00:00Z",
        "webUrl": format!("https://onedrive.test/{name}"),
    })
}

async fn mount_session(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(SESSION_CREATE))
        .and(header("authorization", "Bearer graph-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uploadUrl": format!("{}{SESSION_URL}", server.uri()),
            "expirationDateTime": "2030-01-01T00:00:00Z",
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_session_upload_returns_the_final_item() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    Mock::given(method("PUT"))
        .and(path(SESSION_URL))
        .respond_with(
            ResponseTemplate::new(202).set_body_json(json!({ "nextExpectedRanges": ["4-"] })),
        )
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SESSION_URL))
        .and(header("content-range", "bytes 8-9/10"))
        .respond_with(ResponseTemplate::new(201).set_body_json(drive_item("item-9", "big.bin", 10)))
        .expect(1)
        .mount(&server)
        .await;

    let onedrive = provider(&server).await;
    let item = onedrive
        .upload_file(
            Bytes::from_static(b"0123456789"),
            UploadOptions::new("big.bin", "application/octet-stream", 10),
        )
        .await
        .unwrap();
    assert_eq!(item.id, "item-9");
    assert_eq!(item.size, 10);
    assert_eq!(item.path, "/big.bin");
}

#[tokio::test]
async fn test_failed_chunk_cancels_the_session() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    Mock::given(method("PUT"))
        .and(path(SESSION_URL))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SESSION_URL))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(SESSION_URL))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let onedrive = provider(&server).await;
    let err = onedrive
        .upload_file(
            Bytes::from_static(b"0123456789"),
            UploadOptions::new("big.bin", "application/octet-stream", 10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Transient(_)), "got {err:?}");
}

#[tokio::test]
async fn test_name_collision_on_small_upload_is_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/me/drive/root:/a.txt:/content"))
        .and(query_param("@microsoft.graph.conflictBehavior", "fail"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": { "code": "nameAlreadyExists", "message": "exists" }
        })))
        .mount(&server)
        .await;

    let onedrive = provider(&server).await;
    let err = onedrive
        .upload_file(Bytes::from_static(b"a"), UploadOptions::new("a.txt", "text/plain", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn test_copy_polls_the_monitor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/drive/items/item-1/copy"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("{}/monitor/1", server.uri()).as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/monitor/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "status": "inProgress", "percentageComplete": 50 })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/monitor/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "status": "completed", "resourceId": "item-2" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/item-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(drive_item("item-2", "a 1.txt", 1)))
        .mount(&server)
        .await;

    let onedrive = provider(&server).await;
    let copy = onedrive.copy_file("item-1", None).await.unwrap();
    assert_eq!(copy.id, "item-2");
    assert_eq!(copy.name, "a 1.txt");
}

#[tokio::test]
async fn test_quota_and_missing_thumbnail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "quota": { "total": 1000, "used": 250, "remaining": 750 }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/item-1/thumbnails/0/medium/content"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let onedrive = provider(&server).await;
    assert_eq!(onedrive.get_quota().await.unwrap(), Quota::limited(1000, 250));
    assert!(onedrive
        .get_thumbnail("item-1", Default::default())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_token_refresh_posts_to_the_token_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "graph-token-2",
            "refresh_token": "graph-refresh-2",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let onedrive = provider(&server).await;
    let tokens = onedrive.refresh_access_token().await.unwrap();
    assert_eq!(tokens.access_token, "graph-token-2");
    assert_eq!(tokens.refresh_token.as_deref(), Some("graph-refresh-2"));
}
