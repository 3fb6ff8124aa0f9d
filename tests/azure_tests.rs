use std::time::Duration;

use bytes::Bytes;
use cloud_storage::provider::{
    AzureBlobProvider, AzureSettings, HttpSettings, StorageError, StorageProvider, UploadLimits,
    UploadOptions,
};
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BLOB: &str = "/files/users/alice/big.bin";

async fn provider(server: &MockServer) -> AzureBlobProvider {
    let settings = AzureSettings {
        account: "acct".to_string(),
        access_key: "c2VjcmV0LWtleS1mb3ItdGVzdHM=".to_string(),
        container: "files".to_string(),
        endpoint: Some(server.uri()),
    };
    let http = HttpSettings::new(Duration::from_secs(5)).unwrap();
    let azure = AzureBlobProvider::new(settings, http, "alice")
        .unwrap()
        .with_upload_limits(UploadLimits::new(4, 4));
    azure.authenticate("deployment", None).await.unwrap();
    azure
}

#[tokio::test]
async fn test_block_upload_commits_list_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(BLOB))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(BLOB))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "application/zip"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(BLOB))
        .and(query_param("comp", "block"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(201))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(BLOB))
        .and(query_param("comp", "blocklist"))
        .and(header("if-none-match", "*"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let azure = provider(&server).await;
    let item = azure
        .upload_file(
            Bytes::from_static(b"0123456789"),
            UploadOptions::new("big.bin", "application/zip", 10),
        )
        .await
        .unwrap();
    assert_eq!(item.id, "big.bin");
    assert_eq!(item.mime_type, "application/zip");

    let requests = server.received_requests().await.unwrap();
    let block_ids: Vec<String> = requests
        .iter()
        .filter(|r| r.url.query_pairs().any(|(k, v)| k == "comp" && v == "block"))
        .filter_map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "blockid")
                .map(|(_, v)| v.into_owned())
        })
        .collect();
    assert_eq!(block_ids.len(), 3);
    assert!(block_ids.iter().all(|id| id.len() == block_ids[0].len()));

    let commit = requests
        .iter()
        .find(|r| r.url.query_pairs().any(|(k, v)| k == "comp" && v == "blocklist"))
        .expect("block list request");
    let body = String::from_utf8_lossy(&commit.body);
    let positions: Vec<usize> = block_ids
        .iter()
        .map(|id| body.find(id.as_str()).expect("block id in list"))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    // Staged blocks in committed order are exactly the payload.
    let mut staged: Vec<(usize, Vec<u8>)> = requests
        .iter()
        .filter(|r| r.url.query_pairs().any(|(k, v)| k == "comp" && v == "block"))
        .map(|r| {
            let id = r
                .url
                .query_pairs()
                .find(|(k, _)| k == "blockid")
                .map(|(_, v)| v.into_owned())
                .unwrap();
            (body.find(id.as_str()).unwrap(), r.body.clone())
        })
        .collect();
    staged.sort_by_key(|(position, _)| *position);
    let rebuilt: Vec<u8> = staged.into_iter().flat_map(|(_, b)| b).collect();
    assert_eq!(rebuilt, b"0123456789");
}

#[tokio::test]
async fn test_failed_block_never_commits() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(BLOB))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(BLOB))
        .and(query_param("comp", "block"))
        .respond_with(ResponseTemplate::new(201))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(BLOB))
        .and(query_param("comp", "block"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(BLOB))
        .and(query_param("comp", "blocklist"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let azure = provider(&server).await;
    let err = azure
        .upload_file(
            Bytes::from_static(b"0123456789"),
            UploadOptions::new("big.bin", "application/octet-stream", 10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Transient(_)), "got {err:?}");
    assert!(azure.get_file("big.bin").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_existing_blob_is_a_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/files/users/alice/a.txt"))
        .and(header("if-none-match", "*"))
        .respond_with(ResponseTemplate::new(409).set_body_string("BlobAlreadyExists"))
        .mount(&server)
        .await;

    let azure = provider(&server).await;
    let err = azure
        .upload_file(Bytes::from_static(b"a"), UploadOptions::new("a.txt", "text/plain", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn test_rejected_key_maps_to_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/users/alice/a.txt"))
        .respond_with(ResponseTemplate::new(403).set_body_string("AuthenticationFailed"))
        .mount(&server)
        .await;

    let azure = provider(&server).await;
    assert!(azure.download_file("a.txt", None).await.unwrap_err().is_auth());
}
