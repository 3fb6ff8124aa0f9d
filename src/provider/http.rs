use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::StorageError;

/// Shared HTTP client plus the per-call deadline every backend request honours.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub client: Client,
    pub timeout: Duration,
}

impl HttpSettings {
    pub fn new(timeout: Duration) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Backend {
                status: 0,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, timeout })
    }

    /// Send with the deadline applied; any response status is returned as-is.
    pub(crate) async fn send(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<Response, StorageError> {
        match tokio::time::timeout(self.timeout, request.send()).await {
            Err(_) => Err(StorageError::Timeout(format!(
                "{context} exceeded {}s",
                self.timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(from_reqwest(e, context)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// Send and translate any non-2xx status into the error taxonomy.
    pub(crate) async fn send_checked(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<Response, StorageError> {
        let response = self.send(request, context).await?;
        check(response, context).await
    }

    pub(crate) async fn json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<T, StorageError> {
        let response = self.send_checked(request, context).await?;
        read_json(response, context).await
    }
}

pub(crate) async fn check(response: Response, context: &str) -> Result<Response, StorageError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, format!("{context} failed ({status}): {body}")))
}

pub(crate) fn status_error(status: StatusCode, message: String) -> StorageError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Auth(message),
        StatusCode::NOT_FOUND => StorageError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => StorageError::Conflict(message),
        StatusCode::INSUFFICIENT_STORAGE => StorageError::QuotaExceeded(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            StorageError::Transient(message)
        }
        s if s.is_server_error() => StorageError::Transient(message),
        s => StorageError::Backend {
            status: s.as_u16(),
            message,
        },
    }
}

pub(crate) fn from_reqwest(e: reqwest::Error, context: &str) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(format!("{context}: {e}"))
    } else if e.is_connect() || e.is_request() || e.is_body() {
        StorageError::Transient(format!("{context}: {e}"))
    } else {
        StorageError::Backend {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: format!("{context}: {e}"),
        }
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    response: Response,
    context: &str,
) -> Result<T, StorageError> {
    let body = read_bytes(response, context).await?;
    serde_json::from_slice(&body).map_err(|e| StorageError::Backend {
        status: 200,
        message: format!("{context}: unexpected response body: {e}"),
    })
}

pub(crate) async fn read_bytes(response: Response, context: &str) -> Result<Bytes, StorageError> {
    response.bytes().await.map_err(|e| from_reqwest(e, context))
}

pub(crate) fn read_xml<T: DeserializeOwned>(body: &str, context: &str) -> Result<T, StorageError> {
    quick_xml::de::from_str(body).map_err(|e| StorageError::Backend {
        status: 200,
        message: format!("{context}: unexpected XML body: {e}"),
    })
}

/// Percent-encode each segment of a slash-separated key, keeping the slashes.
pub(crate) fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an HTTP-date header value (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}
