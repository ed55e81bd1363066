//! Blob backend: one gzip-compressed object per model behind a
//! key-authenticated HTTP endpoint.
//!
//! The server side lives in the `knnsync-http` crate. Failures are mapped to
//! distinct [`SyncError`] kinds so the router can report a fallback clearly:
//!
//! | condition                  | error                |
//! |----------------------------|----------------------|
//! | 401 / 403                  | `AuthFailure`        |
//! | 404                        | `NotFound`           |
//! | 413 or over local limit    | `PayloadTooLarge`    |
//! | other non-2xx              | `Http`               |
//! | connection refused / DNS   | `NetworkUnreachable` |
//! | request timeout            | `Timeout`            |

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header::CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::BlobConfig;
use crate::dataset::ModelId;
use crate::error::{SyncError, SyncResult};

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobUpload {
    /// URL the artifact can be downloaded from.
    pub locator: String,
    pub compressed_size_bytes: usize,
}

#[mockall::automock]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Compresses and uploads an encoded artifact.
    async fn upload(&self, model_id: &ModelId, artifact: &[u8]) -> SyncResult<BlobUpload>;

    /// Fetches and decompresses the artifact stored at `locator`.
    async fn download(&self, locator: &str) -> SyncResult<Vec<u8>>;

    /// Removes the stored artifact. An absent artifact is not an error.
    async fn delete(&self, model_id: &ModelId) -> SyncResult<()>;
}

/// Error body returned by the blob server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

pub struct HttpBlobStore {
    client: Client,
    endpoint: String,
    api_key: SecretString,
    max_upload_bytes: usize,
}

impl HttpBlobStore {
    pub fn new(config: &BlobConfig) -> SyncResult<Self> {
        if !config.is_configured() {
            return Err(SyncError::Validation(
                "blob endpoint and API key must both be set".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Storage(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    pub fn model_url(&self, model_id: &ModelId) -> String {
        format!("{}/api/models/{}", self.endpoint, model_id)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, model_id: &ModelId, artifact: &[u8]) -> SyncResult<BlobUpload> {
        let compressed = codec::compress(artifact)?;
        let size = compressed.len();
        if size > self.max_upload_bytes {
            return Err(SyncError::PayloadTooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }

        let url = self.model_url(model_id);
        debug!(model_id = %model_id, bytes = artifact.len(), compressed = size, "Uploading blob");
        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(compressed)
            .send()
            .await
            .map_err(|e| map_transport_error(e, &url))?;
        ensure_success(response, size, self.max_upload_bytes).await?;

        info!(model_id = %model_id, bytes = size, "Uploaded blob");
        Ok(BlobUpload {
            locator: url,
            compressed_size_bytes: size,
        })
    }

    async fn download(&self, locator: &str) -> SyncResult<Vec<u8>> {
        let response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(|e| map_transport_error(e, locator))?;
        let response = ensure_success(response, 0, self.max_upload_bytes).await?;
        let compressed = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(e, locator))?;

        let artifact = codec::decompress(&compressed)?;
        debug!(
            locator,
            compressed = compressed.len(),
            bytes = artifact.len(),
            "Downloaded blob"
        );
        Ok(artifact)
    }

    async fn delete(&self, model_id: &ModelId) -> SyncResult<()> {
        let url = self.model_url(model_id);
        let response = self
            .client
            .delete(&url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| map_transport_error(e, &url))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(model_id = %model_id, "Blob already absent");
            return Ok(());
        }
        ensure_success(response, 0, self.max_upload_bytes).await?;
        info!(model_id = %model_id, "Deleted blob");
        Ok(())
    }
}

fn map_transport_error(err: reqwest::Error, url: &str) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout(format!("request to {} timed out", url))
    } else if err.is_connect() || err.is_request() {
        SyncError::NetworkUnreachable(format!("{}: {}", url, err))
    } else {
        SyncError::Storage(format!("{}: {}", url, err))
    }
}

async fn ensure_success(response: Response, size: usize, limit: usize) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or(body);
    warn!(status = status.as_u16(), message = %message, "Blob server rejected request");

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthFailure(message),
        StatusCode::NOT_FOUND => SyncError::NotFound(message),
        StatusCode::PAYLOAD_TOO_LARGE => SyncError::PayloadTooLarge { size, limit },
        _ => SyncError::Http {
            status: status.as_u16(),
            message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::time::Duration;

    fn store_for(endpoint: &str) -> HttpBlobStore {
        HttpBlobStore::new(&BlobConfig::new(endpoint, "secret")).unwrap()
    }

    fn model() -> ModelId {
        ModelId::parse("model-1").unwrap()
    }

    #[test]
    fn test_requires_configuration() {
        assert!(matches!(
            HttpBlobStore::new(&BlobConfig::default()),
            Err(SyncError::Validation(_))
        ));
        let store = store_for("http://blob.local/");
        assert_eq!(store.model_url(&model()), "http://blob.local/api/models/model-1");
    }

    #[tokio::test]
    async fn test_upload_sends_compressed_body_with_key() {
        let mut server = mockito::Server::new_async().await;
        let artifact = br#"{"format":"knnsync.dataset/v1"}"#.to_vec();
        let compressed = codec::compress(&artifact).unwrap();
        let mock = server
            .mock("POST", "/api/models/model-1")
            .match_header("x-api-key", "secret")
            .match_header("content-type", "application/octet-stream")
            .match_header("content-length", compressed.len().to_string().as_str())
            .with_status(200)
            .with_body(r#"{"success":true,"modelId":"model-1","sizeBytes":1}"#)
            .create_async()
            .await;

        let store = store_for(&server.url());
        let upload = store.upload(&model(), &artifact).await.unwrap();
        mock.assert_async().await;
        assert_eq!(upload.locator, format!("{}/api/models/model-1", server.url()));
        assert_eq!(upload.compressed_size_bytes, compressed.len());
    }

    #[tokio::test]
    async fn test_upload_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let store = store_for(&server.url());

        let cases = [
            (401, "auth_failure"),
            (403, "auth_failure"),
            (413, "payload_too_large"),
            (500, "http"),
        ];
        for (status, kind) in cases {
            let id = ModelId::parse(&format!("status-{}", status)).unwrap();
            server
                .mock("POST", format!("/api/models/{}", id).as_str())
                .with_status(status)
                .with_body(r#"{"error":"Rejected","message":"rejected"}"#)
                .create_async()
                .await;
            let err = store.upload(&id, b"data").await.unwrap_err();
            assert_eq!(err.kind(), kind, "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_auth_failure_carries_server_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/models/model-1")
            .with_status(401)
            .with_body(r#"{"error":"Unauthorized","message":"Invalid API key"}"#)
            .create_async()
            .await;
        let err = store_for(&server.url())
            .upload(&model(), b"data")
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::AuthFailure("Invalid API key".to_string()));
    }

    #[tokio::test]
    async fn test_upload_over_local_limit_is_not_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let mut config = BlobConfig::new(&server.url(), "secret");
        config.max_upload_bytes = 8;
        let store = HttpBlobStore::new(&config).unwrap();

        let err = store.upload(&model(), &[7u8; 256]).await.unwrap_err();
        assert!(matches!(err, SyncError::PayloadTooLarge { limit: 8, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let store = store_for("http://127.0.0.1:1");
        let err = store.upload(&model(), b"data").await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnreachable(_)));
        assert!(err.is_network_class());
    }

    #[tokio::test]
    async fn test_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = BlobConfig::new(&format!("http://{}", addr), "secret");
        config.request_timeout = Duration::from_millis(100);
        let store = HttpBlobStore::new(&config).unwrap();
        let err = store.upload(&model(), b"data").await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_download_decompresses() {
        let mut server = mockito::Server::new_async().await;
        let artifact = b"artifact bytes".to_vec();
        server
            .mock("GET", "/api/models/model-1")
            .with_status(200)
            .with_header("content-type", "application/octet-stream")
            .with_body(codec::compress(&artifact).unwrap())
            .create_async()
            .await;

        let store = store_for(&server.url());
        let locator = store.model_url(&model());
        assert_eq!(store.download(&locator).await.unwrap(), artifact);
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/models/model-1")
            .with_status(404)
            .with_body(r#"{"error":"Not found","message":"Model model-1 does not exist"}"#)
            .create_async()
            .await;
        let store = store_for(&server.url());
        let err = store.download(&store.model_url(&model())).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_treats_missing_as_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/api/models/model-1")
            .match_header("x-api-key", "secret")
            .with_status(404)
            .create_async()
            .await;
        store_for(&server.url()).delete(&model()).await.unwrap();
        mock.assert_async().await;
    }
}
