use std::path::Path;

use driveback_core::{ApiErrorClass, classify_api_status};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum DestError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl DestError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DestError::Api { status, .. } => classify_api_status(*status),
            // Network and local I/O failures are worth another attempt.
            DestError::Request(_) | DestError::Io(_) => ApiErrorClass::Transient,
            DestError::Url(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.classification() == ApiErrorClass::Auth
    }
}

/// Backend kinds are a closed set picked at configuration load; the hot path
/// only ever dispatches on the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    S3Gateway,
    B2Vault,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    pub kind: BackendKind,
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    objects: Vec<RemoteObject>,
}

enum Backend {
    S3Gateway(S3GatewayBackend),
    B2Vault(B2VaultBackend),
}

/// One configured durable storage target, exposing the uniform
/// stat / put / list / delete surface the pipeline works against.
pub struct Destination {
    id: String,
    prefix: Option<String>,
    backend: Backend,
}

impl Destination {
    pub fn new(config: &DestinationConfig) -> Result<Self, DestError> {
        let endpoint = Url::parse(&config.endpoint)?;
        let http = Client::new();
        let backend = match config.kind {
            BackendKind::S3Gateway => Backend::S3Gateway(S3GatewayBackend {
                http,
                endpoint,
                bucket: config.bucket.clone(),
                token: config.token.clone(),
            }),
            BackendKind::B2Vault => Backend::B2Vault(B2VaultBackend {
                http,
                endpoint,
                bucket: config.bucket.clone(),
                token: config.token.clone(),
            }),
        };
        Ok(Self {
            id: config.id.clone(),
            prefix: config.prefix.clone(),
            backend,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Maps a provider-relative source path onto this destination's key
    /// space, applying the configured prefix.
    pub fn remote_path_for(&self, source_path: &str) -> String {
        let trimmed = source_path.trim_start_matches('/');
        match self.prefix.as_deref() {
            Some(prefix) => format!("{}/{}", prefix.trim_matches('/'), trimmed),
            None => trimmed.to_string(),
        }
    }

    /// Existence + byte size of the remote object; `None` means not found.
    pub async fn stat(&self, remote_path: &str) -> Result<Option<u64>, DestError> {
        match &self.backend {
            Backend::S3Gateway(backend) => backend.stat(remote_path).await,
            Backend::B2Vault(backend) => backend.stat(remote_path).await,
        }
    }

    /// Streams the local file to the remote path; returns the byte count sent.
    pub async fn put(&self, local_path: &Path, remote_path: &str) -> Result<u64, DestError> {
        match &self.backend {
            Backend::S3Gateway(backend) => backend.put(local_path, remote_path).await,
            Backend::B2Vault(backend) => backend.put(local_path, remote_path).await,
        }
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, DestError> {
        match &self.backend {
            Backend::S3Gateway(backend) => backend.list(prefix).await,
            Backend::B2Vault(backend) => backend.list(prefix).await,
        }
    }

    pub async fn delete(&self, remote_path: &str) -> Result<(), DestError> {
        match &self.backend {
            Backend::S3Gateway(backend) => backend.delete(remote_path).await,
            Backend::B2Vault(backend) => backend.delete(remote_path).await,
        }
    }
}

/// Path-style S3-compatible gateway: objects live at
/// `{endpoint}/{bucket}/{key}` behind a bearer token.
struct S3GatewayBackend {
    http: Client,
    endpoint: Url,
    bucket: String,
    token: String,
}

impl S3GatewayBackend {
    fn object_url(&self, key: &str) -> Result<Url, DestError> {
        Ok(self.endpoint.join(&format!("{}/{}", self.bucket, key))?)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn stat(&self, key: &str) -> Result<Option<u64>, DestError> {
        let response = self
            .http
            .head(self.object_url(key)?)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        stat_from_response(response).await
    }

    async fn put(&self, local_path: &Path, key: &str) -> Result<u64, DestError> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let file = tokio::fs::File::open(local_path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .put(self.object_url(key)?)
            .header("Authorization", self.auth_header_value())
            .header("Content-Length", size)
            .body(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, DestError> {
        let mut url = self.endpoint.join(&self.bucket)?;
        url.query_pairs_mut().append_pair("prefix", prefix);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let response = check_status(response).await?;
        let payload: ListResponse = response.json().await?;
        Ok(payload.objects)
    }

    async fn delete(&self, key: &str) -> Result<(), DestError> {
        let response = self
            .http
            .delete(self.object_url(key)?)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// B2-style vault: objects live at `{endpoint}/file/{bucket}/{key}` and the
/// account token goes in the Authorization header verbatim.
struct B2VaultBackend {
    http: Client,
    endpoint: Url,
    bucket: String,
    token: String,
}

impl B2VaultBackend {
    fn object_url(&self, key: &str) -> Result<Url, DestError> {
        Ok(self.endpoint.join(&format!("file/{}/{}", self.bucket, key))?)
    }

    async fn stat(&self, key: &str) -> Result<Option<u64>, DestError> {
        let response = self
            .http
            .head(self.object_url(key)?)
            .header("Authorization", &self.token)
            .send()
            .await?;
        stat_from_response(response).await
    }

    async fn put(&self, local_path: &Path, key: &str) -> Result<u64, DestError> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let file = tokio::fs::File::open(local_path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .put(self.object_url(key)?)
            .header("Authorization", &self.token)
            .header("Content-Length", size)
            .body(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, DestError> {
        let mut url = self.endpoint.join(&format!("file/{}", self.bucket))?;
        url.query_pairs_mut().append_pair("prefix", prefix);
        let response = self
            .http
            .get(url)
            .header("Authorization", &self.token)
            .send()
            .await?;
        let response = check_status(response).await?;
        let payload: ListResponse = response.json().await?;
        Ok(payload.objects)
    }

    async fn delete(&self, key: &str) -> Result<(), DestError> {
        let response = self
            .http
            .delete(self.object_url(key)?)
            .header("Authorization", &self.token)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn stat_from_response(response: reqwest::Response) -> Result<Option<u64>, DestError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let response = check_status(response).await?;
    let size = response
        .headers()
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    Ok(Some(size))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DestError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DestError::Api { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn s3_config(server: &MockServer) -> DestinationConfig {
        DestinationConfig {
            id: "s3-us".into(),
            kind: BackendKind::S3Gateway,
            endpoint: server.uri(),
            bucket: "backups".into(),
            prefix: Some("google-drive".into()),
            token: "s3-token".into(),
        }
    }

    #[test]
    fn remote_path_applies_prefix() {
        let server_uri = "http://localhost:9999".to_string();
        let dest = Destination::new(&DestinationConfig {
            id: "s3-us".into(),
            kind: BackendKind::S3Gateway,
            endpoint: server_uri,
            bucket: "backups".into(),
            prefix: Some("google-drive".into()),
            token: "t".into(),
        })
        .unwrap();
        assert_eq!(
            dest.remote_path_for("/Archive/2024/scan.pdf"),
            "google-drive/Archive/2024/scan.pdf"
        );

        let bare = Destination::new(&DestinationConfig {
            id: "b2-eu".into(),
            kind: BackendKind::B2Vault,
            endpoint: "http://localhost:9999".into(),
            bucket: "vault".into(),
            prefix: None,
            token: "t".into(),
        })
        .unwrap();
        assert_eq!(bare.remote_path_for("/a.txt"), "a.txt");
    }

    #[tokio::test]
    async fn stat_reports_size_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/backups/google-drive/a.txt"))
            .and(header("authorization", "Bearer s3-token"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "2000"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/backups/google-drive/missing.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dest = Destination::new(&s3_config(&server)).unwrap();
        assert_eq!(
            dest.stat("google-drive/a.txt").await.unwrap(),
            Some(2000)
        );
        assert_eq!(dest.stat("google-drive/missing.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_streams_file_and_returns_size() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/backups/google-drive/a.txt"))
            .and(body_bytes(b"payload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"payload").unwrap();

        let dest = Destination::new(&s3_config(&server)).unwrap();
        let sent = dest.put(&local, "google-drive/a.txt").await.unwrap();
        assert_eq!(sent, 7);
    }

    #[tokio::test]
    async fn b2_vault_uses_file_url_layout_and_raw_token() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file/vault/a.txt"))
            .and(header("authorization", "account-token"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "5"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/file/vault/a.txt"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let dest = Destination::new(&DestinationConfig {
            id: "b2-eu".into(),
            kind: BackendKind::B2Vault,
            endpoint: server.uri(),
            bucket: "vault".into(),
            prefix: None,
            token: "account-token".into(),
        })
        .unwrap();

        assert_eq!(dest.stat("a.txt").await.unwrap(), Some(5));
        dest.delete("a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn list_parses_objects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/backups"))
            .and(query_param("prefix", "google-drive/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "objects": [
                    {"key": "google-drive/a.txt", "size": 7},
                    {"key": "google-drive/b.txt", "size": 9}
                ]
            })))
            .mount(&server)
            .await;

        let dest = Destination::new(&s3_config(&server)).unwrap();
        let objects = dest.list("google-drive/").await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].key, "google-drive/b.txt");
        assert_eq!(objects[1].size, 9);
    }

    #[tokio::test]
    async fn delete_removes_remote_object() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/backups/google-drive/stale.txt"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let dest = Destination::new(&s3_config(&server)).unwrap();
        dest.delete("google-drive/stale.txt").await.unwrap();
    }

    #[tokio::test]
    async fn errors_carry_classification() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/backups/google-drive/denied.txt"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/backups/google-drive/flaky.txt"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dest = Destination::new(&s3_config(&server)).unwrap();

        let err = dest.stat("google-drive/denied.txt").await.unwrap_err();
        assert!(err.is_auth());

        let err = dest.stat("google-drive/flaky.txt").await.unwrap_err();
        assert_eq!(err.classification(), ApiErrorClass::Transient);
    }
}
