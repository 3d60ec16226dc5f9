//! Helpers shared by the integration tests.
#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use docker_registry::config::StorageConfig;
use docker_registry::{Config, Digest, DigestAlgorithm};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration with all three roots under `root`, listening on an ephemeral port.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::new(StorageConfig {
        registry_storage: root.join("registry"),
        temporary_storage: root.join("tmp"),
        proxy_storage: root.join("proxy"),
    });
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.upstream.timeout_secs = 5;
    config.upstream.connect_timeout_secs = 2;
    config
}

pub fn sha256(data: &[u8]) -> Digest {
    Digest::compute(DigestAlgorithm::Sha256, data)
}

/// Number of files left in a directory (staging leftovers).
pub fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0)
}

pub fn image_manifest(config: &Digest, layers: &[&Digest]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|d| {
            serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 1,
                "digest": d.to_string(),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1,
            "digest": config.to_string(),
        },
        "layers": layers,
    }))
    .unwrap()
}

/// In-process upstream registry.
///
/// With `require_auth` set it answers `/v2/` with a Bearer challenge pointing
/// at its own `/token` endpoint. Tokens are `token-<n>`; any token numbered
/// below `min_valid_token` is rejected with 401 to simulate expiry.
#[derive(Default)]
pub struct MockUpstream {
    pub require_auth: bool,
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub manifests: Mutex<HashMap<String, (String, Vec<u8>)>>,
    pub token_requests: AtomicUsize,
    pub blob_requests: AtomicUsize,
    pub manifest_requests: AtomicUsize,
    pub min_valid_token: AtomicUsize,
    /// Answer every manifest request with 503
    pub fail_manifests: AtomicBool,
    pub token_delay_ms: u64,
    pub port: AtomicUsize,
}

impl MockUpstream {
    pub fn new(require_auth: bool) -> Self {
        Self {
            require_auth,
            ..Default::default()
        }
    }

    pub fn add_blob(&self, data: &[u8]) -> Digest {
        let digest = sha256(data);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.to_string(), data.to_vec());
        digest
    }

    /// Serve `data` under a digest it does not hash to.
    pub fn add_corrupt_blob(&self, claimed: &Digest, data: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(claimed.to_string(), data.to_vec());
    }

    /// Serve a manifest under `tag` and under its digest.
    pub fn add_manifest(&self, tag: &str, body: &[u8]) -> Digest {
        let digest = sha256(body);
        let entry = (
            "application/vnd.docker.distribution.manifest.v2+json".to_string(),
            body.to_vec(),
        );
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(tag.to_string(), entry.clone());
        manifests.insert(digest.to_string(), entry);
        digest
    }

    pub fn remove_manifest(&self, reference: &str) {
        self.manifests.lock().unwrap().remove(reference);
    }

    fn challenge(&self) -> String {
        format!(
            r#"Bearer realm="http://127.0.0.1:{}/token",service="mock-registry""#,
            self.port.load(Ordering::SeqCst)
        )
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if !self.require_auth {
            return true;
        }
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer token-"))
            .and_then(|n| n.parse::<usize>().ok())
            .map(|n| n >= self.min_valid_token.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn unauthorized(&self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [("www-authenticate", self.challenge())],
            r#"{"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}"#,
        )
            .into_response()
    }
}

async fn mock_version(State(mock): State<Arc<MockUpstream>>) -> Response {
    if mock.require_auth {
        mock.unauthorized()
    } else {
        (StatusCode::OK, "{}").into_response()
    }
}

async fn mock_token(State(mock): State<Arc<MockUpstream>>) -> Response {
    let n = mock.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    if mock.token_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(mock.token_delay_ms)).await;
    }
    let body = serde_json::json!({
        "token": format!("token-{}", n),
        "expires_in": 300,
        "issued_at": "2026-01-01T00:00:00Z",
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}

async fn mock_content(
    State(mock): State<Arc<MockUpstream>>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if !mock.authorized(&headers) {
        return mock.unauthorized();
    }

    let path = uri.path().replace("%3A", ":");
    if let Some(idx) = path.rfind("/manifests/") {
        mock.manifest_requests.fetch_add(1, Ordering::SeqCst);
        if mock.fail_manifests.load(Ordering::SeqCst) {
            return (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response();
        }
        let reference = &path[idx + "/manifests/".len()..];
        let entry = mock.manifests.lock().unwrap().get(reference).cloned();
        return match entry {
            Some((media_type, body)) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", media_type)
                .header("docker-content-digest", sha256(&body).to_string())
                .body(Body::from(body))
                .unwrap(),
            None => (StatusCode::NOT_FOUND, "manifest unknown").into_response(),
        };
    }

    if let Some(idx) = path.rfind("/blobs/") {
        mock.blob_requests.fetch_add(1, Ordering::SeqCst);
        let digest = &path[idx + "/blobs/".len()..];
        let data = mock.blobs.lock().unwrap().get(digest).cloned();
        return match data {
            Some(data) => {
                let len = data.len();
                let body = if method == Method::HEAD {
                    Body::empty()
                } else {
                    Body::from(data)
                };
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-length", len)
                    .body(body)
                    .unwrap()
            }
            None => (StatusCode::NOT_FOUND, "blob unknown").into_response(),
        };
    }

    (StatusCode::NOT_FOUND, "unknown").into_response()
}

/// Serve `mock` on an ephemeral port; returns the `host:port` to proxy to.
pub async fn start_mock_upstream(mock: Arc<MockUpstream>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    mock.port.store(addr.port() as usize, Ordering::SeqCst);

    let app = Router::new()
        .route("/v2/", get(mock_version))
        .route("/token", get(mock_token))
        .route("/v2/*rest", get(mock_content))
        .with_state(mock);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("127.0.0.1:{}", addr.port())
}

/// A `host:port` nothing is listening on.
pub async fn unused_host() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("127.0.0.1:{}", port)
}
