//! Registry API v2 handlers.
//!
//! Repository names span several path segments, so routes are not matched by
//! axum. [`parse_v2_path`] splits the request path into a [`V2Route`] and the
//! server wrappers dispatch on it.

pub mod blobs;
pub mod errors;
pub mod manifests;
pub mod uploads;

pub use errors::ApiError;

use crate::config::Config;
use crate::error::{RegistryError, Result};
use crate::proxy::{ProxyCoordinator, TokenCache, TokenProvider, UpstreamClient};
use crate::storage::{BlobStore, FilesystemBlobStore, ManifestStore};
use crate::uploads::UploadSessionManager;
use axum::http::{HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;

pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
pub const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

pub fn cache_status(hit: bool) -> HeaderValue {
    HeaderValue::from_static(if hit { "HIT" } else { "MISS" })
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub blobs: Arc<dyn BlobStore>,
    pub manifests: Arc<ManifestStore>,
    pub uploads: Arc<UploadSessionManager>,
    pub proxy: Arc<ProxyCoordinator>,
}

impl AppState {
    /// Wire up filesystem storage and the upstream token cache from `config`.
    pub fn new(config: Config) -> Result<Self> {
        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        let tokens: Arc<dyn TokenProvider> = Arc::new(TokenCache::new(upstream.clone()));
        let blobs: Arc<dyn BlobStore> = Arc::new(FilesystemBlobStore::new(&config.storage)?);
        Ok(Self::with_components(config, blobs, upstream, tokens))
    }

    /// Assemble state around caller-provided storage and token components.
    pub fn with_components(
        config: Config,
        blobs: Arc<dyn BlobStore>,
        upstream: Arc<UpstreamClient>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let manifests = Arc::new(ManifestStore::new(blobs.clone()));
        let uploads = Arc::new(UploadSessionManager::new(
            blobs.clone(),
            Duration::from_secs(config.uploads.session_timeout_secs),
        ));
        let proxy = Arc::new(ProxyCoordinator::new(
            blobs.clone(),
            manifests.clone(),
            upstream,
            tokens,
            Duration::from_secs(config.proxy.tag_ttl_secs),
        ));

        Self {
            config: Arc::new(config),
            blobs,
            manifests,
            uploads,
            proxy,
        }
    }
}

/// Where a repository name points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local(String),
    /// `proxy/<host>/<repository>`
    Proxy { host: String, repository: String },
}

impl Target {
    pub fn parse(name: &str) -> Result<Self> {
        match name.strip_prefix("proxy/") {
            Some(rest) => {
                let (host, repository) = rest
                    .split_once('/')
                    .ok_or_else(|| RegistryError::InvalidName(name.to_string()))?;
                Ok(Target::Proxy {
                    host: host.to_string(),
                    repository: repository.to_string(),
                })
            }
            None => Ok(Target::Local(name.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V2Route {
    Blob { name: String, digest: String },
    Uploads { name: String },
    Upload { name: String, id: String },
    Manifest { name: String, reference: String },
}

impl V2Route {
    pub fn name(&self) -> &str {
        match self {
            V2Route::Blob { name, .. }
            | V2Route::Uploads { name }
            | V2Route::Upload { name, .. }
            | V2Route::Manifest { name, .. } => name,
        }
    }
}

const V2_PREFIX: &str = "/v2/";
const UPLOADS_SUFFIX: &str = "/blobs/uploads";
const MANIFESTS_SUFFIX: &str = "/manifests/";
const BLOBS_SUFFIX: &str = "/blobs/";

/// Split `/v2/<name>/<kind>/<ref>` into a route.
pub fn parse_v2_path(path: &str) -> Option<V2Route> {
    let mut path = path.replace("%3A", ":").replace("%3a", ":");

    // Some clients double the prefix (e.g. /v2/v2/quay.io/...)
    if path.starts_with("/v2/v2/") {
        tracing::warn!(original_path = %path, "Stripping doubled /v2/ prefix");
        path = path.replacen("/v2/v2/", "/v2/", 1);
    }

    let rest = path.strip_prefix(V2_PREFIX)?;
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    let trimmed = rest.strip_suffix('/').unwrap_or(rest);
    if let Some(name) = trimmed.strip_suffix(UPLOADS_SUFFIX) {
        return Some(V2Route::Uploads {
            name: non_empty(name)?,
        });
    }

    let upload_marker = format!("{}/", UPLOADS_SUFFIX);
    if let Some(idx) = rest.rfind(&upload_marker) {
        let id = &rest[idx + upload_marker.len()..];
        if id.contains('/') {
            return None;
        }
        return Some(V2Route::Upload {
            name: non_empty(&rest[..idx])?,
            id: non_empty(id)?,
        });
    }

    if let Some(idx) = rest.rfind(MANIFESTS_SUFFIX) {
        return Some(V2Route::Manifest {
            name: non_empty(&rest[..idx])?,
            reference: non_empty(&rest[idx + MANIFESTS_SUFFIX.len()..])?,
        });
    }

    if let Some(idx) = rest.rfind(BLOBS_SUFFIX) {
        return Some(V2Route::Blob {
            name: non_empty(&rest[..idx])?,
            digest: non_empty(&rest[idx + BLOBS_SUFFIX.len()..])?,
        });
    }

    None
}
