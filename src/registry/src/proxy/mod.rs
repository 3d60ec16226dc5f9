//! Pull-through cache for upstream registries.
//!
//! Content fetched from `https://<host>` is verified against its digest and
//! committed into the proxy storage area, then served locally on later pulls.

pub mod auth;
pub mod token_cache;
pub mod upstream;

pub use token_cache::{TokenCache, TokenKind, TokenProvider, UpstreamToken};
pub use upstream::UpstreamClient;

use crate::config::{DEFAULT_MANIFEST_ACCEPT_HEADER, MAX_MANIFEST_SIZE};
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{RegistryError, Result};
use crate::storage::{
    validate_host, validate_repository, BlobReader, BlobStore, Manifest, ManifestStore, Reference,
    StorageArea, TempBlob,
};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use upstream::transport_error;

const TEE_CHANNEL_CAPACITY: usize = 32;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A proxied blob, either already cached or streaming from upstream.
pub enum ProxyBlob {
    Cached(BlobReader),
    /// `size` is the upstream Content-Length when it was sent
    Streaming { size: Option<u64>, body: ByteStream },
}

impl ProxyBlob {
    pub fn is_cached(&self) -> bool {
        matches!(self, ProxyBlob::Cached(_))
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            ProxyBlob::Cached(reader) => Some(reader.size),
            ProxyBlob::Streaming { size, .. } => *size,
        }
    }

    pub fn into_stream(self) -> ByteStream {
        match self {
            ProxyBlob::Cached(reader) => ReaderStream::new(reader.reader).boxed(),
            ProxyBlob::Streaming { body, .. } => body,
        }
    }
}

/// Size of a proxied blob and whether it is already cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: Option<u64>,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct ProxiedManifest {
    pub manifest: Manifest,
    pub cached: bool,
}

pub struct ProxyCoordinator {
    blobs: Arc<dyn BlobStore>,
    manifests: Arc<ManifestStore>,
    upstream: Arc<UpstreamClient>,
    tokens: Arc<dyn TokenProvider>,
    tag_ttl: Duration,
}

impl ProxyCoordinator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        manifests: Arc<ManifestStore>,
        upstream: Arc<UpstreamClient>,
        tokens: Arc<dyn TokenProvider>,
        tag_ttl: Duration,
    ) -> Self {
        Self {
            blobs,
            manifests,
            upstream,
            tokens,
            tag_ttl,
        }
    }

    /// Send an authorized request, refreshing the token once on 401.
    async fn send(
        &self,
        method: Method,
        host: &str,
        repository: &str,
        path: &str,
        accept: Option<&str>,
    ) -> Result<Response> {
        let scope = format!("repository:{}:pull", repository);

        let mut refreshed = false;
        loop {
            let token = self.tokens.get_token(host, &scope).await?;

            let mut request = self.upstream.request(method.clone(), host, path);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(token) = &token {
                request = token.apply(request);
            }

            let response = request.send().await.map_err(|e| transport_error(host, e))?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if refreshed {
                return Err(RegistryError::UpstreamRejected {
                    host: host.to_string(),
                    status: 401,
                });
            }

            tracing::info!(host = host, scope = %scope, "Upstream returned 401, refreshing token");
            self.tokens.invalidate(host, &scope).await;
            refreshed = true;
        }
    }

    fn check_status(
        response: Response,
        host: &str,
        not_found: impl FnOnce() -> RegistryError,
    ) -> Result<Response> {
        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(not_found()),
            s => Err(RegistryError::UpstreamRejected {
                host: host.to_string(),
                status: s.as_u16(),
            }),
        }
    }

    fn validate(host: &str, repository: &str) -> Result<()> {
        validate_host(host)?;
        validate_repository(repository)
    }

    /// Name under which a proxied repository's tags and revisions are indexed.
    ///
    /// The upstream host is the first component, so two upstreams serving the
    /// same repository never share a tag. Blobs stay shared across hosts.
    fn index_name(host: &str, repository: &str) -> Result<String> {
        let name = format!("{}/{}", host.to_ascii_lowercase().replace(':', "_"), repository);
        validate_repository(&name)?;
        Ok(name)
    }

    /// Serve a blob from the proxy cache, fetching it upstream on a miss.
    ///
    /// On a miss the upstream body is written to temporary storage while it
    /// streams to the caller. The returned stream ends only after the blob is
    /// verified and committed; a verification failure is its final item.
    pub async fn fetch_blob(&self, host: &str, repository: &str, digest: &Digest) -> Result<ProxyBlob> {
        Self::validate(host, repository)?;

        match self.blobs.open_read(StorageArea::Proxy, digest).await {
            Ok(reader) => {
                tracing::debug!(host = host, digest = %digest, "Proxy blob cache hit");
                return Ok(ProxyBlob::Cached(reader));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        tracing::info!(host = host, repository = repository, digest = %digest, "Proxy blob cache miss, fetching upstream");
        let path = format!("/v2/{}/blobs/{}", repository, digest);
        let response = self.send(Method::GET, host, repository, &path, None).await?;
        let response = Self::check_status(response, host, || RegistryError::blob_not_found(digest))?;

        let size = response.content_length();
        let staged = self.blobs.begin_write(StorageArea::Proxy).await?;
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(TEE_CHANNEL_CAPACITY);

        tokio::spawn(tee_upstream_blob(
            self.blobs.clone(),
            staged,
            response,
            tx,
            digest.clone(),
            host.to_string(),
            size,
        ));

        Ok(ProxyBlob::Streaming {
            size,
            body: ReceiverStream::new(rx).boxed(),
        })
    }

    /// Size of a blob, from the cache or an upstream HEAD. Nothing is cached.
    pub async fn head_blob(&self, host: &str, repository: &str, digest: &Digest) -> Result<BlobInfo> {
        Self::validate(host, repository)?;

        match self.blobs.stat(StorageArea::Proxy, digest).await {
            Ok(blob) => {
                return Ok(BlobInfo {
                    size: Some(blob.size),
                    cached: true,
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let path = format!("/v2/{}/blobs/{}", repository, digest);
        let response = self.send(Method::HEAD, host, repository, &path, None).await?;
        let response = Self::check_status(response, host, || RegistryError::blob_not_found(digest))?;

        // HEAD has no body, so reqwest's content_length() reports zero
        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(BlobInfo { size, cached: false })
    }

    /// Serve a manifest from the proxy cache or upstream.
    ///
    /// Digest references are immutable and always served from cache when
    /// present. Tags are revalidated once older than the tag TTL; if upstream
    /// is unreachable at that point the stale copy is served.
    pub async fn fetch_manifest(
        &self,
        host: &str,
        repository: &str,
        reference: &Reference,
    ) -> Result<ProxiedManifest> {
        Self::validate(host, repository)?;
        let index = Self::index_name(host, repository)?;

        let mut stale = None;
        match reference {
            Reference::Digest(_) => {
                if let Some(manifest) = self.cached_manifest(&index, repository, reference).await? {
                    return Ok(ProxiedManifest { manifest, cached: true });
                }
            }
            Reference::Tag(tag) => {
                if let Some(mapping) = self.manifests.tag_mapping(StorageArea::Proxy, &index, tag).await? {
                    let fresh = mapping
                        .age()
                        .to_std()
                        .map(|age| age < self.tag_ttl)
                        // updated_at in the future: treat as fresh
                        .unwrap_or(true);
                    if let Some(manifest) = self.cached_manifest(&index, repository, reference).await? {
                        if fresh {
                            return Ok(ProxiedManifest { manifest, cached: true });
                        }
                        stale = Some(manifest);
                    }
                }
            }
        }

        match self.fetch_upstream_manifest(host, &index, repository, reference).await {
            Ok(manifest) => Ok(ProxiedManifest { manifest, cached: false }),
            Err(e) => match stale {
                Some(manifest)
                    if matches!(
                        e,
                        RegistryError::UpstreamUnavailable { .. }
                            | RegistryError::UpstreamRejected { .. }
                    ) =>
                {
                    tracing::warn!(
                        host = host,
                        repository = repository,
                        reference = %reference,
                        error = %e,
                        "Upstream revalidation failed, serving stale manifest"
                    );
                    Ok(ProxiedManifest { manifest, cached: true })
                }
                _ => Err(e),
            },
        }
    }

    async fn cached_manifest(
        &self,
        index: &str,
        repository: &str,
        reference: &Reference,
    ) -> Result<Option<Manifest>> {
        match self
            .manifests
            .get_manifest(StorageArea::Proxy, index, reference)
            .await
        {
            Ok(mut manifest) => {
                manifest.repository = repository.to_string();
                Ok(Some(manifest))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_upstream_manifest(
        &self,
        host: &str,
        index: &str,
        repository: &str,
        reference: &Reference,
    ) -> Result<Manifest> {
        let path = format!("/v2/{}/manifests/{}", repository, reference);
        let response = self
            .send(Method::GET, host, repository, &path, Some(DEFAULT_MANIFEST_ACCEPT_HEADER))
            .await?;
        let response = Self::check_status(response, host, || {
            RegistryError::manifest_not_found(repository, &reference.to_string())
        })?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let advertised = match response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            Some(raw) => Some(raw.parse::<Digest>().map_err(|_| RegistryError::UpstreamIntegrity {
                host: host.to_string(),
                reason: format!("unparsable Docker-Content-Digest `{}`", raw),
            })?),
            None => None,
        };

        let content = read_limited(response, host, MAX_MANIFEST_SIZE).await?;

        let algorithm = match (reference, &advertised) {
            (Reference::Digest(d), _) => d.algorithm(),
            (_, Some(d)) => d.algorithm(),
            _ => DigestAlgorithm::default(),
        };
        let computed = Digest::compute(algorithm, &content);

        let expected = match reference {
            Reference::Digest(d) => Some(d),
            Reference::Tag(_) => advertised.as_ref(),
        };
        for expected in expected.into_iter().chain(advertised.as_ref()) {
            if expected.algorithm() == computed.algorithm() && *expected != computed {
                return Err(RegistryError::UpstreamIntegrity {
                    host: host.to_string(),
                    reason: format!("manifest digest {} does not match {}", computed, expected),
                });
            }
        }

        let tag = match reference {
            Reference::Tag(tag) => Some(tag.as_str()),
            Reference::Digest(_) => None,
        };
        match self
            .manifests
            .put_manifest_verified(
                StorageArea::Proxy,
                index,
                &content,
                media_type.as_deref(),
                &computed,
                tag,
            )
            .await
        {
            Ok(_) => {}
            Err(RegistryError::MissingReference(missing)) => {
                // Layers are usually pulled after the manifest; cache on a later pull
                tracing::debug!(
                    repository = repository,
                    missing = %missing,
                    "Proxied manifest not cached yet, referenced blobs absent"
                );
            }
            Err(e) => return Err(e),
        }

        Manifest::from_content(
            repository,
            computed,
            tag.map(str::to_string),
            media_type.as_deref(),
            content,
        )
    }
}

/// Read a response body, failing once it exceeds `limit` bytes.
async fn read_limited(response: Response, host: &str, limit: usize) -> Result<Bytes> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| transport_error(host, e))?;
        if body.len() + chunk.len() > limit {
            return Err(RegistryError::UpstreamIntegrity {
                host: host.to_string(),
                reason: format!("manifest larger than {} bytes", limit),
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

/// Forward upstream bytes to the client while staging them, then commit.
async fn tee_upstream_blob(
    blobs: Arc<dyn BlobStore>,
    mut staged: TempBlob,
    response: Response,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    digest: Digest,
    host: String,
    expected_size: Option<u64>,
) {
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(host = %host, digest = %digest, error = %e, "Upstream blob stream failed");
                discard(&blobs, staged).await;
                let _ = tx.send(Err(std::io::Error::other(transport_error(&host, e)))).await;
                return;
            }
        };

        if let Err(e) = blobs.append(&mut staged, &chunk).await {
            tracing::error!(digest = %digest, error = %e, "Failed to stage proxied blob");
            discard(&blobs, staged).await;
            let _ = tx.send(Err(std::io::Error::other(e))).await;
            return;
        }

        if tx.send(Ok(chunk)).await.is_err() {
            tracing::debug!(digest = %digest, "Client went away, dropping partial proxy blob");
            discard(&blobs, staged).await;
            return;
        }
    }

    if let Some(expected) = expected_size {
        if staged.len() != expected {
            let reason = format!("received {} of {} bytes", staged.len(), expected);
            tracing::warn!(host = %host, digest = %digest, reason = %reason, "Upstream blob truncated");
            discard(&blobs, staged).await;
            let err = RegistryError::UpstreamIntegrity { host, reason };
            let _ = tx.send(Err(std::io::Error::other(err))).await;
            return;
        }
    }

    match blobs.commit(&mut staged, &digest).await {
        Ok(blob) => {
            tracing::info!(host = %host, digest = %digest, size = blob.size, "Cached proxied blob");
        }
        Err(RegistryError::DigestMismatch { expected, actual }) => {
            discard(&blobs, staged).await;
            let err = RegistryError::UpstreamIntegrity {
                host,
                reason: format!("blob digest {} does not match requested {}", actual, expected),
            };
            tracing::error!(error = %err, "Discarded proxied blob");
            let _ = tx.send(Err(std::io::Error::other(err))).await;
        }
        Err(e) => {
            tracing::error!(digest = %digest, error = %e, "Failed to commit proxied blob");
            discard(&blobs, staged).await;
            let _ = tx.send(Err(std::io::Error::other(e))).await;
        }
    }
    // dropping tx ends the client stream
}

async fn discard(blobs: &Arc<dyn BlobStore>, staged: TempBlob) {
    if let Err(e) = blobs.discard(staged).await {
        tracing::error!(error = %e, "Failed to remove staged proxy data");
    }
}
