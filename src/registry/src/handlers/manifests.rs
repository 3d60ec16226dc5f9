use super::{cache_status, ApiError, AppState, Target, DOCKER_CONTENT_DIGEST, X_CACHE};
use crate::config::MAX_MANIFEST_SIZE;
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::storage::{Reference, StorageArea};
use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;

fn manifest_response(
    digest: &Digest,
    media_type: &str,
    size: u64,
    body: Body,
) -> Result<Response, ApiError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, size)
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(body)
        .map_err(ApiError::from)
}

/// GET and HEAD /v2/<name>/manifests/<reference>
pub async fn get_manifest(
    state: &AppState,
    target: Target,
    reference: &str,
    head: bool,
) -> Result<Response, ApiError> {
    let reference: Reference = reference.parse()?;

    match target {
        Target::Local(name) => {
            if head {
                let record = state
                    .manifests
                    .resolve(StorageArea::Registry, &name, &reference)
                    .await?;
                return manifest_response(&record.digest, &record.media_type, record.size, Body::empty());
            }

            let manifest = state
                .manifests
                .get_manifest(StorageArea::Registry, &name, &reference)
                .await?;
            tracing::debug!(repository = %name, digest = %manifest.digest, "Serving manifest");
            manifest_response(
                &manifest.digest,
                &manifest.media_type,
                manifest.content.len() as u64,
                Body::from(manifest.content),
            )
        }
        Target::Proxy { host, repository } => {
            let proxied = state
                .proxy
                .fetch_manifest(&host, &repository, &reference)
                .await?;
            let manifest = proxied.manifest;
            let size = manifest.content.len() as u64;
            let body = if head {
                Body::empty()
            } else {
                Body::from(manifest.content)
            };
            let mut response = manifest_response(&manifest.digest, &manifest.media_type, size, body)?;
            response
                .headers_mut()
                .insert(X_CACHE, cache_status(proxied.cached));
            Ok(response)
        }
    }
}

/// PUT /v2/<name>/manifests/<reference>
pub async fn put_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let reference: Reference = reference.parse()?;
    let content = axum::body::to_bytes(body, MAX_MANIFEST_SIZE)
        .await
        .map_err(|e| RegistryError::ManifestInvalid(format!("unreadable body: {}", e)))?;
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let digest = state
        .manifests
        .put_by_reference(StorageArea::Registry, name, &content, media_type, &reference)
        .await?;

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{}/manifests/{}", name, digest))
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .header(header::CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(ApiError::from)
}
