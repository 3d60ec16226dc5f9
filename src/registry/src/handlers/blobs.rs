use super::{cache_status, ApiError, AppState, Target, DOCKER_CONTENT_DIGEST, X_CACHE};
use crate::digest::Digest;
use crate::storage::{validate_repository, StorageArea};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use tokio_util::io::ReaderStream;

fn blob_response(digest: &Digest, size: Option<u64>, body: Body) -> Result<Response, ApiError> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(DOCKER_CONTENT_DIGEST, digest.to_string());
    if let Some(size) = size {
        builder = builder.header(header::CONTENT_LENGTH, size);
    }
    builder.body(body).map_err(ApiError::from)
}

/// GET /v2/<name>/blobs/<digest>
pub async fn get_blob(state: &AppState, target: Target, digest: &str) -> Result<Response, ApiError> {
    let digest: Digest = digest.parse()?;

    match target {
        Target::Local(name) => {
            validate_repository(&name)?;
            let blob = state.blobs.open_read(StorageArea::Registry, &digest).await?;
            tracing::debug!(repository = %name, digest = %digest, size = blob.size, "Serving blob");
            blob_response(
                &digest,
                Some(blob.size),
                Body::from_stream(ReaderStream::new(blob.reader)),
            )
        }
        Target::Proxy { host, repository } => {
            let blob = state.proxy.fetch_blob(&host, &repository, &digest).await?;
            let hit = blob.is_cached();
            let size = blob.size();
            let mut response = blob_response(&digest, size, Body::from_stream(blob.into_stream()))?;
            response.headers_mut().insert(X_CACHE, cache_status(hit));
            Ok(response)
        }
    }
}

/// HEAD /v2/<name>/blobs/<digest>
pub async fn head_blob(state: &AppState, target: Target, digest: &str) -> Result<Response, ApiError> {
    let digest: Digest = digest.parse()?;

    match target {
        Target::Local(name) => {
            validate_repository(&name)?;
            let blob = state.blobs.stat(StorageArea::Registry, &digest).await?;
            blob_response(&digest, Some(blob.size), Body::empty())
        }
        Target::Proxy { host, repository } => {
            let info = state.proxy.head_blob(&host, &repository, &digest).await?;
            let mut response = blob_response(&digest, info.size, Body::empty())?;
            response.headers_mut().insert(X_CACHE, cache_status(info.cached));
            Ok(response)
        }
    }
}
