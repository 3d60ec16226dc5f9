use super::{ApiError, AppState, DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::uploads::UploadId;
use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use std::collections::HashMap;

/// `Range` header value for an upload holding `offset` bytes.
pub fn range_header(offset: u64) -> String {
    format!("0-{}", offset.saturating_sub(1))
}

fn parse_upload_id(id: &str) -> Result<UploadId, ApiError> {
    id.parse()
        .map_err(|_| RegistryError::upload_not_found(id).into())
}

/// `Content-Range: <start>-<end>`; the start is the chunk's offset.
fn parse_content_range(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let invalid = || {
        ApiError::new(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "BLOB_UPLOAD_INVALID",
            "malformed Content-Range",
        )
    };
    let raw = value.to_str().map_err(|_| invalid())?;
    let raw = raw.strip_prefix("bytes ").unwrap_or(raw);
    let (start, _end) = raw.split_once('-').ok_or_else(invalid)?;
    start.trim().parse().map(Some).map_err(|_| invalid())
}

fn accepted(name: &str, id: &UploadId, offset: u64, status: StatusCode) -> Result<Response, ApiError> {
    Response::builder()
        .status(status)
        .header(header::LOCATION, format!("/v2/{}/blobs/uploads/{}", name, id))
        .header(header::RANGE, range_header(offset))
        .header(DOCKER_UPLOAD_UUID, id.to_string())
        .header(header::CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(ApiError::from)
}

/// POST /v2/<name>/blobs/uploads/
pub async fn start_upload(
    state: &AppState,
    name: &str,
    query: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    if query.contains_key("digest") {
        return Err(ApiError::not_implemented(
            "monolithic uploads are not supported, use a chunked upload",
        ));
    }

    let id = state.uploads.initiate(name).await?;
    accepted(name, &id, 0, StatusCode::ACCEPTED)
}

/// PATCH /v2/<name>/blobs/uploads/<id>
pub async fn patch_upload(
    state: &AppState,
    name: &str,
    id: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let id = parse_upload_id(id)?;
    let offset = parse_content_range(headers)?;

    let offset = state
        .uploads
        .append_stream(name, &id, offset, body.into_data_stream())
        .await?;
    accepted(name, &id, offset, StatusCode::ACCEPTED)
}

/// PUT /v2/<name>/blobs/uploads/<id>?digest=<digest>
pub async fn complete_upload(
    state: &AppState,
    name: &str,
    id: &str,
    query: &HashMap<String, String>,
    body: Body,
) -> Result<Response, ApiError> {
    let id = parse_upload_id(id)?;
    let digest: Digest = query
        .get("digest")
        .ok_or_else(|| RegistryError::InvalidDigest("digest query parameter is required".to_string()))?
        .parse()?;

    let blob = state
        .uploads
        .commit_with_chunk(name, &id, &digest, body.into_data_stream())
        .await?;

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{}/blobs/{}", name, blob.digest))
        .header(DOCKER_CONTENT_DIGEST, blob.digest.to_string())
        .header(header::CONTENT_LENGTH, 0)
        .body(Body::empty())
        .map_err(ApiError::from)
}

/// GET /v2/<name>/blobs/uploads/<id>
pub async fn upload_status(state: &AppState, name: &str, id: &str) -> Result<Response, ApiError> {
    let id = parse_upload_id(id)?;
    let status = state.uploads.status(name, &id).await?;
    accepted(name, &id, status.offset, StatusCode::NO_CONTENT)
}

/// DELETE /v2/<name>/blobs/uploads/<id>
pub async fn cancel_upload(state: &AppState, name: &str, id: &str) -> Result<Response, ApiError> {
    let id = parse_upload_id(id)?;
    state.uploads.cancel(name, &id).await?;
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn range_values() {
        assert_eq!(range_header(0), "0-0");
        assert_eq!(range_header(1), "0-0");
        assert_eq!(range_header(1024), "0-1023");
    }

    #[test]
    fn content_range_start() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_content_range(&headers).unwrap(), None);
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("100-199"));
        assert_eq!(parse_content_range(&headers).unwrap(), Some(100));
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 0-9"));
        assert_eq!(parse_content_range(&headers).unwrap(), Some(0));
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("garbage"));
        assert!(parse_content_range(&headers).is_err());
    }
}
