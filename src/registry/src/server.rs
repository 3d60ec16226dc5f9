use crate::config::Config;
use crate::error::{RegistryError, Result};
use crate::handlers::{
    blobs, manifests, parse_v2_path, uploads, ApiError, AppState, Target, V2Route,
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

type Params = Query<HashMap<String, String>>;

fn route(uri: &Uri) -> std::result::Result<V2Route, ApiError> {
    let route = parse_v2_path(uri.path()).ok_or_else(|| ApiError::unknown_route(uri.path()))?;
    tracing::debug!(path = %uri.path(), route = ?route, "Parsed v2 request path");
    Ok(route)
}

/// Repository name for a write; pull-through names are read-only.
fn local_name(name: &str) -> std::result::Result<String, ApiError> {
    match Target::parse(name)? {
        Target::Local(name) => Ok(name),
        Target::Proxy { .. } => Err(ApiError::unsupported("proxied repositories are read-only")),
    }
}

fn into_response(result: std::result::Result<Response, ApiError>) -> Response {
    result.unwrap_or_else(IntoResponse::into_response)
}

// Names span several segments, so every /v2/ route is parsed here rather than by axum
async fn get_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    let result = async {
        match route(&uri)? {
            V2Route::Blob { name, digest } => blobs::get_blob(&state, Target::parse(&name)?, &digest).await,
            V2Route::Manifest { name, reference } => {
                manifests::get_manifest(&state, Target::parse(&name)?, &reference, false).await
            }
            V2Route::Upload { name, id } => uploads::upload_status(&state, &local_name(&name)?, &id).await,
            V2Route::Uploads { .. } => Err(ApiError::unsupported("GET on the uploads collection")),
        }
    }
    .await;
    into_response(result)
}

async fn head_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    let result = async {
        match route(&uri)? {
            V2Route::Blob { name, digest } => blobs::head_blob(&state, Target::parse(&name)?, &digest).await,
            V2Route::Manifest { name, reference } => {
                manifests::get_manifest(&state, Target::parse(&name)?, &reference, true).await
            }
            _ => Err(ApiError::unsupported("HEAD is only defined for blobs and manifests")),
        }
    }
    .await;
    into_response(result)
}

async fn post_v2_wrapper(State(state): State<AppState>, uri: Uri, Query(params): Params) -> Response {
    let result = async {
        match route(&uri)? {
            V2Route::Uploads { name } => uploads::start_upload(&state, &local_name(&name)?, &params).await,
            _ => Err(ApiError::unsupported("POST is only defined for blob uploads")),
        }
    }
    .await;
    into_response(result)
}

async fn patch_v2_wrapper(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let result = async {
        match route(&uri)? {
            V2Route::Upload { name, id } => {
                uploads::patch_upload(&state, &local_name(&name)?, &id, &headers, body).await
            }
            _ => Err(ApiError::unsupported("PATCH is only defined for blob uploads")),
        }
    }
    .await;
    into_response(result)
}

async fn put_v2_wrapper(
    State(state): State<AppState>,
    uri: Uri,
    Query(params): Params,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let result = async {
        match route(&uri)? {
            V2Route::Upload { name, id } => {
                uploads::complete_upload(&state, &local_name(&name)?, &id, &params, body).await
            }
            V2Route::Manifest { name, reference } => {
                manifests::put_manifest(&state, &local_name(&name)?, &reference, &headers, body).await
            }
            _ => Err(ApiError::unsupported("PUT is only defined for uploads and manifests")),
        }
    }
    .await;
    into_response(result)
}

async fn delete_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    let result = async {
        match route(&uri)? {
            V2Route::Upload { name, id } => uploads::cancel_upload(&state, &local_name(&name)?, &id).await,
            _ => Err(ApiError::unsupported("deletion is not supported")),
        }
    }
    .await;
    into_response(result)
}

async fn api_version() -> impl IntoResponse {
    tracing::debug!("GET /v2/ - API version request");
    (StatusCode::OK, "{}")
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route("/v2", get(api_version))
        .route(
            "/v2/*path",
            get(get_v2_wrapper)
                .head(head_v2_wrapper)
                .post(post_v2_wrapper)
                .patch(patch_v2_wrapper)
                .put(put_v2_wrapper)
                .delete(delete_v2_wrapper),
        )
        .route("/health", get(health))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("docker-distribution-api-version"),
            HeaderValue::from_static("registry/2.0"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running server and its background tasks.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub server: JoinHandle<()>,
    pub sweeper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn abort(&self) {
        self.server.abort();
        self.sweeper.abort();
    }
}

/// Validate the configuration, bind the listener and serve in the background.
pub async fn start_server(config: Config) -> Result<ServerHandle> {
    config.validate()?;
    tracing::info!(
        registry_storage = %config.storage.registry_storage.display(),
        proxy_storage = %config.storage.proxy_storage.display(),
        temporary_storage = %config.storage.temporary_storage.display(),
        "Storage roots ready"
    );

    let bind = format!("{}:{}", config.server.bind_address, config.server.port);
    let sweep_interval = Duration::from_secs(config.uploads.sweep_interval_secs);
    let state = AppState::new(config)?;

    let sweeper = state.uploads.clone().spawn_sweeper(sweep_interval);

    let listener = tokio::net::TcpListener::bind(&bind).await.map_err(|e| {
        RegistryError::ConfigurationInvalid(format!("cannot bind {}: {}", bind, e))
    })?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "Registry listening");

    let app = build_router(state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        server,
        sweeper,
    })
}
