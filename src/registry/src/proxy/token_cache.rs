use super::auth::{AuthChallenge, AuthScheme};
use super::upstream::{transport_error, UpstreamClient};
use crate::config::DEFAULT_TOKEN_EXPIRY_SECS;
use crate::error::{RegistryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Credential to attach to upstream requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Bearer(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamToken {
    pub kind: TokenKind,
    /// Informational only; tokens are dropped when upstream rejects them
    pub expires_at: Option<DateTime<Utc>>,
}

impl UpstreamToken {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.kind {
            TokenKind::Bearer(token) => request.bearer_auth(token),
            TokenKind::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

/// Source of upstream credentials, keyed by host and scope.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `None` means the upstream allows anonymous access.
    async fn get_token(&self, host: &str, scope: &str) -> Result<Option<UpstreamToken>>;

    /// Forget the cached token so the next `get_token` acquires a fresh one.
    async fn invalidate(&self, host: &str, scope: &str);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    issued_at: Option<String>,
}

type TokenKey = (String, String);

/// Caches upstream tokens per (host, scope).
///
/// Tokens are never expired in the background. Concurrent misses for the same
/// key wait on a per-key lock so only one token request goes out; the lock is
/// dropped again once nobody holds or waits on it.
pub struct TokenCache {
    upstream: Arc<UpstreamClient>,
    tokens: RwLock<HashMap<TokenKey, UpstreamToken>>,
    challenges: RwLock<HashMap<String, Option<AuthChallenge>>>,
    in_flight: Mutex<HashMap<TokenKey, Arc<Mutex<()>>>>,
}

impl TokenCache {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self {
            upstream,
            tokens: RwLock::new(HashMap::new()),
            challenges: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn cached(&self, key: &TokenKey) -> Option<UpstreamToken> {
        self.tokens.read().await.get(key).cloned()
    }

    async fn key_lock(&self, key: &TokenKey) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-key lock once no other request holds or waits on it.
    async fn release_key_lock(&self, key: &TokenKey, lock: &Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        let idle = in_flight
            .get(key)
            // one reference in the map, one held by the caller
            .map(|current| Arc::ptr_eq(current, lock) && Arc::strong_count(lock) == 2)
            .unwrap_or(false);
        if idle {
            in_flight.remove(key);
        }
    }

    /// Number of keys with an acquisition lock outstanding.
    pub async fn pending_acquisitions(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Challenge the host presents on `GET /v2/`, cached per host.
    async fn challenge(&self, host: &str) -> Result<Option<AuthChallenge>> {
        if let Some(known) = self.challenges.read().await.get(host) {
            return Ok(known.clone());
        }

        let response = self
            .upstream
            .request(Method::GET, host, "/v2/")
            .send()
            .await
            .map_err(|e| transport_error(host, e))?;

        let challenge = match response.status() {
            s if s.is_success() => None,
            StatusCode::UNAUTHORIZED => {
                let header = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                match AuthChallenge::parse(header) {
                    Some(c) => Some(c),
                    None => {
                        tracing::warn!(host = host, header = header, "Unusable auth challenge");
                        return Err(RegistryError::UpstreamRejected {
                            host: host.to_string(),
                            status: 401,
                        });
                    }
                }
            }
            other => {
                return Err(RegistryError::UpstreamRejected {
                    host: host.to_string(),
                    status: other.as_u16(),
                })
            }
        };

        tracing::debug!(
            host = host,
            scheme = ?challenge.as_ref().map(|c| c.scheme),
            "Discovered upstream auth challenge"
        );
        self.challenges
            .write()
            .await
            .insert(host.to_string(), challenge.clone());
        Ok(challenge)
    }

    async fn request_token(
        &self,
        host: &str,
        challenge: &AuthChallenge,
        scope: &str,
    ) -> Result<UpstreamToken> {
        let realm = challenge.realm().ok_or_else(|| RegistryError::UpstreamRejected {
            host: host.to_string(),
            status: 401,
        })?;

        let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
        if let Some(service) = challenge.service() {
            query.push(("service", service));
        }

        let mut request = self.upstream.client().get(realm).query(&query);
        if let Some(auth) = self.upstream.credentials(host) {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        tracing::debug!(host = host, realm = realm, scope = scope, "Requesting upstream token");
        let response = request.send().await.map_err(|e| transport_error(host, e))?;
        if !response.status().is_success() {
            return Err(RegistryError::UpstreamRejected {
                host: host.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| transport_error(host, e))?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty() && t != "unauthenticated")
            .ok_or_else(|| RegistryError::UpstreamRejected {
                host: host.to_string(),
                status: 401,
            })?;

        let issued_at = body
            .issued_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let lifetime = body.expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
        let expires_at = issued_at + chrono::Duration::seconds(lifetime as i64);

        Ok(UpstreamToken {
            kind: TokenKind::Bearer(token),
            expires_at: Some(expires_at),
        })
    }

    /// Acquire a token for `key`; the caller holds the key's lock.
    async fn acquire(&self, key: &TokenKey, host: &str, scope: &str) -> Result<Option<UpstreamToken>> {
        // Someone else may have filled it while we waited
        if let Some(token) = self.cached(key).await {
            tracing::debug!(host = host, scope = scope, "Token acquired by concurrent request");
            return Ok(Some(token));
        }

        let token = match self.challenge(host).await? {
            None => return Ok(None),
            Some(challenge) => match challenge.scheme {
                AuthScheme::Basic => {
                    let auth = self.upstream.credentials(host).ok_or_else(|| {
                        RegistryError::UpstreamRejected {
                            host: host.to_string(),
                            status: 401,
                        }
                    })?;
                    UpstreamToken {
                        kind: TokenKind::Basic {
                            username: auth.username.clone(),
                            password: auth.password.clone(),
                        },
                        expires_at: None,
                    }
                }
                AuthScheme::Bearer => self.request_token(host, &challenge, scope).await?,
            },
        };

        tracing::info!(host = host, scope = scope, expires_at = ?token.expires_at, "Cached upstream token");
        self.tokens.write().await.insert(key.clone(), token.clone());
        Ok(Some(token))
    }
}

#[async_trait]
impl TokenProvider for TokenCache {
    async fn get_token(&self, host: &str, scope: &str) -> Result<Option<UpstreamToken>> {
        let key = (host.to_string(), scope.to_string());
        if let Some(token) = self.cached(&key).await {
            return Ok(Some(token));
        }

        let lock = self.key_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.acquire(&key, host, scope).await
        };
        self.release_key_lock(&key, &lock).await;
        result
    }

    async fn invalidate(&self, host: &str, scope: &str) {
        let key = (host.to_string(), scope.to_string());
        if self.tokens.write().await.remove(&key).is_some() {
            tracing::debug!(host = host, scope = scope, "Invalidated upstream token");
        }
        // The challenge may have changed too (e.g. registry enabled auth)
        self.challenges.write().await.remove(host);
    }
}
