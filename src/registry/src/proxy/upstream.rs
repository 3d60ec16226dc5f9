use crate::config::{RegistryAuth, UpstreamConfig};
use crate::dns::ipv4_first_resolver;
use crate::error::{RegistryError, Result};
use reqwest::{Client, Method, RequestBuilder};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// HTTP client shared by all upstream registry requests
pub struct UpstreamClient {
    client: Client,
    insecure_registries: HashSet<String>,
    credentials: HashMap<String, RegistryAuth>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        if config.prefer_ipv4 {
            builder = builder.dns_resolver(ipv4_first_resolver());
        }

        Ok(Self {
            client: builder.build()?,
            insecure_registries: config.insecure_registries.iter().cloned().collect(),
            credentials: config.credentials.clone(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `https://<host>`, or `http://<host>` for hosts listed as insecure
    pub fn base_url(&self, host: &str) -> String {
        if self.insecure_registries.contains(host) {
            format!("http://{}", host)
        } else {
            format!("https://{}", host)
        }
    }

    pub fn request(&self, method: Method, host: &str, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url(host), path))
    }

    pub fn credentials(&self, host: &str) -> Option<&RegistryAuth> {
        self.credentials.get(host)
    }
}

/// Classify a transport failure talking to `host`.
pub fn transport_error(host: &str, err: reqwest::Error) -> RegistryError {
    let reason = if err.is_timeout() {
        "timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    };
    RegistryError::UpstreamUnavailable {
        host: host.to_string(),
        reason,
    }
}
