use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default listening port (the conventional registry port)
pub const DEFAULT_PORT: u16 = 5000;

/// Accept header sent upstream for manifest requests.
/// Lists first so multi-arch references resolve to the index, not one platform.
pub const DEFAULT_MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Media type assumed when neither the client nor the body declares one
pub const DEFAULT_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Token lifetime assumed when the auth server omits `expires_in`
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 60;

/// Largest manifest body accepted from clients or upstreams (4 MiB)
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// The three storage roots. All are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Blobs and manifests pushed by clients
    pub registry_storage: PathBuf,
    /// Staging area for in-progress uploads and proxy fetches
    pub temporary_storage: PathBuf,
    /// Content pulled through from upstream registries
    pub proxy_storage: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Idle time after which an upload session expires
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// How often the expiry sweep runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_session_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Deadline for a whole upstream request, body included
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Resolve upstream hosts to IPv4 addresses first
    #[serde(default = "default_true")]
    pub prefer_ipv4: bool,
    /// Hosts reached over plain HTTP instead of HTTPS
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    /// Basic credentials per upstream host
    #[serde(default)]
    pub credentials: HashMap<String, RegistryAuth>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            insecure_skip_verify: false,
            prefer_ipv4: true,
            insecure_registries: Vec::new(),
            credentials: HashMap::new(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    600 // large layers
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Age after which a cached tag is revalidated against upstream
    #[serde(default = "default_tag_ttl_secs")]
    pub tag_ttl_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tag_ttl_secs: default_tag_ttl_secs(),
        }
    }
}

fn default_tag_ttl_secs() -> u64 {
    300
}

impl Config {
    /// Configuration with default settings around the given storage roots
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            server: ServerConfig::default(),
            storage,
            uploads: UploadConfig::default(),
            upstream: UpstreamConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }

    /// Read a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::ConfigurationInvalid(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RegistryError::ConfigurationInvalid(e.to_string()))
    }

    /// Create the storage roots and check they can back atomic commits.
    ///
    /// Commits rename files out of the temporary root, so every root must be a
    /// distinct directory on the same filesystem as the temporary root.
    pub fn validate(&self) -> Result<()> {
        let roots = [
            ("registry_storage", &self.storage.registry_storage),
            ("temporary_storage", &self.storage.temporary_storage),
            ("proxy_storage", &self.storage.proxy_storage),
        ];

        for (name, path) in roots {
            if path.as_os_str().is_empty() {
                return Err(RegistryError::ConfigurationInvalid(format!(
                    "storage.{} must be set",
                    name
                )));
            }
            std::fs::create_dir_all(path).map_err(|e| {
                RegistryError::ConfigurationInvalid(format!(
                    "storage.{} ({}) cannot be created: {}",
                    name,
                    path.display(),
                    e
                ))
            })?;
            if !path.is_dir() {
                return Err(RegistryError::ConfigurationInvalid(format!(
                    "storage.{} ({}) is not a directory",
                    name,
                    path.display()
                )));
            }
        }

        let canonical: Vec<PathBuf> = roots
            .iter()
            .map(|(_, p)| std::fs::canonicalize(p))
            .collect::<std::io::Result<_>>()
            .map_err(|e| RegistryError::ConfigurationInvalid(e.to_string()))?;

        for i in 0..canonical.len() {
            for j in 0..canonical.len() {
                if i != j && canonical[i].starts_with(&canonical[j]) {
                    return Err(RegistryError::ConfigurationInvalid(format!(
                        "storage.{} must not live inside storage.{}",
                        roots[i].0, roots[j].0
                    )));
                }
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let temp_dev = std::fs::metadata(&self.storage.temporary_storage)?.dev();
            for (name, path) in [roots[0], roots[2]] {
                if std::fs::metadata(path)?.dev() != temp_dev {
                    return Err(RegistryError::ConfigurationInvalid(format!(
                        "storage.{} and storage.temporary_storage must share a filesystem",
                        name
                    )));
                }
            }
        }

        if self.uploads.session_timeout_secs == 0 || self.uploads.sweep_interval_secs == 0 {
            return Err(RegistryError::ConfigurationInvalid(
                "uploads.session_timeout_secs and uploads.sweep_interval_secs must be positive"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
