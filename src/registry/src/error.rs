use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {name}")]
    NotFound { kind: NotFoundKind, name: String },

    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid repository name: {0}")]
    InvalidName(String),

    #[error("Range mismatch: chunk starts at {requested}, upload is at {current}")]
    RangeMismatch { requested: u64, current: u64 },

    #[error("Upload session {0} is busy with another request")]
    SessionBusy(String),

    #[error("Cannot {event} upload session in state {state}")]
    InvalidState {
        state: &'static str,
        event: &'static str,
    },

    #[error("Manifest references unknown blob {0}")]
    MissingReference(String),

    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("Upstream {host} unavailable: {reason}")]
    UpstreamUnavailable { host: String, reason: String },

    #[error("Upstream {host} rejected request with status {status}")]
    UpstreamRejected { host: String, status: u16 },

    #[error("Upstream {host} served content failing verification: {reason}")]
    UpstreamIntegrity { host: String, reason: String },
}

/// Object family reported by [`RegistryError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Blob,
    Manifest,
    Upload,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotFoundKind::Blob => "Blob",
            NotFoundKind::Manifest => "Manifest",
            NotFoundKind::Upload => "Upload session",
        };
        f.write_str(name)
    }
}

impl RegistryError {
    pub fn blob_not_found(digest: impl ToString) -> Self {
        RegistryError::NotFound {
            kind: NotFoundKind::Blob,
            name: digest.to_string(),
        }
    }

    pub fn manifest_not_found(repository: &str, reference: &str) -> Self {
        RegistryError::NotFound {
            kind: NotFoundKind::Manifest,
            name: format!("{}:{}", repository, reference),
        }
    }

    pub fn upload_not_found(id: impl ToString) -> Self {
        RegistryError::NotFound {
            kind: NotFoundKind::Upload,
            name: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}
