use crate::digest::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Revision record kept next to every stored manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Tag to digest mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMapping {
    pub digest: Digest,
    pub updated_at: DateTime<Utc>,
}

impl TagMapping {
    pub fn new(digest: Digest) -> Self {
        Self {
            digest,
            updated_at: Utc::now(),
        }
    }

    /// Time since the tag was last written or revalidated
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.updated_at)
    }
}
