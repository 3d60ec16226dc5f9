//! Content-addressed storage.
//!
//! [`BlobStore`] is the seam between the registry logic and the backing
//! medium. Writes are staged through a [`TempBlob`] and only become visible
//! once [`BlobStore::commit`] has verified the content against its digest.

pub mod filesystem;
pub mod manifests;
pub mod metadata;

pub use filesystem::FilesystemBlobStore;
pub use manifests::{Manifest, ManifestStore, Reference};
pub use metadata::{ManifestMetadata, TagMapping};

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Which root a blob or manifest lives under.
///
/// Pushed content and pulled-through content never share storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageArea {
    Registry,
    Proxy,
}

impl StorageArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Registry => "registry",
            StorageArea::Proxy => "proxy",
        }
    }
}

/// A committed, immutable blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: Digest,
    pub size: u64,
    pub area: StorageArea,
}

/// Handle to content being staged in temporary storage.
///
/// Created by [`BlobStore::begin_write`]; consumed by a successful commit or
/// by [`BlobStore::discard`].
#[derive(Debug)]
pub struct TempBlob {
    id: Uuid,
    area: StorageArea,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    len: u64,
    committed: bool,
}

impl TempBlob {
    pub(crate) fn new(id: Uuid, area: StorageArea, path: PathBuf, file: tokio::fs::File) -> Self {
        Self {
            id,
            area,
            path,
            file: Some(file),
            len: 0,
            committed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn area(&self) -> StorageArea {
        self.area
    }

    /// Bytes staged so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Readable view of a committed blob.
pub struct BlobReader {
    pub size: u64,
    pub reader: BoxedReader,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader").field("size", &self.size).finish()
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Open a new staging handle in temporary storage.
    async fn begin_write(&self, area: StorageArea) -> Result<TempBlob>;

    /// Append bytes to a staging handle.
    async fn append(&self, handle: &mut TempBlob, chunk: &[u8]) -> Result<()>;

    /// Cut staged content back to `len` bytes.
    async fn truncate(&self, handle: &mut TempBlob, len: u64) -> Result<()>;

    /// Verify staged content against `expected` and publish it atomically.
    ///
    /// On `DigestMismatch` the staged content is left in place so the caller
    /// can keep appending or discard it. Committing a digest that already
    /// exists succeeds without rewriting it.
    async fn commit(&self, handle: &mut TempBlob, expected: &Digest) -> Result<Blob>;

    /// Drop staged content. No-op for an already committed handle.
    async fn discard(&self, handle: TempBlob) -> Result<()>;

    async fn open_read(&self, area: StorageArea, digest: &Digest) -> Result<BlobReader>;

    async fn stat(&self, area: StorageArea, digest: &Digest) -> Result<Blob>;

    async fn exists(&self, area: StorageArea, digest: &Digest) -> Result<bool> {
        match self.stat(area, digest).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read a small index document (tag and revision records).
    async fn read_metadata(&self, area: StorageArea, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a small index document atomically.
    async fn write_metadata(&self, area: StorageArea, key: &str, data: &[u8]) -> Result<()>;

    /// Stage, verify and commit an in-memory buffer.
    async fn write_all(&self, area: StorageArea, data: &[u8], expected: &Digest) -> Result<Blob> {
        let mut handle = self.begin_write(area).await?;
        let result = match self.append(&mut handle, data).await {
            Ok(()) => self.commit(&mut handle, expected).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.discard(handle).await?;
        }
        result
    }
}

/// Check a repository name: slash separated components of lowercase
/// alphanumerics joined by single `.`, `_` or `-`.
pub fn validate_repository(name: &str) -> Result<()> {
    let invalid = || RegistryError::InvalidName(name.to_string());

    if name.is_empty() || name.len() > 255 {
        return Err(invalid());
    }

    for component in name.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(invalid());
        }
        let bytes = component.as_bytes();
        let separator = |b: u8| matches!(b, b'.' | b'_' | b'-');
        if separator(bytes[0]) || separator(bytes[bytes.len() - 1]) {
            return Err(invalid());
        }
        let mut previous_separator = false;
        for &b in bytes {
            match b {
                b'a'..=b'z' | b'0'..=b'9' => previous_separator = false,
                // "__" is the one doubled separator the distribution grammar allows
                b'_' if previous_separator => {}
                b if separator(b) => {
                    if previous_separator && b != b'_' {
                        return Err(invalid());
                    }
                    previous_separator = true;
                }
                _ => return Err(invalid()),
            }
        }
    }

    Ok(())
}

/// Check a tag: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<()> {
    let bytes = tag.as_bytes();
    let valid = !bytes.is_empty()
        && bytes.len() <= 128
        && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::ManifestInvalid(format!("invalid tag `{}`", tag)))
    }
}

/// Check an upstream host (`name[:port]`).
pub fn validate_host(host: &str) -> Result<()> {
    let valid = !host.is_empty()
        && !host.starts_with('.')
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':'));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        for ok in ["library/alpine", "a", "my-org/my_app", "a.b/c__d", "x/y/z-1"] {
            assert!(validate_repository(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", "../etc", "a/../b", "A/b", "a//b", "-a", "a-", "a/b/", "a..b", "a b"] {
            assert!(validate_repository(bad).is_err(), "{} should be invalid", bad);
        }
    }

    #[test]
    fn tags() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("v1.2.3-rc_1").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag("a/b").is_err());
        assert!(validate_tag(&"x".repeat(129)).is_err());
    }
}
