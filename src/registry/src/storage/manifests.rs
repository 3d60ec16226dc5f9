use super::metadata::{ManifestMetadata, TagMapping};
use super::{validate_repository, validate_tag, BlobStore, StorageArea};
use crate::config::{DEFAULT_MANIFEST_MEDIA_TYPE, MAX_MANIFEST_SIZE};
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{RegistryError, Result};
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// A manifest reference: a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains(':') {
            Ok(Reference::Digest(s.parse()?))
        } else {
            validate_tag(s)?;
            Ok(Reference::Tag(s.to_string()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{}", digest),
        }
    }
}

/// A stored manifest together with its body.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub repository: String,
    pub digest: Digest,
    pub tag: Option<String>,
    pub media_type: String,
    pub references: Vec<Digest>,
    pub content: Bytes,
}

impl Manifest {
    /// Build a manifest from a body that has already been verified.
    pub fn from_content(
        repository: &str,
        digest: Digest,
        tag: Option<String>,
        media_type: Option<&str>,
        content: Bytes,
    ) -> Result<Self> {
        let parsed = parse_manifest(&content)?;
        let media_type = resolve_media_type(media_type, &parsed);
        let references = referenced_digests(&parsed)?;
        Ok(Self {
            repository: repository.to_string(),
            digest,
            tag,
            media_type,
            references,
            content,
        })
    }
}

/// Manifests and tag index on top of a [`BlobStore`].
pub struct ManifestStore {
    blobs: Arc<dyn BlobStore>,
}

impl ManifestStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn revision_key(repository: &str, digest: &Digest) -> String {
        format!(
            "repositories/{}/_manifests/revisions/{}/{}.json",
            repository,
            digest.algorithm(),
            digest.hex()
        )
    }

    fn tag_key(repository: &str, tag: &str) -> String {
        format!("repositories/{}/_manifests/tags/{}.json", repository, tag)
    }

    /// Store a manifest body, optionally pointing `tag` at it.
    ///
    /// Every blob the manifest references must already exist in `area`;
    /// otherwise nothing is written.
    pub async fn put_manifest(
        &self,
        area: StorageArea,
        repository: &str,
        content: &[u8],
        media_type: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Digest> {
        self.store(area, repository, content, media_type, tag, DigestAlgorithm::default())
            .await
    }

    /// Store a manifest pushed by digest; the body must hash to `expected`.
    pub async fn put_manifest_by_digest(
        &self,
        area: StorageArea,
        repository: &str,
        content: &[u8],
        media_type: Option<&str>,
        expected: &Digest,
    ) -> Result<Digest> {
        self.put_manifest_verified(area, repository, content, media_type, expected, None)
            .await
    }

    /// Store a body that must hash to `expected`, optionally tagging it.
    pub async fn put_manifest_verified(
        &self,
        area: StorageArea,
        repository: &str,
        content: &[u8],
        media_type: Option<&str>,
        expected: &Digest,
        tag: Option<&str>,
    ) -> Result<Digest> {
        let computed = Digest::compute(expected.algorithm(), content);
        expected.verify(&computed)?;
        self.store(area, repository, content, media_type, tag, expected.algorithm())
            .await
    }

    /// Dispatch on the reference form used in a PUT URL.
    pub async fn put_by_reference(
        &self,
        area: StorageArea,
        repository: &str,
        content: &[u8],
        media_type: Option<&str>,
        reference: &Reference,
    ) -> Result<Digest> {
        match reference {
            Reference::Tag(tag) => {
                self.put_manifest(area, repository, content, media_type, Some(tag))
                    .await
            }
            Reference::Digest(digest) => {
                self.put_manifest_by_digest(area, repository, content, media_type, digest)
                    .await
            }
        }
    }

    async fn store(
        &self,
        area: StorageArea,
        repository: &str,
        content: &[u8],
        media_type: Option<&str>,
        tag: Option<&str>,
        algorithm: DigestAlgorithm,
    ) -> Result<Digest> {
        validate_repository(repository)?;
        if let Some(tag) = tag {
            validate_tag(tag)?;
        }
        if content.len() > MAX_MANIFEST_SIZE {
            return Err(RegistryError::ManifestInvalid(format!(
                "manifest of {} bytes exceeds the {} byte limit",
                content.len(),
                MAX_MANIFEST_SIZE
            )));
        }

        let parsed = parse_manifest(content)?;
        for reference in referenced_digests(&parsed)? {
            if !self.blobs.exists(area, &reference).await? {
                tracing::debug!(
                    repository = repository,
                    reference = %reference,
                    "Manifest rejected, referenced blob absent"
                );
                return Err(RegistryError::MissingReference(reference.to_string()));
            }
        }

        let digest = Digest::compute(algorithm, content);
        let blob = self.blobs.write_all(area, content, &digest).await?;

        let record = ManifestMetadata {
            digest: digest.clone(),
            media_type: resolve_media_type(media_type, &parsed),
            size: blob.size,
            timestamp: Utc::now(),
        };
        self.blobs
            .write_metadata(
                area,
                &Self::revision_key(repository, &digest),
                &serde_json::to_vec(&record)?,
            )
            .await?;

        if let Some(tag) = tag {
            let mapping = TagMapping::new(digest.clone());
            self.blobs
                .write_metadata(
                    area,
                    &Self::tag_key(repository, tag),
                    &serde_json::to_vec(&mapping)?,
                )
                .await?;
        }

        tracing::info!(
            repository = repository,
            digest = %digest,
            tag = tag.unwrap_or("-"),
            area = area.as_str(),
            "Stored manifest"
        );
        Ok(digest)
    }

    /// Current mapping for `tag`, if any.
    pub async fn tag_mapping(
        &self,
        area: StorageArea,
        repository: &str,
        tag: &str,
    ) -> Result<Option<TagMapping>> {
        validate_repository(repository)?;
        validate_tag(tag)?;
        match self
            .blobs
            .read_metadata(area, &Self::tag_key(repository, tag))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Look up the revision record for a tag or digest without reading the body.
    pub async fn resolve(
        &self,
        area: StorageArea,
        repository: &str,
        reference: &Reference,
    ) -> Result<ManifestMetadata> {
        validate_repository(repository)?;
        let not_found = || RegistryError::manifest_not_found(repository, &reference.to_string());

        let digest = match reference {
            Reference::Digest(digest) => digest.clone(),
            Reference::Tag(tag) => {
                self.tag_mapping(area, repository, tag)
                    .await?
                    .ok_or_else(not_found)?
                    .digest
            }
        };

        match self
            .blobs
            .read_metadata(area, &Self::revision_key(repository, &digest))
            .await?
        {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(not_found()),
        }
    }

    pub async fn get_manifest(
        &self,
        area: StorageArea,
        repository: &str,
        reference: &Reference,
    ) -> Result<Manifest> {
        let record = self.resolve(area, repository, reference).await?;

        let mut blob = match self.blobs.open_read(area, &record.digest).await {
            Ok(blob) => blob,
            Err(e) if e.is_not_found() => {
                return Err(RegistryError::manifest_not_found(
                    repository,
                    &reference.to_string(),
                ))
            }
            Err(e) => return Err(e),
        };
        let mut content = Vec::with_capacity(blob.size as usize);
        blob.reader.read_to_end(&mut content).await?;

        let tag = match reference {
            Reference::Tag(tag) => Some(tag.clone()),
            Reference::Digest(_) => None,
        };
        Manifest::from_content(
            repository,
            record.digest,
            tag,
            Some(&record.media_type),
            Bytes::from(content),
        )
    }
}

fn parse_manifest(content: &[u8]) -> Result<Value> {
    let parsed: Value = serde_json::from_slice(content)
        .map_err(|e| RegistryError::ManifestInvalid(format!("not valid JSON: {}", e)))?;
    if !parsed.is_object() {
        return Err(RegistryError::ManifestInvalid(
            "manifest must be a JSON object".to_string(),
        ));
    }
    Ok(parsed)
}

fn resolve_media_type(declared: Option<&str>, parsed: &Value) -> String {
    declared
        .filter(|m| !m.is_empty())
        .map(|m| m.split(';').next().unwrap_or(m).trim().to_string())
        .or_else(|| {
            parsed
                .get("mediaType")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_MANIFEST_MEDIA_TYPE.to_string())
}

/// Every blob or child manifest digest a manifest body points at.
pub fn referenced_digests(manifest: &Value) -> Result<Vec<Digest>> {
    let mut found: Vec<&str> = Vec::new();

    if let Some(config) = manifest.get("config") {
        if let Some(d) = config.get("digest").and_then(Value::as_str) {
            found.push(d);
        }
    }

    for (list, field) in [
        ("layers", "digest"),
        ("manifests", "digest"),
        ("blobs", "digest"),
        ("fsLayers", "blobSum"),
    ] {
        if let Some(entries) = manifest.get(list).and_then(Value::as_array) {
            for entry in entries {
                match entry.get(field).and_then(Value::as_str) {
                    Some(d) => found.push(d),
                    None => {
                        return Err(RegistryError::ManifestInvalid(format!(
                            "{} entry without {}",
                            list, field
                        )))
                    }
                }
            }
        }
    }

    let mut digests = Vec::with_capacity(found.len());
    for raw in found {
        let digest: Digest = raw
            .parse()
            .map_err(|_| RegistryError::ManifestInvalid(format!("bad digest `{}`", raw)))?;
        if !digests.contains(&digest) {
            digests.push(digest);
        }
    }
    Ok(digests)
}
