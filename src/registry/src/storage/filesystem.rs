use super::{Blob, BlobReader, BlobStore, StorageArea, TempBlob};
use crate::config::StorageConfig;
use crate::digest::{self, Digest};
use crate::error::{RegistryError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufReader};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Blob store laid out on a local filesystem.
///
/// ```text
/// <root>/blobs/<algorithm>/<hex>
/// <root>/repositories/<repo>/_manifests/...
/// <temp>/<uuid>
/// ```
///
/// Commits are a rename out of the temporary root, so the temporary root must
/// be on the same filesystem as both content roots.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    registry_root: PathBuf,
    proxy_root: PathBuf,
    temp_root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(storage: &StorageConfig) -> Result<Self> {
        for dir in [
            &storage.registry_storage,
            &storage.proxy_storage,
            &storage.temporary_storage,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            registry_root: storage.registry_storage.clone(),
            proxy_root: storage.proxy_storage.clone(),
            temp_root: storage.temporary_storage.clone(),
        })
    }

    fn root(&self, area: StorageArea) -> &Path {
        match area {
            StorageArea::Registry => &self.registry_root,
            StorageArea::Proxy => &self.proxy_root,
        }
    }

    /// Final location of a committed blob
    pub fn blob_path(&self, area: StorageArea, digest: &Digest) -> PathBuf {
        self.root(area)
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    fn metadata_path(&self, area: StorageArea, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(RegistryError::InvalidName(key.to_string()));
        }
        Ok(self.root(area).join(relative))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.temp_root.join(name)
    }

    /// Rename `from` onto `to`, creating the parent and syncing it afterwards.
    async fn publish(from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(from, to).await?;

        if let Some(parent) = to.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn begin_write(&self, area: StorageArea) -> Result<TempBlob> {
        let id = uuid::Uuid::new_v4();
        let path = self.temp_path(&id.to_string());
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        tracing::debug!(area = area.as_str(), path = %path.display(), "Opened staging file");
        Ok(TempBlob::new(id, area, path, file))
    }

    async fn append(&self, handle: &mut TempBlob, chunk: &[u8]) -> Result<()> {
        if handle.committed {
            return Err(RegistryError::InvalidState {
                state: "committed",
                event: "append to",
            });
        }
        let file = handle.file.as_mut().ok_or(RegistryError::InvalidState {
            state: "closed",
            event: "append to",
        })?;
        file.write_all(chunk).await?;
        handle.len += chunk.len() as u64;
        Ok(())
    }

    async fn truncate(&self, handle: &mut TempBlob, len: u64) -> Result<()> {
        if let Some(file) = handle.file.as_mut() {
            file.flush().await?;
            file.set_len(len).await?;
            // the write cursor must follow the new end
            file.seek(std::io::SeekFrom::Start(len)).await?;
        }
        handle.len = len;
        Ok(())
    }

    async fn commit(&self, handle: &mut TempBlob, expected: &Digest) -> Result<Blob> {
        if handle.committed {
            return self.stat(handle.area, expected).await;
        }

        if let Some(file) = handle.file.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }

        // Hash what actually reached the disk, not what the writer believed it sent
        let computed = digest::digest_file(expected.algorithm(), &handle.path).await?;
        if let Err(e) = expected.verify(&computed) {
            tracing::warn!(
                expected = %expected,
                computed = %computed,
                size = handle.len,
                "Staged content failed verification"
            );
            return Err(e);
        }

        // The handle stays open until the blob is in place so a failed
        // publish leaves the upload appendable
        let destination = self.blob_path(handle.area, expected);
        if fs::try_exists(&destination).await? {
            // Same digest, same bytes: the existing copy wins
            fs::remove_file(&handle.path).await?;
            tracing::debug!(digest = %expected, "Blob already present, dropped duplicate");
        } else {
            Self::publish(&handle.path, &destination).await?;
            tracing::info!(
                digest = %expected,
                size = handle.len,
                area = handle.area.as_str(),
                "Committed blob"
            );
        }

        handle.file = None;
        handle.committed = true;
        Ok(Blob {
            digest: expected.clone(),
            size: handle.len,
            area: handle.area,
        })
    }

    async fn discard(&self, mut handle: TempBlob) -> Result<()> {
        if handle.committed {
            return Ok(());
        }
        handle.file = None;
        match fs::remove_file(&handle.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_read(&self, area: StorageArea, digest: &Digest) -> Result<BlobReader> {
        let path = self.blob_path(area, digest);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::blob_not_found(digest));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        Ok(BlobReader {
            size,
            reader: Box::pin(BufReader::with_capacity(READ_BUFFER_SIZE, file)),
        })
    }

    async fn stat(&self, area: StorageArea, digest: &Digest) -> Result<Blob> {
        match fs::metadata(self.blob_path(area, digest)).await {
            Ok(meta) => Ok(Blob {
                digest: digest.clone(),
                size: meta.len(),
                area,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RegistryError::blob_not_found(digest))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_metadata(&self, area: StorageArea, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.metadata_path(area, key)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_metadata(&self, area: StorageArea, key: &str, data: &[u8]) -> Result<()> {
        let destination = self.metadata_path(area, key)?;
        let temp_path = self.temp_path(&format!("{}.meta", uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path).await?;
        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = Self::publish(&temp_path, &destination).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }
}
