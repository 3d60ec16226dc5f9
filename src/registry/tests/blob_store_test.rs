//! Filesystem blob store: staging, verification and atomic commit

mod common;

use common::{count_files, sha256, test_config};
use docker_registry::storage::{BlobStore, FilesystemBlobStore, StorageArea};
use docker_registry::{Digest, DigestAlgorithm, RegistryError};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

fn store(dir: &TempDir) -> FilesystemBlobStore {
    FilesystemBlobStore::new(&test_config(dir.path()).storage).unwrap()
}

#[tokio::test]
async fn test_commit_then_read_back() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let data = b"hello registry";
    let digest = sha256(data);

    let mut handle = store.begin_write(StorageArea::Registry).await.unwrap();
    store.append(&mut handle, b"hello ").await.unwrap();
    store.append(&mut handle, b"registry").await.unwrap();
    assert_eq!(handle.len(), data.len() as u64);

    let blob = store.commit(&mut handle, &digest).await.unwrap();
    assert_eq!(blob.size, data.len() as u64);
    assert_eq!(blob.digest, digest);

    let path = store.blob_path(StorageArea::Registry, &digest);
    assert!(path.ends_with(format!("blobs/sha256/{}", digest.hex())));
    assert_eq!(count_files(&dir.path().join("tmp")), 0);

    let mut reader = store.open_read(StorageArea::Registry, &digest).await.unwrap();
    assert_eq!(reader.size, data.len() as u64);
    let mut read = Vec::new();
    reader.reader.read_to_end(&mut read).await.unwrap();
    assert_eq!(read, data);
}

#[tokio::test]
async fn test_mismatch_leaves_staged_file_and_publishes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let wrong = sha256(b"something else");

    let mut handle = store.begin_write(StorageArea::Registry).await.unwrap();
    store.append(&mut handle, b"actual content").await.unwrap();

    let err = store.commit(&mut handle, &wrong).await.unwrap_err();
    assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    assert!(!store.exists(StorageArea::Registry, &wrong).await.unwrap());
    assert_eq!(count_files(&dir.path().join("tmp")), 1);

    // The same handle can still be committed with the right digest
    let right = sha256(b"actual content");
    store.commit(&mut handle, &right).await.unwrap();
    assert!(store.exists(StorageArea::Registry, &right).await.unwrap());

    store.discard(handle).await.unwrap();
    assert_eq!(count_files(&dir.path().join("tmp")), 0);
}

#[tokio::test]
async fn test_commit_of_existing_digest_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let data = b"layer";
    let digest = sha256(data);

    store.write_all(StorageArea::Registry, data, &digest).await.unwrap();
    let first = store.blob_path(StorageArea::Registry, &digest);
    let before = std::fs::metadata(&first).unwrap().modified().unwrap();

    let blob = store.write_all(StorageArea::Registry, data, &digest).await.unwrap();
    assert_eq!(blob.size, data.len() as u64);
    assert_eq!(std::fs::metadata(&first).unwrap().modified().unwrap(), before);
    assert_eq!(count_files(&dir.path().join("tmp")), 0);
    assert_eq!(count_files(first.parent().unwrap()), 1);
}

#[tokio::test]
async fn test_missing_blob_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let digest = sha256(b"never stored");

    let err = store.open_read(StorageArea::Registry, &digest).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(store.stat(StorageArea::Registry, &digest).await.unwrap_err().is_not_found());
    assert!(!store.exists(StorageArea::Registry, &digest).await.unwrap());
}

#[tokio::test]
async fn test_areas_are_disjoint() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let digest = sha256(b"pushed");

    store.write_all(StorageArea::Registry, b"pushed", &digest).await.unwrap();
    assert!(store.exists(StorageArea::Registry, &digest).await.unwrap());
    assert!(!store.exists(StorageArea::Proxy, &digest).await.unwrap());
}

#[tokio::test]
async fn test_sha512_blobs_live_under_their_algorithm() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let digest = Digest::compute(DigestAlgorithm::Sha512, b"wide");

    store.write_all(StorageArea::Proxy, b"wide", &digest).await.unwrap();
    let path = store.blob_path(StorageArea::Proxy, &digest);
    assert!(path.to_string_lossy().contains("blobs/sha512/"));
    assert!(path.exists());
}

#[tokio::test]
async fn test_truncate_rolls_back_staged_bytes() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);

    let mut handle = store.begin_write(StorageArea::Registry).await.unwrap();
    store.append(&mut handle, b"keep").await.unwrap();
    store.append(&mut handle, b"-drop").await.unwrap();
    store.truncate(&mut handle, 4).await.unwrap();
    store.append(&mut handle, b"!").await.unwrap();

    let blob = store.commit(&mut handle, &sha256(b"keep!")).await.unwrap();
    assert_eq!(blob.size, 5);
}

#[tokio::test]
async fn test_metadata_round_trip_and_path_checks() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let key = "repositories/a/_manifests/tags/latest.json";

    assert_eq!(store.read_metadata(StorageArea::Registry, key).await.unwrap(), None);
    store.write_metadata(StorageArea::Registry, key, b"{}").await.unwrap();
    assert_eq!(
        store.read_metadata(StorageArea::Registry, key).await.unwrap(),
        Some(b"{}".to_vec())
    );

    assert!(store
        .write_metadata(StorageArea::Registry, "../escape.json", b"{}")
        .await
        .is_err());
}
