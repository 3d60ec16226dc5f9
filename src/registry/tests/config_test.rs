//! Configuration parsing and storage root validation

mod common;

use common::test_config;
use docker_registry::config::StorageConfig;
use docker_registry::{Config, RegistryError};
use tempfile::TempDir;

#[test]
fn test_minimal_toml_uses_defaults() {
    let config = Config::from_toml(
        r#"
        [storage]
        registry_storage = "/srv/registry"
        temporary_storage = "/srv/tmp"
        proxy_storage = "/srv/proxy"
        "#,
    )
    .unwrap();

    assert_eq!(config.server.port, 5000);
    assert_eq!(config.server.bind_address, "0.0.0.0");
    assert_eq!(config.uploads.session_timeout_secs, 3600);
    assert_eq!(config.proxy.tag_ttl_secs, 300);
    assert!(config.upstream.prefer_ipv4);
    assert!(config.upstream.insecure_registries.is_empty());
}

#[test]
fn test_full_toml() {
    let config = Config::from_toml(
        r#"
        [server]
        bind_address = "127.0.0.1"
        port = 5443

        [storage]
        registry_storage = "/data/registry"
        temporary_storage = "/data/tmp"
        proxy_storage = "/data/proxy"

        [uploads]
        session_timeout_secs = 120
        sweep_interval_secs = 10

        [upstream]
        timeout_secs = 30
        prefer_ipv4 = false
        insecure_registries = ["mirror.local:5000"]

        [upstream.credentials."ghcr.io"]
        username = "bot"
        password = "secret"

        [proxy]
        tag_ttl_secs = 60
        "#,
    )
    .unwrap();

    assert_eq!(config.server.port, 5443);
    assert_eq!(config.uploads.sweep_interval_secs, 10);
    assert_eq!(config.upstream.timeout_secs, 30);
    assert_eq!(config.upstream.connect_timeout_secs, 10);
    assert!(!config.upstream.prefer_ipv4);
    assert_eq!(config.upstream.insecure_registries, vec!["mirror.local:5000"]);
    assert_eq!(config.upstream.credentials["ghcr.io"].username, "bot");
    assert_eq!(config.proxy.tag_ttl_secs, 60);
}

#[test]
fn test_missing_storage_section_is_invalid() {
    let err = Config::from_toml("[server]\nport = 5000\n").unwrap_err();
    assert!(matches!(err, RegistryError::ConfigurationInvalid(_)));
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, RegistryError::ConfigurationInvalid(_)));
}

#[test]
fn test_load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("configuration.toml");
    std::fs::write(
        &path,
        r#"
        [storage]
        registry_storage = "r"
        temporary_storage = "t"
        proxy_storage = "p"
        "#,
    )
    .unwrap();
    let config = Config::load(&path).unwrap();
    assert_eq!(config.storage.proxy_storage.to_str(), Some("p"));
}

#[test]
fn test_validate_creates_roots() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    config.validate().unwrap();

    assert!(dir.path().join("registry").is_dir());
    assert!(dir.path().join("tmp").is_dir());
    assert!(dir.path().join("proxy").is_dir());
}

#[test]
fn test_validate_rejects_nested_roots() {
    let dir = TempDir::new().unwrap();
    let config = Config::new(StorageConfig {
        registry_storage: dir.path().join("data"),
        temporary_storage: dir.path().join("data").join("tmp"),
        proxy_storage: dir.path().join("proxy"),
    });
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("temporary_storage"), "{}", err);
}

#[test]
fn test_validate_rejects_shared_root() {
    let dir = TempDir::new().unwrap();
    let shared = dir.path().join("shared");
    let config = Config::new(StorageConfig {
        registry_storage: shared.clone(),
        temporary_storage: dir.path().join("tmp"),
        proxy_storage: shared,
    });
    assert!(matches!(
        config.validate(),
        Err(RegistryError::ConfigurationInvalid(_))
    ));
}

#[test]
fn test_validate_rejects_file_as_root() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();
    let mut config = test_config(dir.path());
    config.storage.proxy_storage = file;
    assert!(matches!(
        config.validate(),
        Err(RegistryError::ConfigurationInvalid(_))
    ));
}

#[test]
fn test_validate_rejects_zero_timeouts() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.uploads.session_timeout_secs = 0;
    assert!(matches!(
        config.validate(),
        Err(RegistryError::ConfigurationInvalid(_))
    ));
}
