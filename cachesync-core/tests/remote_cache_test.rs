//! Tests for remote cache backends and configuration.

use std::fs;

use cachesync_core::remote_cache::{
    Artifact, ArtifactVerifier, FilesystemBackend, RemoteCache, RemoteCacheBackend,
    RemoteCacheConfig, RemoteKey,
};
use cachesync_core::{CancellationToken, Error};
use tempfile::TempDir;

fn sample_artifact() -> (TempDir, Artifact) {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("archives/partial")).unwrap();
    fs::write(dir.path().join("archives/curl.deb"), b"curl").unwrap();
    fs::write(dir.path().join("pkgcache.bin"), b"bin").unwrap();
    let artifact = Artifact::from_dir(dir.path()).unwrap();
    (dir, artifact)
}

#[tokio::test]
async fn test_filesystem_round_trip() {
    let store = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(store.path(), "cache").unwrap();
    let cancel = CancellationToken::new();
    let key = RemoteKey::new("ci-apt-cache");
    let (_source, artifact) = sample_artifact();

    assert!(!backend.exists(&key, &cancel).await);
    backend.export(&key, &artifact, &cancel).await.unwrap();
    assert!(backend.exists(&key, &cancel).await);

    let imported = backend.import(&key, &cancel).await.unwrap();
    assert_eq!(imported.manifest(), artifact.manifest());
    ArtifactVerifier::verify(&imported, &artifact.hash()).unwrap();

    let dest = TempDir::new().unwrap();
    imported.extract_to(dest.path(), false).unwrap();
    assert_eq!(fs::read(dest.path().join("archives/curl.deb")).unwrap(), b"curl");
    assert!(dest.path().join("archives/partial").is_dir());
}

#[tokio::test]
async fn test_filesystem_miss_is_empty() {
    let store = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(store.path(), "cache").unwrap();

    let artifact = backend
        .import(&RemoteKey::new("ci-missing"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(artifact.is_empty());
}

#[tokio::test]
async fn test_export_replaces_previous_object() {
    let store = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(store.path(), "cache").unwrap();
    let cancel = CancellationToken::new();
    let key = RemoteKey::new("ci-go");

    let (_first_dir, first) = sample_artifact();
    backend.export(&key, &first, &cancel).await.unwrap();

    let second_dir = TempDir::new().unwrap();
    fs::write(second_dir.path().join("only"), b"1").unwrap();
    let second = Artifact::from_dir(second_dir.path()).unwrap();
    backend.export(&key, &second, &cancel).await.unwrap();

    let imported = backend.import(&key, &cancel).await.unwrap();
    assert_eq!(imported.len(), 1);
}

#[test]
fn test_config_from_toml_with_env_overlay() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
registry = "ghcr.io"
repo = "acme/cache"
pipeline = "nightly"
max_retries = 5
"#,
    )
    .unwrap();

    let config = RemoteCacheConfig::load(&path).unwrap();
    assert_eq!(config.repo, "acme/cache");
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.max_artifact_size, Some(1024 * 1024 * 1024));

    let config = config.apply_env_with(|name| match name {
        "CACHESYNC_PIPELINE" => Some("ci".to_string()),
        "CACHESYNC_INSECURE" => Some("true".to_string()),
        _ => None,
    });
    assert_eq!(config.pipeline, "ci");
    assert_eq!(config.registry, "ghcr.io");
    assert!(config.insecure);
}

#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "registry = [").unwrap();

    assert!(matches!(
        RemoteCacheConfig::load(&path),
        Err(Error::Toml { .. })
    ));
    assert_eq!(
        RemoteCacheConfig::load_or_default(&dir.path().join("absent.toml")).unwrap(),
        RemoteCacheConfig::default()
    );
}

#[test]
fn test_config_toml_round_trip() {
    let config = RemoteCacheConfig::new("localhost:5000", "cache")
        .with_pipeline("ci")
        .with_credentials("bot", "REGISTRY_TOKEN")
        .skip_if_exists(true);

    let parsed: RemoteCacheConfig = toml::from_str(&config.to_toml().unwrap()).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_from_config_disables_without_registry() {
    let config = RemoteCacheConfig::default().with_pipeline("ci");
    assert!(!RemoteCache::from_config(&config).unwrap().is_enabled());

    let config = RemoteCacheConfig::new("https://ghcr.io", "cache").with_pipeline("ci");
    assert!(!RemoteCache::from_config(&config).unwrap().is_enabled());
}

#[test]
fn test_from_config_requires_pipeline() {
    let config = RemoteCacheConfig::new("ghcr.io", "cache");
    assert!(matches!(
        RemoteCache::from_config(&config),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_from_config_filesystem_store() {
    let store = TempDir::new().unwrap();
    let config = RemoteCacheConfig::new(format!("file://{}", store.path().display()), "cache")
        .with_pipeline("ci");

    let cache = RemoteCache::from_config(&config).unwrap();
    assert!(cache.is_enabled());
    assert!(store.path().join("cache").is_dir());
}

#[tokio::test]
async fn test_unreachable_registry_degrades_to_miss() {
    let config = RemoteCacheConfig::new("127.0.0.1:1", "cache")
        .with_pipeline("ci")
        .insecure(true)
        .max_retries(0);
    let cache = RemoteCache::from_config(&config).unwrap();
    let cancel = CancellationToken::new();
    let key = cache.remote_key("apt-cache", None).unwrap();

    assert!(!cache.backend().exists(&key, &cancel).await);
    let artifact = cache.backend().import(&key, &cancel).await.unwrap();
    assert!(artifact.is_empty());
}

#[tokio::test]
async fn test_registry_export_fails_when_unreachable() {
    let config = RemoteCacheConfig::new("127.0.0.1:1", "cache")
        .with_pipeline("ci")
        .insecure(true)
        .max_retries(0);
    let cache = RemoteCache::from_config(&config).unwrap();
    let (_dir, artifact) = sample_artifact();
    let key = cache.remote_key("apt-cache", None).unwrap();

    let result = cache
        .backend()
        .export(&key, &artifact, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::Registry { .. })));
}
