use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cachesync_core::remote_cache::{
    label_name, Artifact, ExportOutcome, FilesystemBackend, MountMetadata, RemoteCache,
    RemoteCacheBackend, RemoteCacheConfig, RemoteKey, SkipReason, TrackedCache,
};
use cachesync_core::{
    BuildStep, CacheVolume, CancellationToken, Error, MountOptions, Platform, Result,
};
use cachesync_engine::{LocalEngine, LocalStep};
use tempfile::TempDir;

/// Filesystem store that counts the exports it receives.
struct CountingBackend {
    inner: FilesystemBackend,
    exports: AtomicUsize,
}

impl CountingBackend {
    fn new(root: &std::path::Path) -> Arc<Self> {
        Arc::new(Self {
            inner: FilesystemBackend::new(root, "cache").unwrap(),
            exports: AtomicUsize::new(0),
        })
    }

    fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteCacheBackend for CountingBackend {
    async fn exists(&self, key: &RemoteKey, cancel: &CancellationToken) -> bool {
        self.inner.exists(key, cancel).await
    }

    async fn import(&self, key: &RemoteKey, cancel: &CancellationToken) -> Result<Artifact> {
        self.inner.import(key, cancel).await
    }

    async fn export(
        &self,
        key: &RemoteKey,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        self.inner.export(key, artifact, cancel).await
    }
}

/// Store whose writes always fail.
struct ReadOnlyBackend;

#[async_trait]
impl RemoteCacheBackend for ReadOnlyBackend {
    async fn exists(&self, _key: &RemoteKey, _cancel: &CancellationToken) -> bool {
        false
    }

    async fn import(&self, _key: &RemoteKey, _cancel: &CancellationToken) -> Result<Artifact> {
        Ok(Artifact::empty())
    }

    async fn export(
        &self,
        key: &RemoteKey,
        _artifact: &Artifact,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(Error::Storage {
            key: key.to_string(),
            message: "store is read-only".to_string(),
        })
    }
}

struct Fixture {
    _dirs: Vec<TempDir>,
    store: Arc<CountingBackend>,
    cache: RemoteCache,
}

impl Fixture {
    fn new() -> Self {
        let store_dir = TempDir::new().unwrap();
        let store = CountingBackend::new(store_dir.path());
        let cache = RemoteCache::new(store.clone(), "ci").unwrap();
        Self {
            _dirs: vec![store_dir],
            store,
            cache,
        }
    }

    /// A fresh engine, standing in for another build host.
    fn engine(&mut self) -> LocalEngine {
        let dir = TempDir::new().unwrap();
        let engine = LocalEngine::new(dir.path()).unwrap();
        self._dirs.push(dir);
        engine
    }
}

fn write_file(step: &LocalStep, path: &str, contents: &str) -> LocalStep {
    step.with_exec(&["sh", "-c", "printf %s \"$1\" > \"$2\"", "sh", contents, path])
}

#[tokio::test]
async fn test_cold_mount_then_warm_mount_on_another_host() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let engine = fixture.engine();
    let step = fixture
        .cache
        .cache_volume("/var/cache/apt", "apt-cache")
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap();

    let labels = step.labels().await.unwrap();
    let label = &labels[&label_name(&RemoteKey::new("ci-apt-cache"))];
    let metadata = MountMetadata::from_label("", label).unwrap();
    assert!(!metadata.cache_exists);

    let step = write_file(&step, "/var/cache/apt/pkg.deb", "deb");
    let (_, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert_eq!(report.outcome("ci-apt-cache"), Some(&ExportOutcome::Exported));
    assert_eq!(fixture.store.exports(), 1);

    let other = fixture.engine();
    let step = fixture
        .cache
        .cache_volume("/var/cache/apt", "apt-cache")
        .mount(&other.step().unwrap(), &cancel)
        .await
        .unwrap();
    assert_eq!(
        fs::read_to_string(step.host_path("/var/cache/apt/pkg.deb")).unwrap(),
        "deb"
    );

    let (_, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert_eq!(
        report.outcome("ci-apt-cache"),
        Some(&ExportOutcome::Skipped(SkipReason::AlreadyCached))
    );
    assert_eq!(fixture.store.exports(), 1);
}

#[tokio::test]
async fn test_import_replaces_stale_volume_content() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let engine = fixture.engine();
    let step = fixture
        .cache
        .cache_volume("/cache", "tools")
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/fresh", "new");
    fixture.cache.export(&step, &cancel).await.unwrap();

    let other = fixture.engine();
    let stale = other
        .step()
        .unwrap()
        .with_mounted_cache("/cache", &CacheVolume::new("ci-tools"), &MountOptions::default());
    write_file(&stale, "/cache/stale", "old")
        .sync(&cancel)
        .await
        .unwrap();

    let step = fixture
        .cache
        .cache_volume("/cache", "tools")
        .mount(&other.step().unwrap(), &cancel)
        .await
        .unwrap();
    assert!(step.host_path("/cache/fresh").is_file());
    assert!(!step.host_path("/cache/stale").exists());
}

#[tokio::test]
async fn test_export_is_idempotent() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let engine = fixture.engine();
    let step = fixture
        .cache
        .cache_volume("/cache", "npm")
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/index", "1");

    let (step, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert_eq!(report.exported(), 1);
    assert!(step.labels().await.unwrap().is_empty());

    let (_, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(fixture.store.exports(), 1);
}

#[tokio::test]
async fn test_force_export_writes_existing_cache() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let engine = fixture.engine();
    let step = fixture
        .cache
        .cache_volume("/cache", "go")
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap();
    fixture
        .cache
        .export(&write_file(&step, "/cache/a", "1"), &cancel)
        .await
        .unwrap();

    let step = fixture
        .cache
        .cache_volume("/cache", "go")
        .force_export(true)
        .mount(&fixture.engine().step().unwrap(), &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/b", "2");
    let (_, report) = fixture.cache.export(&step, &cancel).await.unwrap();

    assert_eq!(report.outcome("ci-go"), Some(&ExportOutcome::Exported));
    assert_eq!(fixture.store.exports(), 2);

    let artifact = fixture
        .store
        .import(&RemoteKey::new("ci-go"), &cancel)
        .await
        .unwrap();
    assert_eq!(artifact.len(), 2);
}

#[tokio::test]
async fn test_platform_aware_keys() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let arm = Platform::new("linux/arm64").unwrap();

    let step = fixture
        .engine()
        .step()
        .unwrap()
        .with_platform(arm);
    let step = fixture
        .cache
        .cache_volume("/cache", "apt-cache")
        .platform_aware(true)
        .mount(&step, &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/x", "x");

    let labels = step.labels().await.unwrap();
    assert!(labels.contains_key(&label_name(&RemoteKey::new("ci-apt-cache-linux-arm64"))));

    let (_, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert_eq!(
        report.outcome("ci-apt-cache-linux-arm64"),
        Some(&ExportOutcome::Exported)
    );
    assert!(
        !fixture
            .store
            .exists(&RemoteKey::new("ci-apt-cache"), &cancel)
            .await
    );

    let amd = fixture
        .engine()
        .step()
        .unwrap()
        .with_platform(Platform::new("linux/amd64").unwrap());
    let step = fixture
        .cache
        .cache_volume("/cache", "apt-cache")
        .platform_aware(true)
        .mount(&amd, &cancel)
        .await
        .unwrap();
    assert!(!step.host_path("/cache/x").exists());

    let (_, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert_eq!(
        report.outcome("ci-apt-cache-linux-amd64"),
        Some(&ExportOutcome::Exported)
    );
}

#[tokio::test]
async fn test_corrupt_label_does_not_block_siblings() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let step = fixture
        .cache
        .cache_volume("/cache", "pip")
        .mount(&fixture.engine().step().unwrap(), &cancel)
        .await
        .unwrap();
    let broken = label_name(&RemoteKey::new("ci-broken"));
    let step = write_file(&step, "/cache/wheel", "w").with_label(&broken, "{not json");

    let (step, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert!(matches!(
        report.outcome("ci-broken"),
        Some(ExportOutcome::Failed(_))
    ));
    assert_eq!(report.outcome("ci-pip"), Some(&ExportOutcome::Exported));
    assert!(!report.is_success());

    let labels = step.labels().await.unwrap();
    assert!(labels.contains_key(&broken));
    assert_eq!(labels.len(), 1);
}

#[tokio::test]
async fn test_failed_export_keeps_label() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let cache = RemoteCache::new(Arc::new(ReadOnlyBackend), "ci").unwrap();

    let step = cache
        .cache_volume("/cache", "cargo")
        .mount(&fixture.engine().step().unwrap(), &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/registry", "r");

    let (step, report) = cache.export(&step, &cancel).await.unwrap();
    assert_eq!(report.failed(), 1);
    assert_eq!(step.labels().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disabled_cache_mounts_locally() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let cache = RemoteCache::disabled("ci").unwrap();

    let step = cache
        .cache_volume("/cache", "apt-cache")
        .mount(&fixture.engine().step().unwrap(), &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/pkg", "p");

    let (step, report) = cache.export(&step, &cancel).await.unwrap();
    assert_eq!(
        report.outcome("ci-apt-cache"),
        Some(&ExportOutcome::Skipped(SkipReason::RemoteDisabled))
    );
    assert!(step.labels().await.unwrap().is_empty());
    assert!(step.host_path("/cache/pkg").is_file());
}

#[tokio::test]
async fn test_mounted_directory_restores_into_step() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let step = fixture
        .cache
        .mounted_directory("/src/node_modules", "node-modules")
        .mount(&fixture.engine().step().unwrap(), &cancel)
        .await
        .unwrap();
    assert!(step.host_path("/src/node_modules").is_dir());
    assert!(step.host_path("/src/node_modules").starts_with(step.rootfs()));

    let step = write_file(&step, "/src/node_modules/lib.js", "js");
    fixture.cache.export(&step, &cancel).await.unwrap();

    let step = fixture
        .cache
        .mounted_directory("/src/node_modules", "node-modules")
        .mount(&fixture.engine().step().unwrap(), &cancel)
        .await
        .unwrap();
    assert_eq!(
        fs::read_to_string(step.host_path("/src/node_modules/lib.js")).unwrap(),
        "js"
    );
}

#[tokio::test]
async fn test_expanded_path() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let step = fixture
        .engine()
        .step()
        .unwrap()
        .with_env_variable("HOME", "/home/builder");
    let step = fixture
        .cache
        .mounted_directory("$HOME/.cache", "home-cache")
        .expand(true)
        .mount(&step, &cancel)
        .await
        .unwrap();
    assert!(step.host_path("/home/builder/.cache").is_dir());

    let step = write_file(&step, "/home/builder/.cache/x", "x");
    let (_, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert_eq!(report.outcome("ci-home-cache"), Some(&ExportOutcome::Exported));
}

#[tokio::test]
async fn test_cancelled_mount() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = fixture
        .cache
        .cache_volume("/cache", "apt-cache")
        .mount(&fixture.engine().step().unwrap(), &cancel)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_tracked_cache_round_trip() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let mut tracked = TrackedCache::new(fixture.cache.clone());
    let base = fixture.engine().step().unwrap();
    let options = MountOptions::default();
    let step = tracked
        .mounted_volume(&base, "/cache/pip", "pip", &options, false)
        .await
        .unwrap();
    let step = tracked
        .mounted_volume(&step, "/cache/apt", "apt", &options, false)
        .await
        .unwrap();
    let step = tracked
        .mounted_volume(&step, "/cache/pip", "pip", &options, false)
        .await
        .unwrap();
    assert_eq!(tracked.keys().collect::<Vec<_>>(), vec!["apt", "pip"]);

    let step = write_file(&step, "/cache/apt/a", "a");
    let step = write_file(&step, "/cache/pip/p", "p");
    let (_, report) = tracked.sync(&step, &cancel).await.unwrap();
    assert_eq!(report.exported(), 2);

    let mut restored = TrackedCache::new(fixture.cache.clone()).with_skip_if_exists(true);
    let base = fixture.engine().step().unwrap();
    let step = restored
        .mounted_volume(&base, "/cache/apt", "apt", &options, false)
        .await
        .unwrap();
    restored.download(&cancel).await.unwrap();
    assert_eq!(fs::read_to_string(step.host_path("/cache/apt/a")).unwrap(), "a");

    let report = restored.upload(&cancel).await;
    assert_eq!(
        report.outcome("ci-apt"),
        Some(&ExportOutcome::Skipped(SkipReason::AlreadyCached))
    );
    assert_eq!(fixture.store.exports(), 2);
}

#[tokio::test]
async fn test_platforms_do_not_share_volume_on_one_host() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let engine = fixture.engine();

    let arm = engine
        .step()
        .unwrap()
        .with_platform(Platform::new("linux/arm64").unwrap());
    let step = fixture
        .cache
        .cache_volume("/cache", "apt")
        .platform_aware(true)
        .mount(&arm, &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/arm-only", "arm");
    fixture.cache.export(&step, &cancel).await.unwrap();

    let amd = engine
        .step()
        .unwrap()
        .with_platform(Platform::new("linux/amd64").unwrap());
    let step = fixture
        .cache
        .cache_volume("/cache", "apt")
        .platform_aware(true)
        .mount(&amd, &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/amd-only", "amd");
    let (step, report) = fixture.cache.export(&step, &cancel).await.unwrap();
    assert_eq!(
        report.outcome("ci-apt-linux-amd64"),
        Some(&ExportOutcome::Exported)
    );
    assert!(!step.host_path("/cache/arm-only").exists());

    let dest = TempDir::new().unwrap();
    fixture
        .store
        .import(&RemoteKey::new("ci-apt-linux-amd64"), &cancel)
        .await
        .unwrap()
        .extract_to(dest.path(), false)
        .unwrap();
    assert!(dest.path().join("amd-only").is_file());
    assert!(!dest.path().join("arm-only").exists());
}

#[tokio::test]
async fn test_pipelines_do_not_share_volume_on_one_host() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let engine = fixture.engine();
    let nightly = RemoteCache::new(fixture.store.clone(), "nightly").unwrap();

    let step = fixture
        .cache
        .cache_volume("/cache", "apt")
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/cache/ci-only", "ci");
    fixture.cache.export(&step, &cancel).await.unwrap();

    let step = nightly
        .cache_volume("/cache", "apt")
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap()
        .sync(&cancel)
        .await
        .unwrap();
    assert!(step.host_path("/cache").is_dir());
    assert!(!step.host_path("/cache/ci-only").exists());
}

#[tokio::test]
async fn test_oversized_artifact_fails_without_blocking_siblings() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let cache = fixture.cache.with_max_artifact_size(Some(4));

    let step = fixture.engine().step().unwrap();
    let step = cache
        .cache_volume("/big", "big")
        .mount(&step, &cancel)
        .await
        .unwrap();
    let step = cache
        .cache_volume("/small", "small")
        .mount(&step, &cancel)
        .await
        .unwrap();
    let step = write_file(&step, "/big/blob", "0123456789");
    let step = write_file(&step, "/small/ok", "ok");

    let (step, report) = cache.export(&step, &cancel).await.unwrap();
    assert!(matches!(report.outcome("ci-big"), Some(ExportOutcome::Failed(_))));
    assert_eq!(report.outcome("ci-small"), Some(&ExportOutcome::Exported));
    assert_eq!(fixture.store.exports(), 1);
    assert!(!fixture.store.exists(&RemoteKey::new("ci-big"), &cancel).await);

    let labels = step.labels().await.unwrap();
    assert!(labels.contains_key(&label_name(&RemoteKey::new("ci-big"))));
    assert_eq!(labels.len(), 1);
}

#[tokio::test]
async fn test_tracked_upload_enforces_max_artifact_size() {
    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();

    let mut tracked = TrackedCache::new(fixture.cache.with_max_artifact_size(Some(4)));
    let options = MountOptions::default();
    let step = fixture.engine().step().unwrap();
    let step = tracked
        .mounted_volume(&step, "/big", "big", &options, false)
        .await
        .unwrap();
    let step = tracked
        .mounted_volume(&step, "/small", "small", &options, false)
        .await
        .unwrap();
    let step = write_file(&step, "/big/blob", "0123456789");
    let step = write_file(&step, "/small/ok", "ok");

    let (_, report) = tracked.resolve_and_upload(&step, &cancel).await.unwrap();
    assert!(matches!(report.outcome("ci-big"), Some(ExportOutcome::Failed(_))));
    assert_eq!(report.outcome("ci-small"), Some(&ExportOutcome::Exported));
}

#[tokio::test]
async fn test_tracked_platform_volumes_are_separate() {
    let mut fixture = Fixture::new();
    let engine = fixture.engine();
    let mut tracked = TrackedCache::new(fixture.cache.clone());
    let options = MountOptions::default();

    let arm = engine
        .step()
        .unwrap()
        .with_platform(Platform::new("linux/arm64").unwrap());
    let arm = tracked
        .mounted_volume(&arm, "/cache", "apt", &options, true)
        .await
        .unwrap();
    let amd = engine
        .step()
        .unwrap()
        .with_platform(Platform::new("linux/amd64").unwrap());
    let amd = tracked
        .mounted_volume(&amd, "/cache", "apt", &options, true)
        .await
        .unwrap();

    assert_eq!(
        arm.host_path("/cache"),
        engine.volume_path(&CacheVolume::new("ci-apt-linux-arm64"))
    );
    assert_ne!(arm.host_path("/cache"), amd.host_path("/cache"));
}

#[tokio::test]
async fn test_tracked_cache_from_config() {
    let store = TempDir::new().unwrap();
    let config = RemoteCacheConfig::new(format!("file://{}", store.path().display()), "cache")
        .with_pipeline("ci")
        .skip_if_exists(true);

    let tracked = TrackedCache::<LocalStep>::from_config(&config).unwrap();
    assert!(tracked.skip_if_exists());
    assert!(tracked.is_empty());

    let config = config.skip_if_exists(false);
    assert!(!TrackedCache::<LocalStep>::from_config(&config)
        .unwrap()
        .skip_if_exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_mounted_directory_applies_owner() {
    use std::os::unix::fs::MetadataExt;

    let mut fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let engine = fixture.engine();
    let meta = fs::metadata(engine.root()).unwrap();
    let owner = format!("{}:{}", meta.uid(), meta.gid());

    let step = fixture
        .cache
        .mounted_directory("/src/target", "target")
        .owner(owner)
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap()
        .sync(&cancel)
        .await
        .unwrap();
    assert_eq!(fs::metadata(step.host_path("/src/target")).unwrap().uid(), meta.uid());

    let result = fixture
        .cache
        .mounted_directory("/src/target", "target")
        .owner("no-such-user-cachesync")
        .mount(&engine.step().unwrap(), &cancel)
        .await
        .unwrap()
        .sync(&cancel)
        .await;
    assert!(matches!(result, Err(Error::Exec { .. })));
}
