//! Core library for synchronizing build cache volumes with a remote store.

pub mod error;
pub mod platform;
pub mod remote_cache;
pub mod step;

pub use error::{Error, Result};
pub use platform::Platform;
pub use remote_cache::{
    Artifact, ExportOutcome, ExportReport, KeyFormatter, MountMetadata, RemoteCache,
    RemoteCacheBackend, RemoteCacheConfig, RemoteKey, SkipReason, TrackedCache, VolumeMount,
};
pub use step::{BuildStep, CacheVolume, MountOptions};

pub use tokio_util::sync::CancellationToken;
