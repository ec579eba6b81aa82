//! Host-directory build step engine.
//!
//! Runs [`BuildStep`](cachesync_core::BuildStep) operations directly on the
//! host. Each step gets its own root directory; cache volumes are
//! directories under the engine root shared by name across steps.

mod local;
mod ops;

pub use local::{LocalEngine, LocalStep};
