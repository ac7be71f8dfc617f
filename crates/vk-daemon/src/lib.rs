//! vk-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod daemon;
pub mod http_client;
pub mod native_fs;
pub mod watcher;

// Re-export key types for convenience
pub use config::Args;
pub use daemon::{Daemon, DaemonSettings};
pub use http_client::HttpTaskClient;
pub use native_fs::NativeFs;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
