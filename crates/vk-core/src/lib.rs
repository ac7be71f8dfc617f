//! vk-core: keeps task notes in a vault in step with a remote task service.
//!
//! This crate provides:
//! - A status poller that reconciles project task listings with known state
//! - A per-note FIFO queue for frontmatter updates
//! - Frontmatter parsing and the task metadata schema
//! - FileSystem and TaskClient trait abstractions

pub mod backoff;
pub mod client;
pub mod frontmatter;
pub mod fs;
pub mod index;
pub mod metadata;
pub mod poller;
pub mod status;
pub mod update_queue;

pub use client::{ClientError, CreateTask, Project, TaskApi, TaskClient, TaskSummary, UpdateTask};
pub use fs::{FileEntry, FileSystem, FsError, InMemoryFs};
pub use index::{IndexError, PushOutcome, TaskIndex};
pub use metadata::{MetadataError, MetadataStore, TaskMetadata};
pub use poller::{CycleReport, PollerConfig, PollerPhase, StatusPoller};
pub use status::{CombinedState, TaskStatus};
pub use update_queue::UpdateQueue;
