//! Task metadata stored in note frontmatter.
//!
//! Only the keys listed in [`TaskMetadata`] are recognized; everything else in
//! the frontmatter is left exactly as the user wrote it.

use crate::frontmatter::{self, FrontmatterError};
use crate::fs::{FileSystem, FsError};
use crate::status::TaskStatus;
use thiserror::Error;

pub const KEY_TITLE: &str = "title";
pub const KEY_PROJECT_NAME: &str = "vk_project_name";
pub const KEY_PROJECT_ID: &str = "vk_project_id";
pub const KEY_TASK_ID: &str = "vk_task_id";
pub const KEY_STATUS: &str = "vk_status";
pub const KEY_LAST_SYNCED: &str = "vk_last_synced";
pub const KEY_ATTEMPT_ID: &str = "vk_attempt_id";
pub const KEY_BRANCH: &str = "vk_branch";
pub const KEY_PR_URL: &str = "vk_pr_url";
pub const KEY_EXECUTOR: &str = "vk_executor";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Note not found: {0}")]
    NotFound(String),

    #[error("Note is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error(transparent)]
    Frontmatter(#[from] FrontmatterError),

    #[error("Update for {path} did not complete: {reason}")]
    Interrupted { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Recognized frontmatter fields.
///
/// Used both for reads (missing keys are `None`) and for merge updates
/// (`None` means "leave unchanged").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetadata {
    pub title: Option<String>,
    pub project_name: Option<String>,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub last_synced: Option<String>,
    pub attempt_id: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub executor: Option<String>,
}

impl TaskMetadata {
    /// A note is linked once it carries a non-empty task id.
    pub fn is_linked(&self) -> bool {
        self.task_id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }

    pub fn phase(&self) -> TaskStatus {
        self.status.unwrap_or_default()
    }

    /// Update touching only the status.
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn from_note(note: &frontmatter::ParsedNote) -> Self {
        let get = |key: &str| note.get_str(key).filter(|v| !v.is_empty());
        Self {
            title: get(KEY_TITLE),
            project_name: get(KEY_PROJECT_NAME),
            project_id: get(KEY_PROJECT_ID),
            task_id: get(KEY_TASK_ID),
            status: get(KEY_STATUS).and_then(|s| s.parse().ok()),
            last_synced: get(KEY_LAST_SYNCED),
            attempt_id: get(KEY_ATTEMPT_ID),
            branch: get(KEY_BRANCH),
            pr_url: get(KEY_PR_URL),
            executor: get(KEY_EXECUTOR),
        }
    }

    fn apply_to(&self, note: &mut frontmatter::ParsedNote) {
        let fields = [
            (KEY_TITLE, self.title.as_deref()),
            (KEY_PROJECT_NAME, self.project_name.as_deref()),
            (KEY_PROJECT_ID, self.project_id.as_deref()),
            (KEY_TASK_ID, self.task_id.as_deref()),
            (KEY_STATUS, self.status.as_ref().map(TaskStatus::as_str)),
            (KEY_LAST_SYNCED, self.last_synced.as_deref()),
            (KEY_ATTEMPT_ID, self.attempt_id.as_deref()),
            (KEY_BRANCH, self.branch.as_deref()),
            (KEY_PR_URL, self.pr_url.as_deref()),
            (KEY_EXECUTOR, self.executor.as_deref()),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                note.set_str(key, value);
            }
        }
    }

    /// True when the update would not touch any field.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Reads and merge-writes [`TaskMetadata`] in notes.
///
/// Performs no locking of its own. Writers that can race must go through
/// [`crate::update_queue::UpdateQueue`].
pub struct MetadataStore<F: FileSystem> {
    fs: F,
}

impl<F: FileSystem> MetadataStore<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    async fn load(&self, path: &str) -> Result<String> {
        let bytes = self.fs.read(path).await.map_err(|e| match e {
            FsError::NotFound(_) => MetadataError::NotFound(path.to_string()),
            other => MetadataError::Fs(other),
        })?;
        String::from_utf8(bytes).map_err(|_| MetadataError::InvalidUtf8(path.to_string()))
    }

    /// Broken frontmatter reads as no metadata at all.
    pub async fn read(&self, path: &str) -> Result<TaskMetadata> {
        let raw = self.load(path).await?;
        Ok(TaskMetadata::from_note(&frontmatter::parse(&raw)))
    }

    /// Write the `Some` fields of `update` into the note, leaving all other
    /// frontmatter keys and the body untouched.
    ///
    /// Notes whose frontmatter cannot be parsed are not written.
    pub async fn merge_update(&self, path: &str, update: &TaskMetadata) -> Result<()> {
        let raw = self.load(path).await?;
        let mut note = frontmatter::parse_strict(&raw)?;
        update.apply_to(&mut note);
        let content = frontmatter::serialize(&note)?;
        self.fs.write(path, content.as_bytes()).await?;
        Ok(())
    }

    pub async fn is_linked(&self, path: &str) -> Result<bool> {
        Ok(self.read(path).await?.is_linked())
    }

    pub async fn current_phase(&self, path: &str) -> Result<TaskStatus> {
        Ok(self.read(path).await?.phase())
    }
}
