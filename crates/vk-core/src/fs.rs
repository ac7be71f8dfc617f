//! FileSystem trait abstraction for vault access.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in vk-daemon) - Uses tokio::fs rooted at the vault directory
//!
//! Paths are vault-relative and `/`-separated.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent vault filesystem.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents. The empty path is the vault root.
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;
}

/// In-memory filesystem for testing.
///
/// Directories are implicit: a directory exists while any file lives under it.
#[derive(Default)]
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for seeding test vaults.
    pub fn insert(&self, path: &str, content: &str) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Self::normalize_path(path), content.as_bytes().to_vec());
    }

    /// Read a file as UTF-8, `None` when missing.
    pub fn contents(&self, path: &str) -> Option<String> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::normalize_path(path))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Remove a file, returning whether it was there.
    pub fn remove(&self, path: &str) -> bool {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&Self::normalize_path(path))
            .is_some()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn is_dir(files: &BTreeMap<String, Vec<u8>>, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{}/", path);
        files.keys().any(|k| k.starts_with(&prefix))
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        if let Some(content) = files.get(&path) {
            return Ok(content.clone());
        }
        if Self::is_dir(&files, &path) {
            return Err(FsError::IsDirectory(path));
        }
        Err(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        if Self::is_dir(&files, &path) {
            return Err(FsError::IsDirectory(path));
        }
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        if !Self::is_dir(&files, &path) {
            return Err(FsError::NotFound(path));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        for key in files.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let (name, is_dir) = match rest.split_once('/') {
                Some((dir, _)) => (dir, true),
                None => (rest, false),
            };
            if seen.insert(name.to_string()) {
                entries.push(FileEntry {
                    name: name.to_string(),
                    is_dir,
                });
            }
        }

        Ok(entries)
    }
}

// Lets several components share one filesystem (store, index, tests)
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }
}
