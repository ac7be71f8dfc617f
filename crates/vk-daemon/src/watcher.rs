//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to vault root
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    Deleted,
}

/// Watches the vault directory for note changes.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtime per note, to drop events that changed nothing (Docker
/// volumes report these).
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Vault-relative path of a markdown note, `None` for hidden entries and
/// anything that is not a note.
pub fn note_path(vault_path: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(vault_path).ok()?;
    let components: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;

    if components.is_empty() || components.iter().any(|c| c.starts_with('.')) {
        return None;
    }
    let joined = components.join("/");
    joined.ends_with(".md").then_some(joined)
}

impl FileWatcher {
    /// Create a new file watcher for the vault.
    ///
    /// Uses 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new(vault_path: PathBuf) -> Result<Self> {
        // On macOS /var/folders is really /private/var/folders and FSEvents
        // reports the real path.
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watch_root = vault_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) =
                            Self::process_event(&event, &watch_root, &mtime_cache)
                        {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(
        event: &DebouncedEvent,
        vault_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;
        let relative = note_path(vault_path, path)?;
        let key = PathBuf::from(&relative);

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let kind = match std::fs::metadata(path) {
            Ok(metadata) => {
                if let Ok(mtime) = metadata.modified() {
                    if cache.get(&key) == Some(&mtime) {
                        return None;
                    }
                    cache.insert(key, mtime);
                }
                FileEventKind::Modified
            }
            Err(_) => {
                cache.remove(&key);
                FileEventKind::Deleted
            }
        };

        debug!("File event: {:?} - {}", kind, relative);
        Some(FileEvent {
            path: relative,
            kind,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}
