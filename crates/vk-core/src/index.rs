//! Task index: links notes to remote tasks and wires the poller to the vault.
//!
//! At startup the index walks the vault, remembers which note carries which
//! task id, and seeds the poller so state already written into notes is not
//! reported as a change. Afterwards it applies poller notifications to notes
//! through the [`UpdateQueue`] and keeps the poller's active set in step with
//! notes being edited, renamed and deleted.

use crate::client::{ClientError, CreateTask, TaskApi, TaskClient, TaskSummary, UpdateTask};
use crate::fs::{FileSystem, FsError};
use crate::metadata::{MetadataError, TaskMetadata};
use crate::poller::StatusPoller;
use crate::status::TaskStatus;
use crate::update_queue::UpdateQueue;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Task service error: {0}")]
    Client(#[from] ClientError),

    #[error("Note {0} has no project id")]
    NoProject(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// An indexed note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedNote {
    pub path: String,
    pub project_id: Option<String>,
    pub status: Option<TaskStatus>,
}

/// What [`TaskIndex::push_document`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Created { task_id: String },
    Updated { task_id: String },
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".md").unwrap_or(name)
}

/// Maps task ids to note paths (and back).
pub struct TaskIndex<F: FileSystem + 'static> {
    queue: UpdateQueue<F>,
    by_task: HashMap<String, LinkedNote>,
    by_path: HashMap<String, String>,
}

impl<F: FileSystem + 'static> TaskIndex<F> {
    pub fn new(queue: UpdateQueue<F>) -> Self {
        Self {
            queue,
            by_task: HashMap::new(),
            by_path: HashMap::new(),
        }
    }

    pub fn queue(&self) -> &UpdateQueue<F> {
        &self.queue
    }

    /// List every markdown note in the vault, skipping hidden entries.
    pub async fn list_notes(&self) -> Result<Vec<String>> {
        let fs = self.queue.store().fs();
        let mut notes = Vec::new();
        let mut dirs_to_visit = vec![String::new()];

        while let Some(dir) = dirs_to_visit.pop() {
            for entry in fs.list(&dir).await? {
                if entry.name.starts_with('.') {
                    continue;
                }
                let path = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };

                if entry.is_dir {
                    dirs_to_visit.push(path);
                } else if path.ends_with(".md") {
                    notes.push(path);
                }
            }
        }

        notes.sort();
        Ok(notes)
    }

    /// Index every linked note in the vault. Notes that cannot be read are
    /// skipped with a warning.
    pub async fn build(&mut self) -> Result<usize> {
        self.by_task.clear();
        self.by_path.clear();

        for path in self.list_notes().await? {
            match self.queue.store().read(&path).await {
                Ok(meta) => self.insert(&path, &meta),
                Err(e) => warn!("Skipping {}: {}", path, e),
            }
        }

        info!("Indexed {} linked note(s)", self.by_task.len());
        Ok(self.by_task.len())
    }

    fn insert(&mut self, path: &str, meta: &TaskMetadata) {
        let Some(task_id) = meta.task_id.as_deref().filter(|_| meta.is_linked()) else {
            return;
        };
        if let Some(existing) = self.by_task.get(task_id) {
            if existing.path != path {
                warn!(
                    "Task {} is linked from both {} and {}; keeping {}",
                    task_id, existing.path, path, existing.path
                );
                return;
            }
        }
        self.by_path.insert(path.to_string(), task_id.to_string());
        self.by_task.insert(
            task_id.to_string(),
            LinkedNote {
                path: path.to_string(),
                project_id: meta.project_id.clone(),
                status: meta.status,
            },
        );
    }

    fn remove_path(&mut self, path: &str) -> Option<String> {
        let task_id = self.by_path.remove(path)?;
        self.by_task.remove(&task_id);
        Some(task_id)
    }

    pub fn note_for_task(&self, task_id: &str) -> Option<&LinkedNote> {
        self.by_task.get(task_id)
    }

    pub fn task_for_note(&self, path: &str) -> Option<&str> {
        self.by_path.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }

    /// Project ids referenced by indexed notes, sorted.
    pub fn project_ids(&self) -> Vec<String> {
        self.by_task
            .values()
            .filter_map(|note| note.project_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Mark every indexed task active and record its known state.
    pub fn seed<C: TaskClient + 'static>(&self, poller: &StatusPoller<C>) {
        for (task_id, note) in &self.by_task {
            poller.track_task(task_id);
            if let Some(status) = note.status {
                poller.set_known_state(task_id, status, false);
            }
        }
    }

    /// Write a poller notification into the task's note.
    ///
    /// Returns `Ok(false)` when no note is linked to the task.
    pub async fn apply_update(&mut self, task: &TaskSummary) -> Result<bool> {
        let Some(note) = self.by_task.get_mut(&task.id) else {
            debug!("No note linked to task {}", task.id);
            return Ok(false);
        };

        let mut update = TaskMetadata {
            status: Some(task.status),
            last_synced: Some(now_rfc3339()),
            ..Default::default()
        };
        if task.status != TaskStatus::Deleted {
            update.title = Some(task.title.clone()).filter(|t| !t.is_empty());
            update.executor = task.executor.clone().filter(|e| !e.is_empty());
        }

        note.status = Some(task.status);
        let path = note.path.clone();
        info!("Task {} is now {} ({})", task.id, task.status, path);
        self.queue.update(&path, update).await?;
        Ok(true)
    }

    /// Re-read a note after it changed on disk and update the links.
    pub async fn on_document_changed<C: TaskClient + 'static>(
        &mut self,
        path: &str,
        poller: &StatusPoller<C>,
    ) -> Result<()> {
        let meta = match self.queue.store().read(path).await {
            Ok(meta) => meta,
            Err(MetadataError::NotFound(_)) => return self.on_document_deleted(path, poller),
            Err(e) => return Err(e.into()),
        };

        let previous = self.by_path.get(path).cloned();
        let current = meta.task_id.clone().filter(|_| meta.is_linked());

        if previous == current {
            if let Some(note) = current.and_then(|id| self.by_task.get_mut(&id)) {
                note.project_id = meta.project_id.clone();
                note.status = meta.status;
            }
            return Ok(());
        }

        if let Some(old) = previous {
            self.remove_path(path);
            poller.untrack_task(&old);
            debug!("{} no longer linked to task {}", path, old);
        }

        if let Some(task_id) = current {
            self.insert(path, &meta);
            if self.task_for_note(path) == Some(task_id.as_str()) {
                poller.track_task(&task_id);
                if let Some(status) = meta.status {
                    poller.set_known_state(&task_id, status, false);
                }
                if let Some(project_id) = &meta.project_id {
                    poller.add_project(project_id);
                }
                debug!("{} linked to task {}", path, task_id);
            }
        }
        Ok(())
    }

    pub fn on_document_deleted<C: TaskClient + 'static>(
        &mut self,
        path: &str,
        poller: &StatusPoller<C>,
    ) -> Result<()> {
        if let Some(task_id) = self.remove_path(path) {
            poller.untrack_task(&task_id);
            debug!("{} deleted, untracked task {}", path, task_id);
        }
        Ok(())
    }

    pub fn on_document_renamed(&mut self, from: &str, to: &str) {
        let Some(task_id) = self.by_path.remove(from) else {
            return;
        };
        if let Some(note) = self.by_task.get_mut(&task_id) {
            note.path = to.to_string();
        }
        self.by_path.insert(to.to_string(), task_id);
    }

    /// Push a note to the task service.
    ///
    /// Unlinked notes with a project id get a new task; linked notes send
    /// their title and status. Either way the task ends up tracked.
    pub async fn push_document<A, C>(
        &mut self,
        api: &A,
        service_url: &str,
        path: &str,
        poller: &StatusPoller<C>,
    ) -> Result<PushOutcome>
    where
        A: TaskApi + ?Sized,
        C: TaskClient + 'static,
    {
        let meta = self.queue.store().read(path).await?;
        let title = meta
            .title
            .clone()
            .unwrap_or_else(|| file_stem(path).to_string());

        let (task, outcome) = if meta.is_linked() {
            let task_id = meta.task_id.clone().unwrap_or_default();
            let update = UpdateTask {
                title: Some(title),
                status: meta.status.filter(|s| *s != TaskStatus::NotSynced),
                ..Default::default()
            };
            let task = api.update_task(service_url, &task_id, &update).await?;
            (task, PushOutcome::Updated { task_id })
        } else {
            let project_id = meta
                .project_id
                .clone()
                .ok_or_else(|| IndexError::NoProject(path.to_string()))?;
            let create = CreateTask {
                project_id: project_id.clone(),
                title,
                description: None,
            };
            let task = api.create_task(service_url, &create).await?;
            let project_name = match meta.project_name {
                Some(name) => Some(name),
                None => match api.get_project(service_url, &project_id).await {
                    Ok(project) => Some(project.name).filter(|n| !n.is_empty()),
                    Err(e) => {
                        warn!("Could not look up project {}: {}", project_id, e);
                        None
                    }
                },
            };
            let task_id = task.id.clone();
            let update = TaskMetadata {
                task_id: Some(task.id.clone()),
                project_id: Some(project_id),
                project_name,
                ..Default::default()
            };
            self.queue.update(path, update).await?;
            (task, PushOutcome::Created { task_id })
        };

        self.queue
            .update(
                path,
                TaskMetadata {
                    status: Some(task.status),
                    last_synced: Some(now_rfc3339()),
                    ..Default::default()
                },
            )
            .await?;

        let meta = self.queue.store().read(path).await?;
        self.remove_path(path);
        self.insert(path, &meta);
        poller.track_task(&task.id);
        poller.set_known_state(&task.id, task.status, task.has_in_progress_attempt);
        if let Some(project_id) = &meta.project_id {
            poller.add_project(project_id);
        }

        info!("Pushed {} as task {}", path, task.id);
        Ok(outcome)
    }
}
