//! Daemon state and event loop.
//!
//! Poller notifications arrive on an mpsc channel and are written into notes;
//! watcher events keep the index (and the poller's active set) current.

use crate::watcher::{FileEvent, FileEventKind};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vk_core::{
    FileSystem, MetadataStore, PollerConfig, StatusPoller, TaskApi, TaskIndex, TaskSummary,
    UpdateQueue,
};

/// Runtime settings that are not part of [`PollerConfig`].
#[derive(Debug, Clone, Default)]
pub struct DaemonSettings {
    pub service_url: String,
    /// Polled in addition to the projects referenced by notes
    pub projects: Vec<String>,
    pub push_unlinked: bool,
    /// Log failed polls
    pub debug: bool,
}

pub struct Daemon<F: FileSystem + 'static, A: TaskApi + Clone + 'static> {
    index: TaskIndex<F>,
    poller: StatusPoller<A>,
    api: A,
    settings: DaemonSettings,
}

impl<F: FileSystem + 'static, A: TaskApi + Clone + 'static> Daemon<F, A> {
    /// Index the vault, seed the poller with what notes already say, and
    /// start polling. Returns the channel poller notifications arrive on.
    pub async fn start(
        fs: F,
        api: A,
        config: PollerConfig,
        settings: DaemonSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TaskSummary>)> {
        let queue = UpdateQueue::new(Arc::new(MetadataStore::new(fs)));
        let mut index = TaskIndex::new(queue);
        index.build().await.context("Failed to index vault")?;

        let poller = StatusPoller::new(api.clone(), config);
        index.seed(&poller);

        let mut projects = settings.projects.clone();
        projects.extend(index.project_ids());

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        poller.start(
            &settings.service_url,
            projects,
            move |task| {
                // Receiver gone means the daemon is shutting down
                let _ = updates_tx.send(task);
            },
            settings.debug,
        );
        info!(
            "Polling {} project(s) on {}",
            poller.project_ids().len(),
            settings.service_url
        );

        let mut daemon = Self {
            index,
            poller,
            api,
            settings,
        };
        if daemon.settings.push_unlinked {
            daemon.push_unlinked_notes().await;
        }
        Ok((daemon, updates_rx))
    }

    pub fn index(&self) -> &TaskIndex<F> {
        &self.index
    }

    pub fn poller(&self) -> &StatusPoller<A> {
        &self.poller
    }

    /// Write a poller notification into its note.
    pub async fn on_task_update(&mut self, task: TaskSummary) {
        match self.index.apply_update(&task).await {
            Ok(true) => {}
            Ok(false) => debug!("Ignoring update for unlinked task {}", task.id),
            Err(e) => error!("Failed to record {} for task {}: {}", task.status, task.id, e),
        }
    }

    pub async fn on_file_event(&mut self, event: FileEvent) {
        match event.kind {
            FileEventKind::Modified => {
                if let Err(e) = self
                    .index
                    .on_document_changed(&event.path, &self.poller)
                    .await
                {
                    warn!("Failed to re-index {}: {}", event.path, e);
                    return;
                }
                if self.settings.push_unlinked {
                    self.push_if_unlinked(&event.path).await;
                }
            }
            FileEventKind::Deleted => {
                if let Err(e) = self.index.on_document_deleted(&event.path, &self.poller) {
                    warn!("Failed to unindex {}: {}", event.path, e);
                }
            }
        }
    }

    async fn push_unlinked_notes(&mut self) {
        let notes = match self.index.list_notes().await {
            Ok(notes) => notes,
            Err(e) => {
                warn!("Failed to list notes: {}", e);
                return;
            }
        };
        for path in notes {
            self.push_if_unlinked(&path).await;
        }
    }

    async fn push_if_unlinked(&mut self, path: &str) {
        if self.index.task_for_note(path).is_some() {
            return;
        }
        let meta = match self.index.queue().store().read(path).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!("Not pushing {}: {}", path, e);
                return;
            }
        };
        if meta.is_linked() || meta.project_id.is_none() {
            return;
        }

        if let Err(e) = self
            .index
            .push_document(&self.api, &self.settings.service_url, path, &self.poller)
            .await
        {
            error!("Failed to create task for {}: {}", path, e);
        }
    }

    /// Serve until `shutdown` resolves, then stop the poller.
    pub async fn run(
        mut self,
        mut updates: mpsc::UnboundedReceiver<TaskSummary>,
        file_events: &mut mpsc::UnboundedReceiver<FileEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(task) = updates.recv() => {
                    self.on_task_update(task).await;
                }

                Some(event) = file_events.recv() => {
                    self.on_file_event(event).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.poller.stop();
    }
}
