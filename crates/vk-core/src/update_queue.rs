//! Per-note FIFO queue for frontmatter writes.
//!
//! Each path maps to the tail of its pending chain. A new update waits for the
//! current tail to settle (success, failure or panic), performs its own
//! merge-write, and then releases the entry if nothing was queued behind it.
//! Different paths never wait on each other.

use crate::fs::FileSystem;
use crate::metadata::{MetadataError, MetadataStore, Result, TaskMetadata};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// Resolves once the link it belongs to has settled.
type Tail = Shared<BoxFuture<'static, ()>>;

struct QueueEntry {
    id: u64,
    tail: Tail,
}

#[derive(Default)]
struct Chains {
    entries: HashMap<String, QueueEntry>,
    next_id: u64,
}

/// Settles a link when dropped, and clears the path's entry if this link is
/// still the tail. Runs on panic too, so a failed write never wedges the chain.
struct LinkGuard {
    chains: Arc<Mutex<Chains>>,
    path: String,
    id: u64,
    settled: Option<oneshot::Sender<()>>,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        {
            let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
            if chains
                .entries
                .get(&self.path)
                .is_some_and(|entry| entry.id == self.id)
            {
                chains.entries.remove(&self.path);
            }
        }
        if let Some(tx) = self.settled.take() {
            let _ = tx.send(());
        }
    }
}

/// Serializes [`MetadataStore::merge_update`] calls per note path.
pub struct UpdateQueue<F: FileSystem + 'static> {
    store: Arc<MetadataStore<F>>,
    chains: Arc<Mutex<Chains>>,
}

impl<F: FileSystem + 'static> Clone for UpdateQueue<F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            chains: Arc::clone(&self.chains),
        }
    }
}

impl<F: FileSystem + 'static> UpdateQueue<F> {
    pub fn new(store: Arc<MetadataStore<F>>) -> Self {
        Self {
            store,
            chains: Arc::new(Mutex::new(Chains::default())),
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore<F>> {
        &self.store
    }

    /// Queue a merge-update for `path`.
    ///
    /// The update is registered immediately, so two calls made one after the
    /// other are applied in that order no matter when their futures are
    /// polled. The write runs on the tokio runtime and completes even if the
    /// returned future is dropped. The future resolves with this update's
    /// own result only.
    ///
    /// Must be called from within a tokio runtime.
    pub fn update(
        &self,
        path: &str,
        fields: TaskMetadata,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let (settled_tx, settled_rx) = oneshot::channel::<()>();
        let tail: Tail = settled_rx.map(|_| ()).boxed().shared();

        let (id, previous) = {
            let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
            let id = chains.next_id;
            chains.next_id += 1;
            let previous = chains
                .entries
                .insert(path.to_string(), QueueEntry { id, tail })
                .map(|entry| entry.tail);
            (id, previous)
        };

        let guard = LinkGuard {
            chains: Arc::clone(&self.chains),
            path: path.to_string(),
            id,
            settled: Some(settled_tx),
        };
        let store = Arc::clone(&self.store);
        let task_path = path.to_string();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            if let Some(previous) = previous {
                previous.await;
            }
            debug!("Writing frontmatter for {}", task_path);
            store.merge_update(&task_path, &fields).await
        });

        let path = path.to_string();
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(MetadataError::Interrupted {
                    path,
                    reason: e.to_string(),
                }),
            }
        }
    }

    /// Number of paths with queued or in-flight updates.
    pub fn pending_paths(&self) -> usize {
        self.chains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}
