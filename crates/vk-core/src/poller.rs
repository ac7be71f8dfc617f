//! Status poller: mirrors remote task state and reports transitions.
//!
//! One cycle lists the tasks of every project in order, compares each task's
//! [`CombinedState`] with the last one recorded, and reports differences
//! (including tasks that vanished from their project, reported as deleted).
//! Fetch failures are isolated per project and only stretch the interval to
//! the next cycle.
//!
//! Cycles are chained: the next one is scheduled only after the previous one
//! has finished, so two cycles never overlap.
//!
//! Memory is bounded two ways. Inactive tasks in a terminal phase are dropped
//! after every project pass, and if the tracked set still exceeds
//! [`PollerConfig::max_tracked`] the oldest inactive entries are evicted.
//! Tasks in the active set (backed by a note) are never dropped by either.

use crate::backoff::PollBackoff;
use crate::client::{ClientError, TaskClient, TaskSummary};
use crate::status::{CombinedState, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Receives one call per detected transition.
pub type UpdateCallback = Arc<dyn Fn(TaskSummary) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval between cycles while everything succeeds
    pub base_interval: Duration,
    /// Upper bound for the backed-off interval
    pub max_interval: Duration,
    /// Tracked task count above which inactive entries are evicted
    pub max_tracked: usize,
    /// Bound on each project listing request
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            max_tracked: 1000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl PollerConfig {
    pub fn with_intervals(mut self, base: Duration, max: Duration) -> Self {
        self.base_interval = base;
        self.max_interval = max;
        self
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Lifecycle of the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerPhase {
    /// Not started, or stopped
    Stopped,
    /// Started, but there is nothing to poll (or cycles are driven manually)
    Idle,
    /// A cycle is in progress
    Polling,
    /// Waiting for the next cycle
    Scheduled,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Projects whose listing failed or timed out
    pub failed_projects: Vec<String>,
    /// Transitions reported during the cycle, in emission order
    pub notifications: Vec<TaskSummary>,
    /// Delay before the next cycle
    pub next_interval: Duration,
}

#[derive(Debug, Clone)]
struct TrackedTask {
    /// Unknown for tasks seeded from a note but not yet seen in a listing
    project_id: Option<String>,
    state: CombinedState,
    /// Insertion order, used to pick eviction candidates
    seq: u64,
}

struct PollerState {
    phase: PollerPhase,
    /// Bumped on every start and stop; a cycle from an older generation
    /// discards its results.
    generation: u64,
    /// Cycles are driven through `poll_once` instead of a timer
    manual: bool,
    service_url: String,
    debug: bool,
    on_update: Option<UpdateCallback>,
    projects: Vec<String>,
    tracked: HashMap<String, TrackedTask>,
    next_seq: u64,
    active: HashSet<String>,
    backoff: PollBackoff,
}

impl PollerState {
    fn is_current(&self, generation: u64) -> bool {
        self.phase != PollerPhase::Stopped && self.generation == generation
    }

    fn record(&mut self, id: &str, project_id: Option<&str>, state: CombinedState) {
        match self.tracked.get_mut(id) {
            Some(entry) => {
                entry.state = state;
                if let Some(project_id) = project_id {
                    entry.project_id = Some(project_id.to_string());
                }
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.tracked.insert(
                    id.to_string(),
                    TrackedTask {
                        project_id: project_id.map(str::to_string),
                        state,
                        seq,
                    },
                );
            }
        }
    }

    /// Diff one project's listing against tracked state and return the
    /// transitions to report.
    fn apply_listing(&mut self, project_id: &str, tasks: Vec<TaskSummary>) -> Vec<TaskSummary> {
        let mut changes = Vec::new();

        let present: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut vanished: Vec<(u64, String)> = self
            .tracked
            .iter()
            .filter(|(id, task)| {
                task.project_id.as_deref() == Some(project_id)
                    && task.state.status != TaskStatus::Deleted
                    && !present.contains(id.as_str())
            })
            .map(|(id, task)| (task.seq, id.clone()))
            .collect();
        vanished.sort_unstable();

        for (_, id) in vanished {
            debug!("Task {} no longer listed in project {}", id, project_id);
            self.tracked.remove(&id);
            changes.push(TaskSummary::deleted(&id, project_id));
        }

        for mut task in tasks {
            let state = CombinedState::new(task.status, task.has_in_progress_attempt);
            let previous = self.tracked.get(&task.id).map(|t| t.state);
            self.record(&task.id, Some(project_id), state);

            if let Some(previous) = previous {
                if previous != state {
                    debug!("Task {} changed {} -> {}", task.id, previous, state);
                    if task.project_id.is_empty() {
                        task.project_id = project_id.to_string();
                    }
                    changes.push(task);
                }
            }
        }

        changes
    }

    fn cleanup_terminal(&mut self) -> usize {
        let before = self.tracked.len();
        let active = &self.active;
        self.tracked
            .retain(|id, task| !task.state.status.is_terminal() || active.contains(id));
        before - self.tracked.len()
    }

    fn evict_over_capacity(&mut self, max_tracked: usize) -> usize {
        if self.tracked.len() <= max_tracked {
            return 0;
        }
        let excess = self.tracked.len() - max_tracked;
        let mut candidates: Vec<(u64, String)> = self
            .tracked
            .iter()
            .filter(|(id, _)| !self.active.contains(id.as_str()))
            .map(|(id, task)| (task.seq, id.clone()))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0;
        for (_, id) in candidates.into_iter().take(excess) {
            self.tracked.remove(&id);
            evicted += 1;
        }
        evicted
    }
}

struct Inner<C> {
    client: C,
    config: PollerConfig,
    state: Mutex<PollerState>,
    /// Wakes a sleeping loop when the poller is stopped
    wake: Notify,
}

impl<C> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Polls the task service and reports task state transitions.
///
/// Cheap to clone; clones share the same state.
pub struct StatusPoller<C: TaskClient + 'static> {
    inner: Arc<Inner<C>>,
}

impl<C: TaskClient + 'static> Clone for StatusPoller<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn normalize_projects<I, S>(project_ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut projects: Vec<String> = Vec::new();
    for id in project_ids {
        let id = id.into().trim().to_string();
        if !id.is_empty() && !projects.contains(&id) {
            projects.push(id);
        }
    }
    projects
}

impl<C: TaskClient + 'static> StatusPoller<C> {
    pub fn new(client: C, config: PollerConfig) -> Self {
        let backoff = PollBackoff::new(config.base_interval, config.max_interval);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                state: Mutex::new(PollerState {
                    phase: PollerPhase::Stopped,
                    generation: 0,
                    manual: false,
                    service_url: String::new(),
                    debug: false,
                    on_update: None,
                    projects: Vec::new(),
                    tracked: HashMap::new(),
                    next_seq: 0,
                    active: HashSet::new(),
                    backoff,
                }),
                wake: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    /// Start polling `project_ids` on `service_url`.
    ///
    /// Does nothing if already running. Empty project ids are dropped; with
    /// no projects left the poller counts as running but makes no requests
    /// until [`add_project`](Self::add_project) is called. Otherwise the
    /// first cycle starts right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<I, S>(
        &self,
        service_url: &str,
        project_ids: I,
        on_update: impl Fn(TaskSummary) + Send + Sync + 'static,
        debug: bool,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.begin(service_url, project_ids, Arc::new(on_update), debug, false);
    }

    /// Like [`start`](Self::start), but no timer is scheduled: the caller
    /// runs each cycle with [`poll_once`](Self::poll_once).
    pub fn start_manual<I, S>(
        &self,
        service_url: &str,
        project_ids: I,
        on_update: impl Fn(TaskSummary) + Send + Sync + 'static,
        debug: bool,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.begin(service_url, project_ids, Arc::new(on_update), debug, true);
    }

    fn begin<I, S>(
        &self,
        service_url: &str,
        project_ids: I,
        on_update: UpdateCallback,
        debug: bool,
        manual: bool,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let generation = {
            let mut state = self.inner.lock();
            if state.phase != PollerPhase::Stopped {
                debug!("Status poller already running");
                return;
            }

            state.generation += 1;
            state.manual = manual;
            state.service_url = normalize_url(service_url);
            state.projects = normalize_projects(project_ids);
            state.on_update = Some(on_update);
            state.debug = debug;
            state.backoff.reset();

            info!(
                "Starting status poller for {} project(s) at {}",
                state.projects.len(),
                state.service_url
            );

            if manual || state.projects.is_empty() {
                state.phase = PollerPhase::Idle;
                return;
            }
            state.phase = PollerPhase::Polling;
            state.generation
        };

        self.spawn_loop(generation);
    }

    fn spawn_loop(&self, generation: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_loop(inner, generation).await;
        });
    }

    /// Add a project to poll from the next cycle on.
    pub fn add_project(&self, project_id: &str) {
        let project_id = project_id.trim();
        if project_id.is_empty() {
            return;
        }

        let spawn = {
            let mut state = self.inner.lock();
            if state.projects.iter().any(|p| p == project_id) {
                return;
            }
            state.projects.push(project_id.to_string());
            debug!("Added project {} to status poller", project_id);

            // The first project for a poller started empty kicks off the loop
            if state.phase == PollerPhase::Idle && !state.manual {
                state.phase = PollerPhase::Polling;
                Some(state.generation)
            } else {
                None
            }
        };

        if let Some(generation) = spawn {
            self.spawn_loop(generation);
        }
    }

    /// Mark a task as backed by a note. Active tasks are never evicted.
    pub fn track_task(&self, task_id: &str) {
        if task_id.is_empty() {
            return;
        }
        self.inner.lock().active.insert(task_id.to_string());
    }

    /// Forget a task entirely: active membership, recorded state and project.
    pub fn untrack_task(&self, task_id: &str) {
        let mut state = self.inner.lock();
        state.active.remove(task_id);
        state.tracked.remove(task_id);
    }

    /// Record a task's state without reporting it, so that state already
    /// reflected in a note does not show up as a change on the first cycle.
    pub fn set_known_state(&self, task_id: &str, status: TaskStatus, executing: bool) {
        if task_id.is_empty() {
            return;
        }
        self.inner
            .lock()
            .record(task_id, None, CombinedState::new(status, executing));
    }

    /// Stop polling and forget all tracked state. A cycle in flight finishes
    /// its current request but its results are discarded.
    pub fn stop(&self) {
        {
            let mut state = self.inner.lock();
            if state.phase == PollerPhase::Stopped {
                return;
            }
            state.phase = PollerPhase::Stopped;
            state.generation += 1;
            state.manual = false;
            state.on_update = None;
            state.projects.clear();
            state.tracked.clear();
            state.active.clear();
            state.backoff.reset();
            info!("Status poller stopped");
        }
        self.inner.wake.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().phase != PollerPhase::Stopped
    }

    /// Run one cycle now.
    ///
    /// Only available after [`start_manual`](Self::start_manual); returns
    /// `None` when stopped, when a timer owns the cycles, or when the poller
    /// was stopped while the cycle ran.
    pub async fn poll_once(&self) -> Option<CycleReport> {
        let generation = {
            let mut state = self.inner.lock();
            if state.phase != PollerPhase::Idle || !state.manual {
                return None;
            }
            // Claimed here so a concurrent call sees Polling
            state.phase = PollerPhase::Polling;
            state.generation
        };
        let report = poll_cycle(&self.inner, generation).await;
        let mut state = self.inner.lock();
        if state.is_current(generation) {
            state.phase = PollerPhase::Idle;
        }
        report
    }

    pub fn phase(&self) -> PollerPhase {
        self.inner.lock().phase
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.inner.lock().projects.clone()
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().tracked.len()
    }

    pub fn combined_state(&self, task_id: &str) -> Option<CombinedState> {
        self.inner.lock().tracked.get(task_id).map(|t| t.state)
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.inner.lock().active.contains(task_id)
    }

    pub fn current_interval(&self) -> Duration {
        self.inner.lock().backoff.current()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().backoff.consecutive_errors()
    }
}

async fn run_loop<C: TaskClient>(inner: Arc<Inner<C>>, generation: u64) {
    loop {
        let Some(report) = poll_cycle(&inner, generation).await else {
            break;
        };

        let notified = inner.wake.notified();
        tokio::pin!(notified);
        // Register before checking state so a stop in between is not missed
        notified.as_mut().enable();
        {
            let mut state = inner.lock();
            if !state.is_current(generation) {
                break;
            }
            state.phase = PollerPhase::Scheduled;
        }
        debug!("Next status poll in {:?}", report.next_interval);

        tokio::select! {
            _ = tokio::time::sleep(report.next_interval) => {}
            _ = &mut notified => {}
        }
    }
    debug!("Status poll loop (generation {}) exited", generation);
}

async fn poll_cycle<C: TaskClient>(inner: &Inner<C>, generation: u64) -> Option<CycleReport> {
    let (service_url, projects) = {
        let mut state = inner.lock();
        if !state.is_current(generation) {
            return None;
        }
        state.phase = PollerPhase::Polling;
        (state.service_url.clone(), state.projects.clone())
    };

    let timeout = inner.config.request_timeout;
    let mut report = CycleReport::default();

    for project_id in projects {
        if !inner.lock().is_current(generation) {
            return None;
        }

        let result = match tokio::time::timeout(
            timeout,
            inner.client.list_tasks(&service_url, &project_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        };

        let (changes, callback) = {
            let mut state = inner.lock();
            if !state.is_current(generation) {
                return None;
            }
            match result {
                Ok(tasks) => {
                    let changes = state.apply_listing(&project_id, tasks);
                    let purged = state.cleanup_terminal();
                    let evicted = state.evict_over_capacity(inner.config.max_tracked);
                    if purged + evicted > 0 {
                        debug!(
                            "Dropped {} terminal and {} over-capacity task(s)",
                            purged, evicted
                        );
                    }
                    (changes, state.on_update.clone())
                }
                Err(e) => {
                    if state.debug {
                        warn!("Failed to poll project {}: {}", project_id, e);
                    }
                    report.failed_projects.push(project_id);
                    continue;
                }
            }
        };

        // Callbacks run without the lock held so they may call back in
        if let Some(callback) = callback {
            for task in &changes {
                if !inner.lock().is_current(generation) {
                    return None;
                }
                callback(task.clone());
            }
        }
        report.notifications.extend(changes);
    }

    let mut state = inner.lock();
    if !state.is_current(generation) {
        return None;
    }
    report.next_interval = state.backoff.record_cycle(!report.failed_projects.is_empty());
    if state.debug && !report.failed_projects.is_empty() {
        warn!(
            "{} project(s) failed, backing off to {:?} ({} consecutive)",
            report.failed_projects.len(),
            report.next_interval,
            state.backoff.consecutive_errors()
        );
    }
    debug!(
        "Status poll cycle: {} change(s), {} tracked",
        report.notifications.len(),
        state.tracked.len()
    );
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    enum Listing {
        Tasks(Vec<TaskSummary>),
        Fail,
        Delay(Duration, Vec<TaskSummary>),
    }

    #[derive(Default)]
    struct FakeClient {
        listings: Mutex<HashMap<String, Listing>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeClient {
        fn set(&self, project: &str, listing: Listing) {
            self.listings
                .lock()
                .unwrap()
                .insert(project.to_string(), listing);
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl TaskClient for FakeClient {
        async fn list_tasks(
            &self,
            service_url: &str,
            project_id: &str,
        ) -> crate::client::Result<Vec<TaskSummary>> {
            self.calls
                .lock()
                .unwrap()
                .push((service_url.to_string(), project_id.to_string()));
            let (delay, result) = {
                let listings = self.listings.lock().unwrap();
                match listings.get(project_id) {
                    Some(Listing::Tasks(tasks)) => (None, Ok(tasks.clone())),
                    Some(Listing::Delay(delay, tasks)) => (Some(*delay), Ok(tasks.clone())),
                    Some(Listing::Fail) | None => (
                        None,
                        Err(ClientError::Transport("connection refused".into())),
                    ),
                }
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }

    fn task(id: &str, status: TaskStatus, executing: bool) -> TaskSummary {
        TaskSummary {
            id: id.to_string(),
            project_id: "p1".to_string(),
            title: format!("Task {}", id),
            status,
            has_in_progress_attempt: executing,
            ..Default::default()
        }
    }

    type Seen = Arc<Mutex<Vec<TaskSummary>>>;

    fn manual_poller(
        config: PollerConfig,
        projects: &[&str],
    ) -> (StatusPoller<Arc<FakeClient>>, Arc<FakeClient>, Seen) {
        let client = Arc::new(FakeClient::default());
        let poller = StatusPoller::new(Arc::clone(&client), config);
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        poller.start_manual(
            "http://localhost:3000",
            projects.iter().copied(),
            move |task| sink.lock().unwrap().push(task),
            true,
        );
        (poller, client, seen)
    }

    // ==================== Change detection ====================

    #[tokio::test]
    async fn test_seeded_state_transition_notifies_once() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.set_known_state("T1", TaskStatus::Todo, false);
        assert!(seen.lock().unwrap().is_empty());

        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::InProgress, true)]));
        let report = poller.poll_once().await.unwrap();

        assert_eq!(report.notifications.len(), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, "T1");
        assert_eq!(seen[0].status, TaskStatus::InProgress);
        assert_eq!(
            poller.combined_state("T1"),
            Some(CombinedState::new(TaskStatus::InProgress, true))
        );
    }

    #[tokio::test]
    async fn test_identical_states_never_notify() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.set_known_state("T1", TaskStatus::Todo, false);
        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::Todo, false)]));

        for _ in 0..3 {
            poller.poll_once().await.unwrap();
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execution_flag_alone_is_a_change() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::InProgress, false)]));
        poller.poll_once().await.unwrap();

        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::InProgress, true)]));
        poller.poll_once().await.unwrap();
        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::InProgress, true)]));
        poller.poll_once().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].has_in_progress_attempt);
    }

    #[tokio::test]
    async fn test_first_observation_is_silent_even_when_terminal() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        client.set(
            "p1",
            Listing::Tasks(vec![
                task("T1", TaskStatus::Todo, false),
                task("T2", TaskStatus::Done, false),
            ]),
        );
        poller.poll_once().await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notification_fills_missing_project_id() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.set_known_state("T1", TaskStatus::Todo, false);
        let mut listed = task("T1", TaskStatus::InReview, false);
        listed.project_id.clear();
        client.set("p1", Listing::Tasks(vec![listed]));

        poller.poll_once().await.unwrap();
        assert_eq!(seen.lock().unwrap()[0].project_id, "p1");
    }

    // ==================== Deletion ====================

    #[tokio::test]
    async fn test_vanished_task_reported_deleted_once() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.track_task("T1");
        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::Todo, false)]));
        poller.poll_once().await.unwrap();

        client.set("p1", Listing::Tasks(vec![]));
        poller.poll_once().await.unwrap();
        poller.poll_once().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], TaskSummary::deleted("T1", "p1"));
        assert_eq!(poller.combined_state("T1"), None);
        assert_eq!(poller.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_deletion_scoped_to_owning_project() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1", "p2"]);
        let mut other = task("T2", TaskStatus::Todo, false);
        other.project_id = "p2".into();
        client.set("p1", Listing::Tasks(vec![]));
        client.set("p2", Listing::Tasks(vec![other]));
        poller.poll_once().await.unwrap();

        // p2 fails, p1 still empty: T2 must not be reported deleted
        client.set("p2", Listing::Fail);
        poller.poll_once().await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert!(poller.combined_state("T2").is_some());
    }

    #[tokio::test]
    async fn test_seeded_task_without_project_is_not_deleted() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.track_task("T1");
        poller.set_known_state("T1", TaskStatus::Todo, false);
        client.set("p1", Listing::Tasks(vec![]));

        poller.poll_once().await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert!(poller.combined_state("T1").is_some());
    }

    // ==================== Failures and backoff ====================

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let config = PollerConfig {
            base_interval: Duration::from_millis(5000),
            max_interval: Duration::from_millis(60000),
            ..Default::default()
        };
        let (poller, client, _seen) = manual_poller(config, &["p1"]);
        client.set("p1", Listing::Fail);

        let mut intervals = Vec::new();
        for _ in 0..3 {
            intervals.push(poller.poll_once().await.unwrap().next_interval);
        }
        assert_eq!(
            intervals,
            [
                Duration::from_millis(5000),
                Duration::from_millis(10000),
                Duration::from_millis(20000)
            ]
        );
        assert_eq!(poller.consecutive_errors(), 3);

        client.set("p1", Listing::Tasks(vec![]));
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.next_interval, Duration::from_millis(5000));
        assert_eq!(poller.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_failing_project_does_not_starve_others() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1", "p2"]);
        let mut t2 = task("T2", TaskStatus::Todo, false);
        t2.project_id = "p2".into();
        client.set("p1", Listing::Fail);
        client.set("p2", Listing::Tasks(vec![t2.clone()]));
        poller.poll_once().await.unwrap();

        t2.status = TaskStatus::InProgress;
        client.set("p2", Listing::Tasks(vec![t2]));
        let report = poller.poll_once().await.unwrap();

        assert_eq!(report.failed_projects, ["p1"]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(client.calls(), ["p1", "p2", "p1", "p2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_counts_as_failure() {
        let config = PollerConfig {
            request_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (poller, client, _seen) = manual_poller(config, &["p1"]);
        client.set("p1", Listing::Delay(Duration::from_secs(3600), vec![]));

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.failed_projects, ["p1"]);
        assert_eq!(poller.consecutive_errors(), 1);
    }

    // ==================== Cleanup and capacity ====================

    #[tokio::test]
    async fn test_terminal_inactive_tasks_are_purged() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.track_task("KEEP");
        client.set(
            "p1",
            Listing::Tasks(vec![
                task("KEEP", TaskStatus::Todo, false),
                task("DROP", TaskStatus::Todo, false),
            ]),
        );
        poller.poll_once().await.unwrap();

        client.set(
            "p1",
            Listing::Tasks(vec![
                task("KEEP", TaskStatus::Done, false),
                task("DROP", TaskStatus::Cancelled, false),
            ]),
        );
        poller.poll_once().await.unwrap();

        // Both transitions are reported before cleanup runs
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(
            poller.combined_state("KEEP"),
            Some(CombinedState::new(TaskStatus::Done, false))
        );
        assert_eq!(poller.combined_state("DROP"), None);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_inactive() {
        let config = PollerConfig {
            max_tracked: 3,
            ..Default::default()
        };
        let (poller, client, _seen) = manual_poller(config, &["p1"]);
        poller.track_task("a");
        client.set(
            "p1",
            Listing::Tasks(
                ["a", "b", "c", "d", "e"]
                    .iter()
                    .map(|id| task(id, TaskStatus::Todo, false))
                    .collect(),
            ),
        );
        poller.poll_once().await.unwrap();

        assert_eq!(poller.tracked_count(), 3);
        assert!(poller.combined_state("a").is_some());
        assert!(poller.combined_state("b").is_none());
        assert!(poller.combined_state("c").is_none());
        assert!(poller.combined_state("d").is_some());
        assert!(poller.combined_state("e").is_some());
    }

    #[tokio::test]
    async fn test_active_tasks_may_exceed_capacity() {
        let config = PollerConfig {
            max_tracked: 2,
            ..Default::default()
        };
        let (poller, client, _seen) = manual_poller(config, &["p1"]);
        let ids = ["a", "b", "c", "d"];
        for id in ids {
            poller.track_task(id);
        }
        client.set(
            "p1",
            Listing::Tasks(
                ids.iter()
                    .map(|id| task(id, TaskStatus::Done, false))
                    .chain(std::iter::once(task("x", TaskStatus::Todo, false)))
                    .collect(),
            ),
        );
        poller.poll_once().await.unwrap();

        assert_eq!(poller.tracked_count(), 4);
        assert!(poller.combined_state("x").is_none());
        assert!(ids.iter().all(|id| poller.combined_state(id).is_some()));
    }

    // ==================== Membership ====================

    #[tokio::test]
    async fn test_untrack_purges_immediately() {
        let (poller, client, seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.track_task("T1");
        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::Todo, false)]));
        poller.poll_once().await.unwrap();

        poller.untrack_task("T1");
        assert!(!poller.is_active("T1"));
        assert_eq!(poller.combined_state("T1"), None);

        // Re-observed from scratch: no notification for a state we no longer know
        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::InReview, false)]));
        poller.poll_once().await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_project_skips_empty_and_duplicates() {
        let (poller, client, _seen) = manual_poller(PollerConfig::default(), &["p1", "", "p1"]);
        assert_eq!(poller.project_ids(), ["p1"]);

        poller.add_project("");
        poller.add_project("p1");
        poller.add_project("p2");
        assert_eq!(poller.project_ids(), ["p1", "p2"]);

        client.set("p1", Listing::Tasks(vec![]));
        client.set("p2", Listing::Tasks(vec![]));
        poller.poll_once().await.unwrap();
        assert_eq!(client.calls(), ["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_service_url_is_normalized() {
        let client = Arc::new(FakeClient::default());
        client.set("p1", Listing::Tasks(vec![]));
        let poller = StatusPoller::new(Arc::clone(&client), PollerConfig::default());
        poller.start_manual("http://localhost:3000///", ["p1"], |_| {}, false);

        poller.poll_once().await.unwrap();
        assert_eq!(client.calls.lock().unwrap()[0].0, "http://localhost:3000");
    }

    #[tokio::test]
    async fn test_stop_clears_everything() {
        let (poller, client, _seen) = manual_poller(PollerConfig::default(), &["p1"]);
        poller.track_task("T1");
        client.set("p1", Listing::Fail);
        poller.poll_once().await.unwrap();

        poller.stop();
        poller.stop();

        assert!(!poller.is_running());
        assert_eq!(poller.phase(), PollerPhase::Stopped);
        assert_eq!(poller.tracked_count(), 0);
        assert!(!poller.is_active("T1"));
        assert_eq!(poller.consecutive_errors(), 0);
        assert!(poller.project_ids().is_empty());
        assert!(poller.poll_once().await.is_none());
    }

    #[tokio::test]
    async fn test_callback_may_call_back_into_poller() {
        let client = Arc::new(FakeClient::default());
        let poller = StatusPoller::new(Arc::clone(&client), PollerConfig::default());
        let handle = poller.clone();
        poller.start_manual(
            "http://localhost:3000",
            ["p1"],
            move |task| handle.untrack_task(&task.id),
            false,
        );
        poller.track_task("T1");
        poller.set_known_state("T1", TaskStatus::Todo, false);
        client.set("p1", Listing::Tasks(vec![task("T1", TaskStatus::Done, false)]));

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.notifications.len(), 1);
        assert!(!poller.is_active("T1"));
    }

    // ==================== Timer loop ====================

    fn timed_poller(projects: &[&str]) -> (StatusPoller<Arc<FakeClient>>, Arc<FakeClient>, Seen) {
        let client = Arc::new(FakeClient::default());
        let poller = StatusPoller::new(Arc::clone(&client), PollerConfig::default());
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        poller.start(
            "http://localhost:3000",
            projects.iter().copied(),
            move |task| sink.lock().unwrap().push(task),
            false,
        );
        (poller, client, seen)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_runs_immediately_then_on_interval() {
        let (poller, client, _seen) = timed_poller(&["p1"]);
        client.set("p1", Listing::Tasks(vec![]));
        advance(1).await;
        assert_eq!(client.calls().len(), 1);
        assert_eq!(poller.phase(), PollerPhase::Scheduled);

        advance(5000).await;
        assert_eq!(client.calls().len(), 2);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_backs_off_on_failures() {
        let (poller, client, _seen) = timed_poller(&["p1"]);
        client.set("p1", Listing::Fail);

        // Attempts at t=0, 5s, 15s, 35s
        advance(1).await;
        assert_eq!(client.calls().len(), 1);
        advance(5000).await;
        assert_eq!(client.calls().len(), 2);
        advance(9900).await;
        assert_eq!(client.calls().len(), 2);
        advance(100).await;
        assert_eq!(client.calls().len(), 3);
        advance(20000).await;
        assert_eq!(client.calls().len(), 4);
        assert_eq!(poller.current_interval(), Duration::from_secs(40));
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (poller, client, _seen) = timed_poller(&["p1"]);
        client.set("p1", Listing::Tasks(vec![]));
        poller.start("http://other", ["p2"], |_| {}, false);

        advance(1).await;
        assert_eq!(client.calls(), ["p1"]);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_project_set_makes_no_requests() {
        let (poller, client, _seen) = timed_poller(&["", "  "]);
        advance(60_000).await;

        assert!(poller.is_running());
        assert_eq!(poller.phase(), PollerPhase::Idle);
        assert!(client.calls().is_empty());

        client.set("p1", Listing::Tasks(vec![]));
        poller.add_project("p1");
        advance(1).await;
        assert_eq!(client.calls(), ["p1"]);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_sleeping_loop() {
        let (poller, client, _seen) = timed_poller(&["p1"]);
        client.set("p1", Listing::Tasks(vec![]));
        advance(1).await;
        poller.stop();

        advance(60_000).await;
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_cycle_discards_results_and_skips_remaining_projects() {
        let (poller, client, seen) = timed_poller(&["p1", "p2"]);
        poller.set_known_state("T1", TaskStatus::Todo, false);
        client.set(
            "p1",
            Listing::Delay(
                Duration::from_secs(1),
                vec![task("T1", TaskStatus::Done, false)],
            ),
        );
        client.set("p2", Listing::Tasks(vec![]));

        advance(100).await;
        poller.stop();
        advance(5000).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(client.calls(), ["p1"]);
        assert_eq!(poller.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_from_callback_halts_remaining_notifications() {
        let client = Arc::new(FakeClient::default());
        let poller = StatusPoller::new(Arc::clone(&client), PollerConfig::default());
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let handle = poller.clone();
        poller.start_manual(
            "http://localhost:3000",
            ["p1"],
            move |task| {
                sink.lock().unwrap().push(task);
                handle.stop();
            },
            true,
        );
        poller.set_known_state("T1", TaskStatus::Todo, false);
        poller.set_known_state("T2", TaskStatus::Todo, false);
        client.set(
            "p1",
            Listing::Tasks(vec![
                task("T1", TaskStatus::Done, false),
                task("T2", TaskStatus::Done, false),
            ]),
        );

        assert!(poller.poll_once().await.is_none());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_poll_once_runs_a_single_cycle() {
        let (poller, client, _seen) = manual_poller(PollerConfig::default(), &["p1"]);
        client.set("p1", Listing::Delay(Duration::from_millis(500), vec![]));

        let (first, second) = tokio::join!(poller.poll_once(), poller.poll_once());

        assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
        assert_eq!(client.calls(), ["p1"]);
        assert_eq!(poller.phase(), PollerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_starts_fresh_loop() {
        let (poller, client, _seen) = timed_poller(&["p1"]);
        client.set("p1", Listing::Tasks(vec![]));
        advance(1).await;
        poller.stop();

        poller.start("http://localhost:3000", ["p1"], |_| {}, false);
        advance(1).await;
        assert_eq!(client.calls().len(), 2);

        advance(5000).await;
        assert_eq!(client.calls().len(), 3);
        poller.stop();
    }
}
