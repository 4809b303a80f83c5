// ABOUTME: Per-session update dispatcher fanning platform events out to registered handlers.
// ABOUTME: Priority groups in ascending order; the first match suppresses all remaining groups for that update.

use crate::transport::Update;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Decides whether a handler wants an update. Must be cheap; runs inline in
/// the dispatch pass.
pub type Predicate = Arc<dyn Fn(&Update) -> bool + Send + Sync>;

/// Handler body invoked for a matched update. Errors are logged and do not
/// stop the worker loop.
pub type Callback = Arc<dyn Fn(Update) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Lifecycle of the dispatcher: `Stopped -> Running -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Running,
    /// No longer admitting events; queued events finish processing
    Draining,
}

/// Opaque ticket returned by `add_handler`, used to remove the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerHandle {
    id: u64,
    group: i64,
}

struct HandlerEntry {
    id: u64,
    predicate: Predicate,
    callback: Callback,
}

/// Outcome of one group's dispatch step, examined by the outer pass.
enum GroupOutcome {
    Matched,
    NoMatch,
}

type Groups = Arc<Mutex<BTreeMap<i64, Vec<Arc<HandlerEntry>>>>>;

/// Queues inbound updates and delivers each to at most one handler per pass.
///
/// Groups are processed in ascending numeric order; within a group, handlers
/// run in registration order. The first handler whose predicate matches
/// consumes the update for every group, not just its own. Registration
/// changes never affect a pass already snapshotted.
pub struct Dispatcher {
    groups: Groups,
    queue: std::sync::Mutex<Option<mpsc::UnboundedSender<Update>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    state: std::sync::Mutex<DispatcherState>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(Mutex::new(BTreeMap::new())),
            queue: std::sync::Mutex::new(None),
            workers: std::sync::Mutex::new(Vec::new()),
            state: std::sync::Mutex::new(DispatcherState::Stopped),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap()
    }

    /// Launch the worker pool. With more than one worker, ordering across
    /// updates is not guaranteed; relay correlation needs exactly one.
    pub fn start(&self, workers: usize) {
        let mut state = self.state.lock().unwrap();
        if *state != DispatcherState::Stopped {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.queue.lock().unwrap() = Some(tx);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::new();
        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let groups = Arc::clone(&self.groups);
            handles.push(tokio::spawn(async move {
                worker_loop(worker, rx, groups).await;
            }));
        }
        *self.workers.lock().unwrap() = handles;
        *state = DispatcherState::Running;
        tracing::debug!("update dispatcher started");
    }

    /// Stop admitting events, drain the queue, await in-flight handler work.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != DispatcherState::Running {
                return;
            }
            *state = DispatcherState::Draining;
        }
        // Dropping the sender closes the queue; workers exit once drained
        self.queue.lock().unwrap().take();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        *self.state.lock().unwrap() = DispatcherState::Stopped;
        tracing::debug!("update dispatcher stopped");
    }

    /// Called by the transport layer for every platform-pushed event.
    /// Never blocks; events arriving while stopped or draining are dropped.
    pub fn enqueue(&self, update: Update) {
        if let Some(tx) = self.queue.lock().unwrap().as_ref() {
            if tx.send(update).is_err() {
                tracing::debug!("update queue closed, dropping update");
            }
        }
    }

    /// Register a handler in `group`. Takes effect for the next dispatch
    /// pass, never for one already snapshotted.
    pub async fn add_handler(
        &self,
        predicate: Predicate,
        callback: Callback,
        group: i64,
    ) -> HandlerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut groups = self.groups.lock().await;
        groups.entry(group).or_default().push(Arc::new(HandlerEntry {
            id,
            predicate,
            callback,
        }));
        HandlerHandle { id, group }
    }

    /// Remove a previously registered handler. Removing twice is harmless.
    pub async fn remove_handler(&self, handle: HandlerHandle) {
        let mut groups = self.groups.lock().await;
        if let Some(entries) = groups.get_mut(&handle.group) {
            entries.retain(|entry| entry.id != handle.id);
            if entries.is_empty() {
                groups.remove(&handle.group);
            }
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.groups.lock().await.values().map(Vec::len).sum()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Update>>>,
    groups: Groups,
) {
    loop {
        let update = { rx.lock().await.recv().await };
        let Some(update) = update else {
            break;
        };
        // Snapshot under the registration lock; handlers registered or
        // removed during this pass only apply to the next update
        let snapshot: Vec<Vec<Arc<HandlerEntry>>> =
            { groups.lock().await.values().cloned().collect() };
        for group in &snapshot {
            match dispatch_group(&update, group).await {
                GroupOutcome::Matched => break,
                GroupOutcome::NoMatch => continue,
            }
        }
    }
    tracing::debug!(worker, "dispatch worker exited");
}

async fn dispatch_group(update: &Update, entries: &[Arc<HandlerEntry>]) -> GroupOutcome {
    for entry in entries {
        if !(entry.predicate)(update) {
            continue;
        }
        if let Err(e) = (entry.callback)(update.clone()).await {
            tracing::error!(error = %e, "handler callback failed");
        }
        return GroupOutcome::Matched;
    }
    GroupOutcome::NoMatch
}
