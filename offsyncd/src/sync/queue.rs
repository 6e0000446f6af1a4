//! Priority-ordered queue of deferred actions that are not direct entity
//! mutations. Held in memory and mirrored to the store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use offsync_core::BackendError;

use super::background::{DEFAULT_MAX_RETRIES, FlagGuard, RateLimitGate, SyncError};
use super::clock::Clock;
use super::mutation::new_id;
use super::network::NetworkMonitor;
use crate::store::{ActionRow, DeadLetter, DeadLetterSource, EntityKind, Priority, QueueStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Action {
    /// Run a background sync pass.
    Sync,
    /// Insert `record` into `table`.
    Upload { table: String, record: Value },
    /// Fetch one record and store it locally.
    Download { kind: EntityKind, id: String },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Sync => "sync",
            Action::Upload { .. } => "upload",
            Action::Download { .. } => "download",
        }
    }

    fn target(&self) -> String {
        match self {
            Action::Sync => String::new(),
            Action::Upload { table, .. } => table.clone(),
            Action::Download { kind, id } => kind.dependency_key(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub action: Action,
    pub timestamp: i64,
    pub retry_count: u32,
    pub priority: Priority,
}

impl QueuedAction {
    fn to_row(&self) -> Result<ActionRow, serde_json::Error> {
        Ok(ActionRow {
            id: self.id.clone(),
            action: serde_json::to_value(&self.action)?,
            timestamp: self.timestamp,
            retry_count: self.retry_count,
            priority: self.priority,
        })
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("action failed: {0}")]
    Failed(String),
}

impl ActionError {
    fn is_connectivity(&self) -> bool {
        matches!(self, ActionError::Backend(err) if err.is_connectivity())
    }

    fn rate_limit(&self) -> Option<&BackendError> {
        match self {
            ActionError::Backend(err) if err.is_rate_limited() => Some(err),
            _ => None,
        }
    }
}

/// Performs one queued action. Implemented by the engine; tests supply
/// scripted executors.
pub trait ActionExecutor: Send + Sync {
    fn execute<'a>(&'a self, action: &'a QueuedAction) -> BoxFuture<'a, Result<(), ActionError>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPassReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub halted: bool,
    pub rate_limited: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionQueueStatus {
    pub length: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub is_processing: bool,
    pub oldest_timestamp: Option<i64>,
}

pub struct OfflineActionQueue {
    items: Mutex<VecDeque<QueuedAction>>,
    queues: QueueStore,
    network: NetworkMonitor,
    clock: Clock,
    max_retries: u32,
    processing: AtomicBool,
    rate_limit: RateLimitGate,
    persist_lock: tokio::sync::Mutex<()>,
}

impl OfflineActionQueue {
    pub fn new(queues: QueueStore, network: NetworkMonitor, clock: Clock) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            queues,
            network,
            clock,
            max_retries: DEFAULT_MAX_RETRIES,
            processing: AtomicBool::new(false),
            rate_limit: RateLimitGate::default(),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Restores the persisted queue. Rows that no longer decode are moved
    /// to the dead-letter log.
    pub async fn load(&self) -> Result<usize, ActionError> {
        let mut restored = VecDeque::new();
        for row in self.queues.load_actions().await? {
            match serde_json::from_value::<Action>(row.action.clone()) {
                Ok(action) => restored.push_back(QueuedAction {
                    id: row.id,
                    action,
                    timestamp: row.timestamp,
                    retry_count: row.retry_count,
                    priority: row.priority,
                }),
                Err(err) => {
                    error!(id = %row.id, "unreadable queued action dropped: {err}");
                    self.queues
                        .record_dead_letter(&DeadLetter {
                            id: row.id,
                            source: DeadLetterSource::Action,
                            kind: "unknown".to_string(),
                            target: String::new(),
                            payload: row.action,
                            retries: row.retry_count,
                            last_error: Some(err.to_string()),
                            failed_at: self.clock.now_ms(),
                        })
                        .await?;
                }
            }
        }
        let count = restored.len();
        *self.lock_items() = restored;
        debug!(count, "action queue restored");
        Ok(count)
    }

    /// Inserts before the first item of strictly lower priority so equal
    /// priorities keep FIFO order.
    pub async fn enqueue(&self, action: Action, priority: Priority) -> String {
        let now = self.clock.now_ms();
        let queued = QueuedAction {
            id: new_id(now),
            action,
            timestamp: now,
            retry_count: 0,
            priority,
        };
        let id = queued.id.clone();
        {
            let mut items = self.lock_items();
            let position = items
                .iter()
                .position(|existing| existing.priority < priority)
                .unwrap_or(items.len());
            items.insert(position, queued);
        }
        self.persist_quietly().await;
        id
    }

    pub async fn remove_action(&self, id: &str) -> bool {
        let removed = {
            let mut items = self.lock_items();
            let before = items.len();
            items.retain(|item| item.id != id);
            items.len() != before
        };
        if removed {
            self.persist_quietly().await;
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<QueuedAction> {
        self.lock_items().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    pub fn get_queue_status(&self) -> ActionQueueStatus {
        let items = self.lock_items();
        let mut status = ActionQueueStatus {
            length: items.len(),
            is_processing: self.processing.load(Ordering::Acquire),
            oldest_timestamp: items.iter().map(|item| item.timestamp).min(),
            ..ActionQueueStatus::default()
        };
        for item in items.iter() {
            match item.priority {
                Priority::High => status.high += 1,
                Priority::Medium => status.medium += 1,
                Priority::Low => status.low += 1,
            }
        }
        status
    }

    /// Works the queue head-first. A failed action moves to the tail until
    /// it reaches the retry ceiling. Only actions queued when the pass starts
    /// are attempted, each at most once.
    pub async fn process_queue(&self, executor: &dyn ActionExecutor) -> Result<ActionPassReport, ActionError> {
        let mut report = ActionPassReport::default();
        if !self.network.is_online() || self.rate_limit.is_closed(self.clock.now_ms()) {
            report.skipped = true;
            return Ok(report);
        }
        let Some(_running) = FlagGuard::acquire(&self.processing) else {
            debug!("action pass skipped: already running");
            report.skipped = true;
            return Ok(report);
        };

        self.run_pass(executor, &mut report).await;

        if report.attempted > 0 {
            info!(
                succeeded = report.succeeded,
                requeued = report.requeued,
                dropped = report.dropped,
                halted = report.halted,
                "action pass finished"
            );
        }
        Ok(report)
    }

    async fn run_pass(&self, executor: &dyn ActionExecutor, report: &mut ActionPassReport) {
        let pass_ids: Vec<String> = self.lock_items().iter().map(|item| item.id.clone()).collect();
        for id in pass_ids {
            if !self.network.is_online() {
                report.halted = true;
                break;
            }
            let Some(current) = self.lock_items().iter().find(|item| item.id == id).cloned() else {
                continue;
            };

            match executor.execute(&current).await {
                Ok(()) => {
                    report.attempted += 1;
                    report.succeeded += 1;
                    self.lock_items().retain(|item| item.id != current.id);
                }
                Err(err) if err.is_connectivity() => {
                    self.network.set_online(false);
                    report.halted = true;
                    info!(id = %current.id, "action pass halted: backend unreachable: {err}");
                    break;
                }
                Err(err) => {
                    report.attempted += 1;
                    self.record_failure(&current, &err, report).await;
                    if let Some(backend) = err.rate_limit() {
                        report.rate_limited = true;
                        let until = self.rate_limit.close(self.clock.now_ms(), backend);
                        info!(id = %current.id, ?until, "action pass paused: rate limited");
                        self.persist_quietly().await;
                        break;
                    }
                }
            }
            self.persist_quietly().await;
        }
    }

    /// Requeues `action` at the tail, or moves it to the dead-letter table
    /// once the ceiling is reached. The action stays queued if the dead
    /// letter cannot be written.
    async fn record_failure(&self, action: &QueuedAction, err: &ActionError, report: &mut ActionPassReport) {
        let retry_count = action.retry_count.saturating_add(1);
        if retry_count >= self.max_retries {
            match self.dead_letter(action, retry_count, &err.to_string()).await {
                Ok(()) => {
                    report.dropped += 1;
                    return;
                }
                Err(store_err) => {
                    warn!(id = %action.id, "exhausted action kept in queue, dead letter failed: {store_err}");
                }
            }
        } else {
            warn!(id = %action.id, kind = action.action.kind(), retry_count, "action failed: {err}");
        }
        let mut items = self.lock_items();
        let position = items.iter().position(|item| item.id == action.id);
        if let Some(mut item) = position.and_then(|index| items.remove(index)) {
            item.retry_count = retry_count;
            items.push_back(item);
        }
        report.requeued += 1;
    }

    /// Writes the dead letter and the queue without `action` in one
    /// transaction, then drops it from memory.
    async fn dead_letter(&self, action: &QueuedAction, retries: u32, last_error: &str) -> Result<(), ActionError> {
        let letter = DeadLetter {
            id: action.id.clone(),
            source: DeadLetterSource::Action,
            kind: action.action.kind().to_string(),
            target: action.action.target(),
            payload: serde_json::to_value(&action.action)?,
            retries,
            last_error: Some(last_error.to_string()),
            failed_at: self.clock.now_ms(),
        };
        {
            let _serialized = self.persist_lock.lock().await;
            let remaining = self
                .snapshot()
                .iter()
                .filter(|item| item.id != action.id)
                .map(QueuedAction::to_row)
                .collect::<Result<Vec<_>, _>>()?;
            self.queues.dead_letter_action(&letter, &remaining).await?;
            self.lock_items().retain(|item| item.id != action.id);
        }
        error!(
            id = %action.id,
            kind = action.action.kind(),
            retries,
            "action dropped after exhausting retries: {last_error}"
        );
        Ok(())
    }

    /// Writes the current queue contents to the store.
    pub async fn persist(&self) -> Result<(), ActionError> {
        let _serialized = self.persist_lock.lock().await;
        let rows = self
            .snapshot()
            .iter()
            .map(QueuedAction::to_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.queues.replace_actions(&rows).await?;
        Ok(())
    }

    async fn persist_quietly(&self) {
        if let Err(err) = self.persist().await {
            warn!("action queue persistence failed: {err}");
        }
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedAction>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
