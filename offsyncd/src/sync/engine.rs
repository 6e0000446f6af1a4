//! Consumer-facing engine: cached reads, queued writes, sync and validation
//! status. Constructed once with [`OfflineEngine::init`] and shared by
//! cloning; [`OfflineEngine::dispose`] drains background work and closes
//! storage.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use offsync_core::{BackendError, CollectionClient};

use super::background::{BackgroundSync, DEFAULT_MAX_RETRIES, PassReport, SyncError};
use super::clock::Clock;
use super::coordinator::{CacheCoordinator, ValidationReport, ValidationStatus};
use super::mutation::{Mutation, SyncQueueItem, table_dependency_key};
use super::network::{NetworkMonitor, NetworkSpeed, Transition};
use super::queue::{
    Action, ActionError, ActionExecutor, ActionPassReport, ActionQueueStatus, OfflineActionQueue,
    QueuedAction,
};
use super::wake::BackgroundWake;
use crate::store::{
    CacheEntry, CacheMeta, DeadLetter, EntityInput, EntityStore, MetadataCache, Priority, StorageStatus, Store,
    StoreError,
};

const DEFAULT_QUOTA_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("action error: {0}")]
    Action(#[from] ActionError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("offline and nothing cached for {0}")]
    Offline(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend_url: String,
    pub api_key: String,
    /// `None` uses the per-user data directory.
    pub db_path: Option<PathBuf>,
    pub max_retries: u32,
    pub slow_fetch_threshold: Duration,
    pub storage_quota_bytes: u64,
    pub initially_online: bool,
}

impl EngineConfig {
    pub fn new(backend_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            api_key: api_key.into(),
            db_path: None,
            max_retries: DEFAULT_MAX_RETRIES,
            slow_fetch_threshold: Duration::from_millis(1500),
            storage_quota_bytes: DEFAULT_QUOTA_BYTES,
            initially_online: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub max_age: Duration,
    pub dependencies: Vec<String>,
    pub priority: Priority,
    /// Skip a fresh cache hit and go to the network when online.
    pub force_refresh: bool,
}

impl ReadOptions {
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_age,
            dependencies: Vec::new(),
            priority: Priority::Medium,
            force_refresh: false,
        }
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    fn meta(&self) -> CacheMeta {
        CacheMeta {
            dependencies: self.dependencies.clone(),
            priority: self.priority,
            version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult<T> {
    pub data: T,
    pub is_from_cache: bool,
    pub is_stale: bool,
    pub is_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub queue_length: i64,
    pub pending_actions: usize,
    pub dead_letters: i64,
    pub is_online: bool,
    pub is_syncing: bool,
    pub speed: NetworkSpeed,
}

/// Work done after an offline to online transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectReport {
    pub sync: PassReport,
    pub actions: ActionPassReport,
    pub validation: ValidationReport,
}

struct EngineInner {
    store: Store,
    client: CollectionClient,
    entities: EntityStore,
    cache: MetadataCache,
    network: NetworkMonitor,
    clock: Clock,
    sync: Arc<BackgroundSync>,
    actions: OfflineActionQueue,
    coordinator: CacheCoordinator,
    tracker: TaskTracker,
    refreshing: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct OfflineEngine {
    inner: Arc<EngineInner>,
}

impl OfflineEngine {
    pub async fn init(config: EngineConfig, wake: Arc<dyn BackgroundWake>) -> Result<Self, EngineError> {
        let store = match &config.db_path {
            Some(path) => Store::open(path.clone()).await?,
            None => Store::open_default().await?,
        };
        let client = CollectionClient::new(&config.backend_url, config.api_key.clone())?;
        let network = NetworkMonitor::new(config.initially_online)
            .with_slow_threshold(config.slow_fetch_threshold);
        let engine = Self::with_parts(
            store,
            client,
            network,
            Clock::System,
            wake,
            config.max_retries,
            config.storage_quota_bytes,
        )
        .await?;
        info!(backend = %config.backend_url, "offline engine ready");
        Ok(engine)
    }

    /// Assembles an engine from already-built parts and restores the
    /// persisted action queue.
    pub async fn with_parts(
        store: Store,
        client: CollectionClient,
        network: NetworkMonitor,
        clock: Clock,
        wake: Arc<dyn BackgroundWake>,
        max_retries: u32,
        storage_quota_bytes: u64,
    ) -> Result<Self, EngineError> {
        let tracker = TaskTracker::new();
        let cache = store
            .metadata(clock.clone(), network.clone())
            .with_quota(storage_quota_bytes);
        let entities = store.entities();
        let sync = BackgroundSync::new(
            store.queues(),
            client.clone(),
            network.clone(),
            cache.clone(),
            wake,
            clock.clone(),
            tracker.clone(),
        )
        .with_max_retries(max_retries);
        let actions = OfflineActionQueue::new(store.queues(), network.clone(), clock.clone())
            .with_max_retries(max_retries);
        let restored = actions.load().await?;
        if restored > 0 {
            info!(restored, "restored pending actions");
        }
        let coordinator = CacheCoordinator::new(
            entities.clone(),
            cache.clone(),
            client.clone(),
            network.clone(),
            clock.clone(),
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                client,
                entities,
                cache,
                network,
                clock,
                sync: Arc::new(sync),
                actions,
                coordinator,
                tracker,
                refreshing: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn client(&self) -> &CollectionClient {
        &self.inner.client
    }

    pub fn entities(&self) -> &EntityStore {
        &self.inner.entities
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.inner.cache
    }

    /// Cached-or-fresh read of `"{category}_{key}"`.
    ///
    /// A fresh hit returns immediately. A stale hit is served as-is; when
    /// online a single background refresh is started for the key. A miss
    /// calls `fetcher` and caches its result. If the fetch fails and a
    /// previous value exists, that value is served instead of the error.
    pub async fn read<T, F, Fut>(
        &self,
        category: &str,
        key: &str,
        fetcher: F,
        options: ReadOptions,
    ) -> Result<ReadResult<T>, EngineError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BackendError>> + Send + 'static,
    {
        let cache_key = format!("{category}_{key}");
        let online = self.inner.network.is_online();
        let cached = match self.cached_value::<T>(&cache_key).await {
            Some((data, entry)) if !(online && options.force_refresh) => {
                let stale = self.inner.cache.is_stale(&entry, options.max_age);
                if stale && online {
                    self.spawn_refresh(cache_key, fetcher, options.meta());
                }
                return Ok(ReadResult {
                    data,
                    is_from_cache: true,
                    is_stale: stale,
                    is_online: online,
                });
            }
            other => other,
        };

        if !online {
            return Err(EngineError::Offline(cache_key));
        }

        match self.fetch_and_store(&cache_key, fetcher, options.meta()).await {
            Ok(data) => Ok(ReadResult {
                data,
                is_from_cache: false,
                is_stale: false,
                is_online: true,
            }),
            Err(err) => {
                if err.is_connectivity() {
                    self.inner.network.set_online(false);
                }
                match cached {
                    Some((data, entry)) => {
                        warn!(key = %cache_key, "fetch failed, serving cached value: {err}");
                        Ok(ReadResult {
                            data,
                            is_from_cache: true,
                            is_stale: self.inner.cache.is_stale(&entry, options.max_age),
                            is_online: self.inner.network.is_online(),
                        })
                    }
                    None => Err(err.into()),
                }
            }
        }
    }

    async fn cached_value<T: DeserializeOwned>(&self, cache_key: &str) -> Option<(T, CacheEntry)> {
        let entry = match self.inner.cache.get_entry(cache_key).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(key = cache_key, "cache read failed, treating as miss: {err}");
                return None;
            }
        };
        match serde_json::from_value(entry.data.clone()) {
            Ok(value) => Some((value, entry)),
            Err(err) => {
                warn!(key = cache_key, "cached payload has unexpected shape: {err}");
                None
            }
        }
    }

    async fn fetch_and_store<T, F, Fut>(&self, cache_key: &str, fetcher: F, meta: CacheMeta) -> Result<T, BackendError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let started = Instant::now();
        let value = fetcher().await?;
        self.inner.network.record_fetch(started.elapsed());
        match serde_json::to_value(&value) {
            Ok(payload) => {
                if let Err(err) = self.inner.cache.set(cache_key, &payload, meta).await {
                    warn!(key = cache_key, "cache write failed: {err}");
                }
            }
            Err(err) => warn!(key = cache_key, "result not cacheable: {err}"),
        }
        Ok(value)
    }

    fn spawn_refresh<T, F, Fut>(&self, cache_key: String, fetcher: F, meta: CacheMeta)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BackendError>> + Send + 'static,
    {
        {
            let mut refreshing = self
                .inner
                .refreshing
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !refreshing.insert(cache_key.clone()) {
                debug!(key = %cache_key, "refresh already in flight");
                return;
            }
        }
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            if let Err(err) = this.fetch_and_store(&cache_key, fetcher, meta).await {
                if err.is_connectivity() {
                    this.inner.network.set_online(false);
                }
                debug!(key = %cache_key, "background refresh failed: {err}");
            }
            this.inner
                .refreshing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&cache_key);
        });
    }

    /// Saves entities into the local store. Storage failures are logged and
    /// reported as nothing cached.
    pub async fn cache_entities(&self, entities: &[EntityInput]) -> usize {
        match self
            .inner
            .entities
            .save(entities, self.inner.clock.now_ms())
            .await
        {
            Ok(written) => written,
            Err(err) => {
                warn!(count = entities.len(), "entity save failed: {err}");
                0
            }
        }
    }

    pub async fn enqueue_mutation(&self, mutation: Mutation) -> Result<SyncQueueItem, EngineError> {
        Ok(self.inner.sync.queue_operation(mutation).await?)
    }

    /// Adds a deferred action; starts an action pass right away when online.
    pub async fn enqueue_action(&self, action: Action, priority: Priority) -> String {
        let id = self.inner.actions.enqueue(action, priority).await;
        if self.inner.network.is_online() {
            let this = self.clone();
            self.inner.tracker.spawn(async move {
                if let Err(err) = this.process_actions().await {
                    warn!("action pass failed: {err}");
                }
            });
        }
        id
    }

    pub async fn remove_action(&self, id: &str) -> bool {
        self.inner.actions.remove_action(id).await
    }

    pub fn action_queue_status(&self) -> ActionQueueStatus {
        self.inner.actions.get_queue_status()
    }

    pub fn pending_actions(&self) -> Vec<QueuedAction> {
        self.inner.actions.snapshot()
    }

    pub async fn process_sync_queue(&self) -> Result<PassReport, EngineError> {
        Ok(self.inner.sync.process_queue().await?)
    }

    pub async fn process_actions(&self) -> Result<ActionPassReport, EngineError> {
        Ok(self.inner.actions.process_queue(self).await?)
    }

    pub async fn persist_actions(&self) -> Result<(), EngineError> {
        Ok(self.inner.actions.persist().await?)
    }

    /// Feeds an observed connectivity change. On an offline to online
    /// transition this runs a sync pass, an action pass and a validation
    /// pass in that order.
    pub async fn set_online(&self, online: bool) -> Result<Option<ReconnectReport>, EngineError> {
        match self.inner.network.set_online(online) {
            Some(Transition::CameOnline) => Ok(Some(self.on_came_online().await?)),
            Some(Transition::WentOffline) | None => Ok(None),
        }
    }

    async fn on_came_online(&self) -> Result<ReconnectReport, EngineError> {
        let sync = self.process_sync_queue().await?;
        let actions = self.process_actions().await?;
        let validation = self.validate_cache().await?;
        Ok(ReconnectReport {
            sync,
            actions,
            validation,
        })
    }

    pub async fn get_sync_status(&self) -> Result<SyncStatus, EngineError> {
        let state = self.inner.network.state();
        Ok(SyncStatus {
            queue_length: self.inner.sync.queue_length().await?,
            pending_actions: self.inner.actions.len(),
            dead_letters: self.inner.store.queues().count_dead_letters().await?,
            is_online: state.is_online,
            is_syncing: state.is_syncing,
            speed: state.speed,
        })
    }

    pub fn get_validation_status(&self) -> ValidationStatus {
        self.inner.coordinator.status()
    }

    pub async fn validate_cache(&self) -> Result<ValidationReport, EngineError> {
        Ok(self.inner.coordinator.validate_all_cached_items().await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, EngineError> {
        Ok(self.inner.store.queues().list_dead_letters().await?)
    }

    pub async fn clear_dead_letters(&self) -> Result<u64, EngineError> {
        Ok(self.inner.store.queues().clear_dead_letters().await?)
    }

    pub async fn storage_status(&self) -> Result<StorageStatus, EngineError> {
        Ok(self.inner.cache.get_storage_status().await?)
    }

    pub async fn enforce_cache_budget(&self, max_bytes: u64) -> Result<Vec<String>, EngineError> {
        let evicted = self.inner.cache.enforce_budget(max_bytes).await?;
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "cache entries evicted to fit budget");
        }
        Ok(evicted)
    }

    /// Waits for background refreshes and passes spawned so far.
    pub async fn settle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    pub async fn dispose(self) -> Result<(), EngineError> {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.actions.persist().await?;
        self.inner.store.close().await;
        info!("offline engine disposed");
        Ok(())
    }

    async fn run_action(&self, queued: &QueuedAction) -> Result<(), ActionError> {
        match &queued.action {
            Action::Sync => {
                self.inner.sync.process_queue().await?;
                Ok(())
            }
            Action::Upload { table, record } => {
                self.inner.client.insert(table, record).await?;
                self.inner
                    .cache
                    .invalidate_with_dependencies(&table_dependency_key(table))
                    .await?;
                Ok(())
            }
            Action::Download { kind, id } => {
                let record = self
                    .inner
                    .client
                    .fetch_record(kind.collection(), id)
                    .await?
                    .ok_or_else(|| {
                        ActionError::Failed(format!("{} not found remotely", kind.dependency_key(id)))
                    })?;
                self.inner
                    .entities
                    .save(
                        &[EntityInput::new(*kind, id.clone(), record)],
                        self.inner.clock.now_ms(),
                    )
                    .await?;
                self.inner
                    .cache
                    .invalidate_with_dependencies(&kind.dependency_key(id))
                    .await?;
                Ok(())
            }
        }
    }
}

impl ActionExecutor for OfflineEngine {
    fn execute<'a>(&'a self, action: &'a QueuedAction) -> BoxFuture<'a, Result<(), ActionError>> {
        Box::pin(self.run_action(action))
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
