//! FIFO replay queue for remote mutations recorded while offline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use offsync_core::{BackendError, CollectionClient};

use super::clock::Clock;
use super::mutation::{Mutation, SyncQueueItem, table_dependency_key};
use super::network::NetworkMonitor;
use super::wake::{BACKGROUND_SYNC_TAG, BackgroundWake};
use crate::store::{DeadLetter, DeadLetterSource, MetadataCache, QueueStore, StoreError};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Connectivity was lost before the snapshot was exhausted.
    pub halted: bool,
    /// The backend answered 429; the rest of the snapshot waits.
    pub rate_limited: bool,
    /// The pass did not run: offline, rate limited, or another pass was active.
    pub skipped: bool,
}

impl PassReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Holds a pass-in-progress flag and clears it on drop, so a cancelled pass
/// does not leave the queue locked.
pub(super) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    pub(super) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SyncingGuard<'a>(&'a NetworkMonitor);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_syncing(false);
    }
}

/// Millisecond deadline before which the backend asked us not to call again.
/// Zero means no deadline.
#[derive(Debug, Default)]
pub(super) struct RateLimitGate(AtomicI64);

impl RateLimitGate {
    pub(super) fn is_closed(&self, now_ms: i64) -> bool {
        now_ms < self.0.load(Ordering::Acquire)
    }

    /// Without a `Retry-After` the gate stays open and only the current
    /// pass stops.
    pub(super) fn close(&self, now_ms: i64, err: &BackendError) -> Option<i64> {
        let secs = err.retry_after_secs()?;
        let until = now_ms.saturating_add(i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX));
        self.0.store(until, Ordering::Release);
        Some(until)
    }
}

pub struct BackgroundSync {
    queues: QueueStore,
    client: CollectionClient,
    network: NetworkMonitor,
    cache: MetadataCache,
    wake: Arc<dyn BackgroundWake>,
    clock: Clock,
    tracker: TaskTracker,
    max_retries: u32,
    processing: AtomicBool,
    rate_limit: RateLimitGate,
}

impl BackgroundSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: QueueStore,
        client: CollectionClient,
        network: NetworkMonitor,
        cache: MetadataCache,
        wake: Arc<dyn BackgroundWake>,
        clock: Clock,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            queues,
            client,
            network,
            cache,
            wake,
            clock,
            tracker,
            max_retries: DEFAULT_MAX_RETRIES,
            processing: AtomicBool::new(false),
            rate_limit: RateLimitGate::default(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Persists the mutation, then starts a pass right away when online or
    /// registers for a deferred wake when offline.
    pub async fn queue_operation(self: &Arc<Self>, mutation: Mutation) -> Result<SyncQueueItem, SyncError> {
        let item = SyncQueueItem::new(mutation, self.clock.now_ms());
        self.queues.insert_sync_item(&item.to_row()?).await?;
        debug!(
            id = %item.id,
            kind = item.mutation.kind().as_str(),
            table = item.mutation.table(),
            "mutation queued"
        );

        if self.network.is_online() {
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                if let Err(err) = this.process_queue().await {
                    warn!("sync pass failed: {err}");
                }
            });
        } else if !self.wake.register(BACKGROUND_SYNC_TAG) {
            debug!("deferred wake unavailable; waiting for online transition");
        }
        Ok(item)
    }

    pub async fn pending(&self) -> Result<Vec<SyncQueueItem>, SyncError> {
        let mut items = Vec::new();
        for row in self.queues.list_sync_items().await? {
            items.push(SyncQueueItem::from_row(row)?);
        }
        Ok(items)
    }

    pub async fn queue_length(&self) -> Result<i64, SyncError> {
        Ok(self.queues.count_sync_items().await?)
    }

    /// Replays a snapshot of the queue in FIFO order. Concurrent calls while
    /// a pass is active return a skipped report. Items queued after the
    /// snapshot is taken wait for the next pass.
    pub async fn process_queue(&self) -> Result<PassReport, SyncError> {
        if !self.network.is_online() {
            debug!("sync pass skipped: offline");
            return Ok(PassReport::skipped());
        }
        if self.rate_limit.is_closed(self.clock.now_ms()) {
            debug!("sync pass skipped: rate limited");
            return Ok(PassReport::skipped());
        }
        let Some(_running) = FlagGuard::acquire(&self.processing) else {
            debug!("sync pass skipped: already running");
            return Ok(PassReport::skipped());
        };
        self.network.set_syncing(true);
        let _syncing = SyncingGuard(&self.network);

        let snapshot = self.load_snapshot().await?;
        let mut report = PassReport::default();
        for item in snapshot {
            if !self.network.is_online() {
                report.halted = true;
                info!(attempted = report.attempted, "sync pass halted: offline");
                break;
            }
            match item.mutation.apply(&self.client).await {
                Ok(()) => {
                    report.attempted += 1;
                    report.succeeded += 1;
                    if let Err(err) = self.queues.delete_sync_item(&item.id).await {
                        warn!(id = %item.id, "replayed mutation could not be dequeued: {err}");
                        continue;
                    }
                    let key = table_dependency_key(item.mutation.table());
                    if let Err(err) = self.cache.invalidate_with_dependencies(&key).await {
                        warn!(key = %key, "post-replay invalidation failed: {err}");
                    }
                }
                Err(err) if err.is_connectivity() => {
                    self.network.set_online(false);
                    report.halted = true;
                    info!(id = %item.id, "sync pass halted: backend unreachable: {err}");
                    break;
                }
                Err(err) => {
                    report.attempted += 1;
                    self.record_failure(&item, &err, &mut report).await;
                    if err.is_rate_limited() {
                        report.rate_limited = true;
                        let until = self.rate_limit.close(self.clock.now_ms(), &err);
                        info!(id = %item.id, ?until, "sync pass paused: rate limited");
                        break;
                    }
                }
            }
        }

        if report.attempted > 0 {
            info!(
                succeeded = report.succeeded,
                retried = report.retried,
                dropped = report.dropped,
                "sync pass finished"
            );
        }
        Ok(report)
    }

    /// Charges one retry to `item`, moving it to the dead-letter table at the
    /// ceiling. Store errors are logged and leave the item queued.
    async fn record_failure(&self, item: &SyncQueueItem, err: &BackendError, report: &mut PassReport) {
        let retries = item.retries.saturating_add(1);
        if retries < self.max_retries {
            if let Err(store_err) = self.queues.update_sync_retries(&item.id, retries).await {
                warn!(id = %item.id, "retry count not saved: {store_err}");
            }
            warn!(id = %item.id, retries, retryable = err.is_retryable(), "mutation replay failed: {err}");
            report.retried += 1;
            return;
        }
        match self.drop_item(item, retries, &err.to_string()).await {
            Ok(()) => report.dropped += 1,
            Err(drop_err) => {
                warn!(id = %item.id, "exhausted mutation kept in queue, dead letter failed: {drop_err}");
                report.retried += 1;
            }
        }
    }

    async fn load_snapshot(&self) -> Result<Vec<SyncQueueItem>, SyncError> {
        let mut items = Vec::new();
        for row in self.queues.list_sync_items().await? {
            let id = row.id.clone();
            let raw = row.mutation.clone();
            match SyncQueueItem::from_row(row) {
                Ok(item) => items.push(item),
                Err(err) => {
                    error!(id = %id, "unreadable queued mutation dropped: {err}");
                    let letter = DeadLetter {
                        id: id.clone(),
                        source: DeadLetterSource::Sync,
                        kind: "unknown".to_string(),
                        target: String::new(),
                        payload: raw,
                        retries: 0,
                        last_error: Some(err.to_string()),
                        failed_at: self.clock.now_ms(),
                    };
                    if let Err(store_err) = self.queues.dead_letter_sync_item(&letter).await {
                        warn!(id = %id, "unreadable mutation left queued: {store_err}");
                    }
                }
            }
        }
        Ok(items)
    }

    async fn drop_item(&self, item: &SyncQueueItem, retries: u32, last_error: &str) -> Result<(), SyncError> {
        self.queues
            .dead_letter_sync_item(&DeadLetter {
                id: item.id.clone(),
                source: DeadLetterSource::Sync,
                kind: item.mutation.kind().as_str().to_string(),
                target: item.mutation.table().to_string(),
                payload: serde_json::to_value(&item.mutation)?,
                retries,
                last_error: Some(last_error.to_string()),
                failed_at: self.clock.now_ms(),
            })
            .await?;
        error!(
            id = %item.id,
            kind = item.mutation.kind().as_str(),
            table = item.mutation.table(),
            retries,
            "mutation dropped after exhausting retries: {last_error}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CacheMeta, Store};
    use crate::sync::wake::{ChannelWake, NoopWake};
    use offsync_core::Match;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        sync: Arc<BackgroundSync>,
        network: NetworkMonitor,
        store: Store,
        cache: MetadataCache,
        clock: Clock,
    }

    fn build(
        store: Store,
        client: CollectionClient,
        online: bool,
        wake: Arc<dyn BackgroundWake>,
        max_retries: u32,
    ) -> Harness {
        let network = NetworkMonitor::new(online);
        let clock = Clock::manual(1_000);
        let cache = store.metadata(clock.clone(), network.clone());
        let sync = BackgroundSync::new(
            store.queues(),
            client,
            network.clone(),
            cache.clone(),
            wake,
            clock.clone(),
            TaskTracker::new(),
        )
        .with_max_retries(max_retries);
        Harness {
            sync: Arc::new(sync),
            network,
            store,
            cache,
            clock,
        }
    }

    fn harness_with_wake(store: Store, server: &MockServer, online: bool, wake: Arc<dyn BackgroundWake>) -> Harness {
        let client = CollectionClient::new(&server.uri(), "anon-key").unwrap();
        build(store, client, online, wake, DEFAULT_MAX_RETRIES)
    }

    async fn harness(server: &MockServer, online: bool) -> Harness {
        let store = Store::in_memory().await.unwrap();
        harness_with_wake(store, server, online, Arc::new(NoopWake))
    }

    fn region_update() -> Mutation {
        Mutation::update(
            "document_regions",
            Match::eq("id", "r1"),
            json!({"label": "Intro"}),
        )
    }

    #[tokio::test]
    async fn offline_enqueue_replays_once_online() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/document_regions"))
            .and(query_param("id", "eq.r1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = Store::in_memory().await.unwrap();
        let (wake, _rx) = ChannelWake::new();
        let wake = Arc::new(wake);
        let h = harness_with_wake(store, &server, false, wake.clone());
        h.cache
            .set(
                "regions_d1",
                &json!([]),
                CacheMeta::default().depends_on("table:document_regions"),
            )
            .await
            .unwrap();

        h.sync.queue_operation(region_update()).await.unwrap();
        assert_eq!(h.sync.queue_length().await.unwrap(), 1);
        assert!(wake.is_registered(BACKGROUND_SYNC_TAG));

        let report = h.sync.process_queue().await.unwrap();
        assert!(report.skipped);
        assert_eq!(h.sync.queue_length().await.unwrap(), 1);

        h.network.set_online(true);
        let report = h.sync.process_queue().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.sync.queue_length().await.unwrap(), 0);
        assert!(h.cache.get("regions_d1").await.unwrap().is_none());
        assert!(!h.network.state().is_syncing);
    }

    #[tokio::test]
    async fn items_are_replayed_in_fifo_order_and_failures_do_not_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/folders"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/worksheets"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let h = harness(&server, false).await;
        let first = h
            .sync
            .queue_operation(Mutation::create("folders", json!({"id": "f1"})))
            .await
            .unwrap();
        h.sync
            .queue_operation(Mutation::delete("worksheets", Match::eq("id", "w1")))
            .await
            .unwrap();

        h.network.set_online(true);
        let report = h.sync.process_queue().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.succeeded, 1);

        let pending = h.sync.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[0].retries, 1);
    }

    #[tokio::test]
    async fn item_is_dropped_and_dead_lettered_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/folders"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad record"))
            .expect(3)
            .mount(&server)
            .await;

        let h = harness(&server, false).await;
        h.sync
            .queue_operation(Mutation::create("folders", json!({"id": "f1"})))
            .await
            .unwrap();
        h.network.set_online(true);

        for expected_retries in 1..=2 {
            let report = h.sync.process_queue().await.unwrap();
            assert_eq!(report.retried, 1);
            let pending = h.sync.pending().await.unwrap();
            assert_eq!(pending[0].retries, expected_retries);
        }

        let report = h.sync.process_queue().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(h.sync.queue_length().await.unwrap(), 0);

        let letters = h.store.queues().list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, "create");
        assert_eq!(letters[0].target, "folders");
        assert_eq!(letters[0].retries, 3);
        assert!(letters[0].last_error.as_deref().unwrap().contains("bad record"));

        let report = h.sync.process_queue().await.unwrap();
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn going_offline_mid_pass_halts_without_losing_items() {
        let server = MockServer::start().await;
        let h = harness(&server, false).await;
        let network = h.network.clone();
        Mock::given(method("POST"))
            .and(path("/rest/v1/folders"))
            .respond_with(move |_: &wiremock::Request| {
                network.set_online(false);
                ResponseTemplate::new(201)
            })
            .expect(1)
            .mount(&server)
            .await;

        for id in ["f1", "f2", "f3"] {
            h.sync
                .queue_operation(Mutation::create("folders", json!({"id": id})))
                .await
                .unwrap();
        }
        h.network.set_online(true);

        let report = h.sync.process_queue().await.unwrap();
        assert!(report.halted);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.sync.queue_length().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unreachable_backend_marks_offline_without_spending_retries() {
        let store = Store::in_memory().await.unwrap();
        let network = NetworkMonitor::new(false);
        let clock = Clock::manual(0);
        let sync = Arc::new(BackgroundSync::new(
            store.queues(),
            CollectionClient::new("http://127.0.0.1:9", "k").unwrap(),
            network.clone(),
            store.metadata(clock.clone(), network.clone()),
            Arc::new(NoopWake),
            clock,
            TaskTracker::new(),
        ));

        sync.queue_operation(region_update()).await.unwrap();
        network.set_online(true);
        let report = sync.process_queue().await.unwrap();
        assert!(report.halted);
        assert!(!network.is_online());
        assert_eq!(sync.pending().await.unwrap()[0].retries, 0);
    }

    #[tokio::test]
    async fn concurrent_pass_is_a_no_op() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/document_regions"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, false).await;
        h.sync.queue_operation(region_update()).await.unwrap();
        h.network.set_online(true);

        let (first, second) = tokio::join!(h.sync.process_queue(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.sync.process_queue().await
        });
        assert_eq!(first.unwrap().succeeded, 1);
        assert!(second.unwrap().skipped);
    }

    #[tokio::test]
    async fn timed_out_request_spends_a_retry_and_does_not_block_later_items() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/document_regions"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(400)))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/worksheets"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = CollectionClient::with_timeout(&server.uri(), "anon-key", Duration::from_millis(100)).unwrap();
        let store = Store::in_memory().await.unwrap();
        let h = build(store, client, false, Arc::new(NoopWake), DEFAULT_MAX_RETRIES);
        let slow = h.sync.queue_operation(region_update()).await.unwrap();
        h.sync
            .queue_operation(Mutation::delete("worksheets", Match::eq("id", "w1")))
            .await
            .unwrap();
        h.network.set_online(true);

        let report = h.sync.process_queue().await.unwrap();
        assert!(!report.halted);
        assert!(h.network.is_online());
        assert_eq!(report.attempted, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.succeeded, 1);

        for _ in 0..2 {
            h.sync.process_queue().await.unwrap();
        }
        assert_eq!(h.sync.queue_length().await.unwrap(), 0);
        let letters = h.store.queues().list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, slow.id);
        assert_eq!(letters[0].retries, 3);
    }

    #[tokio::test]
    async fn dead_letter_failure_keeps_the_item_and_finishes_the_pass() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/folders"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/worksheets"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = Store::in_memory().await.unwrap();
        let client = CollectionClient::new(&server.uri(), "anon-key").unwrap();
        let h = build(store, client, false, Arc::new(NoopWake), 1);
        let rejected = h
            .sync
            .queue_operation(Mutation::create("folders", json!({"id": "f1"})))
            .await
            .unwrap();
        h.sync
            .queue_operation(Mutation::delete("worksheets", Match::eq("id", "w1")))
            .await
            .unwrap();
        sqlx::query("DROP TABLE dead_letters")
            .execute(h.store.pool())
            .await
            .unwrap();

        h.network.set_online(true);
        let report = h.sync.process_queue().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.dropped, 0);

        let pending = h.sync.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, rejected.id);
    }

    #[tokio::test]
    async fn rate_limit_pauses_the_queue_until_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/folders"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/folders"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/worksheets"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, false).await;
        h.sync
            .queue_operation(Mutation::create("folders", json!({"id": "f1"})))
            .await
            .unwrap();
        h.sync
            .queue_operation(Mutation::delete("worksheets", Match::eq("id", "w1")))
            .await
            .unwrap();
        h.network.set_online(true);

        let report = h.sync.process_queue().await.unwrap();
        assert!(report.rate_limited);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.retried, 1);
        let pending = h.sync.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].retries, 0);

        h.clock.advance(Duration::from_secs(29));
        assert!(h.sync.process_queue().await.unwrap().skipped);

        h.clock.advance(Duration::from_secs(1));
        let report = h.sync.process_queue().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(h.sync.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn items_queued_during_a_pass_wait_for_the_next_pass() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/document_regions"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/worksheets"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, false).await;
        h.sync.queue_operation(region_update()).await.unwrap();
        h.network.set_online(true);

        let late = SyncQueueItem::new(Mutation::delete("worksheets", Match::eq("id", "w1")), 2_000);
        let (report, ()) = tokio::join!(h.sync.process_queue(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.store
                .queues()
                .insert_sync_item(&late.to_row().unwrap())
                .await
                .unwrap();
        });
        let report = report.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);

        let pending = h.sync.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, late.id);
        assert_eq!(pending[0].retries, 0);

        let report = h.sync.process_queue().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.sync.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_pass_releases_the_processing_flag() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/document_regions"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let h = harness(&server, false).await;
        h.sync.queue_operation(region_update()).await.unwrap();
        h.network.set_online(true);

        let cancelled = tokio::time::timeout(Duration::from_millis(50), h.sync.process_queue()).await;
        assert!(cancelled.is_err());
        assert!(!h.sync.is_processing());
        assert!(!h.network.state().is_syncing);

        let report = h.sync.process_queue().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.succeeded, 1);
    }
}
