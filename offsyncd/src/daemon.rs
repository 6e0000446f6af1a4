use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use offsync_core::{BackendError, CollectionClient};

use crate::sync::backoff::Backoff;
use crate::sync::coordinator::{ValidationReport, ValidationStatus};
use crate::sync::engine::{EngineConfig, OfflineEngine, ReconnectReport, SyncStatus};
use crate::sync::wake::{BackgroundWake, ChannelWake, NoopWake, WakeMessage};

const DEFAULT_MAX_RETRIES: u64 = 3;
const DEFAULT_PERSIST_SECS: u64 = 30;
const DEFAULT_PROBE_SECS: u64 = 10;
const DEFAULT_WORKER_LOOP_MS: u64 = 5000;
const DEFAULT_EVICTION_SECS: u64 = 60;
const DEFAULT_CACHE_MAX_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_SLOW_FETCH_MS: u64 = 1500;
const PROBE_BACKOFF_FACTOR: u32 = 6;
const MIN_PROBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub probe_interval: Duration,
    pub worker_interval: Duration,
    pub persist_interval: Duration,
    pub eviction_interval: Duration,
    pub cache_max_bytes: u64,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let backend_url =
            std::env::var("OFFSYNC_BACKEND_URL").context("OFFSYNC_BACKEND_URL is not set")?;
        let api_key = std::env::var("OFFSYNC_API_KEY").unwrap_or_default();
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let db_path = std::env::var("OFFSYNC_DB_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, &home));

        let mut engine = EngineConfig::new(backend_url, api_key);
        engine.db_path = db_path;
        engine.max_retries =
            u32::try_from(read_u64_env("OFFSYNC_MAX_RETRIES", DEFAULT_MAX_RETRIES)).unwrap_or(u32::MAX);
        engine.slow_fetch_threshold =
            Duration::from_millis(read_u64_env("OFFSYNC_SLOW_FETCH_MS", DEFAULT_SLOW_FETCH_MS));
        engine.storage_quota_bytes =
            read_u64_env("OFFSYNC_STORAGE_QUOTA_BYTES", DEFAULT_STORAGE_QUOTA_BYTES);
        engine.initially_online = read_bool_env("OFFSYNC_ASSUME_ONLINE", false);

        Ok(Self {
            engine,
            probe_interval: Duration::from_secs(read_u64_env("OFFSYNC_PROBE_SECS", DEFAULT_PROBE_SECS)),
            worker_interval: Duration::from_millis(read_u64_env(
                "OFFSYNC_WORKER_LOOP_MS",
                DEFAULT_WORKER_LOOP_MS,
            )),
            persist_interval: Duration::from_secs(read_u64_env(
                "OFFSYNC_PERSIST_SECS",
                DEFAULT_PERSIST_SECS,
            )),
            eviction_interval: Duration::from_secs(DEFAULT_EVICTION_SECS),
            cache_max_bytes: read_u64_env("OFFSYNC_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES),
        })
    }
}

/// Point-in-time view printed by `--status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub sync: SyncStatus,
    pub validation: ValidationStatus,
    pub storage: crate::store::StorageStatus,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: OfflineEngine,
    wake: Arc<ChannelWake>,
    wake_rx: mpsc::UnboundedReceiver<WakeMessage>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let (wake, wake_rx) = ChannelWake::new();
        let wake = Arc::new(wake);
        let engine = OfflineEngine::init(
            config.engine.clone(),
            Arc::clone(&wake) as Arc<dyn BackgroundWake>,
        )
        .await
        .context("failed to initialize offline engine")?;
        Ok(Self {
            config,
            engine,
            wake,
            wake_rx,
        })
    }

    pub fn engine(&self) -> &OfflineEngine {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            engine,
            wake,
            mut wake_rx,
        } = self;
        info!(
            backend = %config.engine.backend_url,
            probe_secs = config.probe_interval.as_secs(),
            "offsyncd started"
        );

        let engine_for_probe = engine.clone();
        let wake_for_probe = Arc::clone(&wake);
        let probe_interval = config.probe_interval;
        let probe_handle = tokio::spawn(async move {
            let mut backoff = Backoff::new(
                probe_interval,
                probe_interval.saturating_mul(PROBE_BACKOFF_FACTOR),
                true,
            );
            loop {
                let reachable = probe_backend(engine_for_probe.client()).await;
                match engine_for_probe.set_online(reachable).await {
                    Ok(Some(report)) => {
                        info!("{}", describe_reconnect(&report));
                        wake_for_probe.fire();
                    }
                    Ok(None) => {}
                    Err(err) => error!("reconnect processing failed: {err}"),
                }
                let delay = if reachable {
                    backoff.reset();
                    probe_interval
                } else {
                    backoff.next_delay().max(MIN_PROBE_DELAY)
                };
                debug!(reachable, delay_ms = delay.as_millis() as u64, "next connectivity probe");
                tokio::time::sleep(delay).await;
            }
        });

        let engine_for_worker = engine.clone();
        let worker_interval = config.worker_interval;
        let worker_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker_interval);
            loop {
                tokio::select! {
                    message = wake_rx.recv() => {
                        match message {
                            Some(WakeMessage::BackgroundSync) => debug!("background wake received"),
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {}
                }
                run_worker_pass(&engine_for_worker).await;
            }
        });

        let engine_for_persist = engine.clone();
        let persist_interval = config.persist_interval;
        let persist_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(persist_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = engine_for_persist.persist_actions().await {
                    warn!("periodic action persistence failed: {err}");
                }
            }
        });

        let engine_for_eviction = engine.clone();
        let eviction_interval = config.eviction_interval;
        let cache_max_bytes = config.cache_max_bytes;
        let eviction_handle = tokio::spawn(async move {
            loop {
                if let Err(err) = engine_for_eviction.enforce_cache_budget(cache_max_bytes).await {
                    warn!("cache eviction failed: {err}");
                }
                tokio::time::sleep(eviction_interval).await;
            }
        });

        let shutdown = tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal");

        probe_handle.abort();
        worker_handle.abort();
        persist_handle.abort();
        eviction_handle.abort();

        info!("shutting down");
        engine.dispose().await.context("failed to dispose engine")?;
        shutdown
    }
}

/// Opens the engine without background tasks for one-shot CLI commands.
pub async fn open_oneshot(config: &DaemonConfig) -> anyhow::Result<OfflineEngine> {
    OfflineEngine::init(config.engine.clone(), Arc::new(NoopWake))
        .await
        .context("failed to initialize offline engine")
}

pub async fn status_snapshot(engine: &OfflineEngine) -> anyhow::Result<StatusSnapshot> {
    Ok(StatusSnapshot {
        sync: engine.get_sync_status().await?,
        validation: engine.get_validation_status(),
        storage: engine.storage_status().await?,
    })
}

/// Probes the backend, replays pending work if reachable and validates
/// every cached entity.
pub async fn validate_once(engine: &OfflineEngine) -> anyhow::Result<ValidationReport> {
    let reachable = probe_backend(engine.client()).await;
    if !reachable {
        anyhow::bail!("backend is unreachable; cached data left untouched");
    }
    match engine.set_online(true).await? {
        Some(report) => Ok(report.validation),
        None => Ok(engine.validate_cache().await?),
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
