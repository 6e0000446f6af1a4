use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use offsync_core::{BackendError, CollectionClient};

use super::background::FlagGuard;
use super::clock::Clock;
use super::network::NetworkMonitor;
use crate::store::{EntityRecord, EntityStore, MetadataCache, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub checked: usize,
    pub invalidated: usize,
    pub failed: usize,
    pub halted: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStatus {
    pub is_validating: bool,
    pub last_validated_at: Option<i64>,
    pub last_report: Option<ValidationReport>,
}

struct ValidatingGuard<'a>(&'a NetworkMonitor);

impl Drop for ValidatingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_validating(false);
    }
}

enum Verdict {
    Fresh,
    Mismatch(&'static str),
}

/// Revalidates locally cached entities against the backend.
pub struct CacheCoordinator {
    entities: EntityStore,
    cache: MetadataCache,
    client: CollectionClient,
    network: NetworkMonitor,
    clock: Clock,
    running: AtomicBool,
    last: Mutex<(Option<i64>, Option<ValidationReport>)>,
}

impl CacheCoordinator {
    pub fn new(
        entities: EntityStore,
        cache: MetadataCache,
        client: CollectionClient,
        network: NetworkMonitor,
        clock: Clock,
    ) -> Self {
        Self {
            entities,
            cache,
            client,
            network,
            clock,
            running: AtomicBool::new(false),
            last: Mutex::new((None, None)),
        }
    }

    pub fn status(&self) -> ValidationStatus {
        let (last_validated_at, last_report) =
            *self.last.lock().unwrap_or_else(PoisonError::into_inner);
        ValidationStatus {
            is_validating: self.running.load(Ordering::Acquire),
            last_validated_at,
            last_report,
        }
    }

    /// Checks every cached entity. A mismatch removes the entity and cascades
    /// through cache entries depending on it; nothing is refetched here.
    pub async fn validate_all_cached_items(&self) -> Result<ValidationReport, StoreError> {
        let mut report = ValidationReport::default();
        if !self.network.is_online() {
            report.skipped = true;
            return Ok(report);
        }
        let Some(_running) = FlagGuard::acquire(&self.running) else {
            report.skipped = true;
            return Ok(report);
        };
        self.network.set_validating(true);
        let _validating = ValidatingGuard(&self.network);

        self.run(&mut report).await?;

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
            (Some(self.clock.now_ms()), Some(report));
        info!(
            checked = report.checked,
            invalidated = report.invalidated,
            failed = report.failed,
            "cache validation finished"
        );
        Ok(report)
    }

    async fn run(&self, report: &mut ValidationReport) -> Result<(), StoreError> {
        let records = self.entities.get_all(None, None).await?;
        for record in records {
            if !self.network.is_online() {
                report.halted = true;
                break;
            }
            match self.check(&record).await {
                Ok(Verdict::Fresh) => report.checked += 1,
                Ok(Verdict::Mismatch(reason)) => {
                    report.checked += 1;
                    match self.invalidate(&record).await {
                        Ok(()) => {
                            debug!(
                                collection = record.kind.collection(),
                                id = %record.id,
                                reason,
                                "cached entity invalidated"
                            );
                            report.invalidated += 1;
                        }
                        Err(err) => {
                            warn!(id = %record.id, "invalidation failed: {err}");
                            report.failed += 1;
                        }
                    }
                }
                Err(err) if err.is_connectivity() => {
                    self.network.set_online(false);
                    report.halted = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        collection = record.kind.collection(),
                        id = %record.id,
                        "validation check failed: {err}"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn check(&self, record: &EntityRecord) -> Result<Verdict, BackendError> {
        let stamp = self
            .client
            .fetch_stamp(record.kind.collection(), &record.id)
            .await?;
        let Some(stamp) = stamp else {
            return Ok(Verdict::Mismatch("missing remotely"));
        };
        let Some(updated_at) = stamp.updated_at.as_deref() else {
            return Ok(Verdict::Fresh);
        };
        match OffsetDateTime::parse(updated_at, &Rfc3339) {
            Ok(parsed) => {
                let remote_ms = (parsed.unix_timestamp_nanos() / 1_000_000) as i64;
                if remote_ms > record.timestamp {
                    Ok(Verdict::Mismatch("updated remotely"))
                } else {
                    Ok(Verdict::Fresh)
                }
            }
            Err(err) => {
                debug!(id = %record.id, updated_at, "unparseable updated_at: {err}");
                Ok(Verdict::Fresh)
            }
        }
    }

    async fn invalidate(&self, record: &EntityRecord) -> Result<(), StoreError> {
        self.entities.remove(record.kind, &record.id).await?;
        self.cache
            .invalidate_with_dependencies(&record.kind.dependency_key(&record.id))
            .await?;
        Ok(())
    }
}
