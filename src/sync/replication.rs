//! Activity replication
//!
//! Pages through the athlete's activity list and upserts every record into
//! the local store. A full sync starts from page 1 with no filter; a delta
//! sync passes the newest stored start date as `after`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::SyncError;
use crate::models::{ActivityRecord, ActivitySummary};
use crate::otel::SyncMetrics;
use crate::sync::http_client::{PageRequest, ResilientClient};
use crate::sync::quota::QuotaSnapshot;
use crate::sync::wait::cancellable_sleep;

/// One page attempt, handed to progress callbacks
///
/// A failed page is reported too, with no items and `error` set.
#[derive(Debug, Clone)]
pub struct FetchPage {
    pub items: Vec<ActivitySummary>,
    /// 1-based page number
    pub page: u32,
    /// Items fetched so far, this page included
    pub cumulative_count: usize,
    pub quota: QuotaSnapshot,
    /// Retries spent on this page
    pub retried: u32,
    pub error: Option<SyncError>,
}

/// A page failed after retries; items from earlier pages are kept
#[derive(Debug, Error)]
#[error("sync stopped at page {page} after {} records: {source}", .fetched.len())]
pub struct PartialSync {
    pub page: u32,
    pub fetched: Vec<ActivitySummary>,
    pub source: SyncError,
}

/// How a replication run chose its starting point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Delta { since: DateTime<Utc> },
}

/// Persistence tally for a batch of fetched records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub saved: u64,
    pub failed: u64,
}

/// Summary of a completed replication run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub mode: SyncMode,
    pub fetched: usize,
    pub persisted: PersistReport,
}

/// Replicates the remote activity list into the database
pub struct ReplicationOrchestrator<D: Database> {
    client: Arc<ResilientClient>,
    database: Arc<D>,
    metrics: Option<SyncMetrics>,
}

impl<D: Database> ReplicationOrchestrator<D> {
    pub fn new(client: Arc<ResilientClient>, database: Arc<D>) -> Self {
        Self {
            client,
            database,
            metrics: None,
        }
    }

    /// Record persistence metrics
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetch every activity, newest first
    pub async fn sync_all<F>(
        &self,
        token: &str,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<Vec<ActivitySummary>, PartialSync>
    where
        F: FnMut(&FetchPage),
    {
        self.fetch_pages(None, token, cancel, progress).await
    }

    /// Fetch activities that started after `cursor`
    pub async fn sync_since<F>(
        &self,
        cursor: DateTime<Utc>,
        token: &str,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<Vec<ActivitySummary>, PartialSync>
    where
        F: FnMut(&FetchPage),
    {
        self.fetch_pages(Some(cursor.timestamp()), token, cancel, progress)
            .await
    }

    async fn fetch_pages<F>(
        &self,
        after: Option<i64>,
        token: &str,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> Result<Vec<ActivitySummary>, PartialSync>
    where
        F: FnMut(&FetchPage),
    {
        let mut fetched: Vec<ActivitySummary> = Vec::new();
        let mut page = 1u32;

        loop {
            let mut request = PageRequest::new(page);
            if let Some(epoch) = after {
                request = request.after(epoch);
            }

            let result = match self.client.fetch_page(&request, token, cancel).await {
                Ok(result) => result,
                Err(source) => {
                    let quota = self.client.quota().current().await;
                    progress(&FetchPage {
                        items: Vec::new(),
                        page,
                        cumulative_count: fetched.len(),
                        quota,
                        retried: 0,
                        error: Some(source.clone()),
                    });
                    return Err(PartialSync {
                        page,
                        fetched,
                        source,
                    })
                }
            };

            let done = result.items.is_empty();
            let report = FetchPage {
                cumulative_count: fetched.len() + result.items.len(),
                items: result.items,
                page,
                quota: result.quota,
                retried: result.retries,
                error: None,
            };
            progress(&report);

            if done {
                break;
            }

            fetched.extend(report.items);
            page += 1;
        }

        Ok(fetched)
    }

    /// Upsert fetched activities one at a time
    ///
    /// Failed records are logged and skipped. Cancellation stops between
    /// records; everything saved before it stays saved.
    pub async fn persist(
        &self,
        items: &[ActivitySummary],
        cancel: &CancellationToken,
    ) -> Result<PersistReport, SyncError> {
        let mut report = PersistReport::default();

        for item in items {
            if cancel.is_cancelled() {
                info!(saved = report.saved, "Persisting interrupted by shutdown");
                return Err(SyncError::Cancelled);
            }

            let record = ActivityRecord::from(item);
            match self.database.upsert_activity(&record).await {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    warn!(activity_id = item.id, name = %item.name, error = %e, "Failed to save activity");
                    report.failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_persist_failure();
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_upserted(report.saved);
        }

        Ok(report)
    }

    /// Run one replication cycle
    ///
    /// Waits out any recommended quota pause, then performs a delta sync from
    /// the newest stored start date, or a full sync when the store is empty.
    pub async fn run(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        let quota = self.client.quota().current().await;
        if !quota.recommended_wait.is_zero() {
            info!(
                wait_secs = quota.recommended_wait.as_secs(),
                short_usage = %quota.short,
                daily_usage = %quota.daily,
                "Waiting for rate limit reset before sync"
            );
            cancellable_sleep(quota.recommended_wait, cancel).await?;
        }

        let cursor = self.database.max_start_date().await?;
        let mode = match cursor {
            Some(since) => SyncMode::Delta { since },
            None => SyncMode::Full,
        };

        let log_page = |page: &FetchPage| {
            if let Some(error) = &page.error {
                debug!(
                    page = page.page,
                    total = page.cumulative_count,
                    error = %error,
                    "Activity page failed"
                );
                return;
            }
            debug!(
                page = page.page,
                count = page.items.len(),
                total = page.cumulative_count,
                retried = page.retried,
                short_usage = %page.quota.short,
                daily_usage = %page.quota.daily,
                "Fetched activity page"
            );
        };

        let fetched = match mode {
            SyncMode::Delta { since } => {
                info!(since = %since, "Starting delta sync");
                self.sync_since(since, token, cancel, log_page).await
            }
            SyncMode::Full => {
                info!("Starting full sync");
                self.sync_all(token, cancel, log_page).await
            }
        };

        let items = match fetched {
            Ok(items) => items,
            Err(partial) => {
                match mode {
                    // Delta pages run oldest first, so a prefix is a valid cursor
                    SyncMode::Delta { .. } if !partial.fetched.is_empty() => {
                        warn!(
                            page = partial.page,
                            fetched = partial.fetched.len(),
                            error = %partial.source,
                            "Delta sync incomplete, saving fetched activities"
                        );
                        self.persist(&partial.fetched, cancel).await?;
                    }
                    // A newest-first prefix would advance the cursor past unfetched history
                    SyncMode::Full if !partial.fetched.is_empty() => {
                        warn!(
                            page = partial.page,
                            discarded = partial.fetched.len(),
                            error = %partial.source,
                            "Full sync incomplete, discarding fetched activities"
                        );
                    }
                    _ => {}
                }
                return Err(partial.source);
            }
        };

        let persisted = self.persist(&items, cancel).await?;

        let quota = self.client.quota().current().await;
        info!(
            fetched = items.len(),
            saved = persisted.saved,
            failed = persisted.failed,
            short_usage = %quota.short,
            daily_usage = %quota.daily,
            "Activity sync completed"
        );

        Ok(SyncOutcome {
            mode,
            fetched: items.len(),
            persisted,
        })
    }
}
