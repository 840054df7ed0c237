//! Zone enrichment worker
//!
//! Runs enrichment batches back to back while quota headroom remains. A run
//! ends when a batch comes back short, the backlog is empty, the daily
//! allowance is nearly spent, or the zones endpoint turns out to be
//! unavailable for the account. A tripped rate-limit circuit waits for the
//! 15-minute window to reset and carries on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::CredentialProvider;
use crate::config::SyncConfig;
use crate::database::Database;
use crate::error::SyncError;
use crate::models::SyncResult;
use crate::sync::enrichment::{BatchStop, EnrichmentBatchOrchestrator};
use crate::sync::wait::cancellable_sleep;
use crate::sync::Syncable;

/// Periodically enriches activities with zone distributions
pub struct EnrichmentWorker<D: Database> {
    orchestrator: Arc<EnrichmentBatchOrchestrator<D>>,
    database: Arc<D>,
    credentials: Arc<dyn CredentialProvider>,
    interval: Duration,
    initial_delay: Duration,
    batch_pause: Duration,
}

impl<D: Database> EnrichmentWorker<D> {
    pub fn new(
        orchestrator: Arc<EnrichmentBatchOrchestrator<D>>,
        database: Arc<D>,
        credentials: Arc<dyn CredentialProvider>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            orchestrator,
            database,
            credentials,
            interval: Duration::from_secs(config.interval_secs),
            initial_delay: Duration::from_secs(config.enrichment_initial_delay_secs),
            batch_pause: Duration::from_millis(config.enrichment_batch_pause_ms),
        }
    }

    async fn run_batches(
        &self,
        mut remaining: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, SyncError> {
        let batch_size = self.orchestrator.config().batch_size;
        let mut total_synced = 0u64;
        let mut batch = 0u32;

        loop {
            // Refetched per batch; quota waits can outlast the access token
            let token = self.credentials.valid_access_token().await?;

            batch += 1;
            let report = match self.orchestrator.run_batch(&token, cancel).await {
                Ok(report) => report,
                Err(SyncError::FeatureUnavailable) => {
                    info!(total_synced, "Zone enrichment disabled for this account");
                    return Ok(total_synced);
                }
                Err(e) => {
                    error!(batch, error = %e, "Zone enrichment batch failed");
                    return Err(e);
                }
            };

            total_synced += report.synced as u64;
            remaining = remaining.saturating_sub(report.synced as u64);

            let quota = self.orchestrator.quota().current().await;
            info!(
                batch,
                synced = report.synced,
                skipped = report.skipped,
                total_synced,
                remaining,
                short_usage = %quota.short,
                daily_usage = %quota.daily,
                "Zone enrichment batch completed"
            );

            match report.stop {
                BatchStop::EmptyBacklog | BatchStop::Disabled | BatchStop::DailyQuota => break,
                BatchStop::RateLimitCircuit => {
                    info!(
                        total_synced,
                        wait_secs = quota.time_until_short_reset.as_secs(),
                        "Zone enrichment rate limited, waiting for window reset"
                    );
                    cancellable_sleep(quota.time_until_short_reset, cancel).await?;
                    continue;
                }
                BatchStop::BacklogExhausted => {}
            }

            if report.synced < batch_size {
                break;
            }

            if remaining == 0 {
                info!(total_synced, "Zone enrichment complete, all activities synced");
                break;
            }

            cancellable_sleep(self.batch_pause, cancel).await?;
        }

        Ok(total_synced)
    }
}

#[async_trait]
impl<D: Database + 'static> Syncable for EnrichmentWorker<D> {
    fn name(&self) -> &str {
        "zones"
    }

    fn sync_interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn sync(&self, cancel: &CancellationToken) -> Result<SyncResult, SyncError> {
        if self.orchestrator.is_disabled() {
            debug!("Zone enrichment skipped, feature unavailable");
            return Ok(SyncResult::skipped().with_message("zone enrichment disabled"));
        }

        let pending = self.database.count_activities_without_zones().await?;
        if pending == 0 {
            debug!("All activities have zones synced");
            return Ok(SyncResult::skipped());
        }

        info!(activities_remaining = pending, "Starting zone enrichment");

        let synced = self.run_batches(pending, cancel).await?;
        Ok(SyncResult::success(synced))
    }
}
