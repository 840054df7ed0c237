//! Zone enrichment
//!
//! Works through activities that have never had their zone distributions
//! fetched, newest first, one request at a time. The run adapts to quota:
//! it waits out the 15-minute window, stops for the day when the daily
//! allowance runs low, and trips a circuit after repeated rate limiting.
//! A 402 from the zones endpoint disables enrichment for the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::database::Database;
use crate::error::SyncError;
use crate::models::normalize_zones;
use crate::otel::SyncMetrics;
use crate::sync::http_client::ResilientClient;
use crate::sync::quota::QuotaTracker;
use crate::sync::wait::cancellable_sleep;

/// Where the orchestrator currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentState {
    Idle,
    FetchingBacklog,
    ProcessingItem,
    WaitingForQuota,
    Done,
    /// Terminal: the account cannot use the zones endpoint
    Disabled,
}

/// Batch tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentConfig {
    pub batch_size: usize,
    /// Delay between successful items
    pub pacing: Duration,
    pub max_consecutive_rate_limits: u32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl EnrichmentConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.enrichment_batch_size,
            pacing: Duration::from_millis(config.enrichment_pacing_ms),
            max_consecutive_rate_limits: config.max_consecutive_rate_limits,
        }
    }
}

/// Why a batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStop {
    /// Nothing left to enrich
    EmptyBacklog,
    /// Every item in the batch was visited
    BacklogExhausted,
    /// Daily allowance is used up or nearly so
    DailyQuota,
    /// Too many rate limits in a row
    RateLimitCircuit,
    /// Enrichment is unavailable for this account
    Disabled,
}

/// Result of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Backlog size fetched for this batch
    pub backlog: usize,
    pub synced: usize,
    pub skipped: usize,
    pub stop: BatchStop,
}

impl BatchReport {
    fn new(backlog: usize, stop: BatchStop) -> Self {
        Self {
            backlog,
            synced: 0,
            skipped: 0,
            stop,
        }
    }
}

enum QuotaGate {
    Proceed,
    DailyExhausted,
}

/// Fetches and stores zone distributions for un-enriched activities
pub struct EnrichmentBatchOrchestrator<D: Database> {
    client: Arc<ResilientClient>,
    database: Arc<D>,
    config: EnrichmentConfig,
    disabled: AtomicBool,
    state: RwLock<EnrichmentState>,
    metrics: Option<SyncMetrics>,
}

impl<D: Database> EnrichmentBatchOrchestrator<D> {
    pub fn new(client: Arc<ResilientClient>, database: Arc<D>, config: EnrichmentConfig) -> Self {
        Self {
            client,
            database,
            config,
            disabled: AtomicBool::new(false),
            state: RwLock::new(EnrichmentState::Idle),
            metrics: None,
        }
    }

    /// Record enrichment metrics
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    /// Quota state shared with the underlying client
    pub fn quota(&self) -> &Arc<QuotaTracker> {
        self.client.quota()
    }

    /// True once the source reported the feature unavailable
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> EnrichmentState {
        *self.state.read().await
    }

    async fn set_state(&self, next: EnrichmentState) {
        let mut state = self.state.write().await;
        if *state != EnrichmentState::Disabled && *state != next {
            trace!(from = ?*state, to = ?next, "Enrichment state change");
            *state = next;
        }
    }

    /// Enrich up to one batch of activities
    ///
    /// Returns `FeatureUnavailable` the first time the source rejects the
    /// endpoint; every later call is a no-op. `Unauthorized` and
    /// `Cancelled` abort the batch.
    pub async fn run_batch(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, SyncError> {
        if self.is_disabled() {
            debug!("Zone enrichment disabled, skipping");
            return Ok(BatchReport::new(0, BatchStop::Disabled));
        }

        self.set_state(EnrichmentState::FetchingBacklog).await;
        let backlog = match self
            .database
            .activities_without_zones(self.config.batch_size)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                self.set_state(EnrichmentState::Idle).await;
                return Err(e.into());
            }
        };

        if backlog.is_empty() {
            self.set_state(EnrichmentState::Idle).await;
            return Ok(BatchReport::new(0, BatchStop::EmptyBacklog));
        }

        debug!(backlog = backlog.len(), "Enriching activity zones");

        let result = self.process(&backlog, token, cancel).await;
        if !self.is_disabled() {
            self.set_state(EnrichmentState::Idle).await;
        }
        result
    }

    async fn process(
        &self,
        backlog: &[i64],
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, SyncError> {
        let mut report = BatchReport::new(backlog.len(), BatchStop::BacklogExhausted);
        let mut consecutive_rate_limits = 0u32;

        'items: for (position, &activity_id) in backlog.iter().enumerate() {
            loop {
                if let QuotaGate::DailyExhausted = self.wait_for_quota(cancel).await? {
                    report.stop = BatchStop::DailyQuota;
                    break 'items;
                }

                self.set_state(EnrichmentState::ProcessingItem).await;
                trace!(
                    activity_id,
                    position = position + 1,
                    total = backlog.len(),
                    "Fetching zones"
                );

                match self.client.fetch_zones(activity_id, token, cancel).await {
                    Ok(zones) => {
                        consecutive_rate_limits = 0;
                        let groups = normalize_zones(&zones);

                        match self
                            .database
                            .replace_activity_zones(activity_id, &groups)
                            .await
                        {
                            Ok(()) => {
                                report.synced += 1;
                                if let Some(metrics) = &self.metrics {
                                    metrics.record_enrichment_synced();
                                }
                                if position + 1 < backlog.len() {
                                    cancellable_sleep(self.config.pacing, cancel).await?;
                                }
                            }
                            Err(e) => {
                                warn!(activity_id, error = %e, "Failed to store zones");
                                report.skipped += 1;
                            }
                        }
                        break;
                    }
                    Err(SyncError::FeatureUnavailable) => {
                        self.disabled.store(true, Ordering::SeqCst);
                        *self.state.write().await = EnrichmentState::Disabled;
                        warn!(
                            synced = report.synced,
                            "Zone data requires a subscription, disabling enrichment"
                        );
                        return Err(SyncError::FeatureUnavailable);
                    }
                    Err(SyncError::RateLimited(retry_after)) => {
                        consecutive_rate_limits += 1;
                        if consecutive_rate_limits >= self.config.max_consecutive_rate_limits {
                            warn!(
                                consecutive_rate_limits,
                                synced = report.synced,
                                "Stopping zone enrichment after repeated rate limiting"
                            );
                            report.stop = BatchStop::RateLimitCircuit;
                            break 'items;
                        }

                        let wait = match retry_after {
                            Some(secs) => Duration::from_secs(secs),
                            None => self.client.quota().current().await.time_until_short_reset,
                        };
                        info!(
                            activity_id,
                            consecutive_rate_limits,
                            wait_secs = wait.as_secs(),
                            "Rate limited, retrying activity after wait"
                        );
                        self.set_state(EnrichmentState::WaitingForQuota).await;
                        cancellable_sleep(wait, cancel).await?;
                    }
                    Err(e @ (SyncError::Cancelled | SyncError::Unauthorized)) => return Err(e),
                    Err(e) => {
                        warn!(activity_id, error = %e, "Failed to fetch zones, skipping activity");
                        consecutive_rate_limits = 0;
                        report.skipped += 1;
                        break;
                    }
                }
            }
        }

        self.set_state(EnrichmentState::Done).await;
        info!(
            synced = report.synced,
            skipped = report.skipped,
            backlog = report.backlog,
            stop = ?report.stop,
            "Zone enrichment batch finished"
        );

        Ok(report)
    }

    /// Block until the short window has headroom; report a spent daily window
    async fn wait_for_quota(&self, cancel: &CancellationToken) -> Result<QuotaGate, SyncError> {
        loop {
            let quota = self.client.quota().current().await;

            if quota.is_daily_exceeded() || quota.is_approaching_daily() {
                info!(
                    daily_usage = %quota.daily,
                    resets_in_secs = quota.time_until_daily_reset.as_secs(),
                    "Daily rate limit nearly reached, stopping zone enrichment"
                );
                return Ok(QuotaGate::DailyExhausted);
            }

            if quota.is_short_exceeded() || quota.is_approaching_short() {
                info!(
                    short_usage = %quota.short,
                    wait_secs = quota.time_until_short_reset.as_secs(),
                    "15-minute rate limit nearly reached, waiting for reset"
                );
                self.set_state(EnrichmentState::WaitingForQuota).await;
                cancellable_sleep(quota.time_until_short_reset, cancel).await?;
                continue;
            }

            return Ok(QuotaGate::Proceed);
        }
    }
}
