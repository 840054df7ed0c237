//! Data synchronization infrastructure
//!
//! This module replicates activities from the upstream API into the local
//! database and enriches them with zone data, while staying inside the
//! upstream's two-window rate limit.
//!
//! # Components
//!
//! - [`quota`]: Quota header parsing and reset-time arithmetic
//! - [`retry`]: Pluggable retry policy with quota-aligned backoff
//! - [`http_client`]: Resilient client for the list and zones endpoints
//! - [`replication`]: Full and delta activity replication
//! - [`enrichment`]: Batched zone enrichment with circuit breaking
//! - [`scheduler`]: Periodic task runner with shared cancellation
//!
//! # Example
//!
//! ```ignore
//! use activity_sync::sync::{QuotaAwarePolicy, QuotaTracker, ReplicationOrchestrator, ResilientClient};
//!
//! let quota = Arc::new(QuotaTracker::from_config(&config.quota));
//! let policy = Arc::new(QuotaAwarePolicy::from_config(&config.retry));
//! let client = Arc::new(ResilientClient::new(&config.source, quota, policy)?);
//!
//! let replication = ReplicationOrchestrator::new(client, database);
//! let outcome = replication.run(&access_token, &cancel).await?;
//! ```

pub mod enrichment;
pub mod http_client;
pub mod quota;
pub mod replication;
pub mod retry;
pub mod scheduler;
pub mod wait;

// Re-export main types for convenience
pub use enrichment::{
    BatchReport, BatchStop, EnrichmentBatchOrchestrator, EnrichmentConfig, EnrichmentState,
};
pub use http_client::{FetchedPage, PageRequest, ResilientClient};
pub use quota::{QuotaSnapshot, QuotaTracker, QuotaWindow, WindowKind};
pub use replication::{
    FetchPage, PartialSync, PersistReport, ReplicationOrchestrator, SyncMode, SyncOutcome,
};
pub use retry::{AttemptOutcome, QuotaAwarePolicy, RetryDecision, RetryPolicy, RetryState};
pub use scheduler::{ManualSyncHandle, SchedulerConfig, SyncScheduler, Syncable};
pub use wait::cancellable_sleep;
