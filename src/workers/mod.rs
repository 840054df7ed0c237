//! Background workers
//!
//! Each worker adapts one piece of the sync layer to the [`Syncable`]
//! interface so the scheduler can run it periodically:
//! - [`activity`]: delta or full replication of the activity list
//! - [`enrichment`]: back-to-back zone enrichment batches
//! - [`token`]: proactive access token refresh
//!
//! [`Syncable`]: crate::sync::Syncable

pub mod activity;
pub mod enrichment;
pub mod token;

use tracing::{info, warn};

use crate::database::Database;

pub use activity::ActivitySyncWorker;
pub use enrichment::EnrichmentWorker;
pub use token::TokenRefreshWorker;

/// Log a one-line summary of what the local store holds
pub async fn log_database_stats<D: Database + ?Sized>(db: &D) {
    let total = match db.count_activities().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "Failed to count activities");
            return;
        }
    };

    if total == 0 {
        info!(total_activities = 0, "Database statistics");
        return;
    }

    let newest = format_date(db.max_start_date().await.ok().flatten());
    let oldest = format_date(db.min_start_date().await.ok().flatten());
    let with_zones = db.count_activities_with_zones().await.unwrap_or_default();
    let without_zones = db.count_activities_without_zones().await.unwrap_or_default();

    info!(
        total_activities = total,
        newest_activity = %newest,
        oldest_activity = %oldest,
        with_zones,
        without_zones,
        "Database statistics"
    );
}

fn format_date(date: Option<chrono::DateTime<chrono::Utc>>) -> String {
    date.map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}
