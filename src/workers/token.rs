//! Token refresh worker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::TokenManager;
use crate::database::Database;
use crate::error::SyncError;
use crate::models::SyncResult;
use crate::sync::Syncable;

/// Refresh when fewer than this many minutes of validity remain
pub const REFRESH_MARGIN_MINUTES: i64 = 10;

/// Keeps the stored access token ahead of its expiry
pub struct TokenRefreshWorker<D: Database> {
    tokens: Arc<TokenManager<D>>,
    interval: Duration,
    margin: chrono::Duration,
}

impl<D: Database> TokenRefreshWorker<D> {
    pub fn new(tokens: Arc<TokenManager<D>>, interval: Duration) -> Self {
        Self {
            tokens,
            interval,
            margin: chrono::Duration::minutes(REFRESH_MARGIN_MINUTES),
        }
    }
}

#[async_trait]
impl<D: Database + 'static> Syncable for TokenRefreshWorker<D> {
    fn name(&self) -> &str {
        "token-refresh"
    }

    fn sync_interval(&self) -> Duration {
        self.interval
    }

    async fn sync(&self, _cancel: &CancellationToken) -> Result<SyncResult, SyncError> {
        match self.tokens.refresh_if_expiring(self.margin, Utc::now()).await? {
            Some(refreshed) => {
                let expires_at = refreshed
                    .expires_at_utc()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                info!(new_expires_at = %expires_at, "Token refreshed");
                Ok(SyncResult::success(1).with_message(format!("expires at {}", expires_at)))
            }
            None => Ok(SyncResult::skipped()),
        }
    }
}
