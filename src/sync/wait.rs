//! Interruptible sleeping
//!
//! Every wait in the sync path (backoff, quota, pacing) goes through
//! [`cancellable_sleep`] so shutdown is never blocked behind a timer.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

/// Sleep for `duration` unless `cancel` fires first
///
/// Returns `SyncError::Cancelled` if the token is (or becomes) cancelled.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
