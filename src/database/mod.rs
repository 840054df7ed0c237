//! Database layer for activity-sync
//!
//! This module defines the database trait and SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DbError;
use crate::models::{ActivityRecord, AuthRecord, ClientCredentials, StoredTokens, ZoneGroup};

/// Database trait for data persistence
///
/// This trait defines all database operations needed by the sync pipeline.
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Activity operations
    // =========================================================================

    /// Insert or overwrite an activity keyed by its external ID
    async fn upsert_activity(&self, activity: &ActivityRecord) -> Result<(), DbError>;

    /// Get an activity by ID
    async fn get_activity(&self, id: i64) -> Result<Option<ActivityRecord>, DbError>;

    /// Total number of stored activities
    async fn count_activities(&self) -> Result<u64, DbError>;

    /// Most recent stored start date, used as the delta sync cursor
    async fn max_start_date(&self) -> Result<Option<DateTime<Utc>>, DbError>;

    /// Oldest stored start date
    async fn min_start_date(&self) -> Result<Option<DateTime<Utc>>, DbError>;

    // =========================================================================
    // Zone operations
    // =========================================================================

    /// IDs of activities never enriched, most recent first
    async fn activities_without_zones(&self, limit: usize) -> Result<Vec<i64>, DbError>;

    /// Number of activities never enriched
    async fn count_activities_without_zones(&self) -> Result<u64, DbError>;

    /// Number of activities already enriched
    async fn count_activities_with_zones(&self) -> Result<u64, DbError>;

    /// Replace every zone group of an activity in a single transaction
    ///
    /// Marks the activity as enriched even when `groups` is empty.
    /// Returns `DbError::NotFound` if the activity does not exist.
    async fn replace_activity_zones(&self, id: i64, groups: &[ZoneGroup]) -> Result<(), DbError>;

    /// Stored zone groups for an activity, buckets in index order
    async fn zones_for_activity(&self, id: i64) -> Result<Vec<ZoneGroup>, DbError>;

    // =========================================================================
    // Auth operations
    // =========================================================================

    /// Load client credentials and tokens, if configured
    async fn load_auth(&self) -> Result<Option<AuthRecord>, DbError>;

    /// Store client credentials, keeping any existing tokens
    async fn save_client_config(&self, client: &ClientCredentials) -> Result<(), DbError>;

    /// Store a token pair
    ///
    /// Returns `DbError::NotFound` when no client credentials exist yet.
    async fn save_tokens(&self, tokens: &StoredTokens) -> Result<(), DbError>;

    /// Remove all stored credentials
    async fn delete_auth(&self) -> Result<(), DbError>;
}
