//! Domain models for activity-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod activity;
pub mod sync;
pub mod token;
pub mod zone;

// Re-export commonly used types
pub use activity::{ActivityRecord, ActivitySummary};
pub use sync::{SyncResult, SyncStatus, SyncStatusValue};
pub use token::{AuthRecord, ClientCredentials, StoredTokens, TokenResponse};
pub use zone::{normalize_zones, ActivityZone, TimedZoneRange, ZoneBucket, ZoneGroup};
