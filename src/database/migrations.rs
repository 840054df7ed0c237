//! Database migrations for activity-sync
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Replicated activities
CREATE TABLE IF NOT EXISTS activities (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    distance REAL,
    moving_time INTEGER,
    elapsed_time INTEGER,
    total_elevation_gain REAL,
    activity_type TEXT,
    sport_type TEXT,
    start_date TEXT,
    start_date_local TEXT,
    timezone TEXT,
    average_speed REAL,
    max_speed REAL,
    average_cadence REAL,
    average_heartrate REAL,
    max_heartrate REAL,
    calories REAL,
    zones_synced_at DATETIME,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_activities_start_date ON activities(start_date DESC);
CREATE INDEX IF NOT EXISTS idx_activities_zones_pending
    ON activities(start_date DESC) WHERE zones_synced_at IS NULL;

-- Zone groups, one per measure type
CREATE TABLE IF NOT EXISTS activity_zones (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
    zone_type TEXT NOT NULL,
    sensor_based INTEGER NOT NULL DEFAULT 0,
    UNIQUE(activity_id, zone_type)
);

CREATE INDEX IF NOT EXISTS idx_activity_zones_activity ON activity_zones(activity_id);

-- Ordered distribution buckets of a zone group
CREATE TABLE IF NOT EXISTS zone_buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    zone_id INTEGER NOT NULL REFERENCES activity_zones(id) ON DELETE CASCADE,
    bucket_index INTEGER NOT NULL,
    range_min INTEGER NOT NULL,
    range_max INTEGER NOT NULL,
    measure_secs INTEGER NOT NULL,
    UNIQUE(zone_id, bucket_index)
);

-- OAuth client and token pair (single row)
CREATE TABLE IF NOT EXISTS auth_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    client_id TEXT NOT NULL,
    client_secret TEXT NOT NULL,
    access_token TEXT,
    refresh_token TEXT,
    expires_at INTEGER,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Get the migration version
pub fn migration_version() -> i32 {
    1
}
