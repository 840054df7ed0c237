//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ErrorCode, OptionalExtension};
use tokio_rusqlite::Connection;
use tracing::info;

use super::migrations::{migration_version, CREATE_SCHEMA};
use super::Database;
use crate::error::DbError;
use crate::models::{
    ActivityRecord, AuthRecord, ClientCredentials, StoredTokens, ZoneBucket, ZoneGroup,
};

/// Default time a statement waits on a locked database
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Open (or create) a database file and apply the schema
    ///
    /// Enables WAL journaling, `synchronous=NORMAL` and the given busy timeout.
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, DbError> {
        let shown = path.as_ref().display().to_string();
        let conn = Connection::open(path).await?;

        let journal_mode = conn
            .call(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                let mode = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                conn.pragma_update(None, "synchronous", "NORMAL")?;
                conn.pragma_update(None, "foreign_keys", "ON")?;
                Ok(mode)
            })
            .await
            .map_err(lock_error)?;

        Self::migrate(&conn).await?;

        info!(
            path = %shown,
            journal_mode = %journal_mode,
            busy_timeout_ms = busy_timeout.as_millis() as u64,
            "Database opened"
        );

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().await?;

        conn.call(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        })
        .await?;

        Self::migrate(&conn).await?;

        Ok(Self { conn })
    }

    async fn migrate(conn: &Connection) -> Result<(), DbError> {
        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            conn.pragma_update(None, "user_version", migration_version())?;
            Ok(())
        })
        .await
        .map_err(|e| match lock_error(e) {
            DbError::Connection(e) => DbError::Migration(e.to_string()),
            other => other,
        })
    }

    /// Take and keep an exclusive lock on the database file
    ///
    /// Fails with `DbError::Locked` when another process already holds it.
    /// The lock lasts for the lifetime of this connection.
    pub async fn check_exclusive_access(&self) -> Result<(), DbError> {
        self.conn
            .call(|conn| {
                conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| {
                    row.get::<_, String>(0)
                })?;
                conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")?;
                Ok(())
            })
            .await
            .map_err(lock_error)
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Activity operations
    // =========================================================================

    async fn upsert_activity(&self, activity: &ActivityRecord) -> Result<(), DbError> {
        let a = activity.clone();
        let start_date = a.start_date.map(format_datetime);
        let start_date_local = a.start_date_local.map(format_datetime);

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO activities
                    (id, name, distance, moving_time, elapsed_time, total_elevation_gain,
                     activity_type, sport_type, start_date, start_date_local, timezone,
                     average_speed, max_speed, average_cadence, average_heartrate,
                     max_heartrate, calories, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                            ?16, ?17, CURRENT_TIMESTAMP)
                    ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        distance = excluded.distance,
                        moving_time = excluded.moving_time,
                        elapsed_time = excluded.elapsed_time,
                        total_elevation_gain = excluded.total_elevation_gain,
                        activity_type = excluded.activity_type,
                        sport_type = excluded.sport_type,
                        start_date = excluded.start_date,
                        start_date_local = excluded.start_date_local,
                        timezone = excluded.timezone,
                        average_speed = excluded.average_speed,
                        max_speed = excluded.max_speed,
                        average_cadence = excluded.average_cadence,
                        average_heartrate = excluded.average_heartrate,
                        max_heartrate = excluded.max_heartrate,
                        calories = excluded.calories,
                        updated_at = CURRENT_TIMESTAMP
                    "#,
                    rusqlite::params![
                        a.id,
                        a.name,
                        a.distance,
                        a.moving_time,
                        a.elapsed_time,
                        a.total_elevation_gain,
                        a.activity_type,
                        a.sport_type,
                        start_date,
                        start_date_local,
                        a.timezone,
                        a.average_speed,
                        a.max_speed,
                        a.average_cadence,
                        a.average_heartrate,
                        a.max_heartrate,
                        a.calories
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn get_activity(&self, id: i64) -> Result<Option<ActivityRecord>, DbError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, name, distance, moving_time, elapsed_time, total_elevation_gain,
                           activity_type, sport_type, start_date, start_date_local, timezone,
                           average_speed, max_speed, average_cadence, average_heartrate,
                           max_heartrate, calories
                    FROM activities
                    WHERE id = ?1
                    "#,
                )?;

                let result = stmt.query_row([id], activity_from_row).optional()?;
                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_activities(&self) -> Result<u64, DbError> {
        self.count("SELECT COUNT(*) FROM activities").await
    }

    async fn max_start_date(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        self.start_date_bound("SELECT MAX(start_date) FROM activities")
            .await
    }

    async fn min_start_date(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        self.start_date_bound("SELECT MIN(start_date) FROM activities")
            .await
    }

    // =========================================================================
    // Zone operations
    // =========================================================================

    async fn activities_without_zones(&self, limit: usize) -> Result<Vec<i64>, DbError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id FROM activities
                    WHERE zones_synced_at IS NULL
                    ORDER BY start_date DESC, id DESC
                    LIMIT ?1
                    "#,
                )?;

                let ids = stmt
                    .query_map([limit], |row| row.get(0))?
                    .collect::<Result<Vec<i64>, _>>()?;

                Ok(ids)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_activities_without_zones(&self) -> Result<u64, DbError> {
        self.count("SELECT COUNT(*) FROM activities WHERE zones_synced_at IS NULL")
            .await
    }

    async fn count_activities_with_zones(&self) -> Result<u64, DbError> {
        self.count("SELECT COUNT(*) FROM activities WHERE zones_synced_at IS NOT NULL")
            .await
    }

    async fn replace_activity_zones(&self, id: i64, groups: &[ZoneGroup]) -> Result<(), DbError> {
        let groups = groups.to_vec();

        let found = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let updated = tx.execute(
                    "UPDATE activities SET zones_synced_at = CURRENT_TIMESTAMP WHERE id = ?1",
                    [id],
                )?;
                if updated == 0 {
                    return Ok(false);
                }

                tx.execute(
                    r#"
                    DELETE FROM zone_buckets
                    WHERE zone_id IN (SELECT id FROM activity_zones WHERE activity_id = ?1)
                    "#,
                    [id],
                )?;
                tx.execute("DELETE FROM activity_zones WHERE activity_id = ?1", [id])?;

                {
                    let mut insert_group = tx.prepare(
                        "INSERT INTO activity_zones (activity_id, zone_type, sensor_based) VALUES (?1, ?2, ?3)",
                    )?;
                    let mut insert_bucket = tx.prepare(
                        r#"
                        INSERT INTO zone_buckets
                        (zone_id, bucket_index, range_min, range_max, measure_secs)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        "#,
                    )?;

                    for group in &groups {
                        let zone_id = insert_group.insert(rusqlite::params![
                            id,
                            group.zone_type,
                            group.sensor_based
                        ])?;

                        for bucket in &group.buckets {
                            insert_bucket.execute(rusqlite::params![
                                zone_id,
                                bucket.index,
                                bucket.range_min,
                                bucket.range_max,
                                bucket.measure_secs
                            ])?;
                        }
                    }
                }

                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !found {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn zones_for_activity(&self, id: i64) -> Result<Vec<ZoneGroup>, DbError> {
        self.conn
            .call(move |conn| {
                let mut groups_stmt = conn.prepare(
                    r#"
                    SELECT id, zone_type, sensor_based
                    FROM activity_zones
                    WHERE activity_id = ?1
                    ORDER BY id
                    "#,
                )?;
                let mut buckets_stmt = conn.prepare(
                    r#"
                    SELECT bucket_index, range_min, range_max, measure_secs
                    FROM zone_buckets
                    WHERE zone_id = ?1
                    ORDER BY bucket_index
                    "#,
                )?;

                let rows = groups_stmt
                    .query_map([id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, bool>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut groups = Vec::with_capacity(rows.len());
                for (zone_id, zone_type, sensor_based) in rows {
                    let buckets = buckets_stmt
                        .query_map([zone_id], |row| {
                            Ok(ZoneBucket {
                                index: row.get(0)?,
                                range_min: row.get(1)?,
                                range_max: row.get(2)?,
                                measure_secs: row.get(3)?,
                            })
                        })?
                        .collect::<Result<Vec<_>, _>>()?;

                    groups.push(ZoneGroup {
                        zone_type,
                        sensor_based,
                        buckets,
                    });
                }

                Ok(groups)
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Auth operations
    // =========================================================================

    async fn load_auth(&self) -> Result<Option<AuthRecord>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT client_id, client_secret, access_token, refresh_token, expires_at
                    FROM auth_config
                    WHERE id = 1
                    "#,
                )?;

                let result = stmt
                    .query_row([], |row| {
                        let access_token: Option<String> = row.get(2)?;
                        let refresh_token: Option<String> = row.get(3)?;
                        let expires_at: Option<i64> = row.get(4)?;

                        let tokens = match (access_token, refresh_token) {
                            (Some(access_token), Some(refresh_token)) => Some(StoredTokens {
                                access_token,
                                refresh_token,
                                expires_at: expires_at.unwrap_or(0),
                            }),
                            _ => None,
                        };

                        Ok(AuthRecord {
                            client: ClientCredentials {
                                client_id: row.get(0)?,
                                client_secret: row.get(1)?,
                            },
                            tokens,
                        })
                    })
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn save_client_config(&self, client: &ClientCredentials) -> Result<(), DbError> {
        let client_id = client.client_id.clone();
        let client_secret = client.client_secret.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO auth_config (id, client_id, client_secret, updated_at)
                    VALUES (1, ?1, ?2, CURRENT_TIMESTAMP)
                    ON CONFLICT(id) DO UPDATE SET
                        client_id = excluded.client_id,
                        client_secret = excluded.client_secret,
                        updated_at = CURRENT_TIMESTAMP
                    "#,
                    rusqlite::params![client_id, client_secret],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn save_tokens(&self, tokens: &StoredTokens) -> Result<(), DbError> {
        let access_token = tokens.access_token.clone();
        let refresh_token = tokens.refresh_token.clone();
        let expires_at = tokens.expires_at;

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE auth_config
                    SET access_token = ?1, refresh_token = ?2, expires_at = ?3,
                        updated_at = CURRENT_TIMESTAMP
                    WHERE id = 1
                    "#,
                    rusqlite::params![access_token, refresh_token, expires_at],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn delete_auth(&self) -> Result<(), DbError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM auth_config", [])?;
                Ok(())
            })
            .await?;

        Ok(())
    }
}

impl SqliteDatabase {
    async fn count(&self, sql: &'static str) -> Result<u64, DbError> {
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(count.max(0) as u64)
            })
            .await
            .map_err(Into::into)
    }

    async fn start_date_bound(&self, sql: &'static str) -> Result<Option<DateTime<Utc>>, DbError> {
        self.conn
            .call(move |conn| {
                let value: Option<String> = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(parse_datetime(value))
            })
            .await
            .map_err(Into::into)
    }
}

fn activity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityRecord> {
    Ok(ActivityRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        distance: row.get(2)?,
        moving_time: row.get(3)?,
        elapsed_time: row.get(4)?,
        total_elevation_gain: row.get(5)?,
        activity_type: row.get(6)?,
        sport_type: row.get(7)?,
        start_date: parse_datetime(row.get(8)?),
        start_date_local: parse_datetime(row.get(9)?),
        timezone: row.get(10)?,
        average_speed: row.get(11)?,
        max_speed: row.get(12)?,
        average_cadence: row.get(13)?,
        average_heartrate: row.get(14)?,
        max_heartrate: row.get(15)?,
        calories: row.get(16)?,
    })
}

/// Map busy/locked SQLite failures to `DbError::Locked`
fn lock_error(err: tokio_rusqlite::Error) -> DbError {
    match err {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, msg))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            DbError::Locked(msg.unwrap_or_else(|| e.to_string()))
        }
        other => DbError::Connection(other),
    }
}

/// Stored start dates sort lexically, so always write whole seconds in UTC
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn heartrate(buckets: &[i64]) -> ZoneGroup {
        ZoneGroup {
            zone_type: "heartrate".to_string(),
            sensor_based: true,
            buckets: buckets
                .iter()
                .enumerate()
                .map(|(i, secs)| ZoneBucket {
                    index: i as i64 + 1,
                    range_min: i as i64 * 20,
                    range_max: i as i64 * 20 + 20,
                    measure_secs: *secs,
                })
                .collect(),
        }
    }

    fn power(buckets: &[i64]) -> ZoneGroup {
        ZoneGroup {
            zone_type: "power".to_string(),
            sensor_based: false,
            ..heartrate(buckets)
        }
    }

    // Test 1: Create in-memory database
    #[tokio::test]
    async fn test_create_in_memory_database() {
        let db = SqliteDatabase::in_memory().await;
        assert!(db.is_ok());
    }

    // Test 2: Upsert and retrieve an activity with absent fields
    #[tokio::test]
    async fn test_upsert_and_get_activity() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        let mut record = ActivityRecord::new(1001, "Lunch Ride").with_start_date(at(1, 12));
        record.distance = Some(25_000.5);
        record.moving_time = Some(3600);
        record.activity_type = Some("Ride".to_string());

        db.upsert_activity(&record).await.unwrap();

        let stored = db.get_activity(1001).await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert!(stored.average_heartrate.is_none());
        assert!(stored.calories.is_none());
    }

    // Test 3: Unknown activity returns None
    #[tokio::test]
    async fn test_get_missing_activity() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        assert!(db.get_activity(7).await.unwrap().is_none());
    }

    // Test 4: Upserting twice keeps one row with the second values
    #[tokio::test]
    async fn test_upsert_is_idempotent_and_overwrites() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        let mut first = ActivityRecord::new(5, "Easy Run").with_start_date(at(2, 7));
        first.distance = Some(5000.0);
        db.upsert_activity(&first).await.unwrap();

        let mut second = ActivityRecord::new(5, "Tempo Run").with_start_date(at(2, 7));
        second.average_heartrate = Some(162.0);
        db.upsert_activity(&second).await.unwrap();

        assert_eq!(db.count_activities().await.unwrap(), 1);

        let stored = db.get_activity(5).await.unwrap().unwrap();
        assert_eq!(stored.name, "Tempo Run");
        assert_eq!(stored.average_heartrate, Some(162.0));
        assert!(stored.distance.is_none());
    }

    // Test 5: Start date bounds
    #[tokio::test]
    async fn test_start_date_bounds() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        assert!(db.max_start_date().await.unwrap().is_none());
        assert!(db.min_start_date().await.unwrap().is_none());

        for (id, day) in [(1, 3), (2, 9), (3, 5)] {
            db.upsert_activity(&ActivityRecord::new(id, "a").with_start_date(at(day, 6)))
                .await
                .unwrap();
        }
        db.upsert_activity(&ActivityRecord::new(4, "no date"))
            .await
            .unwrap();

        assert_eq!(db.max_start_date().await.unwrap(), Some(at(9, 6)));
        assert_eq!(db.min_start_date().await.unwrap(), Some(at(3, 6)));
    }

    // Test 6: Backlog is most recent first and honors the limit
    #[tokio::test]
    async fn test_activities_without_zones_order() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        for (id, day) in [(10, 1), (11, 4), (12, 2), (13, 3)] {
            db.upsert_activity(&ActivityRecord::new(id, "a").with_start_date(at(day, 8)))
                .await
                .unwrap();
        }

        assert_eq!(
            db.activities_without_zones(3).await.unwrap(),
            vec![11, 13, 12]
        );
        assert_eq!(db.count_activities_without_zones().await.unwrap(), 4);
    }

    // Test 7: Replace zones stores groups and leaves the backlog
    #[tokio::test]
    async fn test_replace_and_read_zones() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.upsert_activity(&ActivityRecord::new(1, "Ride").with_start_date(at(1, 9)))
            .await
            .unwrap();
        db.upsert_activity(&ActivityRecord::new(2, "Run").with_start_date(at(2, 9)))
            .await
            .unwrap();

        let groups = vec![heartrate(&[60, 600, 1200]), power(&[30, 90])];
        db.replace_activity_zones(1, &groups).await.unwrap();

        assert_eq!(db.zones_for_activity(1).await.unwrap(), groups);
        assert_eq!(db.activities_without_zones(10).await.unwrap(), vec![2]);
        assert_eq!(db.count_activities_with_zones().await.unwrap(), 1);
        assert_eq!(db.count_activities_without_zones().await.unwrap(), 1);
    }

    // Test 8: Re-running enrichment replaces the bucket set
    #[tokio::test]
    async fn test_replace_zones_overwrites_previous_set() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.upsert_activity(&ActivityRecord::new(1, "Ride"))
            .await
            .unwrap();

        db.replace_activity_zones(1, &[heartrate(&[1, 2, 3, 4, 5]), power(&[9])])
            .await
            .unwrap();
        db.replace_activity_zones(1, &[heartrate(&[7, 8])])
            .await
            .unwrap();

        let stored = db.zones_for_activity(1).await.unwrap();
        assert_eq!(stored, vec![heartrate(&[7, 8])]);
    }

    // Test 9: Empty zone response still marks the activity as enriched
    #[tokio::test]
    async fn test_replace_with_no_groups() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.upsert_activity(&ActivityRecord::new(1, "Walk"))
            .await
            .unwrap();

        db.replace_activity_zones(1, &[]).await.unwrap();

        assert!(db.zones_for_activity(1).await.unwrap().is_empty());
        assert!(db.activities_without_zones(10).await.unwrap().is_empty());
    }

    // Test 10: Replace for an unknown activity fails without side effects
    #[tokio::test]
    async fn test_replace_zones_unknown_activity() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        let result = db.replace_activity_zones(404, &[heartrate(&[1])]).await;

        assert!(matches!(result, Err(DbError::NotFound)));
        assert!(db.zones_for_activity(404).await.unwrap().is_empty());
    }

    // Test 11: Re-upserting an enriched activity keeps its zones
    #[tokio::test]
    async fn test_upsert_keeps_zones() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.upsert_activity(&ActivityRecord::new(1, "Ride"))
            .await
            .unwrap();
        db.replace_activity_zones(1, &[heartrate(&[10, 20])])
            .await
            .unwrap();

        db.upsert_activity(&ActivityRecord::new(1, "Renamed Ride"))
            .await
            .unwrap();

        assert_eq!(db.zones_for_activity(1).await.unwrap().len(), 1);
        assert_eq!(db.count_activities_with_zones().await.unwrap(), 1);
    }

    // Test 12: Auth row lifecycle
    #[tokio::test]
    async fn test_auth_operations() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let tokens = StoredTokens {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: 1_700_000_000,
        };

        assert!(db.load_auth().await.unwrap().is_none());
        assert!(matches!(
            db.save_tokens(&tokens).await,
            Err(DbError::NotFound)
        ));

        let client = ClientCredentials {
            client_id: "123".to_string(),
            client_secret: "secret".to_string(),
        };
        db.save_client_config(&client).await.unwrap();

        let record = db.load_auth().await.unwrap().unwrap();
        assert_eq!(record.client, client);
        assert!(record.tokens.is_none());

        db.save_tokens(&tokens).await.unwrap();

        // Updating the client keeps the token pair
        let rotated = ClientCredentials {
            client_id: "123".to_string(),
            client_secret: "rotated".to_string(),
        };
        db.save_client_config(&rotated).await.unwrap();

        let record = db.load_auth().await.unwrap().unwrap();
        assert_eq!(record.client, rotated);
        assert_eq!(record.tokens, Some(tokens));

        db.delete_auth().await.unwrap();
        assert!(db.load_auth().await.unwrap().is_none());
    }

    // Test 13: File database applies WAL journaling
    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activities.db");

        let db = SqliteDatabase::open(&path, DEFAULT_BUSY_TIMEOUT)
            .await
            .unwrap();
        db.upsert_activity(&ActivityRecord::new(1, "Ride"))
            .await
            .unwrap();

        let mode: String = db
            .conn
            .call(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }

    // Test 14: Second instance is rejected by the lock probe
    #[tokio::test]
    async fn test_exclusive_access_rejects_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activities.db");
        let timeout = Duration::from_millis(100);

        let first = SqliteDatabase::open(&path, timeout).await.unwrap();
        first.check_exclusive_access().await.unwrap();

        match SqliteDatabase::open(&path, timeout).await {
            Err(DbError::Locked(_)) => {}
            Ok(second) => {
                let result = second.check_exclusive_access().await;
                assert!(matches!(result, Err(DbError::Locked(_))), "{result:?}");
            }
            Err(other) => panic!("expected lock error, got {other:?}"),
        }
    }

    // Test 15: Lock probe succeeds on an in-memory database
    #[tokio::test]
    async fn test_exclusive_access_in_memory() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        assert!(db.check_exclusive_access().await.is_ok());
    }

    // Test 16: Readers never observe a half-applied replacement
    #[tokio::test]
    async fn test_replace_zones_is_atomic() {
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        db.upsert_activity(&ActivityRecord::new(1, "Ride"))
            .await
            .unwrap();

        let set_a = vec![heartrate(&[1, 2, 3, 4, 5]), power(&[6, 7, 8, 9, 10])];
        let set_b = vec![heartrate(&[11, 12])];
        db.replace_activity_zones(1, &set_a).await.unwrap();

        let writer = {
            let db = Arc::clone(&db);
            let (a, b) = (set_a.clone(), set_b.clone());
            tokio::spawn(async move {
                for i in 0..50 {
                    let next = if i % 2 == 0 { &b } else { &a };
                    db.replace_activity_zones(1, next).await.unwrap();
                }
            })
        };

        for _ in 0..100 {
            let seen = db.zones_for_activity(1).await.unwrap();
            assert!(seen == set_a || seen == set_b, "partial state: {seen:?}");
        }

        writer.await.unwrap();
    }

    // Test 17: Datetime parsing accepts both stored formats
    #[test]
    fn test_parse_datetime_formats() {
        let expected = at(1, 10);

        assert_eq!(
            parse_datetime(Some("2024-05-01T10:00:00Z".to_string())),
            Some(expected)
        );
        assert_eq!(
            parse_datetime(Some("2024-05-01 10:00:00".to_string())),
            Some(expected)
        );
        assert_eq!(parse_datetime(Some("garbage".to_string())), None);
        assert_eq!(format_datetime(expected), "2024-05-01T10:00:00Z");
    }
}
