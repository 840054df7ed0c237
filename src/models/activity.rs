//! Activity models
//!
//! `ActivitySummary` mirrors the list endpoint payload. `ActivityRecord` is the
//! persisted shape, with every optional field carried as `Option`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity as returned by `GET /athlete/activities`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub id: i64,

    #[serde(default)]
    pub name: String,

    /// Meters
    #[serde(default)]
    pub distance: f64,

    /// Seconds
    #[serde(default)]
    pub moving_time: i64,

    /// Seconds
    #[serde(default)]
    pub elapsed_time: i64,

    #[serde(default)]
    pub total_elevation_gain: f64,

    #[serde(rename = "type", default)]
    pub activity_type: String,

    #[serde(default)]
    pub sport_type: String,

    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub start_date_local: Option<DateTime<Utc>>,

    #[serde(default)]
    pub timezone: String,

    #[serde(default)]
    pub average_speed: f64,

    #[serde(default)]
    pub max_speed: f64,

    #[serde(default)]
    pub average_cadence: f64,

    #[serde(default)]
    pub average_heartrate: f64,

    #[serde(default)]
    pub max_heartrate: f64,

    #[serde(default)]
    pub kilojoules: f64,
}

/// Activity row as stored locally
///
/// The source reports missing measurements as zero or empty strings, so a
/// zero value is stored as NULL. A genuine zero (a stationary activity with
/// 0 m distance) is indistinguishable from "not recorded".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: i64,
    pub name: String,
    pub distance: Option<f64>,
    pub moving_time: Option<i64>,
    pub elapsed_time: Option<i64>,
    pub total_elevation_gain: Option<f64>,
    pub activity_type: Option<String>,
    pub sport_type: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub start_date_local: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub average_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub average_cadence: Option<f64>,
    pub average_heartrate: Option<f64>,
    pub max_heartrate: Option<f64>,
    pub calories: Option<f64>,
}

impl ActivityRecord {
    /// Create a record with only identity and name set
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            distance: None,
            moving_time: None,
            elapsed_time: None,
            total_elevation_gain: None,
            activity_type: None,
            sport_type: None,
            start_date: None,
            start_date_local: None,
            timezone: None,
            average_speed: None,
            max_speed: None,
            average_cadence: None,
            average_heartrate: None,
            max_heartrate: None,
            calories: None,
        }
    }

    /// Set the start date
    pub fn with_start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self
    }
}

impl From<&ActivitySummary> for ActivityRecord {
    fn from(a: &ActivitySummary) -> Self {
        Self {
            id: a.id,
            name: a.name.clone(),
            distance: non_zero_f64(a.distance),
            moving_time: non_zero_i64(a.moving_time),
            elapsed_time: non_zero_i64(a.elapsed_time),
            total_elevation_gain: non_zero_f64(a.total_elevation_gain),
            activity_type: non_empty(&a.activity_type),
            sport_type: non_empty(&a.sport_type),
            start_date: a.start_date,
            start_date_local: a.start_date_local,
            timezone: non_empty(&a.timezone),
            average_speed: non_zero_f64(a.average_speed),
            max_speed: non_zero_f64(a.max_speed),
            average_cadence: non_zero_f64(a.average_cadence),
            average_heartrate: non_zero_f64(a.average_heartrate),
            max_heartrate: non_zero_f64(a.max_heartrate),
            calories: non_zero_f64(a.kilojoules),
        }
    }
}

fn non_zero_f64(v: f64) -> Option<f64> {
    (v != 0.0).then_some(v)
}

fn non_zero_i64(v: i64) -> Option<i64> {
    (v != 0).then_some(v)
}

fn non_empty(v: &str) -> Option<String> {
    (!v.is_empty()).then(|| v.to_string())
}
