//! Activity zone models
//!
//! The zones endpoint returns one group per measure (heart rate, power), each
//! with an ordered list of distribution buckets.

use serde::{Deserialize, Serialize};

/// Zone group as returned by `GET /activities/{id}/zones`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityZone {
    /// "heartrate" or "power"
    #[serde(rename = "type")]
    pub zone_type: String,

    #[serde(default)]
    pub sensor_based: bool,

    #[serde(default)]
    pub distribution_buckets: Vec<TimedZoneRange>,
}

/// Time spent within one zone range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedZoneRange {
    pub min: i64,
    pub max: i64,

    /// Seconds, reported as a float
    pub time: f64,
}

/// Zone group in its stored shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneGroup {
    pub zone_type: String,
    pub sensor_based: bool,
    pub buckets: Vec<ZoneBucket>,
}

/// One stored bucket; `index` is 1-based and follows the API order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneBucket {
    pub index: i64,
    pub range_min: i64,
    pub range_max: i64,
    pub measure_secs: i64,
}

impl From<&ActivityZone> for ZoneGroup {
    fn from(zone: &ActivityZone) -> Self {
        let buckets = zone
            .distribution_buckets
            .iter()
            .enumerate()
            .map(|(i, range)| ZoneBucket {
                index: i as i64 + 1,
                range_min: range.min,
                range_max: range.max,
                // Fractional seconds are truncated
                measure_secs: range.time as i64,
            })
            .collect();

        Self {
            zone_type: zone.zone_type.clone(),
            sensor_based: zone.sensor_based,
            buckets,
        }
    }
}

/// Normalize an API response into stored groups
pub fn normalize_zones(zones: &[ActivityZone]) -> Vec<ZoneGroup> {
    zones.iter().map(ZoneGroup::from).collect()
}
