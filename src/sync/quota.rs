//! Dual-window request quota tracking
//!
//! The upstream API enforces a short 15-minute window and a daily window.
//! Every response carries `limit` and `usage` headers as `short,daily` pairs,
//! once for the general quota (`X-RateLimit-*`) and once for the stricter read
//! quota (`X-ReadRateLimit-*`). The tracker keeps the most recent observation
//! and derives wait recommendations from it.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use reqwest::header::HeaderMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::QuotaConfig;

pub const RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const RATE_LIMIT_USAGE: &str = "X-RateLimit-Usage";
pub const READ_RATE_LIMIT_LIMIT: &str = "X-ReadRateLimit-Limit";
pub const READ_RATE_LIMIT_USAGE: &str = "X-ReadRateLimit-Usage";

/// Requests kept in reserve below each limit
pub const DEFAULT_BUFFER: u32 = 5;

/// Added to every computed reset so waits land past the boundary
pub const DEFAULT_RESET_MARGIN: Duration = Duration::from_secs(2);

const SHORT_WINDOW_MINUTES: u32 = 15;

/// Which quota window a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Short,
    Daily,
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Short => write!(f, "15min"),
            WindowKind::Daily => write!(f, "daily"),
        }
    }
}

/// Limit and usage for one window; a zero limit means unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub kind: WindowKind,
    pub limit: u32,
    pub usage: u32,
}

impl QuotaWindow {
    pub fn new(kind: WindowKind, limit: u32, usage: u32) -> Self {
        Self { kind, limit, usage }
    }

    fn unknown(kind: WindowKind) -> Self {
        Self::new(kind, 0, 0)
    }

    pub fn is_exceeded(&self) -> bool {
        self.limit > 0 && self.usage >= self.limit
    }

    pub fn is_approaching(&self, buffer: u32) -> bool {
        self.limit > 0 && self.usage >= self.limit.saturating_sub(buffer)
    }

    fn with_usage(self, usage: u32) -> Self {
        Self { usage, ..self }
    }
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.usage, self.limit)
    }
}

/// Windows parsed from one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedQuota {
    pub short: QuotaWindow,
    pub daily: QuotaWindow,
}

/// Parse both quota header sources into the most restrictive view
///
/// Limits take the smaller positive value of the two sources; usage takes the
/// larger. Missing or malformed values count as zero.
pub fn parse_quota_headers(headers: &HeaderMap) -> ParsedQuota {
    let (general_short_limit, general_daily_limit) = header_pair(headers, RATE_LIMIT_LIMIT);
    let (general_short_usage, general_daily_usage) = header_pair(headers, RATE_LIMIT_USAGE);
    let (read_short_limit, read_daily_limit) = header_pair(headers, READ_RATE_LIMIT_LIMIT);
    let (read_short_usage, read_daily_usage) = header_pair(headers, READ_RATE_LIMIT_USAGE);

    ParsedQuota {
        short: QuotaWindow::new(
            WindowKind::Short,
            min_positive(general_short_limit, read_short_limit),
            general_short_usage.max(read_short_usage),
        ),
        daily: QuotaWindow::new(
            WindowKind::Daily,
            min_positive(general_daily_limit, read_daily_limit),
            general_daily_usage.max(read_daily_usage),
        ),
    }
}

fn header_pair(headers: &HeaderMap, name: &str) -> (u32, u32) {
    let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
        return (0, 0);
    };

    let mut parts = value.split(',').map(|p| p.trim().parse::<u32>().unwrap_or(0));
    let short = parts.next().unwrap_or(0);
    let daily = parts.next().unwrap_or(0);
    (short, daily)
}

fn min_positive(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

/// Time until the next :00/:15/:30/:45 boundary plus `margin`
pub fn time_until_short_reset(now: DateTime<Utc>, margin: Duration) -> Duration {
    let minute = now.minute();
    let next_boundary = (minute / SHORT_WINDOW_MINUTES + 1) * SHORT_WINDOW_MINUTES;
    let minutes_until = u64::from(next_boundary - minute);

    // Leap seconds report nanos above one second
    let nanos = now.nanosecond().min(999_999_999);
    let elapsed = Duration::from_secs(u64::from(now.second())) + Duration::from_nanos(u64::from(nanos));

    Duration::from_secs(minutes_until * 60).saturating_sub(elapsed) + margin
}

/// Time until the next UTC midnight plus `margin`
pub fn time_until_daily_reset(now: DateTime<Utc>, margin: Duration) -> Duration {
    let midnight = (now.date_naive() + ChronoDuration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc());

    let until = midnight
        .and_then(|m| (m - now).to_std().ok())
        .unwrap_or(Duration::ZERO);

    until + margin
}

/// Identifies the 15-minute window a timestamp falls into
fn short_window_key(at: DateTime<Utc>) -> (i32, u32, u32, u32) {
    (
        at.year(),
        at.ordinal(),
        at.hour(),
        at.minute() / SHORT_WINDOW_MINUTES,
    )
}

/// Derived, read-only view of the quota at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub short: QuotaWindow,
    pub daily: QuotaWindow,
    pub time_until_short_reset: Duration,
    pub time_until_daily_reset: Duration,
    pub recommended_wait: Duration,
    pub is_rate_limited: bool,
    pub buffer: u32,
}

impl QuotaSnapshot {
    fn build(
        short: QuotaWindow,
        daily: QuotaWindow,
        rejected: bool,
        buffer: u32,
        margin: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let time_until_short_reset = time_until_short_reset(now, margin);
        let time_until_daily_reset = time_until_daily_reset(now, margin);

        let recommended_wait = if short.is_exceeded() {
            time_until_short_reset
        } else if daily.is_exceeded() {
            time_until_daily_reset
        } else if short.is_approaching(buffer) {
            time_until_short_reset
        } else if daily.is_approaching(buffer) {
            time_until_daily_reset
        } else {
            Duration::ZERO
        };

        Self {
            short,
            daily,
            time_until_short_reset,
            time_until_daily_reset,
            recommended_wait,
            is_rate_limited: rejected || short.is_exceeded() || daily.is_exceeded(),
            buffer,
        }
    }

    /// Snapshot with no observations, used before the first response
    pub fn unknown(now: DateTime<Utc>) -> Self {
        Self::build(
            QuotaWindow::unknown(WindowKind::Short),
            QuotaWindow::unknown(WindowKind::Daily),
            false,
            DEFAULT_BUFFER,
            DEFAULT_RESET_MARGIN,
            now,
        )
    }

    pub fn is_short_exceeded(&self) -> bool {
        self.short.is_exceeded()
    }

    pub fn is_daily_exceeded(&self) -> bool {
        self.daily.is_exceeded()
    }

    pub fn is_approaching_short(&self) -> bool {
        self.short.is_approaching(self.buffer)
    }

    pub fn is_approaching_daily(&self) -> bool {
        self.daily.is_approaching(self.buffer)
    }
}

#[derive(Debug, Clone)]
struct Observation {
    quota: ParsedQuota,
    rejected: bool,
    observed_at: DateTime<Utc>,
}

/// Shared quota state, replaced wholesale by each response
pub struct QuotaTracker {
    state: RwLock<Option<Observation>>,
    buffer: u32,
    reset_margin: Duration,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER, DEFAULT_RESET_MARGIN)
    }
}

impl QuotaTracker {
    pub fn new(buffer: u32, reset_margin: Duration) -> Self {
        Self {
            state: RwLock::new(None),
            buffer,
            reset_margin,
        }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::new(config.buffer, Duration::from_secs(config.reset_margin_secs))
    }

    /// Record the quota headers of a response
    ///
    /// `rejected` is true when the response itself was a 429.
    pub async fn update(&self, headers: &HeaderMap, rejected: bool, now: DateTime<Utc>) -> QuotaSnapshot {
        let quota = parse_quota_headers(headers);
        let observation = Observation {
            quota,
            rejected,
            observed_at: now,
        };

        *self.state.write().await = Some(observation);

        QuotaSnapshot::build(
            quota.short,
            quota.daily,
            rejected,
            self.buffer,
            self.reset_margin,
            now,
        )
    }

    /// Derive a fresh snapshot for `now`
    ///
    /// Usage observed in a window that has since rolled over reads as zero,
    /// so a stale observation never demands another full wait.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> QuotaSnapshot {
        let observation = self.state.read().await.clone();

        let Some(obs) = observation else {
            return QuotaSnapshot::build(
                QuotaWindow::unknown(WindowKind::Short),
                QuotaWindow::unknown(WindowKind::Daily),
                false,
                self.buffer,
                self.reset_margin,
                now,
            );
        };

        let same_short_window = short_window_key(obs.observed_at) == short_window_key(now);
        let same_day = obs.observed_at.date_naive() == now.date_naive();

        let short = if same_short_window {
            obs.quota.short
        } else {
            obs.quota.short.with_usage(0)
        };
        let daily = if same_day {
            obs.quota.daily
        } else {
            obs.quota.daily.with_usage(0)
        };

        QuotaSnapshot::build(
            short,
            daily,
            obs.rejected && same_short_window,
            self.buffer,
            self.reset_margin,
            now,
        )
    }

    /// Snapshot at the current wall-clock time
    pub async fn current(&self) -> QuotaSnapshot {
        self.snapshot(Utc::now()).await
    }
}
