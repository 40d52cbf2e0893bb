//! Calendar-aligned period buckets.
//!
//! Buckets are derived from a clock and never stored mutably. The bucket key
//! doubles as the hot-store key segment, so it must stay stable and free of
//! the `:` separator.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bucket width for counting and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "hourly" => Granularity::Hourly,
            "monthly" => Granularity::Monthly,
            _ => Granularity::Daily,
        }
    }

    /// Coarseness order: hourly < daily < monthly.
    pub fn rank(&self) -> u8 {
        match self {
            Granularity::Hourly => 0,
            Granularity::Daily => 1,
            Granularity::Monthly => 2,
        }
    }

    /// Hot-store key TTL: bucket duration plus slack, so stale buckets
    /// self-expire after they can no longer be written.
    pub fn counter_ttl(&self) -> Duration {
        match self {
            Granularity::Hourly => Duration::from_secs(2 * 3600),
            Granularity::Daily => Duration::from_secs(25 * 3600),
            Granularity::Monthly => Duration::from_secs(32 * 24 * 3600),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar-aligned time window: UTC hour truncation, UTC midnight, or
/// month start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: Granularity,
}

impl PeriodBucket {
    /// The bucket containing `at`.
    pub fn containing(at: DateTime<Utc>, granularity: Granularity) -> Self {
        let (start, end) = match granularity {
            Granularity::Hourly => {
                let start = Utc
                    .with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), 0, 0)
                    .single()
                    .expect("valid UTC hour");
                (start, start + chrono::Duration::hours(1))
            }
            Granularity::Daily => {
                let start = Utc
                    .with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
                    .single()
                    .expect("valid UTC day");
                (start, start + chrono::Duration::days(1))
            }
            Granularity::Monthly => {
                let start = Utc
                    .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
                    .single()
                    .expect("valid UTC month");
                let (next_y, next_m) = if at.month() == 12 {
                    (at.year() + 1, 1)
                } else {
                    (at.year(), at.month() + 1)
                };
                let end = Utc
                    .with_ymd_and_hms(next_y, next_m, 1, 0, 0, 0)
                    .single()
                    .expect("valid UTC month");
                (start, end)
            }
        };
        Self {
            start,
            end,
            granularity,
        }
    }

    /// Stable key segment: `2024-03-15T13`, `2024-03-15`, or `2024-03`.
    pub fn key(&self) -> String {
        match self.granularity {
            Granularity::Hourly => self.start.format("%Y-%m-%dT%H").to_string(),
            Granularity::Daily => self.start.format("%Y-%m-%d").to_string(),
            Granularity::Monthly => self.start.format("%Y-%m").to_string(),
        }
    }

    /// Inverse of [`PeriodBucket::key`]. Used by the flush scheduler to map
    /// scanned hot-store keys back to buckets.
    pub fn parse_key(key: &str) -> Option<Self> {
        if key.contains('T') {
            let naive = NaiveDateTime::parse_from_str(&format!("{key}:00:00"), "%Y-%m-%dT%H:%M:%S")
                .ok()?;
            Some(Self::containing(
                Utc.from_utc_datetime(&naive),
                Granularity::Hourly,
            ))
        } else if key.len() == 10 {
            let date = NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()?;
            let naive = date.and_hms_opt(0, 0, 0)?;
            Some(Self::containing(
                Utc.from_utc_datetime(&naive),
                Granularity::Daily,
            ))
        } else {
            let date = NaiveDate::parse_from_str(&format!("{key}-01"), "%Y-%m-%d").ok()?;
            let naive = date.and_hms_opt(0, 0, 0)?;
            Some(Self::containing(
                Utc.from_utc_datetime(&naive),
                Granularity::Monthly,
            ))
        }
    }
}
