//! Periodic window matching.
//!
//! A [`RecurrencePattern`] describes windows that repeat every hour: each
//! offset (seconds past the top of the hour) opens a window `tolerance`
//! seconds wide on either side. The scheduler and the external scoring rules
//! both use [`match_window`] on the same timestamps.
use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seconds in one hour.
pub const SECONDS_PER_HOUR: i64 = 3600;

/// A window every six minutes, two minutes either side.
pub const DEFAULT_OFFSETS: [i64; 10] = [0, 360, 720, 1080, 1440, 1800, 2160, 2520, 2880, 3240];
pub const DEFAULT_TOLERANCE: i64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("invalid offset '{token}': {reason}")]
    InvalidOffset { token: String, reason: String },

    #[error("offset {0} is outside the hour")]
    OffsetOutOfRange(i64),

    #[error("no offsets given")]
    Empty,

    #[error("tolerance {0} is negative")]
    NegativeTolerance(i64),
}

/// Offsets from the top of the hour plus a shared tolerance, all in seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub offsets: Vec<i64>,
    pub tolerance: i64,
}

impl RecurrencePattern {
    pub fn new(offsets: impl Into<Vec<i64>>, tolerance: i64) -> Self {
        Self {
            offsets: offsets.into(),
            tolerance,
        }
    }

    /// Parse a comma separated offset list (e.g. `0, 900, 1800`). Offsets
    /// must lie within the hour.
    pub fn parse_offsets(input: &str, tolerance: i64) -> Result<Self, PatternError> {
        if tolerance < 0 {
            return Err(PatternError::NegativeTolerance(tolerance));
        }
        let mut offsets = Vec::new();
        for token in input.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let offset = token
                .parse::<i64>()
                .map_err(|e| PatternError::InvalidOffset {
                    token: token.to_string(),
                    reason: e.to_string(),
                })?;
            if !(0..SECONDS_PER_HOUR).contains(&offset) {
                return Err(PatternError::OffsetOutOfRange(offset));
            }
            offsets.push(offset);
        }
        if offsets.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self::new(offsets, tolerance))
    }
}

impl Default for RecurrencePattern {
    fn default() -> Self {
        Self::new(DEFAULT_OFFSETS, DEFAULT_TOLERANCE)
    }
}

/// A matched window. Bounds are whole seconds and inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Whether `instant`, truncated to whole seconds, lies within the window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let secs = instant.timestamp();
        secs >= self.start.timestamp() && secs <= self.end.timestamp()
    }

    /// Key under which at most one submission per category and participant
    /// may be accepted for this window.
    pub fn dedup_key<C, P>(&self, category: C, participant: P) -> (i64, i64, C, P) {
        (
            self.start.timestamp(),
            self.end.timestamp(),
            category,
            participant,
        )
    }
}

/// Whether `instant` falls inside any window of `pattern`.
pub fn matches(pattern: &RecurrencePattern, instant: DateTime<Utc>) -> bool {
    match_window(pattern, instant).is_some()
}

/// Find the window of `pattern` that contains `instant`.
///
/// Offsets are tried in pattern order and the first hit wins, so when two
/// offsets have overlapping bands the earlier one is reported. That order is
/// only meaningful for an unchanged pattern.
pub fn match_window(pattern: &RecurrencePattern, instant: DateTime<Utc>) -> Option<Window> {
    let since_hour = i64::from(instant.minute()) * 60 + i64::from(instant.second());
    let hour_start = instant.timestamp() - since_hour;
    let tol = pattern.tolerance;

    for &offset in &pattern.offsets {
        let centre = if (since_hour - offset).abs() <= tol {
            hour_start + offset
        } else if (since_hour - SECONDS_PER_HOUR - offset).abs() <= tol {
            // Window straddles the top of the next hour.
            hour_start + SECONDS_PER_HOUR + offset
        } else {
            continue;
        };
        return Some(Window {
            start: at_second(centre - tol)?,
            end: at_second(centre + tol)?,
        });
    }
    None
}

fn at_second(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
