//! Lap-time codec
//!
//! Timing feeds report lap times as free-form strings (`1:24.823`, `58.4`,
//! `--:--`). [`LapTime`] is the parsed form, stored as whole milliseconds so
//! statistics never accumulate float error. [`is_placeholder`] separates the
//! "no measurement yet" sentinels from real readings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{KartwallError, Result};

/// Characters that mark a value as a placeholder wherever they appear.
pub const PLACEHOLDER_GLYPHS: [char; 2] = ['-', '\u{2014}'];

/// Literal markers feeds send instead of a time (compared case-insensitively).
const NO_TIME_MARKERS: &[&str] = &["--:--", "--:--.---", "-", "--", "nt", "no time"];

/// True for blank values and the literal no-time markers.
///
/// Used by snapshot merging, where a field like a gap of `-0.3` is a real
/// value and must not be mistaken for a placeholder.
pub fn is_no_time_marker(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || NO_TIME_MARKERS.iter().any(|marker| trimmed.eq_ignore_ascii_case(marker))
}

/// True when a lap-time string carries no measurement.
pub fn is_placeholder(value: &str) -> bool {
    is_no_time_marker(value) || value.contains(PLACEHOLDER_GLYPHS)
}

/// A parsed, strictly positive lap duration in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LapTime(u64);

impl LapTime {
    /// Build from milliseconds. Zero is not a lap.
    pub fn from_millis(millis: u64) -> Option<Self> {
        (millis > 0).then_some(Self(millis))
    }

    /// Parse `m:ss.fff`, `h:mm:ss.fff` or `ss.fff`.
    ///
    /// The fractional part may have one to three digits and a comma is
    /// accepted as decimal separator.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || KartwallError::InvalidLapTime { input: input.to_string() };

        let trimmed = input.trim();
        if is_placeholder(trimmed) {
            return Err(invalid());
        }

        let normalized = trimmed.replace(',', ".");
        let (whole, fraction) = normalized.split_once('.').unwrap_or((normalized.as_str(), ""));

        if fraction.len() > 3 || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let fraction_ms =
            if fraction.is_empty() { 0 } else { format!("{fraction:0<3}").parse::<u64>().map_err(|_| invalid())? };

        let parts: Vec<&str> = whole.split(':').collect();
        if parts.len() > 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
            return Err(invalid());
        }
        let numbers = parts.iter().map(|p| p.parse::<u64>().map_err(|_| invalid())).collect::<Result<Vec<_>>>()?;

        let (hours, minutes, seconds) = match numbers.as_slice() {
            [s] => (0, 0, *s),
            [m, s] => (0, *m, *s),
            [h, m, s] => (*h, *m, *s),
            _ => return Err(invalid()),
        };
        if numbers.len() > 1 && seconds >= 60 {
            return Err(invalid());
        }
        if numbers.len() == 3 && minutes >= 60 {
            return Err(invalid());
        }

        let total = ((hours * 60 + minutes) * 60 + seconds) * 1000 + fraction_ms;
        Self::from_millis(total).ok_or_else(invalid)
    }

    /// Milliseconds in this lap.
    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Canonical `m:ss.mmm` rendering.
    pub fn format(self) -> String {
        let minutes = self.0 / 60_000;
        let seconds = (self.0 % 60_000) / 1000;
        let millis = self.0 % 1000;
        format!("{minutes}:{seconds:02}.{millis:03}")
    }

    /// Mean of a set of laps, rounded to the nearest millisecond.
    pub fn mean(laps: &[LapTime]) -> Option<LapTime> {
        if laps.is_empty() {
            return None;
        }
        let count = laps.len() as u64;
        let total: u64 = laps.iter().map(|lap| lap.0).sum();
        Self::from_millis((total + count / 2) / count)
    }
}

impl fmt::Display for LapTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for LapTime {
    type Err = KartwallError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
