//! Time-of-day windows written as "HH:MM". A window whose start is later than
//! its end spans midnight (e.g. 22:00 to 06:00).

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

const MINUTES_PER_DAY: u16 = 24 * 60;

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// Wall-clock time with minute resolution, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    pub fn new(hour: u16, minute: u16) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self {
                minutes: hour * 60 + minute,
            })
        } else {
            None
        }
    }

    pub fn from_time(t: NaiveTime) -> Self {
        Self {
            minutes: (t.hour() * 60 + t.minute()) as u16,
        }
    }

    pub fn minutes(self) -> u16 {
        self.minutes
    }
}

impl FromStr for TimeOfDay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .with_context(|| format!("expected HH:MM, got '{s}'"))?;
        let hour: u16 = h.parse().with_context(|| format!("bad hour in '{s}'"))?;
        let minute: u16 = m.parse().with_context(|| format!("bad minute in '{s}'"))?;
        match Self::new(hour, minute) {
            Some(t) => Ok(t),
            None => bail!("time '{s}' out of range"),
        }
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Inclusive window between two times of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    pub fn spans_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        let now = TimeOfDay::from_time(now).minutes();
        let (start, end) = (self.start.minutes(), self.end.minutes());
        debug_assert!(start < MINUTES_PER_DAY && end < MINUTES_PER_DAY);

        if start <= end {
            start <= now && now <= end
        } else {
            now >= start || now <= end
        }
    }

    /// True once the window has closed for the current day. Only meaningful
    /// for windows that do not span midnight.
    pub fn has_closed(&self, now: NaiveTime) -> bool {
        !self.spans_midnight() && TimeOfDay::from_time(now).minutes() > self.end.minutes()
    }
}

/// Gate used by rules, whose bounds come from user-edited JSON. A missing or
/// empty bound leaves the rule unrestricted; an unparsable bound keeps it
/// closed.
pub fn in_window(now: NaiveTime, start: Option<&str>, end: Option<&str>) -> bool {
    let (start, end) = match (start.map(str::trim), end.map(str::trim)) {
        (Some(s), Some(e)) if !s.is_empty() && !e.is_empty() => (s, e),
        _ => return true,
    };

    match (start.parse::<TimeOfDay>(), end.parse::<TimeOfDay>()) {
        (Ok(s), Ok(e)) => TimeWindow::new(s, e).contains(now),
        _ => {
            tracing::warn!(start, end, "unparsable time window, treating as closed");
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
