//! Trailing time windows used for admission decisions

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// A trailing interval over which request counts are summed.
///
/// `Month` is a sliding 30-day window rather than a calendar month, so the
/// budget never resets all at once at midnight on the 1st.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
    Month,
}

impl Window {
    /// All windows, shortest first.
    pub const ALL: [Window; 4] = [Window::Minute, Window::Hour, Window::Day, Window::Month];

    pub fn duration(&self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(60 * 60),
            Window::Day => Duration::from_secs(24 * 60 * 60),
            Window::Month => Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    pub fn as_millis(&self) -> u64 {
        common::time::millis(self.duration())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
            Window::Month => "month",
        }
    }

    /// Start of the window ending at `now` (exclusive lower bound).
    pub fn since(&self, now: u64) -> u64 {
        now.saturating_sub(self.as_millis())
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
