//! Time-of-day call windows and the scheduling decisions derived
//! from them.
//!
//! A destination with no rule is callable around the clock
//! (continuous mail). A rule is a set of daily UTC windows; the
//! destination may only be dialed while one of them is open.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Error from parsing a window string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("window must be HH:MM-HH:MM, got {0:?}")]
    Format(String),
    #[error("invalid time in window {0:?}")]
    Time(String),
}

/// One daily window, `start..end` in UTC. A window whose end is not
/// after its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Whether `t` (time of day) falls inside the window.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // wraps midnight
            t >= self.start || t < self.end
        }
    }
}

impl FromStr for TimeWindow {
    type Err = WindowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| WindowParseError::Format(s.to_string()))?;
        let parse = |part: &str| {
            NaiveTime::parse_from_str(part.trim(), "%H:%M")
                .map_err(|_| WindowParseError::Time(s.to_string()))
        };
        Ok(Self {
            start: parse(start)?,
            end: parse(end)?,
        })
    }
}

impl TryFrom<String> for TimeWindow {
    type Error = WindowParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeWindow> for String {
    fn from(w: TimeWindow) -> Self {
        format!(
            "{:02}:{:02}-{:02}:{:02}",
            w.start.hour(),
            w.start.minute(),
            w.end.hour(),
            w.end.minute()
        )
    }
}

/// A destination's availability rule: the union of its windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub windows: Vec<TimeWindow>,
}

impl AvailabilityRule {
    pub fn new(windows: Vec<TimeWindow>) -> Self {
        Self { windows }
    }

    /// Whether the destination may be dialed at instant `t`.
    pub fn callable_at(&self, t: DateTime<Utc>) -> bool {
        self.windows.iter().any(|w| w.contains(t.time()))
    }

    /// Earliest instant strictly after `after` at which a window
    /// opens. `None` when the rule has no windows at all.
    pub fn next_window_start(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = after.date_naive();
        self.windows
            .iter()
            .map(|w| {
                let candidate = today.and_time(w.start).and_utc();
                if candidate > after {
                    candidate
                } else {
                    candidate + ChronoDuration::days(1)
                }
            })
            .min()
    }
}

/// The scheduler's verdict for one destination at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSchedule {
    pub callable_now: bool,
    /// When the next window opens, if the destination is deferred and
    /// the rule allows computing one.
    pub next_window_start: Option<DateTime<Utc>>,
    /// Human-readable reason, logged when a destination is deferred.
    pub reason: String,
}

/// Computes the schedule for a destination with an optional rule.
pub fn call_schedule(rule: Option<&AvailabilityRule>, now: DateTime<Utc>) -> CallSchedule {
    match rule {
        None => CallSchedule {
            callable_now: true,
            next_window_start: None,
            reason: "continuous mail".to_string(),
        },
        Some(r) if r.callable_at(now) => CallSchedule {
            callable_now: true,
            next_window_start: None,
            reason: "window open".to_string(),
        },
        Some(r) => {
            let next = r.next_window_start(now);
            let reason = match next {
                Some(at) => format!("window closed until {}", at.format("%H:%M UTC")),
                None => "no call windows defined".to_string(),
            };
            CallSchedule {
                callable_now: false,
                next_window_start: next,
                reason,
            }
        }
    }
}
