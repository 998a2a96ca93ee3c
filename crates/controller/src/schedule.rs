//! Weekly zone schedule model: weekdays, HH:MM clock times, and the
//! per-zone entry that the schedule engine evaluates each minute.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use time::macros::format_description;
use time::Weekday;

use crate::error::ControllerError;

// ---------------------------------------------------------------------------
// Weekday
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Day {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Day {
    pub fn from_weekday(w: Weekday) -> Self {
        match w {
            Weekday::Monday => Day::Mon,
            Weekday::Tuesday => Day::Tue,
            Weekday::Wednesday => Day::Wed,
            Weekday::Thursday => Day::Thu,
            Weekday::Friday => Day::Fri,
            Weekday::Saturday => Day::Sat,
            Weekday::Sunday => Day::Sun,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Day::Mon => "Mon",
            Day::Tue => "Tue",
            Day::Wed => "Wed",
            Day::Thu => "Thu",
            Day::Fri => "Fri",
            Day::Sat => "Sat",
            Day::Sun => "Sun",
        }
    }
}

/// Accepts the three-letter form ("Tue") or the full name ("tuesday"),
/// case-insensitively.
impl FromStr for Day {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let day = match lower.as_str() {
            "mon" | "monday" => Day::Mon,
            "tue" | "tuesday" => Day::Tue,
            "wed" | "wednesday" => Day::Wed,
            "thu" | "thursday" => Day::Thu,
            "fri" | "friday" => Day::Fri,
            "sat" | "saturday" => Day::Sat,
            "sun" | "sunday" => Day::Sun,
            _ => {
                return Err(ControllerError::field(
                    "days",
                    format!("unknown weekday '{s}'"),
                ))
            }
        };
        Ok(day)
    }
}

// ---------------------------------------------------------------------------
// Clock time (minute resolution)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime {
    hour: u8,
    minute: u8,
}

impl ClockTime {
    #[cfg(test)]
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn of(t: time::Time) -> Self {
        Self {
            hour: t.hour(),
            minute: t.minute(),
        }
    }

    /// Parse an optional `HH:MM` field; absent and blank both mean "no time".
    pub fn parse_field(
        field: &'static str,
        s: Option<&str>,
    ) -> Result<Option<Self>, ControllerError> {
        match s.map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => v
                .parse::<ClockTime>()
                .map(Some)
                .map_err(|e| ControllerError::field(field, e)),
        }
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        time::Time::parse(s.trim(), format_description!("[hour]:[minute]"))
            .map(Self::of)
            .map_err(|e| format!("'{s}' is not a HH:MM time ({e})"))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Zone schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub days: BTreeSet<Day>,
    #[serde(default)]
    pub on_time: Option<ClockTime>,
    #[serde(default)]
    pub off_time: Option<ClockTime>,
}

/// A schedule edge that matched the current minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    On,
    Off,
}

impl ZoneSchedule {
    /// Which edge, if any, fires at `at` on `day`. When on and off times are
    /// equal the on edge wins.
    pub fn trigger_at(&self, day: Day, at: ClockTime) -> Option<Trigger> {
        if !self.enabled || !self.days.contains(&day) {
            return None;
        }
        if self.on_time == Some(at) {
            Some(Trigger::On)
        } else if self.off_time == Some(at) {
            Some(Trigger::Off)
        } else {
            None
        }
    }
}

/// Parse the raw day names sent by the web UI or a remote client.
pub fn parse_days<S: AsRef<str>>(days: &[S]) -> Result<BTreeSet<Day>, ControllerError> {
    days.iter().map(|d| d.as_ref().parse()).collect()
}

// ===========================================================================
// Tests
// ===========================================================================
