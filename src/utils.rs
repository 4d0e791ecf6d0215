use chrono::{Datelike, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a serde-backed enum into its string name (e.g. snake_case).
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}

/// Inverse of [`serde_enum_name`].
pub fn parse_serde_enum<T: DeserializeOwned>(name: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
}

/// Random alphanumeric string from the thread-local CSPRNG.
pub fn random_alphanumeric(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Days of the week as a 7-bit mask, bit 0 = Monday.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct DaySet(u8);

impl DaySet {
    pub fn from_bits(bits: i16) -> Self {
        DaySet((bits & 0x7f) as u8)
    }

    pub fn bits(&self) -> i16 {
        self.0 as i16
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        (0..7u8)
            .filter_map(|n| Weekday::try_from(n).ok())
            .filter(|d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for DaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = DaySet::default();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

/// Half-open time-of-day range `[start, end)`. When `end` is not after
/// `start` the range runs through midnight.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        TimeWindow { start, end }
    }

    /// `[center - radius, center + radius)`.
    pub fn around(center: NaiveTime, radius: TimeDelta) -> Self {
        // NaiveTime arithmetic wraps at midnight
        TimeWindow {
            start: center - radius,
            end: center + radius,
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// Weekday of the `anchor` occurrence that `at` belongs to. In a window
    /// that runs through midnight, times on the far side of midnight from
    /// `anchor` count towards the anchor's day.
    pub fn anchor_day(&self, anchor: NaiveTime, at: NaiveDateTime) -> Weekday {
        let day = at.weekday();
        if self.start < self.end {
            return day;
        }
        let late = at.time() >= self.start;
        let anchor_late = anchor >= self.start;
        match (late, anchor_late) {
            (true, false) => day.succ(),
            (false, true) => day.pred(),
            _ => day,
        }
    }
}

/// True when `at` is inside `window` and the `anchor` occurrence it belongs
/// to falls on one of `days`.
pub fn scheduled_at(days: DaySet, window: &TimeWindow, anchor: NaiveTime, at: NaiveDateTime) -> bool {
    window.contains(at.time()) && days.contains(window.anchor_day(anchor, at))
}
