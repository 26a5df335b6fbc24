//! Preferences and the location-sharing policy.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{NaiveTime, Timelike, Weekday};

use crate::event::{EngineHandle, Event};

pub const PREF_EXCHANGE_FILES_WIFI_ONLY: &str = "exchange-files-wifi-only";
pub const PREF_AUTOMATIC_LOCATION_SHARING: &str = "automatic-location-sharing";
pub const PREF_LIMIT_LOCATION_SHARING_TIME: &str = "limit-location-sharing-time";
pub const PREF_LIMIT_LOCATION_SHARING_TIME_NOT_BEFORE: &str =
    "limit-location-sharing-time-not-before";
pub const PREF_LIMIT_LOCATION_SHARING_TIME_NOT_AFTER: &str =
    "limit-location-sharing-time-not-after";
pub const PREF_LIMIT_LOCATION_SHARING_DAY: &str = "limit-location-sharing-day";

/// Read-only preference view. Absent booleans read as false; absent strings
/// and sets as empty.
pub trait Preferences: Send + Sync {
    fn get_bool(&self, key: &str) -> bool;
    fn get_string(&self, key: &str) -> Option<String>;
    fn get_string_set(&self, key: &str) -> HashSet<String>;
}

#[derive(Clone)]
enum PrefValue {
    Bool(bool),
    Text(String),
    Set(HashSet<String>),
}

/// In-memory preferences that post [`Event::PreferenceChanged`] on every
/// write once bound to an engine.
#[derive(Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, PrefValue>>,
    sink: RwLock<Option<EngineHandle>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route subsequent change notifications to `handle`.
    pub fn bind(&self, handle: EngineHandle) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn put(&self, key: &str, value: PrefValue) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        if let Some(handle) = &*self.sink.read().unwrap_or_else(|e| e.into_inner()) {
            handle.post(Event::PreferenceChanged {
                key: key.to_string(),
            });
        }
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.put(key, PrefValue::Bool(value));
    }

    pub fn set_string(&self, key: &str, value: impl Into<String>) {
        self.put(key, PrefValue::Text(value.into()));
    }

    pub fn set_string_set(&self, key: &str, value: impl IntoIterator<Item = String>) {
        self.put(key, PrefValue::Set(value.into_iter().collect()));
    }
}

impl Preferences for MemoryPreferences {
    fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.values
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(key),
            Some(PrefValue::Bool(true))
        )
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            Some(PrefValue::Text(text)) => Some(text.clone()),
            _ => None,
        }
    }

    fn get_string_set(&self, key: &str) -> HashSet<String> {
        match self
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            Some(PrefValue::Set(set)) => set.clone(),
            _ => HashSet::new(),
        }
    }
}

fn parse_hh_mm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// The time-of-day location-sharing policy, evaluated at a given local
/// weekday and time.
///
/// Sharing is allowed iff automatic sharing is on, the time window (when
/// limited) contains the current minute with inclusive boundaries, and the
/// weekday is in the allowed set. Unparseable window bounds disable sharing
/// rather than opening it.
pub fn sharing_allowed_at(prefs: &dyn Preferences, weekday: Weekday, time: NaiveTime) -> bool {
    if !prefs.get_bool(PREF_AUTOMATIC_LOCATION_SHARING) {
        return false;
    }

    if prefs.get_bool(PREF_LIMIT_LOCATION_SHARING_TIME) {
        let not_before = prefs
            .get_string(PREF_LIMIT_LOCATION_SHARING_TIME_NOT_BEFORE)
            .as_deref()
            .and_then(parse_hh_mm);
        let not_after = prefs
            .get_string(PREF_LIMIT_LOCATION_SHARING_TIME_NOT_AFTER)
            .as_deref()
            .and_then(parse_hh_mm);
        let (Some(not_before), Some(not_after)) = (not_before, not_after) else {
            return false;
        };
        // Minute resolution: seconds within the boundary minute count as in.
        let minute = time.with_second(0).and_then(|t| t.with_nanosecond(0));
        let Some(minute) = minute else { return false };
        if minute < not_before || minute > not_after {
            return false;
        }
    }

    prefs
        .get_string_set(PREF_LIMIT_LOCATION_SHARING_DAY)
        .contains(weekday_name(weekday))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn sharing_prefs() -> MemoryPreferences {
        let prefs = MemoryPreferences::new();
        prefs.set_bool(PREF_AUTOMATIC_LOCATION_SHARING, true);
        prefs.set_bool(PREF_LIMIT_LOCATION_SHARING_TIME, true);
        prefs.set_string(PREF_LIMIT_LOCATION_SHARING_TIME_NOT_BEFORE, "09:00");
        prefs.set_string(PREF_LIMIT_LOCATION_SHARING_TIME_NOT_AFTER, "17:00");
        prefs.set_string_set(
            PREF_LIMIT_LOCATION_SHARING_DAY,
            ["Monday".to_string(), "Tuesday".to_string()],
        );
        prefs
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn off_switch_wins_over_everything() {
        let prefs = sharing_prefs();
        prefs.set_bool(PREF_AUTOMATIC_LOCATION_SHARING, false);
        assert!(!sharing_allowed_at(&prefs, Weekday::Mon, at(12, 0)));
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let prefs = sharing_prefs();
        assert!(!sharing_allowed_at(&prefs, Weekday::Mon, at(8, 59)));
        assert!(sharing_allowed_at(&prefs, Weekday::Mon, at(9, 0)));
        assert!(sharing_allowed_at(&prefs, Weekday::Mon, at(17, 0)));
        assert!(!sharing_allowed_at(&prefs, Weekday::Mon, at(17, 1)));
    }

    #[test]
    fn boundary_minute_includes_seconds() {
        let prefs = sharing_prefs();
        let time = NaiveTime::from_hms_opt(17, 0, 59).unwrap();
        assert!(sharing_allowed_at(&prefs, Weekday::Mon, time));
        assert_eq!(time.second(), 59);
    }

    #[test]
    fn weekday_gate_applies() {
        let prefs = sharing_prefs();
        assert!(sharing_allowed_at(&prefs, Weekday::Tue, at(12, 0)));
        assert!(!sharing_allowed_at(&prefs, Weekday::Wed, at(12, 0)));
    }

    #[test]
    fn window_off_still_requires_weekday() {
        let prefs = sharing_prefs();
        prefs.set_bool(PREF_LIMIT_LOCATION_SHARING_TIME, false);
        assert!(sharing_allowed_at(&prefs, Weekday::Mon, at(3, 0)));
        assert!(!sharing_allowed_at(&prefs, Weekday::Sun, at(12, 0)));
    }

    #[test]
    fn unparseable_bounds_fail_closed() {
        let prefs = sharing_prefs();
        prefs.set_string(PREF_LIMIT_LOCATION_SHARING_TIME_NOT_BEFORE, "morning");
        assert!(!sharing_allowed_at(&prefs, Weekday::Mon, at(12, 0)));
    }

    #[test]
    fn absent_bool_reads_false() {
        let prefs = MemoryPreferences::new();
        assert!(!prefs.get_bool(PREF_EXCHANGE_FILES_WIFI_ONLY));
    }
}
