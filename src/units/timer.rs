//! Timer unit interval specification
//!
//! A timer fires every `seconds + minutes + ... + months` after its last
//! run. Months are calendar months, everything else is a fixed length.

use chrono::{DateTime, Local, Months, TimeDelta};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerSpec {
    pub seconds: u32,
    pub minutes: u32,
    pub hours: u32,
    pub days: u32,
    pub weeks: u32,
    pub months: u32,
    /// Use an alarm clock that wakes the system from suspend (WakeSystem=)
    pub wake_system: bool,
    /// Unit to run on expiry (Unit=)
    pub unit: String,
}

impl TimerSpec {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            ..Default::default()
        }
    }

    /// True if at least one interval component is positive
    pub fn has_interval(&self) -> bool {
        self.seconds > 0
            || self.minutes > 0
            || self.hours > 0
            || self.days > 0
            || self.weeks > 0
            || self.months > 0
    }

    /// Fixed-length part of the interval (everything except months)
    fn fixed_part(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.seconds))
            + TimeDelta::minutes(i64::from(self.minutes))
            + TimeDelta::hours(i64::from(self.hours))
            + TimeDelta::days(i64::from(self.days))
            + TimeDelta::weeks(i64::from(self.weeks))
    }

    /// Next fire time counted from `from`.
    ///
    /// Returns `None` if the interval is empty or the result is out of range.
    pub fn next_fire(&self, from: DateTime<Local>) -> Option<DateTime<Local>> {
        if !self.has_interval() {
            return None;
        }
        let next = from.checked_add_months(Months::new(self.months))?;
        next.checked_add_signed(self.fixed_part())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_has_interval() {
        let mut spec = TimerSpec::new("backup.unit");
        assert!(!spec.has_interval());
        spec.weeks = 1;
        assert!(spec.has_interval());
    }

    #[test]
    fn test_next_fire_seconds() {
        let mut spec = TimerSpec::new("backup.unit");
        spec.seconds = 5;
        let now = Local::now();
        let next = spec.next_fire(now).unwrap();
        assert_eq!((next - now).num_seconds(), 5);
    }

    #[test]
    fn test_next_fire_components_add_up() {
        let mut spec = TimerSpec::new("backup.unit");
        spec.seconds = 30;
        spec.minutes = 2;
        spec.hours = 1;
        spec.days = 1;
        let now = Local::now();
        let next = spec.next_fire(now).unwrap();
        assert_eq!((next - now).num_seconds(), 30 + 120 + 3600 + 86400);
    }

    #[test]
    fn test_next_fire_months_are_calendar_months() {
        let mut spec = TimerSpec::new("backup.unit");
        spec.months = 1;
        let from = Local.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let next = spec.next_fire(from).unwrap();
        // Clamped to the last day of February
        assert_eq!(next.month(), 2);
        assert_eq!(next.day(), 29);
        assert_eq!(next.hour(), 12);
    }

    #[test]
    fn test_next_fire_empty_interval() {
        let spec = TimerSpec::new("backup.unit");
        assert!(spec.next_fire(Local::now()).is_none());
    }
}
