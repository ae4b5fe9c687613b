//! Wall clock and timezone source for `time` and `tzone` replies.

use chrono::{Local, NaiveDateTime};

/// Date format of the `time` event.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Time-of-day format of the `time` event.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Source of the guest's local time.
pub trait Clock: Send + Sync {
    /// Current local date and time.
    fn now(&self) -> NaiveDateTime;

    /// Timezone name or UTC offset.
    fn timezone(&self) -> String;
}

/// Clock reading the OS local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn timezone(&self) -> String {
        Local::now().offset().to_string()
    }
}

/// Splits a timestamp into the `time` event's date and time tokens.
#[must_use]
pub fn format_time(now: &NaiveDateTime) -> (String, String) {
    (
        now.format(DATE_FORMAT).to_string(),
        now.format(TIME_FORMAT).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;

    #[test]
    fn test_format_time() {
        let now = NaiveDate::from_ymd_opt(2026, 10, 18)
            .and_then(|date| date.and_hms_opt(9, 5, 3))
            .expect("valid timestamp");
        assert_eq!(
            format_time(&now),
            ("2026-10-18".to_string(), "09:05:03".to_string())
        );
    }

    #[test]
    fn test_local_clock_offset() {
        let zone = LocalClock.timezone();
        assert!(zone.starts_with('+') || zone.starts_with('-'));
    }
}
