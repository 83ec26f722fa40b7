//! Local wall-clock rendering for log lines.

use alloc::string::String;
use core::fmt::Write as _;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CivilTime {
    pub year: i64,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 0 = Sunday.
    pub weekday: u8,
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u8, u8) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn days_from_civil(year: i64, month: u8, day: u8) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year.rem_euclid(400);
    let month = i64::from(month);
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

pub fn civil_time(unix_seconds: i64) -> CivilTime {
    let days = unix_seconds.div_euclid(SECONDS_PER_DAY);
    let secs = unix_seconds.rem_euclid(SECONDS_PER_DAY);
    let (year, month, day) = civil_from_days(days);
    CivilTime {
        year,
        month,
        day,
        hour: (secs / 3_600) as u8,
        minute: (secs % 3_600 / 60) as u8,
        second: (secs % 60) as u8,
        // 1970-01-01 was a Thursday.
        weekday: (days + 4).rem_euclid(7) as u8,
    }
}

/// UTC second at which the last Sunday of `month` reaches 01:00 UTC.
fn last_sunday_0100_utc(year: i64, month: u8) -> i64 {
    let last_day = match month {
        3 | 10 => 31,
        _ => 30,
    };
    let days = days_from_civil(year, month, last_day);
    let weekday = (days + 4).rem_euclid(7);
    (days - weekday) * SECONDS_PER_DAY + 3_600
}

/// EU summer time: last Sunday of March to last Sunday of October, both at
/// 01:00 UTC.
pub fn is_eu_summer_time(utc_seconds: i64) -> bool {
    let year = civil_time(utc_seconds).year;
    let start = last_sunday_0100_utc(year, 3);
    let end = last_sunday_0100_utc(year, 10);
    (start..end).contains(&utc_seconds)
}

/// Renders `[Mon DD HH:MM:SS]` in local time.
pub fn local_time_string(utc_seconds: u64, tz_offset_min: i32) -> String {
    let utc = i64::try_from(utc_seconds).unwrap_or(i64::MAX / 2);
    let mut local = utc + i64::from(tz_offset_min) * 60;
    if is_eu_summer_time(utc) {
        local += 3_600;
    }
    let time = civil_time(local);
    let mut out = String::with_capacity(17);
    let _ = write!(
        out,
        "[{} {:02} {:02}:{:02}:{:02}]",
        MONTHS[usize::from(time.month - 1)],
        time.day,
        time.hour,
        time.minute,
        time.second
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_thursday() {
        let time = civil_time(0);
        assert_eq!((time.year, time.month, time.day), (1970, 1, 1));
        assert_eq!(time.weekday, 4);
    }

    #[test]
    fn leap_day_is_rendered() {
        // 2024-02-29 12:34:56 UTC
        let time = civil_time(1_709_210_096);
        assert_eq!((time.year, time.month, time.day), (2024, 2, 29));
        assert_eq!((time.hour, time.minute, time.second), (12, 34, 56));
    }

    #[test]
    fn dst_switches_at_one_utc() {
        // 2024-03-31 00:59:59 and 01:00:00 UTC
        assert!(!is_eu_summer_time(1_711_846_799));
        assert!(is_eu_summer_time(1_711_846_800));
        // 2024-10-27 00:59:59 and 01:00:00 UTC
        assert!(is_eu_summer_time(1_729_990_799));
        assert!(!is_eu_summer_time(1_729_990_800));
    }

    #[test]
    fn local_time_applies_offset_and_dst() {
        // 2024-01-15 10:00:00 UTC, CET
        assert_eq!(local_time_string(1_705_312_800, 60), "[Jan 15 11:00:00]");
        // 2024-07-01 10:00:00 UTC, CEST
        assert_eq!(local_time_string(1_719_828_000, 60), "[Jul 01 12:00:00]");
        assert_eq!(local_time_string(0, 0), "[Jan 01 00:00:00]");
    }
}
