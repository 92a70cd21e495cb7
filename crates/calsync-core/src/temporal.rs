//! Lenient date/time parsing for loosely-typed extract values.
//!
//! Filing extracts mix ISO timestamps with the legacy US `M/D/YYYY h:mm:ss AM` form, so the
//! parsers walk a fixed list of layouts (most common first) and give up with `None`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// Date-time layouts tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Offset-carrying layouts beyond RFC 3339.
const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Date-only layouts; a match is read as midnight.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M", "%I:%M:%S %p", "%I:%M %p"];

fn parse_with_offset(text: &str) -> Option<DateTime<chrono::FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed);
    }
    OFFSET_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(text, fmt).ok())
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

/// Parse a wall-clock date-time. Offsets, when present, are dropped rather than applied.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    parse_naive(text).or_else(|| parse_with_offset(text).map(|dt| dt.naive_local()))
}

/// Parse an instant. Offset-carrying values are normalised to UTC; naive values are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(with_offset) = parse_with_offset(text) {
        return Some(with_offset.with_timezone(&Utc));
    }
    parse_naive(text).map(|naive| naive.and_utc())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    parse_datetime(text).map(|dt| dt.date())
}

/// Parse a time of day, either on its own or as the time part of a full date-time.
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
        .or_else(|| parse_datetime(text).map(|dt| dt.time()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn legacy_us_timestamp_parses_to_midnight() {
        let dt = parse_datetime("1/5/2024 12:00:00 AM").unwrap();
        assert_eq!(dt.date(), NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(dt.hour(), 0);
    }

    #[test]
    fn impossible_month_and_day_are_rejected() {
        assert!(parse_datetime("13/99/2024").is_none());
        assert!(parse_date("2024-02-30").is_none());
    }

    #[test]
    fn offsets_normalise_to_utc_for_timestamps_only() {
        let ts = parse_timestamp("2024-03-01T10:00:00-08:00").unwrap();
        assert_eq!(ts.hour(), 18);
        let naive = parse_datetime("2024-03-01T10:00:00-08:00").unwrap();
        assert_eq!(naive.hour(), 10);
    }

    #[test]
    fn time_accepts_bare_and_embedded_forms() {
        assert_eq!(parse_time("07:45").unwrap().minute(), 45);
        assert_eq!(parse_time("3:15:00 PM").unwrap().hour(), 15);
        assert_eq!(parse_time("2024-01-05 08:30:00").unwrap().hour(), 8);
        assert!(parse_time("lunch").is_none());
    }

    #[test]
    fn iso_date_only_reads_as_midnight() {
        let dt = parse_datetime("2025-01-02").unwrap();
        assert_eq!(dt.day(), 2);
        assert_eq!(dt.time(), NaiveTime::MIN);
    }
}
