//! Date and timestamp codecs. Binary formats count from the PostgreSQL
//! epoch 2000-01-01: days in an int32 for `date`, microseconds in an int64
//! for `timestamp`/`timestamptz`.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

pub fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
}

pub fn pg_epoch_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

pub fn date_to_pg_days(date: NaiveDate) -> i32 {
    (date - pg_epoch_date()).num_days() as i32
}

pub fn date_from_pg_days(days: i32) -> Result<NaiveDate, String> {
    pg_epoch_date()
        .checked_add_signed(chrono::Duration::days(days as i64))
        .ok_or_else(|| format!("date out of range: {days} days from epoch"))
}

pub fn timestamp_to_pg_micros(ts: DateTime<Utc>) -> Result<i64, String> {
    (ts - pg_epoch_timestamp())
        .num_microseconds()
        .ok_or_else(|| "timestamp out of range".to_string())
}

pub fn timestamp_from_pg_micros(micros: i64) -> Result<DateTime<Utc>, String> {
    pg_epoch_timestamp()
        .checked_add_signed(chrono::Duration::microseconds(micros))
        .ok_or_else(|| format!("timestamp out of range: {micros} microseconds from epoch"))
}

pub fn date_to_text(date: NaiveDate) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month(),
        date.day()
    )
}

pub fn date_from_text(text: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| format!("invalid input syntax for type date: \"{text}\""))
}

/// PostgreSQL client spelling: space separator, `+00` zone suffix.
pub fn timestamp_to_pg_text(ts: DateTime<Utc>) -> String {
    format!("{}+00", ts.format("%Y-%m-%d %H:%M:%S%.f"))
}

/// Backend spelling: RFC 3339 with `T` and `Z`, the form Cloud backends
/// emit natively.
pub fn timestamp_to_backend_text(ts: DateTime<Utc>) -> String {
    format!("{}", ts.format("%Y-%m-%dT%H:%M:%S%.fZ"))
}

pub fn timestamp_from_text(text: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!(
        "invalid input syntax for type timestamp: \"{text}\""
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_day_zero() {
        assert_eq!(date_to_pg_days(pg_epoch_date()), 0);
        assert_eq!(
            date_to_pg_days(NaiveDate::from_ymd_opt(2000, 1, 2).unwrap()),
            1
        );
        assert_eq!(
            date_to_pg_days(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            -1
        );
    }

    #[test]
    fn date_round_trips() {
        for text in ["1970-01-01", "2000-01-01", "2024-02-29", "1899-12-31"] {
            let date = date_from_text(text).unwrap();
            assert_eq!(date_from_pg_days(date_to_pg_days(date)).unwrap(), date);
            assert_eq!(date_to_text(date), text);
        }
    }

    #[test]
    fn timestamp_micros_round_trip() {
        let ts = timestamp_from_text("2024-01-15 10:30:00.123456+00").unwrap();
        let micros = timestamp_to_pg_micros(ts).unwrap();
        assert_eq!(timestamp_from_pg_micros(micros).unwrap(), ts);
    }

    #[test]
    fn timestamp_text_spellings() {
        let ts = timestamp_from_text("2024-01-15 10:30:00+00").unwrap();
        assert_eq!(timestamp_to_pg_text(ts), "2024-01-15 10:30:00+00");
        assert_eq!(timestamp_to_backend_text(ts), "2024-01-15T10:30:00Z");
        let with_frac = timestamp_from_text("2024-01-15T10:30:00.500Z").unwrap();
        assert_eq!(timestamp_to_pg_text(with_frac), "2024-01-15 10:30:00.500+00");
    }

    #[test]
    fn parses_naive_timestamps_as_utc() {
        let ts = timestamp_from_text("2024-01-15 10:30:00").unwrap();
        assert_eq!(timestamp_to_pg_micros(ts).unwrap() % 1_000_000, 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(date_from_text("yesterday").is_err());
        assert!(timestamp_from_text("not a timestamp").is_err());
    }
}
