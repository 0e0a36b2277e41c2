//! Timestamp conversions shared by connectors and stores.
//!
//! Records carry two kinds of time: epoch seconds (what connectors report)
//! and their ISO-8601 projections (what stores filter and sort on). The
//! projection is fixed-width UTC with microseconds so that lexicographic
//! order equals chronological order.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::error::{HarvestError, Result};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%z"];

/// Lower bound used when a fetch has no boundary: 1970-01-01T00:00:00Z.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Parse a date string in any of the formats sources are known to emit.
///
/// Values without an explicit offset are taken as UTC.
pub fn str_to_datetime(value: &str) -> Result<DateTime<Utc>> {
    let ts = value.trim();
    if ts.is_empty() {
        return Err(HarvestError::InvalidDate(format!("'{}'", value)));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(ts, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(ts, fmt) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(ts, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }

    Err(HarvestError::InvalidDate(format!("'{}'", value)))
}

/// Fixed-width ISO-8601 projection, e.g. `2015-08-12T18:32:10.000000Z`.
pub fn to_iso(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Seconds since the Unix epoch, with microsecond precision.
pub fn to_epoch(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1_000_000.0
}

/// Inverse of [`to_epoch`]; rounds to the nearest microsecond.
pub fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

/// Interpret a stored document field as a timestamp.
///
/// Strings are parsed as dates; numbers are epoch seconds.
pub fn value_to_datetime(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => str_to_datetime(s).ok(),
        serde_json::Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

/// Serde adapter storing a `DateTime<Utc>` as epoch seconds (float).
pub mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(super::to_epoch(dt))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        super::from_epoch(secs)
            .ok_or_else(|| de::Error::custom(format!("{} is out of range for a timestamp", secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_source_formats() {
        let expected = Utc.with_ymd_and_hms(2015, 8, 12, 18, 32, 10).unwrap();

        assert_eq!(str_to_datetime("2015-08-12T18:32:10").unwrap(), expected);
        assert_eq!(str_to_datetime("2015-08-12 18:32:10").unwrap(), expected);
        assert_eq!(str_to_datetime("2015-08-12T18:32:10Z").unwrap(), expected);
        assert_eq!(
            str_to_datetime("2015-08-12 20:32:10 +0200").unwrap(),
            expected
        );
        assert_eq!(
            str_to_datetime("2015-08-12").unwrap(),
            Utc.with_ymd_and_hms(2015, 8, 12, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            str_to_datetime("not a date"),
            Err(HarvestError::InvalidDate(_))
        ));
        assert!(str_to_datetime("").is_err());
    }

    #[test]
    fn iso_projection_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2009, 7, 22, 15, 27, 25).unwrap();
        let b = Utc.with_ymd_and_hms(2015, 8, 12, 18, 32, 10).unwrap();
        assert_eq!(to_iso(&b), "2015-08-12T18:32:10.000000Z");
        assert!(to_iso(&a) < to_iso(&b));
        assert_eq!(str_to_datetime(&to_iso(&b)).unwrap(), b);
    }

    #[test]
    fn epoch_round_trip() {
        let dt = Utc.with_ymd_and_hms(2015, 8, 12, 18, 32, 10).unwrap();
        assert_eq!(to_epoch(&dt), 1439404330.0);
        assert_eq!(from_epoch(1439404330.0), Some(dt));
        assert_eq!(to_epoch(&epoch()), 0.0);
    }
}
