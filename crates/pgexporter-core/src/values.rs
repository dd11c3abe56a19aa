//! Text value conversion.
//!
//! Rows arrive in text form, so every metric value passes through here.
//! NULL and unparsable numerics become NaN, matching what a scrape expects
//! for "no value" rather than dropping the sample.

use chrono::{DateTime, NaiveDateTime};

use crate::error::QueryError;

/// Numeric value of a column; NULL → NaN.
pub fn parse_float(value: Option<&str>) -> Result<f64, String> {
    let Some(raw) = value else {
        return Ok(f64::NAN);
    };
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<f64>() {
        return Ok(v);
    }
    if let Some(b) = parse_bool(raw) {
        return Ok(if b { 1.0 } else { 0.0 });
    }
    if let Some(ts) = parse_timestamp(raw) {
        return Ok(ts);
    }
    Err(format!("could not parse {raw:?} as a number"))
}

/// `t`/`f`, `true`/`false`, `on`/`off`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "on" | "yes" => Some(true),
        "f" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Seconds since the epoch for `timestamp` / `timestamptz` text output.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    const WITH_ZONE: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"];
    const WITHOUT_ZONE: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in WITH_ZONE {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts.timestamp_micros() as f64 / 1e6);
        }
    }
    for fmt in WITHOUT_ZONE {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.and_utc().timestamp_micros() as f64 / 1e6);
        }
    }
    None
}

/// Duration in milliseconds. Accepts the server's interval output
/// (`[N day[s]] HH:MM:SS[.ffffff]`) and unit strings like `1h2m3.5s` or `250ms`.
/// NULL → NaN.
pub fn parse_duration_ms(value: Option<&str>) -> Result<f64, String> {
    let Some(raw) = value else {
        return Ok(f64::NAN);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    parse_interval(raw)
        .or_else(|| parse_unit_duration(raw))
        .ok_or_else(|| format!("could not parse {raw:?} as a duration"))
}

fn parse_interval(raw: &str) -> Option<f64> {
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let mut days = 0.0;
    let mut clock = body;
    if let Some((count, rest)) = body.split_once(' ') {
        let rest = rest.trim_start();
        let rest = rest
            .strip_prefix("days")
            .or_else(|| rest.strip_prefix("day"))?
            .trim_start();
        days = count.parse::<f64>().ok()?;
        if rest.is_empty() {
            return Some(sign(negative) * days * 86_400_000.0);
        }
        clock = rest;
    }

    let mut parts = clock.split(':');
    let hours: f64 = parts.next()?.trim_start_matches('-').parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let clock_negative = clock.starts_with('-');
    let clock_ms = (hours * 3600.0 + minutes * 60.0 + seconds) * 1000.0;
    let total = days * 86_400_000.0 + sign(clock_negative) * clock_ms;
    Some(sign(negative) * total)
}

fn parse_unit_duration(raw: &str) -> Option<f64> {
    let (negative, mut rest) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if rest == "0" {
        return Some(0.0);
    }

    let mut total = 0.0;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let number: f64 = number.parse().ok()?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let factor = match unit {
            "ns" => 1e-6,
            "us" | "µs" => 1e-3,
            "ms" => 1.0,
            "s" => 1000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        total += number * factor;
        rest = tail;
    }
    Some(sign(negative) * total)
}

fn sign(negative: bool) -> f64 {
    if negative { -1.0 } else { 1.0 }
}

/// Elements of a one-dimensional array in text form (`{1,2,3}`).
/// NULL elements become NaN.
pub fn parse_float_array(column: &str, value: Option<&str>) -> Result<Vec<f64>, QueryError> {
    let column_error = |reason: String| QueryError::Column {
        column: column.to_string(),
        reason,
    };
    let Some(raw) = value else {
        return Ok(Vec::new());
    };
    let inner = raw
        .trim()
        .strip_prefix('{')
        .and_then(|r| r.strip_suffix('}'))
        .ok_or_else(|| column_error(format!("expected an array, got {raw:?}")))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|item| {
            let item = item.trim().trim_matches('"');
            if item.eq_ignore_ascii_case("NULL") {
                Ok(f64::NAN)
            } else {
                parse_float(Some(item)).map_err(&column_error)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_bools_and_nulls() {
        assert_eq!(parse_float(Some("42")).unwrap(), 42.0);
        assert_eq!(parse_float(Some(" 1.5e3 ")).unwrap(), 1500.0);
        assert_eq!(parse_float(Some("t")).unwrap(), 1.0);
        assert_eq!(parse_float(Some("false")).unwrap(), 0.0);
        assert!(parse_float(None).unwrap().is_nan());
        assert!(parse_float(Some("NaN")).unwrap().is_nan());
        assert!(parse_float(Some("streaming")).is_err());
    }

    #[test]
    fn timestamps_become_epoch_seconds() {
        assert_eq!(parse_float(Some("2024-01-01 00:00:00+00")).unwrap(), 1_704_067_200.0);
        assert_eq!(parse_float(Some("2024-01-01 02:00:00.5+02")).unwrap(), 1_704_067_200.5);
        assert_eq!(parse_float(Some("2024-01-01 00:00:01")).unwrap(), 1_704_067_201.0);
    }

    #[test]
    fn intervals_in_milliseconds() {
        assert_eq!(parse_duration_ms(Some("00:00:01.5")).unwrap(), 1500.0);
        assert_eq!(parse_duration_ms(Some("01:02:03")).unwrap(), 3_723_000.0);
        assert_eq!(parse_duration_ms(Some("1 day 00:00:01")).unwrap(), 86_401_000.0);
        assert_eq!(parse_duration_ms(Some("2 days")).unwrap(), 172_800_000.0);
        assert_eq!(parse_duration_ms(Some("-00:00:02")).unwrap(), -2000.0);
        assert!(parse_duration_ms(None).unwrap().is_nan());
    }

    #[test]
    fn unit_durations_in_milliseconds() {
        assert_eq!(parse_duration_ms(Some("1h2m3s")).unwrap(), 3_723_000.0);
        assert_eq!(parse_duration_ms(Some("250ms")).unwrap(), 250.0);
        assert_eq!(parse_duration_ms(Some("1.5s")).unwrap(), 1500.0);
        assert!(parse_duration_ms(Some("3 fortnights")).is_err());
        assert!(parse_duration_ms(Some("")).is_err());
    }

    #[test]
    fn arrays() {
        assert_eq!(parse_float_array("le", Some("{1,2.5,10}")).unwrap(), vec![1.0, 2.5, 10.0]);
        assert!(parse_float_array("le", Some("{}")).unwrap().is_empty());
        assert!(parse_float_array("le", None).unwrap().is_empty());
        assert!(parse_float_array("le", Some("{1,NULL}")).unwrap()[1].is_nan());
        assert!(matches!(
            parse_float_array("le", Some("1,2")),
            Err(QueryError::Column { .. })
        ));
    }
}
