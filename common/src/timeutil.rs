use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeParseError {
	#[error("cannot parse {0:?} as RFC3339 timestamp: {1}")]
	BadRfc3339(String, String),
	#[error("cannot parse {0:?} as a nanosecond timestamp")]
	BadPrecision(String),
}

/// Parses `_time` (RFC3339, optional fractional seconds) into nanoseconds
/// since the Unix epoch.
pub fn parse_rfc3339_nsec(s: &str) -> Result<i64, TimeParseError> {
	let dt = DateTime::parse_from_rfc3339(s)
		.map_err(|e| TimeParseError::BadRfc3339(s.to_string(), e.to_string()))?;
	Ok(dt.timestamp_nanos_opt().unwrap_or(i64::MAX))
}

/// Formats a nanosecond timestamp as RFC3339 with nanosecond-precision
/// fractional seconds, the canonical `_time` representation.
pub fn format_rfc3339_nsec(ts_nsec: i64) -> String {
	let secs = ts_nsec.div_euclid(1_000_000_000);
	let nanos = ts_nsec.rem_euclid(1_000_000_000) as u32;
	DateTime::<Utc>::from_timestamp(secs, nanos)
		.unwrap_or_default()
		.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Widens a bare integer time-query-parameter to a nanosecond value based
/// on its digit count: 10 digits is seconds, 13 is milliseconds, 16 is
/// microseconds, 19 is already nanoseconds. Matches spec.md §8 scenario 4.
///
/// `widen_to_upper_bound` controls whether the value is widened to the
/// start (false, used for `start`/`time`) or the end (true, used for
/// `end`) of its precision window, e.g. seconds value `T` with
/// `widen_to_upper_bound=true` becomes `T*1e9 + 999_999_999`.
pub fn widen_time_param(raw: &str, widen_to_upper_bound: bool) -> Result<i64, TimeParseError> {
	let digits = raw.trim_start_matches('-');
	if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
		return Err(TimeParseError::BadPrecision(raw.to_string()));
	}
	let value: i64 = raw
		.parse()
		.map_err(|_| TimeParseError::BadPrecision(raw.to_string()))?;
	let (scale, window): (i64, i64) = match digits.len() {
		1..=10 => (1_000_000_000, 999_999_999),
		11..=13 => (1_000_000, 999_999),
		14..=16 => (1_000, 999),
		_ => (1, 0),
	};
	let base = value.saturating_mul(scale);
	Ok(if widen_to_upper_bound {
		base.saturating_add(window)
	} else {
		base
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn rfc3339_roundtrips() {
		let s = "2024-05-01T12:30:45.123456789Z";
		let nsec = parse_rfc3339_nsec(s).unwrap();
		assert_eq!(format_rfc3339_nsec(nsec), s);
	}

	#[test]
	fn widens_seconds_to_nsec_upper_bound() {
		assert_eq!(
			widen_time_param("1755104700", true).unwrap(),
			1755104700999999999
		);
	}

	#[test]
	fn widens_milliseconds_to_nsec_upper_bound() {
		assert_eq!(
			widen_time_param("1755104700000", true).unwrap(),
			1755104700000999999
		);
	}

	#[test]
	fn nanoseconds_stay_unchanged() {
		assert_eq!(
			widen_time_param("1755104700000000000", true).unwrap(),
			1755104700000000000
		);
	}

	#[test]
	fn start_widens_to_lower_bound() {
		assert_eq!(widen_time_param("1755104700", false).unwrap(), 1755104700000000000);
	}

	#[test]
	fn rejects_non_numeric() {
		assert!(widen_time_param("not-a-number", true).is_err());
	}
}
