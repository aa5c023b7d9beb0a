//! Turns a raw syslog line into a [`Record`] (spec.md §4.2).
//!
//! Parsing never fails: anything that cannot be decomposed into structured
//! fields is kept verbatim under `message` (renamed to `_msg` at the end),
//! mirroring the "does not throw" contract from the spec.

use common::Record;
use once_cell_lite::current_year;

/// Parameters that drive the enrichment step, independent of the raw line
/// content. One of these is built per accepted connection/packet.
#[derive(Debug, Clone)]
pub struct ParseContext {
	pub use_local_timestamp: bool,
	pub remote_ip: String,
	pub use_remote_ip: bool,
	pub extra_fields: Vec<(String, String)>,
	pub ignore_fields: Vec<String>,
	pub decolorize_fields: Vec<String>,
}

impl Default for ParseContext {
	fn default() -> Self {
		Self {
			use_local_timestamp: false,
			remote_ip: String::new(),
			use_remote_ip: false,
			extra_fields: Vec::new(),
			ignore_fields: Vec::new(),
			decolorize_fields: Vec::new(),
		}
	}
}

/// A syslog record parser. Stateless beyond the fallback year it was built
/// with; safe to pool and reset (spec.md §9).
pub struct RecordParser {
	fallback_year: i32,
}

impl RecordParser {
	pub fn new() -> Self {
		Self {
			fallback_year: current_year(),
		}
	}

	/// Resets the parser to construction-equivalent state, refreshing the
	/// fallback year from the process-wide cell.
	pub fn reset(&mut self) {
		self.fallback_year = current_year();
	}

	/// Parses `line` and applies the enrichment policy, returning a
	/// finished [`Record`]. Never fails.
	pub fn parse(&self, line: &[u8], ctx: &ParseContext) -> Record {
		let text = String::from_utf8_lossy(line);
		let mut fields = parse_fields(&text, self.fallback_year);

		let mut record = if ctx.use_local_timestamp {
			Record::new(now_nsec())
		} else {
			let ts = fields
				.iter()
				.position(|(name, _)| name == "timestamp")
				.and_then(|i| parse_timestamp_field(&fields[i].1))
				.unwrap_or_else(now_nsec);
			Record::new(ts)
		};

		for (name, value) in fields.drain(..) {
			if ctx.ignore_fields.iter().any(|f| f == &name) {
				continue;
			}
			let value = if ctx.decolorize_fields.iter().any(|f| f == &name) {
				strip_ansi(&value)
			} else {
				value
			};
			record.add_field(name, value);
		}

		if ctx.use_remote_ip && !ctx.remote_ip.is_empty() {
			record.add_field("remote_ip", ctx.remote_ip.clone());
			if !record.has_nonempty("hostname") {
				record.add_field("hostname", ctx.remote_ip.clone());
			}
		}

		for (name, value) in &ctx.extra_fields {
			record.add_field(name.clone(), value.clone());
		}

		record.rename_field("message", common::FIELD_MSG);
		record
	}
}

impl Default for RecordParser {
	fn default() -> Self {
		Self::new()
	}
}

impl crate::ingest::pool::Resettable for RecordParser {
	fn reset_for_reuse(&mut self) {
		self.reset();
	}
}

fn now_nsec() -> i64 {
	chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Parses `<PRI>TIMESTAMP HOSTNAME TAG: MESSAGE` (RFC3164-ish) on a
/// best-effort basis; whatever can't be located is salvaged into
/// `message` so the caller always gets at least something.
fn parse_fields(line: &str, fallback_year: i32) -> Vec<(String, String)> {
	let mut out = Vec::new();
	let mut rest = line;

	if let Some(stripped) = rest.strip_prefix('<') {
		if let Some(end) = stripped.find('>') {
			if let Ok(pri) = stripped[..end].parse::<u32>() {
				out.push(("facility".into(), (pri / 8).to_string()));
				out.push(("severity".into(), (pri % 8).to_string()));
				rest = &stripped[end + 1..];
			}
		}
	}

	// RFC3164 timestamp: "Mmm dd hh:mm:ss " (15 chars, e.g. "Jan  2 15:04:05").
	// Hostname and tag extraction only make sense once a timestamp anchors
	// the line as structured syslog; otherwise the whole line is the message.
	let has_timestamp = rest.len() >= 16 && rest.as_bytes()[3] == b' ';
	if has_timestamp {
		let candidate = &rest[..15];
		if let Some(nsec) = parse_rfc3164_timestamp(candidate, fallback_year) {
			out.push(("timestamp".into(), nsec.to_string()));
			rest = rest[15..].trim_start();

			if let Some(sp) = rest.find(' ') {
				let (hostname, remainder) = rest.split_at(sp);
				if !hostname.is_empty() && !hostname.contains(':') {
					out.push(("hostname".into(), hostname.to_string()));
					rest = remainder.trim_start();
				}
			}

			if let Some(colon) = rest.find(':') {
				let (tag, remainder) = rest.split_at(colon);
				if !tag.is_empty() && tag.len() < 32 && !tag.contains(' ') {
					out.push(("tag".into(), tag.to_string()));
					rest = remainder[1..].trim_start();
				}
			}
		}
	}

	out.push(("message".into(), rest.to_string()));
	out
}

fn parse_rfc3164_timestamp(s: &str, fallback_year: i32) -> Option<i64> {
	use chrono::{NaiveDate, TimeZone, Utc};
	let dt = chrono::NaiveDateTime::parse_from_str(
		&format!("{fallback_year} {s}"),
		"%Y %b %e %H:%M:%S",
	)
	.ok()?;
	let _: NaiveDate = dt.date();
	Utc.from_utc_datetime(&dt).timestamp_nanos_opt()
}

fn parse_timestamp_field(raw: &str) -> Option<i64> {
	raw.parse::<i64>().ok()
}

/// Strips ANSI CSI color escape sequences (`\x1b[...m`).
fn strip_ansi(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let mut chars = value.chars().peekable();
	while let Some(c) = chars.next() {
		if c == '\u{1b}' && chars.peek() == Some(&'[') {
			chars.next();
			for c2 in chars.by_ref() {
				if c2.is_ascii_alphabetic() {
					break;
				}
			}
			continue;
		}
		out.push(c);
	}
	out
}

mod once_cell_lite {
	use crate::ingest::year::current_year_value;

	pub fn current_year() -> i32 {
		current_year_value()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn remote_ip_hostname_fallback() {
		// spec.md §8 end-to-end scenario 2: a message with no hostname field.
		let line = b"backup job failed";
		let ctx = ParseContext {
			remote_ip: "10.0.0.5".into(),
			use_remote_ip: true,
			..Default::default()
		};
		let parser = RecordParser::new();
		let record = parser.parse(line, &ctx);
		assert_eq!(record.get("remote_ip"), Some("10.0.0.5"));
		assert_eq!(record.get("hostname"), Some("10.0.0.5"));
	}

	#[test]
	fn existing_hostname_is_not_overridden() {
		let line = b"<14>Jan  2 15:04:05 realhost backup: failed";
		let ctx = ParseContext {
			remote_ip: "10.0.0.5".into(),
			use_remote_ip: true,
			..Default::default()
		};
		let parser = RecordParser::new();
		let record = parser.parse(line, &ctx);
		assert_eq!(record.get("hostname"), Some("realhost"));
		assert_eq!(record.get("remote_ip"), Some("10.0.0.5"));
	}

	#[test]
	fn message_field_is_renamed_to_msg() {
		let parser = RecordParser::new();
		let record = parser.parse(b"plain unstructured text", &ParseContext::default());
		assert_eq!(record.get(common::FIELD_MSG), Some("plain unstructured text"));
		assert_eq!(record.get("message"), None);
	}

	#[test]
	fn use_local_timestamp_overrides_parsed_one() {
		let line = b"<14>Jan  2 15:04:05 host tag: msg";
		let ctx = ParseContext {
			use_local_timestamp: true,
			..Default::default()
		};
		let parser = RecordParser::new();
		let before = now_nsec();
		let record = parser.parse(line, &ctx);
		let after = now_nsec();
		assert!(record.timestamp >= before && record.timestamp <= after);
	}

	#[test]
	fn extra_fields_are_appended_without_dedup() {
		let parser = RecordParser::new();
		let ctx = ParseContext {
			extra_fields: vec![("env".into(), "prod".into()), ("env".into(), "prod2".into())],
			..Default::default()
		};
		let record = parser.parse(b"hi", &ctx);
		let envs: Vec<_> = record.fields.iter().filter(|f| f.name == "env").collect();
		assert_eq!(envs.len(), 2);
	}

	#[test]
	fn ignore_fields_drop_before_storage() {
		let parser = RecordParser::new();
		let ctx = ParseContext {
			ignore_fields: vec!["tag".into()],
			..Default::default()
		};
		let record = parser.parse(b"<14>Jan  2 15:04:05 host tag: msg", &ctx);
		assert_eq!(record.get("tag"), None);
	}

	#[test]
	fn decolorize_strips_ansi_escapes() {
		let parser = RecordParser::new();
		let ctx = ParseContext {
			decolorize_fields: vec!["message".into()],
			..Default::default()
		};
		let record = parser.parse(b"\x1b[31mred text\x1b[0m", &ctx);
		assert_eq!(record.get(common::FIELD_MSG), Some("red text"));
	}
}
