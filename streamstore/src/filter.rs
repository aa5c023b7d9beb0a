//! A deliberately tiny filter-expression matcher for [`InMemoryStore`].
//!
//! `Query`'s filter text is opaque everywhere else in this workspace (the
//! real LogsQL grammar is explicitly out of scope, per spec.md's Non-goals:
//! "the LogsQL parser itself ... we treat parsed queries as opaque
//! values"). The reference store still needs *something* to execute so the
//! splitter/fan-out/last-N tests can assert end-to-end behavior against
//! real row data, so this module implements a small, explicitly
//! non-authoritative stand-in: `*` matches everything; otherwise
//! whitespace-separated terms are ANDed, each of the form `field:value`,
//! `field:in(v1,v2,...)`, or a bare word matched against `_msg`, optionally
//! negated with a leading `!`.
//!
//! [`InMemoryStore`]: crate::InMemoryStore

use common::{Record, FIELD_MSG};

pub fn matches(record: &Record, filter: &str) -> bool {
	let filter = filter.trim();
	if filter.is_empty() || filter == "*" {
		return true;
	}
	filter.split_whitespace().all(|term| matches_term(record, term))
}

fn matches_term(record: &Record, term: &str) -> bool {
	let (negate, term) = match term.strip_prefix('!') {
		Some(rest) => (true, rest),
		None => (false, term),
	};
	let result = match term.split_once(':') {
		Some((field, rhs)) => {
			if let Some(list) = rhs.strip_prefix("in(").and_then(|s| s.strip_suffix(')')) {
				let wanted: Vec<&str> = list.split(',').map(str::trim).collect();
				record
					.get(field)
					.map(|v| wanted.contains(&v))
					.unwrap_or(false)
			} else {
				let value = rhs.strip_prefix('=').unwrap_or(rhs);
				record.get(field).map(|v| v == value).unwrap_or(false)
			}
		}
		None => record
			.get(FIELD_MSG)
			.map(|msg| msg.contains(term))
			.unwrap_or(false),
	};
	result != negate
}
