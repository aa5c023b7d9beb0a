//! Shared HTTP request/response plumbing for the query surface (spec.md
//! §6): the common `query`/`start`/`end`/`time`/`step`/`offset`/`limit`
//! parameter set, the `extra_filters`/`extra_stream_filters` JSON
//! expansion rule, response headers, and cluster protocol version
//! checking.

use crate::cluster::remote_client::PROTOCOL_VERSION;
use common::timeutil::{self, TimeParseError};
use common::{parse_tenant_ids, TenantId};
use logql::Query;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const HEADER_REQUEST_DURATION: &str = "VL-Request-Duration-Seconds";
pub const HEADER_SELECTED_TIME_RANGE: &str = "VL-Selected-Time-Range";

#[derive(Debug, Error)]
pub enum HttpParamError {
	#[error("bad query: {0}")]
	BadQuery(String),
	#[error("bad time parameter {0:?}: {1}")]
	BadTime(String, #[source] TimeParseError),
	#[error("unsupported protocol version {0:?}, expected {PROTOCOL_VERSION:?}")]
	UnsupportedVersion(String),
	#[error("extra_filters must be a LogsQL fragment or a JSON object: {0}")]
	BadExtraFilters(String),
}

/// The parameter set shared by every public query endpoint (spec.md §6
/// "Common request shape"). Field presence varies by endpoint — callers
/// decide which of these are required for their own handler.
#[derive(Debug, Deserialize, Default)]
pub struct CommonQueryParams {
	pub query: String,
	pub start: Option<String>,
	pub end: Option<String>,
	pub time: Option<String>,
	pub step: Option<String>,
	pub offset: Option<u64>,
	pub limit: Option<u64>,
	pub extra_filters: Option<String>,
	pub extra_stream_filters: Option<String>,
	/// Marshaled tenant list (spec.md §6 "tenant_ids="); external clients
	/// without a cluster-protocol front door in scope here (§1 non-goals:
	/// "no authentication beyond pass-through of HTTP headers") just pass
	/// this as a plain query parameter.
	pub tenant_ids: Option<String>,
	/// `field=<name>` for the `field_values`/`stream_field_values` catalog
	/// endpoints (spec.md §6); ignored elsewhere.
	pub field: Option<String>,
}

pub fn check_protocol_version(version: &str) -> Result<(), HttpParamError> {
	if version == PROTOCOL_VERSION {
		Ok(())
	} else {
		Err(HttpParamError::UnsupportedVersion(version.to_string()))
	}
}

fn parse_time(raw: &str, widen_to_upper_bound: bool) -> Result<i64, HttpParamError> {
	// Accepts an RFC3339 timestamp as well as the bare-integer form
	// (spec.md §8 scenario 4): real deployments mix both, and nothing else
	// in this model depends on rejecting one or the other.
	if let Ok(nsec) = timeutil::parse_rfc3339_nsec(raw) {
		return Ok(nsec);
	}
	timeutil::widen_time_param(raw, widen_to_upper_bound).map_err(|e| HttpParamError::BadTime(raw.to_string(), e))
}

/// Expands `extra_filters`/`extra_stream_filters` into LogsQL text (spec.md
/// §6): a bare string is passed through unchanged, a JSON object expands
/// field/value(s) pairs into `field:=value` or `field:in(v1,v2,...)` terms,
/// space-joined in the object's own key order (LogsQL filter terms are
/// implicitly ANDed by juxtaposition; no explicit `AND` keyword).
fn expand_filter_object(raw: &str) -> Result<String, HttpParamError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Ok(String::new());
	}
	if !trimmed.starts_with('{') {
		return Ok(trimmed.to_string());
	}

	let value: Value = serde_json::from_str(trimmed).map_err(|e| HttpParamError::BadExtraFilters(e.to_string()))?;
	let object = value.as_object().ok_or_else(|| HttpParamError::BadExtraFilters(trimmed.to_string()))?;

	let mut terms = Vec::with_capacity(object.len());
	for (field, value) in object {
		match value {
			Value::Array(values) => {
				let rendered: Vec<String> = values.iter().map(json_scalar_to_string).collect();
				terms.push(format!("{field}:in({})", rendered.join(",")));
			}
			other => terms.push(format!("{field}:={}", json_scalar_to_string(other))),
		}
	}
	Ok(terms.join(" "))
}

/// Parallels [`expand_filter_object`] for `extra_stream_filters`, producing
/// the `{field="value",...}` stream-selector syntax instead of filter
/// terms. A multi-value field becomes a regex alternation, the stream
/// selector's own equivalent of `in(...)`.
fn expand_stream_filter_object(raw: &str) -> Result<String, HttpParamError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Ok(String::new());
	}
	if !trimmed.starts_with('{') {
		return Ok(trimmed.to_string());
	}

	let value: Value = serde_json::from_str(trimmed).map_err(|e| HttpParamError::BadExtraFilters(e.to_string()))?;
	let object = value.as_object().ok_or_else(|| HttpParamError::BadExtraFilters(trimmed.to_string()))?;

	let mut tags = Vec::with_capacity(object.len());
	for (field, value) in object {
		match value {
			Value::Array(values) => {
				let rendered: Vec<String> = values.iter().map(json_scalar_to_string).collect();
				tags.push(format!("{field}=~\"{}\"", rendered.join("|")));
			}
			other => tags.push(format!("{field}=\"{}\"", json_scalar_to_string(other))),
		}
	}
	Ok(format!("{{{}}}", tags.join(",")))
}

fn json_scalar_to_string(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

/// Builds the [`Query`] a handler runs: parses `query`'s LogsQL text,
/// appends the expanded `extra_filters`/`extra_stream_filters`, resolves
/// the time range from `start`/`end`/`time`, and appends an `offset`/
/// `limit` pipe when the caller asked for one.
pub fn build_query(params: &CommonQueryParams, now_nsec: i64) -> Result<Query, HttpParamError> {
	let mut base: Query = params.query.parse().map_err(|e: logql::QueryParseError| HttpParamError::BadQuery(e.to_string()))?;

	let mut filter = base.filter().to_string();
	if let Some(extra) = &params.extra_filters {
		let expanded = expand_filter_object(extra)?;
		if !expanded.is_empty() {
			filter = format!("{filter} {expanded}");
		}
	}
	if let Some(extra) = &params.extra_stream_filters {
		let expanded = expand_stream_filter_object(extra)?;
		if !expanded.is_empty() {
			filter = format!("{filter} {expanded}");
		}
	}

	let start = match &params.start {
		Some(s) => parse_time(s, false)?,
		None => match &params.time {
			Some(t) => parse_time(t, false)?,
			None => 0,
		},
	};
	let end = match &params.end {
		Some(e) => parse_time(e, true)?,
		None => match &params.time {
			Some(t) => parse_time(t, true)?,
			None => now_nsec,
		},
	};

	let pipes = base.pipes().to_vec();
	let mut query = Query::new(filter, start, end);
	for pipe in pipes {
		query.append_pipe(pipe);
	}
	if let Some(limit) = params.limit {
		query.append_pipe(logql::Pipe::OffsetLimit { offset: params.offset.unwrap_or(0), limit });
	}
	Ok(query)
}

/// Resolves the `tenant_ids` query parameter to its parsed form, defaulting
/// to the zero tenant when a public client omits it entirely.
pub fn resolve_tenants(raw: Option<&str>) -> Result<Vec<TenantId>, HttpParamError> {
	match raw {
		Some(s) if !s.is_empty() => parse_tenant_ids(s).map_err(|e| HttpParamError::BadQuery(e.to_string())),
		_ => Ok(vec![TenantId::default()]),
	}
}

pub fn request_duration_header(elapsed: Duration) -> String {
	format!("{:.6}", elapsed.as_secs_f64())
}

/// Renders the original query's own time range (not any override a pipe
/// might have applied) as `[min,max]` in nanoseconds (spec.md §6).
pub fn selected_time_range_header(start_nsec: i64, end_nsec: i64) -> String {
	format!("[{start_nsec},{end_nsec}]")
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn protocol_version_must_match() {
		assert!(check_protocol_version(PROTOCOL_VERSION).is_ok());
		assert!(check_protocol_version("99").is_err());
	}

	#[test]
	fn expand_filter_object_builds_equality_and_in_terms() {
		// spec.md §8 scenario 3: {"foo":"bar","baz":["x","y"]} -> "foo:=bar baz:in(x,y)",
		// preserving the object's own key order and joined with a single space.
		let expanded = expand_filter_object(r#"{"foo":"bar","baz":["x","y"]}"#).unwrap();
		assert_eq!(expanded, "foo:=bar baz:in(x,y)");
	}

	#[test]
	fn expand_filter_object_passes_through_bare_logsql() {
		let expanded = expand_filter_object("level:error").unwrap();
		assert_eq!(expanded, "level:error");
	}

	#[test]
	fn expand_stream_filter_object_builds_selector_syntax() {
		let expanded = expand_stream_filter_object(r#"{"service":"checkout"}"#).unwrap();
		assert_eq!(expanded, r#"{service="checkout"}"#);
	}

	#[test]
	fn expand_stream_filter_object_uses_alternation_for_multi_value() {
		let expanded = expand_stream_filter_object(r#"{"service":["a","b"]}"#).unwrap();
		assert_eq!(expanded, r#"{service=~"a|b"}"#);
	}

	#[test]
	fn expand_stream_filter_object_builds_example_from_scenario_3() {
		// spec.md §8 scenario 3: {"foo":"bar","baz":["x","y"]} -> {foo="bar",baz=~"x|y"}
		let expanded = expand_stream_filter_object(r#"{"foo":"bar","baz":["x","y"]}"#).unwrap();
		assert_eq!(expanded, r#"{foo="bar",baz=~"x|y"}"#);
	}

	#[test]
	fn build_query_combines_filter_and_extra_filters() {
		let params = CommonQueryParams {
			query: "level:error".to_string(),
			extra_filters: Some(r#"{"host":"h1"}"#.to_string()),
			start: Some("1000000000".to_string()),
			end: Some("2000000000".to_string()),
			..Default::default()
		};
		let query = build_query(&params, 0).unwrap();
		assert_eq!(query.filter(), "level:error host:=h1");
		assert_eq!(query.time_range(), (1_000_000_000_000_000_000, 2_000_000_000_999_999_999));
	}

	#[test]
	fn build_query_falls_back_to_time_param_for_both_bounds() {
		let params = CommonQueryParams {
			query: "*".to_string(),
			time: Some("1000000000".to_string()),
			..Default::default()
		};
		let query = build_query(&params, 0).unwrap();
		let (start, end) = query.time_range();
		assert!(start < end);
	}

	#[test]
	fn build_query_appends_offset_limit_pipe() {
		let params = CommonQueryParams {
			query: "*".to_string(),
			limit: Some(10),
			offset: Some(5),
			..Default::default()
		};
		let query = build_query(&params, 0).unwrap();
		assert!(query
			.pipes()
			.iter()
			.any(|p| matches!(p, logql::Pipe::OffsetLimit { offset: 5, limit: 10 })));
	}

	#[test]
	fn resolve_tenants_defaults_to_zero_tenant_when_absent() {
		assert_eq!(resolve_tenants(None).unwrap(), vec![TenantId::default()]);
		assert_eq!(resolve_tenants(Some("")).unwrap(), vec![TenantId::default()]);
	}

	#[test]
	fn resolve_tenants_parses_the_marshaled_list() {
		assert_eq!(resolve_tenants(Some("1:2,3:4")).unwrap(), vec![TenantId::new(1, 2), TenantId::new(3, 4)]);
	}
}
