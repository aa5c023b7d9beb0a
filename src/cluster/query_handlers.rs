//! Public HTTP query endpoints (spec.md §6 "Public HTTP query endpoints"):
//! the external-client surface that parses a request's common parameters,
//! runs it through [`crate::cluster::executor::Executor`], and streams the
//! result back as NDJSON (log/histogram/facet endpoints) or a small JSON
//! envelope (catalog and Prometheus-style endpoints). Live tailing streams
//! chunked NDJSON off [`crate::cluster::tail::run_tail`].

use crate::cluster::context::QueryContext;
use crate::cluster::executor::Executor;
use crate::cluster::http_params::{
	build_query, request_duration_header, resolve_tenants, selected_time_range_header, CommonQueryParams,
	HEADER_REQUEST_DURATION, HEADER_SELECTED_TIME_RANGE,
};
use crate::cluster::tail::{run_tail, TailError, TailRunner, TailSink};
use crate::cluster::writer::{NdjsonWorker, SharedSink};
use crate::errors::AppError;
use crate::state::AppState;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query as AxumQuery, State};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use common::{Column, ColumnValues, DataBlock, Record, TenantId, ValueWithHits};
use logql::{Pipe, Query as LogQuery};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

fn now_nsec() -> i64 {
	chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Builds one column per field name seen across `records` (first-seen
/// order), padding rows that lack a given field with an empty string — the
/// same shape `Store::execute` hands back, so [`NdjsonWorker`] can treat
/// the executor's merged rows exactly like a storage node's own blocks.
fn records_to_block(records: &[Record]) -> DataBlock {
	let mut names: Vec<String> = Vec::new();
	for record in records {
		for field in &record.fields {
			if !names.contains(&field.name) {
				names.push(field.name.clone());
			}
		}
	}
	let columns = names
		.into_iter()
		.map(|name| {
			let values: Vec<String> = records.iter().map(|r| r.get(&name).unwrap_or("").to_string()).collect();
			Column { name, values: ColumnValues::encode_best(values) }
		})
		.collect();
	DataBlock { columns }
}

/// Renders `records` as a single NDJSON body through the same worker the
/// binary cluster protocol uses for its own output (spec.md §4.7) — one
/// worker per request here, since the executor already hands back a fully
/// merged row set rather than a per-thread block callback.
async fn ndjson_body(records: Vec<Record>) -> Bytes {
	let sink = SharedSink::new(Vec::<u8>::new());
	let mut worker = NdjsonWorker::new(sink.clone());
	worker
		.write_block(&records_to_block(&records))
		.await
		.expect("writing to an in-memory buffer never fails");
	worker.finish().await.expect("writing to an in-memory buffer never fails");
	Bytes::from(sink.into_inner())
}

fn parse_request(params: &CommonQueryParams) -> Result<(Vec<TenantId>, LogQuery), AppError> {
	let tenants = resolve_tenants(params.tenant_ids.as_deref())?;
	let query = build_query(params, now_nsec())?;
	Ok((tenants, query))
}

/// Runs a query through the executor, counting fan-out failures on the way
/// out so `query_fanout_errors_total` reflects every public endpoint, not
/// just `/select/logsql/query`.
async fn run_query(state: &AppState, ctx: &QueryContext) -> Result<Vec<common::Record>, AppError> {
	match state.executor.query(ctx).await {
		Ok(records) => Ok(records),
		Err(e) => {
			state.metrics.query_fanout_errors_total.add(1, &[]);
			Err(e.into())
		}
	}
}

/// `/select/logsql/query` (spec.md §6): streams matching rows as NDJSON,
/// with the duration/selected-range headers spec.md §6 calls for.
pub async fn query(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
	let (tenants, query) = parse_request(&params)?;
	let (orig_start, orig_end) = query.time_range();
	let ctx = QueryContext::new(tenants, query);
	let records = run_query(&state, &ctx).await?;
	let elapsed = ctx.elapsed();
	let body = ndjson_body(records).await;
	let headers = [
		(HEADER_REQUEST_DURATION, request_duration_header(elapsed)),
		(HEADER_SELECTED_TIME_RANGE, selected_time_range_header(orig_start, orig_end)),
	];
	Ok((headers, body).into_response())
}

/// `/select/logsql/hits` (spec.md §6): a `stats_by_time` histogram over the
/// matched rows, bucketed by `step` (default 60s).
pub async fn hits(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
	let (tenants, mut query) = parse_request(&params)?;
	let step_seconds = params.step.as_deref().and_then(|s| s.parse::<u64>().ok()).unwrap_or(60);
	query.append_pipe(Pipe::StatsByTime { step_seconds, fields: Vec::new() });
	let ctx = QueryContext::new(tenants, query);
	let records = run_query(&state, &ctx).await?;
	Ok(ndjson_body(records).await.into_response())
}

/// `/select/logsql/facets` (spec.md §6): top field/value pairs over the
/// matched rows.
pub async fn facets(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
	let (tenants, mut query) = parse_request(&params)?;
	query.append_pipe(Pipe::Facets { limit: params.limit.unwrap_or(0) });
	let ctx = QueryContext::new(tenants, query);
	let records = run_query(&state, &ctx).await?;
	Ok(ndjson_body(records).await.into_response())
}

#[derive(Serialize)]
struct ValueWithHitsJson {
	value: String,
	hits: u64,
}

fn values_to_json(values: Vec<ValueWithHits>) -> Vec<ValueWithHitsJson> {
	values.into_iter().map(|v| ValueWithHitsJson { value: v.value, hits: v.hits }).collect()
}

macro_rules! catalog_handler {
	($name:ident, $executor_call:ident) => {
		pub async fn $name(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
			let (tenants, query) = parse_request(&params)?;
			let ctx = QueryContext::new(tenants, query);
			let values = state.executor.$executor_call(&ctx).await?;
			Ok(Json(values_to_json(values)).into_response())
		}
	};
}

catalog_handler!(field_names, field_names);
catalog_handler!(stream_field_names, stream_field_names);

macro_rules! catalog_handler_with_field {
	($name:ident, $executor_call:ident) => {
		pub async fn $name(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
			let field = params.field.clone().ok_or_else(|| AppError::BadRequest("missing field".to_string()))?;
			let limit = params.limit.unwrap_or(0);
			let (tenants, query) = parse_request(&params)?;
			let ctx = QueryContext::new(tenants, query);
			let values = state.executor.$executor_call(&ctx, &field, limit).await?;
			Ok(Json(values_to_json(values)).into_response())
		}
	};
}

catalog_handler_with_field!(field_values, field_values);
catalog_handler_with_field!(stream_field_values, stream_field_values);

macro_rules! catalog_handler_with_limit {
	($name:ident, $executor_call:ident) => {
		pub async fn $name(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
			let limit = params.limit.unwrap_or(0);
			let (tenants, query) = parse_request(&params)?;
			let ctx = QueryContext::new(tenants, query);
			let values = state.executor.$executor_call(&ctx, limit).await?;
			Ok(Json(values_to_json(values)).into_response())
		}
	};
}

catalog_handler_with_limit!(streams, streams);
catalog_handler_with_limit!(stream_ids, stream_ids);

#[derive(Serialize)]
struct PromEnvelope {
	status: &'static str,
	data: PromData,
}

#[derive(Serialize)]
struct PromData {
	#[serde(rename = "resultType")]
	result_type: &'static str,
	result: Vec<PromSeries>,
}

#[derive(Serialize)]
struct PromSeries {
	metric: serde_json::Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	value: Option<(i64, String)>,
	#[serde(skip_serializing_if = "Option::is_none")]
	values: Option<Vec<(i64, String)>>,
}

/// `/select/logsql/stats_query` (spec.md §6): a Prometheus-style instant
/// vector giving the total row count matched by the query. The LogsQL
/// stats-aggregation grammar itself is a non-goal (spec.md §1), so this
/// reports the row count the executor already computed rather than
/// evaluating an arbitrary aggregation expression.
pub async fn stats_query(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
	let (tenants, query) = parse_request(&params)?;
	let (_, end) = query.time_range();
	let ctx = QueryContext::new(tenants, query);
	let records = run_query(&state, &ctx).await?;
	let series = PromSeries {
		metric: serde_json::json!({}),
		value: Some((end / 1_000_000_000, records.len().to_string())),
		values: None,
	};
	Ok(Json(PromEnvelope { status: "success", data: PromData { result_type: "vector", result: vec![series] } }).into_response())
}

/// `/select/logsql/stats_query_range` (spec.md §6): a Prometheus-style
/// range matrix built from the same `stats_by_time` bucketing `hits` uses.
pub async fn stats_query_range(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
	let (tenants, mut query) = parse_request(&params)?;
	let step_seconds = params.step.as_deref().and_then(|s| s.parse::<u64>().ok()).unwrap_or(60);
	query.append_pipe(Pipe::StatsByTime { step_seconds, fields: Vec::new() });
	let ctx = QueryContext::new(tenants, query);
	let records = run_query(&state, &ctx).await?;
	let values: Vec<(i64, String)> = records
		.iter()
		.map(|r| (r.timestamp / 1_000_000_000, r.get("count").unwrap_or("0").to_string()))
		.collect();
	let series = PromSeries { metric: serde_json::json!({}), value: None, values: Some(values) };
	Ok(Json(PromEnvelope { status: "success", data: PromData { result_type: "matrix", result: vec![series] } }).into_response())
}

struct ExecutorTailRunner<'a> {
	executor: &'a Executor,
	tenants: Vec<TenantId>,
}

#[async_trait]
impl TailRunner for ExecutorTailRunner<'_> {
	async fn run(&self, query: &LogQuery) -> Result<Vec<Record>, TailError> {
		let ctx = QueryContext::new(self.tenants.clone(), query.clone());
		self.executor.query(&ctx).await.map_err(|e| TailError::QueryFailed(e.to_string()))
	}
}

/// Delivers each round's fresh rows down an mpsc channel backing the HTTP
/// response body; a send error means the client disconnected and the
/// receiver (and its `ReceiverStream`) was dropped (spec.md §9 "Live
/// tailing cancellation").
struct ChannelTailSink {
	tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

#[async_trait]
impl TailSink for ChannelTailSink {
	async fn emit(&mut self, rows: Vec<Record>) -> Result<(), TailError> {
		let mut buf = String::new();
		for line in ndjson_lines(&rows) {
			buf.push_str(&line);
			buf.push('\n');
		}
		self.tx
			.send(Ok(Bytes::from(buf)))
			.await
			.map_err(|e| TailError::SinkClosed(e.to_string()))
	}
}

fn ndjson_lines(records: &[Record]) -> Vec<String> {
	records
		.iter()
		.map(|r| {
			let mut map = serde_json::Map::new();
			for field in &r.fields {
				map.insert(field.name.clone(), serde_json::Value::String(field.value.clone()));
			}
			serde_json::to_string(&serde_json::Value::Object(map)).expect("row json never fails")
		})
		.collect()
}

/// `/select/logsql/tail` (spec.md §4.10, §6): a chunked NDJSON stream,
/// periodically re-running the query over a sliding window.
pub async fn tail(State(state): State<AppState>, AxumQuery(params): AxumQuery<CommonQueryParams>) -> Result<Response, AppError> {
	let (tenants, query) = parse_request(&params)?;
	if !query.can_live_tail() {
		return Err(AppError::BadRequest("query cannot be live-tailed".to_string()));
	}

	let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
	let executor = Arc::clone(&state.executor);
	let cancel = tokio_util::sync::CancellationToken::new();
	tokio::spawn(async move {
		let runner = ExecutorTailRunner { executor: &executor, tenants };
		let mut sink = ChannelTailSink { tx };
		let _ = run_tail(&query, &runner, &mut sink, &cancel, Duration::from_secs(0), Duration::from_secs(1)).await;
	});

	let body = Body::from_stream(ReceiverStream::new(rx));
	Ok(([(axum::http::header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn rec(ts: i64, fields: &[(&str, &str)]) -> Record {
		let mut r = Record::new(ts);
		for (name, value) in fields {
			r.add_field(*name, *value);
		}
		r
	}

	#[test]
	fn records_to_block_pads_missing_fields_with_empty_string() {
		let records = vec![rec(1, &[("a", "1")]), rec(2, &[("b", "2")])];
		let block = records_to_block(&records);
		let a = block.column("a").unwrap();
		assert_eq!(a.values.get(0), Some("1"));
		assert_eq!(a.values.get(1), Some(""));
	}

	#[tokio::test]
	async fn ndjson_body_emits_one_line_per_record() {
		let records = vec![rec(1, &[("_msg", "hello")]), rec(2, &[("_msg", "world")])];
		let body = ndjson_body(records).await;
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert_eq!(text.lines().count(), 2);
	}

	#[test]
	fn ndjson_lines_serializes_every_field() {
		let records = vec![rec(1, &[("_msg", "hi"), ("level", "info")])];
		let lines = ndjson_lines(&records);
		assert_eq!(lines.len(), 1);
		let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
		assert_eq!(parsed["_msg"], "hi");
		assert_eq!(parsed["level"], "info");
	}
}
