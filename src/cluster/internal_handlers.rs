//! The storage-node side of the internal cluster protocol (spec.md §6
//! "Internal cluster endpoints"). This binary plays both roles at once: its
//! own [`crate::cluster::Executor`] talks to configured storage nodes as a
//! client (`remote_client.rs`), and one of those configured nodes may well
//! be this binary's own bind address, answering the same endpoints out of
//! the local [`streamstore::Store`]. Real storage-node internals (column
//! headers, bloom filters, block layout) are out of scope (spec.md §1); what
//! remains in scope is the HTTP surface and wire encoding these handlers
//! implement.

use crate::cluster::http_params::check_protocol_version;
use crate::cluster::wire;
use crate::errors::AppError;
use crate::state::AppState;
use axum::extract::{Query as AxumQuery, State};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use common::{parse_tenant_ids, DataBlock, QueryStatsSnapshot, ValueWithHits};
use logql::Query as LogQuery;
use serde::Deserialize;

/// The form body every `/internal/select/*` endpoint shares (spec.md §6
/// "Common parameters"), matching exactly what `remote_client.rs::post`
/// sends.
#[derive(Debug, Deserialize)]
pub struct InternalForm {
	pub version: String,
	pub tenant_ids: String,
	pub query: String,
	pub start: i64,
	pub timestamp: i64,
	#[serde(default)]
	pub disable_compression: bool,
}

/// `?field=<name>&limit=<n>`, present on the endpoints that take them
/// (spec.md §6); absent/default on the others.
#[derive(Debug, Deserialize, Default)]
pub struct CatalogParams {
	pub field: Option<String>,
	pub limit: Option<u64>,
}

fn build_query(form: &InternalForm) -> Result<(Vec<common::TenantId>, LogQuery), AppError> {
	check_protocol_version(&form.version)?;
	let tenants = parse_tenant_ids(&form.tenant_ids).map_err(|e| AppError::BadRequest(e.to_string()))?;
	let mut query: LogQuery = form.query.parse()?;
	query.set_filter_time_range(form.start, form.timestamp);
	Ok((tenants, query))
}

/// Encodes the `/internal/select/query` response body (spec.md §4.5): one
/// frame carrying every matched data block plus the trailing query-stats
/// block.
pub async fn query(
	State(state): State<AppState>,
	axum::extract::Form(form): axum::extract::Form<InternalForm>,
) -> Result<Response, AppError> {
	let (tenants, query) = build_query(&form)?;
	let execution = state.store.execute(&tenants, &query).await?;
	let blocks: Vec<DataBlock> = execution.blocks.into_iter().map(|(_, block)| block).collect();
	let frame = wire::encode_frame(&blocks, Some(&execution.stats), !form.disable_compression);
	Ok(([(axum::http::header::CONTENT_TYPE, "application/octet-stream")], frame).into_response())
}

/// Encodes a catalog-endpoint response body (spec.md §6): `u64_le count`,
/// that many [`ValueWithHits`], then one query-stats block, the whole
/// payload zstd-compressed unless disabled. `Store`'s catalog calls carry no
/// stats of their own (unlike `execute`), so these responses ship a zeroed
/// stats block — the aggregate endpoints never read bytes/rows counters off
/// it, only `execute`'s callers do.
fn catalog_body(values: &[ValueWithHits], compress: bool) -> Bytes {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&ValueWithHits::marshal_list(values));
	wire::stats_to_block(&QueryStatsSnapshot::default()).marshal(&mut buf);
	let payload = buf.freeze();
	if compress {
		Bytes::from(zstd::encode_all(&payload[..], 0).expect("zstd encode never fails on an in-memory buffer"))
	} else {
		payload
	}
}

pub async fn field_names(
	State(state): State<AppState>,
	axum::extract::Form(form): axum::extract::Form<InternalForm>,
) -> Result<Response, AppError> {
	let (tenants, query) = build_query(&form)?;
	let values = state.store.field_names(&tenants, &query).await?;
	let body = catalog_body(&values, !form.disable_compression);
	Ok(([(axum::http::header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

pub async fn field_values(
	State(state): State<AppState>,
	AxumQuery(params): AxumQuery<CatalogParams>,
	axum::extract::Form(form): axum::extract::Form<InternalForm>,
) -> Result<Response, AppError> {
	let (tenants, query) = build_query(&form)?;
	let field = params.field.ok_or_else(|| AppError::BadRequest("missing field".to_string()))?;
	let values = state.store.field_values(&tenants, &query, &field, params.limit.unwrap_or(0)).await?;
	let body = catalog_body(&values, !form.disable_compression);
	Ok(([(axum::http::header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

/// This model carries stream tags in the same field set as every other
/// record field (spec.md §9, mirrored by `executor.rs`'s catalog aliasing),
/// so `stream_field_names`/`stream_field_values`/`stream_ids` alias the
/// plain field/stream catalog calls rather than a second index.
pub async fn stream_field_names(state: State<AppState>, form: axum::extract::Form<InternalForm>) -> Result<Response, AppError> {
	field_names(state, form).await
}

pub async fn stream_field_values(
	state: State<AppState>,
	params: AxumQuery<CatalogParams>,
	form: axum::extract::Form<InternalForm>,
) -> Result<Response, AppError> {
	field_values(state, params, form).await
}

pub async fn streams(
	State(state): State<AppState>,
	AxumQuery(params): AxumQuery<CatalogParams>,
	axum::extract::Form(form): axum::extract::Form<InternalForm>,
) -> Result<Response, AppError> {
	let (tenants, query) = build_query(&form)?;
	let values = state.store.streams(&tenants, &query, params.limit.unwrap_or(0)).await?;
	let body = catalog_body(&values, !form.disable_compression);
	Ok(([(axum::http::header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

pub async fn stream_ids(state: State<AppState>, params: AxumQuery<CatalogParams>, form: axum::extract::Form<InternalForm>) -> Result<Response, AppError> {
	streams(state, params, form).await
}
