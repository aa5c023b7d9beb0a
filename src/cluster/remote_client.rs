//! Remote query client (spec.md §4.5): issues a request to one storage
//! node's `/internal/select/*` endpoints and decodes the frame stream.

use crate::cluster::wire::{read_frame, Unit, WireError};
use common::{marshal_tenant_ids, DataBlock, QueryStatsSnapshot, TenantId, ValueWithHits};
use logql::Query;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum RemoteClientError {
	#[error("upstream unavailable: {0}")]
	UpstreamUnavailable(String),
	#[error("non-OK status {status}: {body}")]
	NonOk { status: u16, body: String },
	#[error(transparent)]
	Wire(#[from] WireError),
	#[error("query cancelled")]
	Cancelled,
}

/// One storage node's address plus whether its `/internal/select/*`
/// endpoints are served over TLS. Deliberately flat (spec.md §9 "Cyclic
/// references"): the node does not hold a back-reference to its parent,
/// the caller passes the cluster-wide compression setting in at call time.
#[derive(Clone)]
pub struct StorageNode {
	pub addr: String,
	pub tls: bool,
}

pub struct RemoteClient {
	http: reqwest::Client,
}

impl RemoteClient {
	pub fn new(http: reqwest::Client) -> Self {
		Self { http }
	}

	/// Issues `/internal/select/query` and returns every data block plus
	/// the node's own query-stats block.
	pub async fn query(
		&self,
		node: &StorageNode,
		tenants: &[TenantId],
		query: &Query,
		disable_compression: bool,
		cancel: &CancellationToken,
	) -> Result<(Vec<DataBlock>, QueryStatsSnapshot), RemoteClientError> {
		let body = self
			.post(node, "query", tenants, query, disable_compression, cancel)
			.await?;
		let mut cursor = std::io::Cursor::new(body);
		let mut blocks = Vec::new();
		let mut stats = QueryStatsSnapshot::default();
		loop {
			match read_frame(&mut cursor, !disable_compression).await? {
				None => break,
				Some(units) => {
					for unit in units {
						match unit {
							Unit::Data(b) => blocks.push(b),
							Unit::Stats(s) => stats.merge(&s),
						}
					}
				}
			}
		}
		Ok((blocks, stats))
	}

	/// Issues one of the catalog endpoints (`field_names`, `field_values`,
	/// `stream_field_names`, `stream_field_values`, `streams`,
	/// `stream_ids`), which all share the simpler response wire format
	/// (spec.md §6): `u64_le count`, that many `ValueWithHits`, then one
	/// `QueryStats`-as-DataBlock, the whole payload optionally zstd-compressed.
	/// `field` and `limit` become `?field=...&limit=...` on the endpoints
	/// that take them (spec.md §6); unused by the others.
	#[allow(clippy::too_many_arguments)]
	pub async fn catalog(
		&self,
		node: &StorageNode,
		endpoint: &str,
		tenants: &[TenantId],
		query: &Query,
		field: Option<&str>,
		limit: u64,
		disable_compression: bool,
		cancel: &CancellationToken,
	) -> Result<(Vec<ValueWithHits>, QueryStatsSnapshot), RemoteClientError> {
		let mut path = endpoint.to_string();
		let mut qs = Vec::new();
		if let Some(field) = field {
			qs.push(format!("field={field}"));
		}
		if limit > 0 {
			qs.push(format!("limit={limit}"));
		}
		if !qs.is_empty() {
			path.push('?');
			path.push_str(&qs.join("&"));
		}
		let body = self
			.post(node, &path, tenants, query, disable_compression, cancel)
			.await?;
		let inner: Vec<u8> = if disable_compression {
			body
		} else {
			zstd::decode_all(&body[..]).map_err(|e| WireError::BadFrame(e.to_string()))?
		};
		if inner.len() < 8 {
			return Err(WireError::TruncatedStream.into());
		}
		let (values, tail) = ValueWithHits::unmarshal_list(&inner).map_err(|e| WireError::BadFrame(e.to_string()))?;
		let (stats_block, _) = DataBlock::unmarshal(tail).map_err(|e| WireError::BadFrame(e.to_string()))?;
		let stats = crate::cluster::wire::block_to_stats(&stats_block)?;
		Ok((values, stats))
	}

	async fn post(
		&self,
		node: &StorageNode,
		endpoint: &str,
		tenants: &[TenantId],
		query: &Query,
		disable_compression: bool,
		cancel: &CancellationToken,
	) -> Result<Vec<u8>, RemoteClientError> {
		let scheme = if node.tls { "https" } else { "http" };
		let url = format!("{scheme}://{}/internal/select/{endpoint}", node.addr);
		let params = [
			("version", PROTOCOL_VERSION.to_string()),
			("tenant_ids", marshal_tenant_ids(tenants)),
			("query", query.to_string()),
			("start", query.time_range().0.to_string()),
			("timestamp", query.time_range().1.to_string()),
			("disable_compression", disable_compression.to_string()),
		];

		let request = self.http.post(&url).form(&params).send();
		let response = tokio::select! {
			_ = cancel.cancelled() => return Err(RemoteClientError::Cancelled),
			r = request => r.map_err(|e| RemoteClientError::UpstreamUnavailable(e.to_string()))?,
		};

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(RemoteClientError::NonOk {
				status: status.as_u16(),
				body,
			});
		}
		response
			.bytes()
			.await
			.map(|b| b.to_vec())
			.map_err(|e| RemoteClientError::UpstreamUnavailable(e.to_string()))
	}
}
