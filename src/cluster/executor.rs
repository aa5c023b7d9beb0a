//! The public entry point tying the splitter, fan-out, last-N optimizer and
//! local pipe execution together into one `Query -> Vec<Record>` call
//! (spec.md §4.4-§4.9), plus the catalog endpoints (`field_names`, ...).

use crate::cluster::context::QueryContext;
use crate::cluster::fanout::{merge_aggregate, run_query_fanout};
use crate::cluster::lastn::{last_n, LastNError, LastNRunner};
use crate::cluster::local_exec::apply_local_pipes;
use crate::cluster::remote_client::{RemoteClient, RemoteClientError, StorageNode};
use crate::cluster::splitter::{split_query, RunQuery, SplitError};
use async_trait::async_trait;
use common::{timeutil, Record, TenantId, ValueWithHits, FIELD_TIME};
use logql::Query;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
	#[error(transparent)]
	Split(#[from] SplitError),
	#[error(transparent)]
	Remote(#[from] RemoteClientError),
	#[error(transparent)]
	LastN(#[from] LastNError),
}

/// Runs the remote/local split and fan-out across every configured storage
/// node, without the last-N shortcut — the one path `Executor::query` and
/// the last-N adapter both eventually reduce to.
pub struct Executor {
	client: Arc<RemoteClient>,
	nodes: Vec<StorageNode>,
	disable_compression: bool,
}

impl Executor {
	pub fn new(client: Arc<RemoteClient>, nodes: Vec<StorageNode>, disable_compression: bool) -> Self {
		Self { client, nodes, disable_compression }
	}

	/// Entry point for a `/select/logsql/query`-style request: runs the
	/// last-N optimizer when the pipeline is exactly `sort by (_time) desc`
	/// (optionally `offset`/`limit`) (spec.md §4.9), otherwise the general
	/// split+fan-out+local-execution path.
	pub async fn query(&self, ctx: &QueryContext) -> Result<Vec<Record>, ExecutorError> {
		if let Some(limit) = ctx.query.can_return_last_n() {
			let adapter = LastNAdapter { executor: self, ctx };
			let rows = last_n(&ctx.query, 0, limit, &adapter).await?;
			return Ok(rows);
		}
		self.run_raw(ctx).await
	}

	/// The general path: subquery expansion, remote/local split, fan-out to
	/// every node, then the local pipe chain over the merged rows. Called
	/// directly by [`LastNAdapter`] so last-N's own probe queries (which
	/// match `can_return_last_n` themselves) never recurse back into
	/// [`Executor::query`].
	async fn run_raw(&self, ctx: &QueryContext) -> Result<Vec<Record>, ExecutorError> {
		let subquery_runner = SubqueryRunner { executor: self, tenants: ctx.tenants.clone() };
		let split = split_query(&ctx.query, &subquery_runner).await?;

		let remote_ctx = ctx.with_query(split.remote);
		let result = run_query_fanout(Arc::clone(&self.client), &remote_ctx, &self.nodes, self.disable_compression).await?;

		let records: Vec<Record> = result.blocks.iter().flat_map(|tagged| block_to_records(&tagged.block)).collect();
		Ok(apply_local_pipes(records, &split.local))
	}

	async fn catalog(
		&self,
		ctx: &QueryContext,
		endpoint: &str,
		field: Option<&str>,
		limit: u64,
	) -> Result<Vec<ValueWithHits>, ExecutorError> {
		let mut handles = Vec::with_capacity(self.nodes.len());
		for node in &self.nodes {
			let node = node.clone();
			let client = Arc::clone(&self.client);
			let tenants = ctx.tenants.clone();
			let query = ctx.query.clone();
			let cancel = ctx.cancel.clone();
			let endpoint = endpoint.to_string();
			let field = field.map(|f| f.to_string());
			let disable_compression = self.disable_compression;
			handles.push(tokio::spawn(async move {
				client
					.catalog(&node, &endpoint, &tenants, &query, field.as_deref(), limit, disable_compression, &cancel)
					.await
			}));
		}

		let mut per_node = Vec::with_capacity(handles.len());
		for handle in handles {
			let (values, stats) = handle.await.expect("catalog fan-out task panicked")?;
			ctx.stats.update_atomic(&stats);
			per_node.push(values);
		}
		Ok(merge_aggregate(&per_node, limit, false))
	}

	pub async fn field_names(&self, ctx: &QueryContext) -> Result<Vec<ValueWithHits>, ExecutorError> {
		self.catalog(ctx, "field_names", None, 0).await
	}

	pub async fn field_values(&self, ctx: &QueryContext, field: &str, limit: u64) -> Result<Vec<ValueWithHits>, ExecutorError> {
		self.catalog(ctx, "field_values", Some(field), limit).await
	}

	/// This model has no separate stream-tag field index distinct from the
	/// record's own fields (spec.md §9 "`_stream_id`"/stream-tag modeling):
	/// a stream's tags live in the same field set every other query reads,
	/// so the `stream_*` catalog endpoints alias the plain ones rather than
	/// hitting a second index that doesn't exist here.
	pub async fn stream_field_names(&self, ctx: &QueryContext) -> Result<Vec<ValueWithHits>, ExecutorError> {
		self.catalog(ctx, "stream_field_names", None, 0).await
	}

	pub async fn stream_field_values(&self, ctx: &QueryContext, field: &str, limit: u64) -> Result<Vec<ValueWithHits>, ExecutorError> {
		self.catalog(ctx, "stream_field_values", Some(field), limit).await
	}

	pub async fn streams(&self, ctx: &QueryContext, limit: u64) -> Result<Vec<ValueWithHits>, ExecutorError> {
		self.catalog(ctx, "streams", None, limit).await
	}

	pub async fn stream_ids(&self, ctx: &QueryContext, limit: u64) -> Result<Vec<ValueWithHits>, ExecutorError> {
		self.catalog(ctx, "stream_ids", None, limit).await
	}
}

fn block_to_records(block: &common::DataBlock) -> Vec<Record> {
	let mut out = Vec::with_capacity(block.row_count());
	for row in 0..block.row_count() {
		let mut record = Record::new(0);
		for col in &block.columns {
			if let Some(v) = col.values.get(row) {
				record.add_field(col.name.clone(), v.to_string());
			}
		}
		record.timestamp = record
			.get(FIELD_TIME)
			.and_then(|v| timeutil::parse_rfc3339_nsec(v).ok())
			.unwrap_or(0);
		out.push(record);
	}
	out
}

/// Resolves `in(subquery:...)` by treating the inner query's filter as a
/// `_msg` lookup against the same fan-out path (spec.md §9 "Subquery
/// expansion"): the opaque-filter model here carries no structural record
/// of which field a subquery enumerates, so `_msg` is the stand-in target.
struct SubqueryRunner<'a> {
	executor: &'a Executor,
	tenants: Vec<TenantId>,
}

#[async_trait]
impl RunQuery for SubqueryRunner<'_> {
	async fn run_query(&self, query: &Query) -> Result<Vec<String>, SplitError> {
		let ctx = QueryContext::new(self.tenants.clone(), query.clone());
		let values = self
			.executor
			.field_values(&ctx, "_msg", 0)
			.await
			.map_err(|e| SplitError::SubqueryFailed(e.to_string()))?;
		Ok(values.into_iter().map(|v| v.value).collect())
	}
}

/// Adapts [`Executor::run_raw`] to the last-N optimizer's abstract row
/// source.
struct LastNAdapter<'a> {
	executor: &'a Executor,
	ctx: &'a QueryContext,
}

#[async_trait]
impl LastNRunner for LastNAdapter<'_> {
	async fn run(&self, query: &Query) -> Result<Vec<Record>, LastNError> {
		let probe_ctx = self.ctx.with_query(query.clone());
		self.executor
			.run_raw(&probe_ctx)
			.await
			.map_err(|e| LastNError::QueryFailed(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use common::Column;
	use common::ColumnValues;
	use pretty_assertions::assert_eq;

	fn sample_block() -> common::DataBlock {
		common::DataBlock {
			columns: vec![
				Column {
					name: FIELD_TIME.to_string(),
					values: ColumnValues::Raw(vec![timeutil::format_rfc3339_nsec(1_000_000_000)]),
				},
				Column { name: "_msg".to_string(), values: ColumnValues::Raw(vec!["hi".to_string()]) },
			],
		}
	}

	#[test]
	fn block_to_records_parses_time_column_into_timestamp() {
		let records = block_to_records(&sample_block());
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].timestamp, 1_000_000_000);
		assert_eq!(records[0].get("_msg"), Some("hi"));
	}
}
