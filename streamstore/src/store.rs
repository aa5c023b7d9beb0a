//! The `Store` collaborator interface and an in-memory reference
//! implementation.
//!
//! spec.md's Non-goals explicitly put the on-disk columnar storage engine
//! out of scope: "no persistence schema design ... no on-disk columnar
//! storage engine". What remains in scope is everything that calls into
//! storage — the ingest pipeline's admission/write path, and the query
//! layer's execute/catalog calls — so `Store` models exactly that boundary.
//! [`InMemoryStore`] is grounded on this crate's original `StreamStore`
//! (string-interned label index, cleanup-on-overflow), generalized from
//! bare label sets to full [`Record`]s with a filter and time range.

use crate::filter;
use async_trait::async_trait;
use common::{
	timeutil, Column, ColumnValues, DataBlock, QueryStatsSnapshot, Record, TenantId, ValueWithHits,
	FIELD_STREAM, FIELD_TIME,
};
use dashmap::DashMap;
use logql::{Pipe, Query};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store overloaded, try again later")]
	Overloaded,
	#[error("store internal error: {0}")]
	Internal(String),
}

/// One execution of a query against the store: the matched rows, already
/// partitioned by an arbitrary worker id the way a real multi-threaded
/// storage node would hand blocks to per-worker callbacks (spec.md §5 —
/// "callers receive a distinct worker ID per thread and must use it to
/// partition state"), plus the stats this execution accumulated.
#[derive(Debug, Clone, Default)]
pub struct QueryExecution {
	pub blocks: Vec<(usize, DataBlock)>,
	pub stats: QueryStatsSnapshot,
}

impl QueryExecution {
	pub fn row_count(&self) -> usize {
		self.blocks.iter().map(|(_, b)| b.row_count()).sum()
	}

	/// Flattens all blocks' rows into `Record`s, for callers (like the
	/// last-N optimizer) that need to reason about individual rows rather
	/// than column batches.
	pub fn into_records(self) -> Vec<Record> {
		let mut out = Vec::with_capacity(self.row_count());
		for (_, block) in self.blocks {
			out.extend(block_to_records(&block));
		}
		out
	}
}

fn block_to_records(block: &DataBlock) -> Vec<Record> {
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

fn record_to_block(records: &[Record]) -> DataBlock {
	let mut names: Vec<String> = Vec::new();
	for r in records {
		for f in &r.fields {
			if !names.contains(&f.name) {
				names.push(f.name.clone());
			}
		}
	}
	let columns = names
		.into_iter()
		.map(|name| {
			let values = records
				.iter()
				.map(|r| r.get(&name).unwrap_or_default().to_string())
				.collect::<Vec<_>>();
			Column {
				name,
				values: ColumnValues::encode_best(values),
			}
		})
		.collect();
	DataBlock { columns }
}

/// The storage-side collaborator: everything the ingest pipeline writes
/// into and the query layer reads from. Modeled as a trait so the cluster
/// and ingest code never depends on a concrete storage engine (spec.md §1
/// Non-goals).
#[async_trait]
pub trait Store: Send + Sync {
	async fn write(&self, tenant: TenantId, records: Vec<Record>) -> Result<(), StoreError>;
	async fn execute(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
	) -> Result<QueryExecution, StoreError>;
	async fn field_names(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
	) -> Result<Vec<ValueWithHits>, StoreError>;
	async fn field_values(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
		field: &str,
		limit: u64,
	) -> Result<Vec<ValueWithHits>, StoreError>;
	async fn streams(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
		limit: u64,
	) -> Result<Vec<ValueWithHits>, StoreError>;
	/// Admission check for ingest (spec.md §4.3 pipeline stage 1): `false`
	/// means the store is under pressure and new writes must be refused.
	fn admit_write(&self) -> bool {
		true
	}
}

const DEFAULT_MAX_ROWS_PER_TENANT: usize = 2_000_000;

pub struct InMemoryStore {
	rows: DashMap<TenantId, RwLock<Vec<Record>>>,
	max_rows_per_tenant: usize,
}

impl Default for InMemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_MAX_ROWS_PER_TENANT)
	}

	pub fn with_capacity(max_rows_per_tenant: usize) -> Self {
		Self {
			rows: DashMap::new(),
			max_rows_per_tenant,
		}
	}

	fn matching_rows(&self, tenant_ids: &[TenantId], query: &Query) -> (Vec<Record>, u64) {
		let (start, end) = query.time_range();
		let mut scanned: u64 = 0;
		let mut matched = Vec::new();
		for tenant in tenant_ids {
			let Some(bucket) = self.rows.get(tenant) else {
				continue;
			};
			let guard = bucket.read().unwrap();
			for record in guard.iter() {
				if record.timestamp < start || record.timestamp > end {
					continue;
				}
				scanned += 1;
				if filter::matches(record, query.filter()) {
					matched.push(record.clone());
				}
			}
		}
		(matched, scanned)
	}
}

#[async_trait]
impl Store for InMemoryStore {
	async fn write(&self, tenant: TenantId, records: Vec<Record>) -> Result<(), StoreError> {
		if !self.admit_write() {
			return Err(StoreError::Overloaded);
		}
		let bucket = self.rows.entry(tenant).or_insert_with(|| RwLock::new(Vec::new()));
		let mut guard = bucket.write().unwrap();
		guard.extend(records);
		if guard.len() > self.max_rows_per_tenant {
			let overflow = guard.len() - self.max_rows_per_tenant;
			guard.drain(0..overflow);
		}
		Ok(())
	}

	async fn execute(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
	) -> Result<QueryExecution, StoreError> {
		let (mut matched, scanned) = self.matching_rows(tenant_ids, query);
		let rows_found = matched.len() as u64;

		if query.pipes().contains(&Pipe::SortTimeDesc) {
			matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
		}
		for pipe in query.pipes() {
			if let Pipe::OffsetLimit { offset, limit } = pipe {
				let offset = *offset as usize;
				let limit = *limit as usize;
				matched = matched.into_iter().skip(offset).take(limit).collect();
			}
		}
		if let Some(needed) = query.needed_columns() {
			if !needed.is_empty() {
				for record in &mut matched {
					record.fields.retain(|f| needed.contains(&f.name));
				}
			}
		}

		let bytes_read_values: u64 = matched
			.iter()
			.map(|r| r.fields.iter().map(|f| f.value.len() as u64).sum::<u64>())
			.sum();

		// Split rows across two pseudo-workers so downstream code (and
		// tests) that partitions by worker id sees a realistic shape,
		// without this reference store needing real threads.
		let (even, odd): (Vec<_>, Vec<_>) = matched
			.into_iter()
			.enumerate()
			.partition(|(i, _)| i % 2 == 0);
		let mut blocks = Vec::new();
		let evens: Vec<Record> = even.into_iter().map(|(_, r)| r).collect();
		let odds: Vec<Record> = odd.into_iter().map(|(_, r)| r).collect();
		if !evens.is_empty() {
			blocks.push((0, record_to_block(&evens)));
		}
		if !odds.is_empty() {
			blocks.push((1, record_to_block(&odds)));
		}

		Ok(QueryExecution {
			blocks,
			stats: QueryStatsSnapshot {
				rows_processed: scanned,
				rows_found,
				bytes_read_values,
				blocks_processed: 1,
				..Default::default()
			},
		})
	}

	async fn field_names(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
	) -> Result<Vec<ValueWithHits>, StoreError> {
		let (matched, _) = self.matching_rows(tenant_ids, query);
		let mut hits: Vec<ValueWithHits> = Vec::new();
		for record in &matched {
			for field in &record.fields {
				match hits.iter_mut().find(|vh| vh.value == field.name) {
					Some(vh) => vh.hits += 1,
					None => hits.push(ValueWithHits::new(field.name.clone(), 1)),
				}
			}
		}
		hits.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.value.cmp(&b.value)));
		Ok(hits)
	}

	async fn field_values(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
		field: &str,
		limit: u64,
	) -> Result<Vec<ValueWithHits>, StoreError> {
		let (matched, _) = self.matching_rows(tenant_ids, query);
		let mut hits: Vec<ValueWithHits> = Vec::new();
		for record in &matched {
			let Some(value) = record.get(field) else {
				continue;
			};
			match hits.iter_mut().find(|vh| vh.value == value) {
				Some(vh) => vh.hits += 1,
				None => hits.push(ValueWithHits::new(value.to_string(), 1)),
			}
		}
		hits.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.value.cmp(&b.value)));
		if limit > 0 {
			hits.truncate(limit as usize);
		}
		Ok(hits)
	}

	async fn streams(
		&self,
		tenant_ids: &[TenantId],
		query: &Query,
		limit: u64,
	) -> Result<Vec<ValueWithHits>, StoreError> {
		self.field_values(tenant_ids, query, FIELD_STREAM, limit).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use common::Record;
	use pretty_assertions::assert_eq;

	fn tenant() -> TenantId {
		TenantId::new(1, 1)
	}

	fn record(ts: i64, level: &str) -> Record {
		let mut r = Record::new(ts);
		r.add_field("_time", timeutil::format_rfc3339_nsec(ts));
		r.add_field("level", level);
		r.add_field("_msg", format!("event at {ts}"));
		r
	}

	#[tokio::test]
	async fn write_then_execute_roundtrips_matching_rows() {
		let store = InMemoryStore::new();
		store
			.write(tenant(), vec![record(1_000_000_000, "error"), record(2_000_000_000, "info")])
			.await
			.unwrap();

		let query = Query::new("level:error", 0, 3_000_000_000);
		let exec = store.execute(&[tenant()], &query).await.unwrap();
		assert_eq!(exec.row_count(), 1);
		assert_eq!(exec.stats.rows_processed, 2);
		assert_eq!(exec.stats.rows_found, 1);
	}

	#[tokio::test]
	async fn sort_time_desc_and_offset_limit_pipes_are_applied() {
		let store = InMemoryStore::new();
		let records: Vec<Record> = (0..5)
			.map(|i| record(i * 1_000_000_000, "info"))
			.collect();
		store.write(tenant(), records).await.unwrap();

		let mut query = Query::new("*", 0, 10_000_000_000);
		query.append_pipe(Pipe::SortTimeDesc);
		query.append_pipe(Pipe::OffsetLimit { offset: 0, limit: 2 });
		let exec = store.execute(&[tenant()], &query).await.unwrap();
		let rows = exec.into_records();
		assert_eq!(rows.len(), 2);
		assert!(rows[0].timestamp > rows[1].timestamp);
	}

	#[tokio::test]
	async fn field_values_counts_hits_per_distinct_value() {
		let store = InMemoryStore::new();
		store
			.write(
				tenant(),
				vec![record(1, "error"), record(2, "error"), record(3, "info")],
			)
			.await
			.unwrap();
		let query = Query::new("*", 0, 10);
		let values = store.field_values(&[tenant()], &query, "level", 0).await.unwrap();
		assert_eq!(values, vec![ValueWithHits::new("error", 2), ValueWithHits::new("info", 1)]);
	}

	#[tokio::test]
	async fn capacity_overflow_drops_oldest_rows() {
		let store = InMemoryStore::with_capacity(3);
		store
			.write(
				tenant(),
				(0..5).map(|i| record(i, "info")).collect(),
			)
			.await
			.unwrap();
		let query = Query::new("*", 0, 10);
		let exec = store.execute(&[tenant()], &query).await.unwrap();
		assert_eq!(exec.row_count(), 3);
	}
}
