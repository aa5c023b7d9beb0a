//! Last-N optimizer (spec.md §4.9): returns the N most recent rows
//! matching a query without scanning its full time range, using an
//! exponential/binary-search narrowing of the window.

use async_trait::async_trait;
use common::Record;
use logql::{Pipe, Query};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LastNError {
	#[error("query execution failed: {0}")]
	QueryFailed(String),
}

/// Executes one probe of the query at a given time window, returning the
/// matching rows. Kept independent of the storage/fan-out layer so this
/// module stays a pure algorithm over an abstract row source.
#[async_trait]
pub trait LastNRunner: Send + Sync {
	async fn run(&self, query: &Query) -> Result<Vec<Record>, LastNError>;
}

fn probe_query(base: &Query, start: i64, end: i64, probe_limit: u64) -> Query {
	let mut q = Query::new(base.filter().to_string(), start, end);
	q.append_pipe(Pipe::SortTimeDesc);
	q.append_pipe(Pipe::OffsetLimit { offset: 0, limit: probe_limit });
	q
}

fn last_n_rows(mut rows: Vec<Record>, limit: u64) -> Vec<Record> {
	rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
	rows.truncate(limit as usize);
	rows
}

/// Runs the narrowing search for the `limit` most recent rows over the
/// full window (spec.md §4.9 algorithm steps 1-4).
async fn last_n_query_results(base: &Query, limit: u64, runner: &dyn LastNRunner) -> Result<Vec<Record>, LastNError> {
	if limit == 0 {
		return Ok(Vec::new());
	}

	let (orig_start, orig_end) = base.time_range();

	// Fast path: the requested window already holds at most 2*limit rows.
	let fast = probe_query(base, orig_start, orig_end, 2 * limit);
	let rows = runner.run(&fast).await?;
	if (rows.len() as u64) < 2 * limit {
		return Ok(last_n_rows(rows, limit));
	}

	// Slow path: binary search for a sub-range holding roughly `limit` rows.
	let mut start = orig_start;
	let mut end = orig_end;
	let mut d = end / 2 - start / 2;
	start += d;
	let mut n = limit;

	let mut rows_found: Vec<Record> = Vec::new();
	let mut last_non_empty_rows: Vec<Record> = Vec::new();

	loop {
		let probe = probe_query(base, start, end, 2 * n);
		let rows = runner.run(&probe).await?;

		if d == 0 || start >= end {
			rows_found.extend(rows);
			rows_found.extend(last_non_empty_rows);
			return Ok(last_n_rows(rows_found, limit));
		}

		let d_last_bit = d & 1;
		d /= 2;

		if rows.len() as u64 >= 2 * n {
			// Range still too wide: narrow it from the left and remember
			// this round's rows in case the next one comes back empty.
			start += d;
			last_non_empty_rows = rows;
			continue;
		}
		if rows.len() as u64 >= n {
			// This range holds exactly the rows with the largest remaining
			// timestamps.
			rows_found.extend(rows);
			return Ok(last_n_rows(rows_found, limit));
		}

		// Range too narrow: keep what it found and extend the search
		// window to the left of it.
		rows_found.extend(rows);
		n -= rows.len() as u64;
		end = start - 1;
		start -= d + d_last_bit;
	}
}

/// Public entry point: returns rows `[offset, offset+limit)` of the N most
/// recent rows matching `base`, where N = offset + limit.
pub async fn last_n(base: &Query, offset: u64, limit: u64, runner: &dyn LastNRunner) -> Result<Vec<Record>, LastNError> {
	let total = offset + limit;
	let mut rows = last_n_query_results(base, total, runner).await?;
	if (rows.len() as u64) > offset {
		rows = rows.split_off(offset as usize);
	} else {
		rows.clear();
	}
	Ok(rows)
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::sync::atomic::{AtomicUsize, Ordering};

	/// A runner backed by a fixed in-memory row set, answering each probe
	/// by filtering on the probe's own time range and obeying its limit,
	/// so the algorithm's narrowing behavior is exercised exactly as it
	/// would be against a real store.
	struct FixedRowsRunner {
		rows: Vec<Record>,
		calls: AtomicUsize,
	}

	impl FixedRowsRunner {
		fn new(rows: Vec<Record>) -> Self {
			Self { rows, calls: AtomicUsize::new(0) }
		}
	}

	#[async_trait]
	impl LastNRunner for FixedRowsRunner {
		async fn run(&self, query: &Query) -> Result<Vec<Record>, LastNError> {
			self.calls.fetch_add(1, Ordering::Relaxed);
			let (start, end) = query.time_range();
			let limit = match query.pipes() {
				[Pipe::SortTimeDesc, Pipe::OffsetLimit { limit, .. }] => *limit,
				_ => u64::MAX,
			};
			let mut matching: Vec<Record> = self
				.rows
				.iter()
				.filter(|r| r.timestamp >= start && r.timestamp <= end)
				.cloned()
				.collect();
			matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
			matching.truncate(limit as usize);
			Ok(matching)
		}
	}

	fn make_rows(timestamps: &[i64]) -> Vec<Record> {
		timestamps
			.iter()
			.map(|&t| {
				let mut r = Record::new(t);
				r.add_field("_msg", format!("row at {t}"));
				r
			})
			.collect()
	}

	#[tokio::test]
	async fn fast_path_returns_n_most_recent_when_window_is_sparse() {
		let rows = make_rows(&[10, 20, 30, 40, 50]);
		let runner = FixedRowsRunner::new(rows);
		let base = Query::new("*", 0, 100);
		let result = last_n(&base, 0, 3, &runner).await.unwrap();
		let timestamps: Vec<i64> = result.iter().map(|r| r.timestamp).collect();
		assert_eq!(timestamps, vec![50, 40, 30]);
		assert_eq!(runner.calls.load(Ordering::Relaxed), 1);
	}

	#[tokio::test]
	async fn result_order_is_strictly_descending_by_timestamp() {
		let rows = make_rows(&[1, 2, 3, 4, 5, 6, 7, 8]);
		let runner = FixedRowsRunner::new(rows);
		let base = Query::new("*", 0, 10);
		let result = last_n(&base, 0, 4, &runner).await.unwrap();
		let timestamps: Vec<i64> = result.iter().map(|r| r.timestamp).collect();
		assert_eq!(timestamps, vec![8, 7, 6, 5]);
		assert!(timestamps.windows(2).all(|w| w[0] > w[1]));
	}

	#[tokio::test]
	async fn offset_skips_the_most_recent_rows() {
		let rows = make_rows(&[10, 20, 30, 40, 50]);
		let runner = FixedRowsRunner::new(rows);
		let base = Query::new("*", 0, 100);
		let result = last_n(&base, 2, 2, &runner).await.unwrap();
		let timestamps: Vec<i64> = result.iter().map(|r| r.timestamp).collect();
		assert_eq!(timestamps, vec![30, 20]);
	}

	#[tokio::test]
	async fn slow_path_narrows_window_over_a_dense_time_range() {
		// 500 rows spread evenly over a wide range: the fast path's probe
		// of 2*limit rows will be exceeded, forcing the binary search.
		let timestamps: Vec<i64> = (0..500).map(|i| i * 1_000_000).collect();
		let rows = make_rows(&timestamps);
		let runner = FixedRowsRunner::new(rows);
		let base = Query::new("*", 0, 500_000_000);
		let result = last_n(&base, 0, 10, &runner).await.unwrap();
		let result_ts: Vec<i64> = result.iter().map(|r| r.timestamp).collect();
		let mut expected: Vec<i64> = timestamps.clone();
		expected.sort_by(|a, b| b.cmp(a));
		expected.truncate(10);
		assert_eq!(result_ts, expected);
		assert!(runner.calls.load(Ordering::Relaxed) > 1);
	}

	#[tokio::test]
	async fn requesting_zero_rows_runs_no_queries() {
		let rows = make_rows(&[1, 2, 3]);
		let runner = FixedRowsRunner::new(rows);
		let base = Query::new("*", 0, 10);
		let result = last_n(&base, 0, 0, &runner).await.unwrap();
		assert!(result.is_empty());
		assert_eq!(runner.calls.load(Ordering::Relaxed), 0);
	}
}
