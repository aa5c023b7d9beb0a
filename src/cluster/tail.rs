//! Live tailing (spec.md §4.10): a long-lived poll loop that re-issues the
//! same query over an advancing time window and delivers only rows each
//! per-stream bucket hasn't seen yet.

use async_trait::async_trait;
use common::{Record, FIELD_STREAM};
use logql::Query;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const START_OFFSET_NSEC: i64 = 5 * 1_000_000_000;

#[derive(Debug, Error)]
pub enum TailError {
	#[error("query execution failed: {0}")]
	QueryFailed(String),
	#[error("sink closed: {0}")]
	SinkClosed(String),
}

/// Executes one probe of the tailed query over the current window. Kept
/// independent of the fan-out layer for the same reason as
/// [`crate::cluster::LastNRunner`]: this module stays a pure algorithm over
/// an abstract row source.
#[async_trait]
pub trait TailRunner: Send + Sync {
	async fn run(&self, query: &Query) -> Result<Vec<Record>, TailError>;
}

/// Receives each round's freshly-delivered rows, e.g. a chunked HTTP
/// response writer. An error here (client disconnected) ends the loop.
#[async_trait]
pub trait TailSink: Send {
	async fn emit(&mut self, rows: Vec<Record>) -> Result<(), TailError>;
}

/// Per-stream delivery state: the window `[start, end]` for the next probe
/// and the last-seen timestamp per `_stream` bucket (spec.md §4.10 steps
/// 2-4). `_stream_id` in the original design is this model's `_stream`
/// canonical tag string — there is no separate numeric stream id here.
pub struct TailCursor {
	start: i64,
	end: i64,
	last_seen: HashMap<String, i64>,
}

impl TailCursor {
	pub fn new(start: i64, end: i64) -> Self {
		Self { start, end, last_seen: HashMap::new() }
	}

	pub fn window(&self) -> (i64, i64) {
		(self.start, self.end)
	}

	/// For each `_stream` bucket: sort by timestamp, drop rows at or before
	/// the last-seen timestamp, emit the remainder in order, and advance
	/// the bucket's last-seen timestamp. Cross-stream ordering of the
	/// returned rows is not meaningful (spec.md §4.10 "Properties").
	pub fn dedupe(&mut self, rows: Vec<Record>) -> Vec<Record> {
		let mut by_stream: HashMap<String, Vec<Record>> = HashMap::new();
		for row in rows {
			let key = row.get(FIELD_STREAM).unwrap_or("").to_string();
			by_stream.entry(key).or_default().push(row);
		}

		let mut out = Vec::new();
		for (stream, mut bucket) in by_stream {
			bucket.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
			let floor = self.last_seen.get(&stream).copied().unwrap_or(i64::MIN);
			let mut max_seen = floor;
			for row in bucket {
				if row.timestamp <= floor {
					continue;
				}
				max_seen = max_seen.max(row.timestamp);
				out.push(row);
			}
			if max_seen > floor {
				self.last_seen.insert(stream, max_seen);
			}
		}
		out
	}

	/// Advances the window for the next round: `start = old_end - 5s`,
	/// `end = new_end` (spec.md §4.10 step 4's "5 s lookback").
	pub fn advance(&mut self, new_end: i64) {
		self.start = self.end - START_OFFSET_NSEC;
		self.end = new_end;
	}
}

fn now_nsec() -> i64 {
	chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Drives the tail loop until `cancel` fires or the sink reports the client
/// went away. `offset` delays the tailed "now" to tolerate storage-side
/// ingestion lag (spec.md §4.10 step 1's `now - offset`).
pub async fn run_tail(
	base: &Query,
	runner: &dyn TailRunner,
	sink: &mut dyn TailSink,
	cancel: &CancellationToken,
	offset: Duration,
	poll_interval: Duration,
) -> Result<(), TailError> {
	let offset_nsec = offset.as_nanos() as i64;
	let end = now_nsec() - offset_nsec;
	let mut cursor = TailCursor::new(end - START_OFFSET_NSEC, end);

	loop {
		if cancel.is_cancelled() {
			return Ok(());
		}
		let (start, end) = cursor.window();
		let probe = base.clone_with_time_filter(start, end);
		let rows = tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			r = runner.run(&probe) => r?,
		};
		let fresh = cursor.dedupe(rows);
		if !fresh.is_empty() {
			sink.emit(fresh).await?;
		}

		let new_end = now_nsec() - offset_nsec;
		cursor.advance(new_end);

		tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			_ = tokio::time::sleep(poll_interval) => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex;

	fn record(stream: &str, ts: i64) -> Record {
		let mut r = Record::new(ts);
		r.add_field(FIELD_STREAM, stream);
		r.add_field("_msg", format!("row at {ts}"));
		r
	}

	#[test]
	fn dedupe_drops_rows_at_or_before_last_seen_per_stream() {
		let mut cursor = TailCursor::new(0, 100);
		let first = cursor.dedupe(vec![record("a", 10), record("a", 20), record("b", 5)]);
		assert_eq!(first.len(), 3);

		let second = cursor.dedupe(vec![record("a", 20), record("a", 30), record("b", 5)]);
		let timestamps: Vec<i64> = second.iter().map(|r| r.timestamp).collect();
		assert_eq!(timestamps, vec![30]);
	}

	#[test]
	fn dedupe_is_strictly_monotonic_per_stream() {
		let mut cursor = TailCursor::new(0, 100);
		cursor.dedupe(vec![record("a", 5)]);
		let next = cursor.dedupe(vec![record("a", 1), record("a", 2), record("a", 6)]);
		assert_eq!(next.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![6]);
	}

	#[test]
	fn advance_applies_five_second_lookback() {
		let mut cursor = TailCursor::new(0, 100);
		cursor.advance(200);
		assert_eq!(cursor.window(), (100 - START_OFFSET_NSEC, 200));
	}

	struct CountingRunner {
		calls: AtomicUsize,
		cancel_after: usize,
		cancel: CancellationToken,
	}

	#[async_trait]
	impl TailRunner for CountingRunner {
		async fn run(&self, query: &Query) -> Result<Vec<Record>, TailError> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
			if n >= self.cancel_after {
				self.cancel.cancel();
			}
			let (start, _) = query.time_range();
			Ok(vec![record("s1", start + 1)])
		}
	}

	struct CollectingSink {
		received: Mutex<Vec<Record>>,
	}

	#[async_trait]
	impl TailSink for CollectingSink {
		async fn emit(&mut self, rows: Vec<Record>) -> Result<(), TailError> {
			self.received.lock().unwrap().extend(rows);
			Ok(())
		}
	}

	#[tokio::test]
	async fn run_tail_stops_once_cancelled_and_delivers_rows() {
		let cancel = CancellationToken::new();
		let runner = CountingRunner {
			calls: AtomicUsize::new(0),
			cancel_after: 3,
			cancel: cancel.clone(),
		};
		let mut sink = CollectingSink { received: Mutex::new(Vec::new()) };
		let base = Query::new("*", 0, 1_000_000_000);
		run_tail(&base, &runner, &mut sink, &cancel, Duration::ZERO, Duration::from_millis(1))
			.await
			.unwrap();
		assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
		assert_eq!(sink.received.lock().unwrap().len(), 3);
	}

	#[tokio::test]
	async fn run_tail_returns_immediately_when_already_cancelled() {
		let cancel = CancellationToken::new();
		cancel.cancel();
		let runner = CountingRunner {
			calls: AtomicUsize::new(0),
			cancel_after: usize::MAX,
			cancel: cancel.clone(),
		};
		let mut sink = CollectingSink { received: Mutex::new(Vec::new()) };
		let base = Query::new("*", 0, 1_000_000_000);
		run_tail(&base, &runner, &mut sink, &cancel, Duration::ZERO, Duration::from_millis(1))
			.await
			.unwrap();
		assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
	}
}
