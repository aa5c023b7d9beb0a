//! Local streaming writer (spec.md §4.7): the HTTP handler's output path,
//! writing either the binary cluster wire format or NDJSON, one worker at
//! a time into buffers that flush through a single shared, mutex-guarded
//! sink so frames and lines stay atomic on the wire.

use crate::cluster::wire;
use bytes::BytesMut;
use common::{DataBlock, QueryStatsSnapshot};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

const BINARY_FLUSH_THRESHOLD: usize = 1024 * 1024;
const NDJSON_FLUSH_THRESHOLD: usize = 16 * 1024;

/// A sink shared by every per-worker buffer, serializing writes so two
/// workers flushing at once never interleave their bytes mid-frame/line.
pub struct SharedSink<W> {
	inner: Arc<Mutex<W>>,
}

impl<W> Clone for SharedSink<W> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<W: AsyncWrite + Unpin + Send> SharedSink<W> {
	pub fn new(writer: W) -> Self {
		Self { inner: Arc::new(Mutex::new(writer)) }
	}

	async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.write_all(bytes).await
	}

	/// Unwraps back to the inner writer once every clone of this sink (e.g.
	/// a worker that consumed one via `finish`) has been dropped. Used by
	/// one-shot in-memory sinks that buffer a whole response before handing
	/// it back to the caller.
	pub fn into_inner(self) -> W {
		Arc::try_unwrap(self.inner)
			.ok()
			.expect("into_inner called while another SharedSink clone is still alive")
			.into_inner()
	}
}

/// A worker-local accumulator for the binary cluster protocol. Each worker
/// (one per matched block-producing thread on the storage side) owns one
/// of these; nothing here is shared except the final write.
pub struct BinaryWorker<W> {
	sink: SharedSink<W>,
	buf: BytesMut,
	compress: bool,
}

impl<W: AsyncWrite + Unpin + Send> BinaryWorker<W> {
	pub fn new(sink: SharedSink<W>, compress: bool) -> Self {
		Self { sink, buf: BytesMut::new(), compress }
	}

	/// Marshals `block` into this worker's buffer, flushing if the buffer
	/// has crossed the 1 MiB threshold.
	pub async fn write_block(&mut self, block: &DataBlock) -> std::io::Result<()> {
		wire::append_data_unit(&mut self.buf, block);
		if self.buf.len() >= BINARY_FLUSH_THRESHOLD {
			self.flush().await?;
		}
		Ok(())
	}

	async fn flush(&mut self) -> std::io::Result<()> {
		if self.buf.is_empty() {
			return Ok(());
		}
		let payload = self.buf.split();
		let frame = wire::encode_raw_frame(&payload, self.compress);
		self.sink.write_all(&frame).await
	}

	/// Flushes any buffered blocks, then writes the query-stats frame.
	/// Called once per request, after every worker has finished.
	pub async fn finish(mut self, stats: &QueryStatsSnapshot) -> std::io::Result<()> {
		self.flush().await?;
		let mut stats_buf = BytesMut::new();
		wire::append_stats_unit(&mut stats_buf, stats);
		let frame = wire::encode_raw_frame(&stats_buf, self.compress);
		self.sink.write_all(&frame).await
	}
}

fn block_to_ndjson_lines(block: &DataBlock) -> Vec<String> {
	let mut lines = Vec::with_capacity(block.row_count());
	for row in 0..block.row_count() {
		let mut map = Map::new();
		for col in &block.columns {
			if let Some(v) = col.values.get(row) {
				map.insert(col.name.clone(), Value::String(v.to_string()));
			}
		}
		// Object construction from already-valid UTF-8 column values never
		// fails to serialize.
		lines.push(serde_json::to_string(&Value::Object(map)).expect("row json never fails"));
	}
	lines
}

/// A worker-local accumulator for NDJSON output.
pub struct NdjsonWorker<W> {
	sink: SharedSink<W>,
	buf: String,
}

impl<W: AsyncWrite + Unpin + Send> NdjsonWorker<W> {
	pub fn new(sink: SharedSink<W>) -> Self {
		Self { sink, buf: String::new() }
	}

	/// Appends one JSON line per row of `block`, flushing whenever the
	/// buffer crosses the 16 KiB boundary between lines (never mid-line).
	pub async fn write_block(&mut self, block: &DataBlock) -> std::io::Result<()> {
		for line in block_to_ndjson_lines(block) {
			self.buf.push_str(&line);
			self.buf.push('\n');
			if self.buf.len() >= NDJSON_FLUSH_THRESHOLD {
				self.flush().await?;
			}
		}
		Ok(())
	}

	async fn flush(&mut self) -> std::io::Result<()> {
		if self.buf.is_empty() {
			return Ok(());
		}
		let chunk = std::mem::take(&mut self.buf);
		self.sink.write_all(chunk.as_bytes()).await
	}

	pub async fn finish(mut self) -> std::io::Result<()> {
		self.flush().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use common::{Column, ColumnValues, FIELD_TIME};
	use pretty_assertions::assert_eq;

	fn sample_block(value: &str) -> DataBlock {
		DataBlock {
			columns: vec![
				Column { name: FIELD_TIME.to_string(), values: ColumnValues::Raw(vec!["2024-01-01T00:00:00Z".into()]) },
				Column { name: "_msg".to_string(), values: ColumnValues::Raw(vec![value.to_string()]) },
			],
		}
	}

	#[tokio::test]
	async fn binary_worker_flushes_past_threshold_and_appends_stats_on_finish() {
		let out: Vec<u8> = Vec::new();
		let sink = SharedSink::new(out);
		let mut worker = BinaryWorker::new(sink.clone(), false);
		for _ in 0..5 {
			worker.write_block(&sample_block("hello")).await.unwrap();
		}
		worker.finish(&QueryStatsSnapshot { rows_processed: 5, ..Default::default() }).await.unwrap();

		let written = sink.inner.lock().await;
		// At least one data frame and the trailing stats frame were written.
		assert!(written.len() > 8);
	}

	#[tokio::test]
	async fn ndjson_worker_emits_one_line_per_row() {
		let out: Vec<u8> = Vec::new();
		let sink = SharedSink::new(out);
		let mut worker = NdjsonWorker::new(sink.clone());
		worker.write_block(&sample_block("row one")).await.unwrap();
		worker.write_block(&sample_block("row two")).await.unwrap();
		worker.finish().await.unwrap();

		let written = sink.inner.lock().await;
		let text = String::from_utf8(written.clone()).unwrap();
		let lines: Vec<&str> = text.lines().collect();
		assert_eq!(lines.len(), 2);
		for line in &lines {
			let parsed: Value = serde_json::from_str(line).unwrap();
			assert!(parsed.get("_msg").is_some());
		}
	}

	#[tokio::test]
	async fn ndjson_flush_boundary_never_splits_a_line() {
		let out: Vec<u8> = Vec::new();
		let sink = SharedSink::new(out);
		let mut worker = NdjsonWorker::new(sink.clone());
		let long_value = "x".repeat(20 * 1024);
		worker.write_block(&sample_block(&long_value)).await.unwrap();
		worker.finish().await.unwrap();

		let written = sink.inner.lock().await;
		let text = String::from_utf8(written.clone()).unwrap();
		assert_eq!(text.lines().count(), 1);
	}
}
