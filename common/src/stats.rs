use std::sync::atomic::{AtomicU64, Ordering};

/// Counter bundle aggregating bytes/rows read and processed during query
/// execution. Grounded on `lib/logstorage/query_stats.go`'s `QueryStats`,
/// extended with a `query_duration_nsecs` field per spec.md's additivity
/// rule (merged as a maximum, not a sum, since it is wall-clock time and
/// not attributable per-node).
#[derive(Debug, Default)]
pub struct QueryStats {
	pub bytes_read_columns_headers: AtomicU64,
	pub bytes_read_columns_header_indexes: AtomicU64,
	pub bytes_read_bloom_filters: AtomicU64,
	pub bytes_read_values: AtomicU64,
	pub bytes_read_timestamps: AtomicU64,
	pub bytes_read_block_headers: AtomicU64,

	pub blocks_processed: AtomicU64,
	pub rows_processed: AtomicU64,
	pub rows_found: AtomicU64,
	pub values_read: AtomicU64,
	pub timestamps_read: AtomicU64,
	pub bytes_processed_uncompressed_values: AtomicU64,

	pub query_duration_nsecs: AtomicU64,
}

/// A plain-data snapshot of [`QueryStats`], used for merging and for the
/// single-row DataBlock wire representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatsSnapshot {
	pub bytes_read_columns_headers: u64,
	pub bytes_read_columns_header_indexes: u64,
	pub bytes_read_bloom_filters: u64,
	pub bytes_read_values: u64,
	pub bytes_read_timestamps: u64,
	pub bytes_read_block_headers: u64,

	pub blocks_processed: u64,
	pub rows_processed: u64,
	pub rows_found: u64,
	pub values_read: u64,
	pub timestamps_read: u64,
	pub bytes_processed_uncompressed_values: u64,

	pub query_duration_nsecs: u64,
}

impl QueryStatsSnapshot {
	pub fn bytes_read_total(&self) -> u64 {
		self.bytes_read_columns_headers
			+ self.bytes_read_columns_header_indexes
			+ self.bytes_read_bloom_filters
			+ self.bytes_read_values
			+ self.bytes_read_timestamps
			+ self.bytes_read_block_headers
	}

	/// Merges `other` into `self`. Additive for all fields except
	/// `query_duration_nsecs`, which takes the maximum.
	pub fn merge(&mut self, other: &QueryStatsSnapshot) {
		self.bytes_read_columns_headers += other.bytes_read_columns_headers;
		self.bytes_read_columns_header_indexes += other.bytes_read_columns_header_indexes;
		self.bytes_read_bloom_filters += other.bytes_read_bloom_filters;
		self.bytes_read_values += other.bytes_read_values;
		self.bytes_read_timestamps += other.bytes_read_timestamps;
		self.bytes_read_block_headers += other.bytes_read_block_headers;

		self.blocks_processed += other.blocks_processed;
		self.rows_processed += other.rows_processed;
		self.rows_found += other.rows_found;
		self.values_read += other.values_read;
		self.timestamps_read += other.timestamps_read;
		self.bytes_processed_uncompressed_values += other.bytes_processed_uncompressed_values;

		self.query_duration_nsecs = self.query_duration_nsecs.max(other.query_duration_nsecs);
	}
}

impl QueryStats {
	pub fn snapshot(&self) -> QueryStatsSnapshot {
		QueryStatsSnapshot {
			bytes_read_columns_headers: self.bytes_read_columns_headers.load(Ordering::Relaxed),
			bytes_read_columns_header_indexes: self
				.bytes_read_columns_header_indexes
				.load(Ordering::Relaxed),
			bytes_read_bloom_filters: self.bytes_read_bloom_filters.load(Ordering::Relaxed),
			bytes_read_values: self.bytes_read_values.load(Ordering::Relaxed),
			bytes_read_timestamps: self.bytes_read_timestamps.load(Ordering::Relaxed),
			bytes_read_block_headers: self.bytes_read_block_headers.load(Ordering::Relaxed),
			blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
			rows_processed: self.rows_processed.load(Ordering::Relaxed),
			rows_found: self.rows_found.load(Ordering::Relaxed),
			values_read: self.values_read.load(Ordering::Relaxed),
			timestamps_read: self.timestamps_read.load(Ordering::Relaxed),
			bytes_processed_uncompressed_values: self
				.bytes_processed_uncompressed_values
				.load(Ordering::Relaxed),
			query_duration_nsecs: self.query_duration_nsecs.load(Ordering::Relaxed),
		}
	}

	/// Atomically merges a snapshot into this accumulator. Each field is
	/// updated independently, so concurrent callers never block each other
	/// on a lock, matching `QueryStats.updateAtomic`.
	pub fn update_atomic(&self, src: &QueryStatsSnapshot) {
		self.bytes_read_columns_headers
			.fetch_add(src.bytes_read_columns_headers, Ordering::Relaxed);
		self.bytes_read_columns_header_indexes
			.fetch_add(src.bytes_read_columns_header_indexes, Ordering::Relaxed);
		self.bytes_read_bloom_filters
			.fetch_add(src.bytes_read_bloom_filters, Ordering::Relaxed);
		self.bytes_read_values
			.fetch_add(src.bytes_read_values, Ordering::Relaxed);
		self.bytes_read_timestamps
			.fetch_add(src.bytes_read_timestamps, Ordering::Relaxed);
		self.bytes_read_block_headers
			.fetch_add(src.bytes_read_block_headers, Ordering::Relaxed);

		self.blocks_processed
			.fetch_add(src.blocks_processed, Ordering::Relaxed);
		self.rows_processed
			.fetch_add(src.rows_processed, Ordering::Relaxed);
		self.rows_found.fetch_add(src.rows_found, Ordering::Relaxed);
		self.values_read.fetch_add(src.values_read, Ordering::Relaxed);
		self.timestamps_read
			.fetch_add(src.timestamps_read, Ordering::Relaxed);
		self.bytes_processed_uncompressed_values
			.fetch_add(src.bytes_processed_uncompressed_values, Ordering::Relaxed);

		self.query_duration_nsecs
			.fetch_max(src.query_duration_nsecs, Ordering::Relaxed);
	}
}
