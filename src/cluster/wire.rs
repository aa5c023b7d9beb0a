//! Cluster wire format (spec.md §4.5, §6): length-prefixed, optionally
//! zstd-compressed frames carrying data blocks and a trailing query-stats
//! block.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::{Column, ColumnValues, DataBlock, QueryStatsSnapshot};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MARKER_DATA: u8 = 0x00;
pub const MARKER_STATS: u8 = 0x01;

#[derive(Debug, Error)]
pub enum WireError {
	#[error("truncated stream: connection ended mid-frame")]
	TruncatedStream,
	#[error("bad frame: {0}")]
	BadFrame(String),
}

/// One decoded unit of a frame: either a data block or the query-stats
/// block for that node.
pub enum Unit {
	Data(DataBlock),
	Stats(QueryStatsSnapshot),
}

const STATS_FIELDS: &[&str] = &[
	"bytes_read_columns_headers",
	"bytes_read_columns_header_indexes",
	"bytes_read_bloom_filters",
	"bytes_read_values",
	"bytes_read_timestamps",
	"bytes_read_block_headers",
	"blocks_processed",
	"rows_processed",
	"rows_found",
	"values_read",
	"timestamps_read",
	"bytes_processed_uncompressed_values",
	"query_duration_nsecs",
];

pub fn stats_to_block(s: &QueryStatsSnapshot) -> DataBlock {
	let values = [
		s.bytes_read_columns_headers,
		s.bytes_read_columns_header_indexes,
		s.bytes_read_bloom_filters,
		s.bytes_read_values,
		s.bytes_read_timestamps,
		s.bytes_read_block_headers,
		s.blocks_processed,
		s.rows_processed,
		s.rows_found,
		s.values_read,
		s.timestamps_read,
		s.bytes_processed_uncompressed_values,
		s.query_duration_nsecs,
	];
	let columns = STATS_FIELDS
		.iter()
		.zip(values.iter())
		.map(|(name, v)| Column {
			name: name.to_string(),
			values: ColumnValues::Const {
				value: v.to_string(),
				len: 1,
			},
		})
		.collect();
	DataBlock { columns }
}

pub fn block_to_stats(block: &DataBlock) -> Result<QueryStatsSnapshot, WireError> {
	let mut s = QueryStatsSnapshot::default();
	let get = |name: &str| -> Result<u64, WireError> {
		block
			.column(name)
			.and_then(|c| c.values.get(0))
			.ok_or_else(|| WireError::BadFrame(format!("query-stats block missing {name}")))?
			.parse::<u64>()
			.map_err(|e| WireError::BadFrame(e.to_string()))
	};
	s.bytes_read_columns_headers = get("bytes_read_columns_headers")?;
	s.bytes_read_columns_header_indexes = get("bytes_read_columns_header_indexes")?;
	s.bytes_read_bloom_filters = get("bytes_read_bloom_filters")?;
	s.bytes_read_values = get("bytes_read_values")?;
	s.bytes_read_timestamps = get("bytes_read_timestamps")?;
	s.bytes_read_block_headers = get("bytes_read_block_headers")?;
	s.blocks_processed = get("blocks_processed")?;
	s.rows_processed = get("rows_processed")?;
	s.rows_found = get("rows_found")?;
	s.values_read = get("values_read")?;
	s.timestamps_read = get("timestamps_read")?;
	s.bytes_processed_uncompressed_values = get("bytes_processed_uncompressed_values")?;
	s.query_duration_nsecs = get("query_duration_nsecs")?;
	Ok(s)
}

/// Appends one data block's marker+marshal bytes to a worker-local buffer,
/// for callers (the streaming writer) that batch several blocks before
/// emitting a frame.
pub fn append_data_unit(buf: &mut BytesMut, block: &DataBlock) {
	buf.put_u8(MARKER_DATA);
	block.marshal(buf);
}

pub fn append_stats_unit(buf: &mut BytesMut, stats: &QueryStatsSnapshot) {
	buf.put_u8(MARKER_STATS);
	stats_to_block(stats).marshal(buf);
}

/// Length-prefixes (and optionally zstd-compresses) an already-assembled
/// payload of marker+marshal units into one wire frame.
pub fn encode_raw_frame(payload: &[u8], compress: bool) -> Bytes {
	let payload: Vec<u8> = if compress {
		zstd::encode_all(payload, 0).expect("zstd encode never fails on an in-memory buffer")
	} else {
		payload.to_vec()
	};
	let mut frame = BytesMut::with_capacity(8 + payload.len());
	frame.put_u64_le(payload.len() as u64);
	frame.put_slice(&payload);
	frame.freeze()
}

/// Encodes one frame carrying `blocks` and, if given, a trailing
/// query-stats unit.
pub fn encode_frame(blocks: &[DataBlock], stats: Option<&QueryStatsSnapshot>, compress: bool) -> Bytes {
	let mut inner = BytesMut::new();
	for b in blocks {
		append_data_unit(&mut inner, b);
	}
	if let Some(s) = stats {
		append_stats_unit(&mut inner, s);
	}
	encode_raw_frame(&inner, compress)
}

/// Reads one frame from `reader`. Returns `Ok(None)` at a clean EOF
/// (stream ended between frames), or `Err(TruncatedStream)` if EOF arrives
/// mid-frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
	reader: &mut R,
	compress: bool,
) -> Result<Option<Vec<Unit>>, WireError> {
	let mut len_buf = [0u8; 8];
	match reader.read_exact(&mut len_buf).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(_) => return Err(WireError::TruncatedStream),
	}
	let len = u64::from_le_bytes(len_buf) as usize;
	let mut payload = vec![0u8; len];
	reader
		.read_exact(&mut payload)
		.await
		.map_err(|_| WireError::TruncatedStream)?;

	let inner: Vec<u8> = if compress {
		zstd::decode_all(&payload[..]).map_err(|e| WireError::BadFrame(e.to_string()))?
	} else {
		payload
	};

	decode_units(&inner).map(Some)
}

fn decode_units(mut buf: &[u8]) -> Result<Vec<Unit>, WireError> {
	let mut units = Vec::new();
	while !buf.is_empty() {
		let marker = buf[0];
		buf = &buf[1..];
		let (block, tail) = DataBlock::unmarshal(buf).map_err(|e| WireError::BadFrame(e.to_string()))?;
		buf = tail;
		match marker {
			MARKER_DATA => units.push(Unit::Data(block)),
			MARKER_STATS => units.push(Unit::Stats(block_to_stats(&block)?)),
			m => return Err(WireError::BadFrame(format!("unknown block marker {m}"))),
		}
	}
	Ok(units)
}

#[cfg(test)]
mod tests {
	use super::*;
	use common::FIELD_TIME;
	use pretty_assertions::assert_eq;

	fn sample_block() -> DataBlock {
		DataBlock {
			columns: vec![Column {
				name: FIELD_TIME.to_string(),
				values: ColumnValues::Raw(vec!["2024-01-01T00:00:00Z".into()]),
			}],
		}
	}

	#[tokio::test]
	async fn frame_round_trips_data_and_stats() {
		let stats = QueryStatsSnapshot {
			rows_processed: 42,
			..Default::default()
		};
		let frame = encode_frame(&[sample_block()], Some(&stats), false);
		let mut cursor = std::io::Cursor::new(frame.to_vec());
		let units = read_frame(&mut cursor, false).await.unwrap().unwrap();
		assert_eq!(units.len(), 2);
		match &units[0] {
			Unit::Data(b) => assert_eq!(*b, sample_block()),
			_ => panic!("expected data unit first"),
		}
		match &units[1] {
			Unit::Stats(s) => assert_eq!(s.rows_processed, 42),
			_ => panic!("expected stats unit second"),
		}
	}

	#[tokio::test]
	async fn frame_round_trips_compressed() {
		let frame = encode_frame(&[sample_block()], None, true);
		let mut cursor = std::io::Cursor::new(frame.to_vec());
		let units = read_frame(&mut cursor, true).await.unwrap().unwrap();
		assert_eq!(units.len(), 1);
	}

	#[tokio::test]
	async fn eof_between_frames_is_clean() {
		let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
		assert!(read_frame(&mut cursor, false).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn eof_mid_frame_is_truncated_stream() {
		let frame = encode_frame(&[sample_block()], None, false);
		let short = &frame[..frame.len() - 3];
		let mut cursor = std::io::Cursor::new(short.to_vec());
		let err = read_frame(&mut cursor, false).await.unwrap_err();
		assert!(matches!(err, WireError::TruncatedStream));
	}
}
