use crate::field::FIELD_TIME;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
	#[error("truncated stream: expected {expected} more bytes, got {got}")]
	Truncated { expected: usize, got: usize },
	#[error("bad frame: {0}")]
	BadFrame(String),
}

type Result<T> = std::result::Result<T, WireError>;

fn require(buf: &[u8], n: usize) -> Result<()> {
	if buf.len() < n {
		Err(WireError::Truncated {
			expected: n,
			got: buf.len(),
		})
	} else {
		Ok(())
	}
}

fn put_str(dst: &mut BytesMut, s: &str) {
	dst.put_u32_le(s.len() as u32);
	dst.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
	require(buf, 4)?;
	let len = buf.get_u32_le() as usize;
	require(buf, len)?;
	let s = std::str::from_utf8(&buf[..len])
		.map_err(|e| WireError::BadFrame(e.to_string()))?
		.to_string();
	buf.advance(len);
	Ok(s)
}

fn put_varint(dst: &mut BytesMut, mut v: u64) {
	loop {
		let mut b = (v & 0x7f) as u8;
		v >>= 7;
		if v != 0 {
			b |= 0x80;
		}
		dst.put_u8(b);
		if v == 0 {
			break;
		}
	}
}

fn get_varint(buf: &mut &[u8]) -> Result<u64> {
	let mut result: u64 = 0;
	let mut shift = 0;
	loop {
		require(buf, 1)?;
		let b = buf.get_u8();
		result |= ((b & 0x7f) as u64) << shift;
		if b & 0x80 == 0 {
			break;
		}
		shift += 7;
		if shift >= 64 {
			return Err(WireError::BadFrame("varint too long".into()));
		}
	}
	Ok(result)
}

/// One named column within a [`DataBlock`]. Values may be stored densely
/// (`Raw`), as a single shared value repeated for every row (`Const`), or
/// as a dictionary of unique values plus per-row indexes (`Dict`) — the
/// three encodings spec.md §6 calls out for the DataBlock wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValues {
	Raw(Vec<String>),
	Const { value: String, len: usize },
	Dict { dict: Vec<String>, indexes: Vec<u32> },
}

impl ColumnValues {
	pub fn len(&self) -> usize {
		match self {
			ColumnValues::Raw(v) => v.len(),
			ColumnValues::Const { len, .. } => *len,
			ColumnValues::Dict { indexes, .. } => indexes.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn get(&self, row: usize) -> Option<&str> {
		match self {
			ColumnValues::Raw(v) => v.get(row).map(|s| s.as_str()),
			ColumnValues::Const { value, len } => {
				if row < *len {
					Some(value.as_str())
				} else {
					None
				}
			}
			ColumnValues::Dict { dict, indexes } => indexes
				.get(row)
				.and_then(|&i| dict.get(i as usize))
				.map(|s| s.as_str()),
		}
	}

	pub fn to_vec(&self) -> Vec<String> {
		(0..self.len())
			.map(|i| self.get(i).unwrap_or_default().to_string())
			.collect()
	}

	/// Picks the tightest of the three encodings for a plain row vector,
	/// the encoder-side counterpart of the three wire variants.
	pub fn encode_best(values: Vec<String>) -> ColumnValues {
		if values.is_empty() {
			return ColumnValues::Raw(values);
		}
		if values.iter().all(|v| v == &values[0]) {
			return ColumnValues::Const {
				value: values[0].clone(),
				len: values.len(),
			};
		}
		let mut dict: Vec<String> = Vec::new();
		let mut indexes = Vec::with_capacity(values.len());
		'outer: for v in &values {
			for (i, d) in dict.iter().enumerate() {
				if d == v {
					indexes.push(i as u32);
					continue 'outer;
				}
			}
			if dict.len() >= u32::MAX as usize {
				return ColumnValues::Raw(values);
			}
			dict.push(v.clone());
			indexes.push((dict.len() - 1) as u32);
		}
		if dict.len() * 2 < values.len() {
			ColumnValues::Dict { dict, indexes }
		} else {
			ColumnValues::Raw(values)
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
	pub name: String,
	pub values: ColumnValues,
}

/// A column-oriented batch of query results. Read-only once produced;
/// callers that need to retain values past the block's lifetime must copy
/// them, since backing buffers may be pooled by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBlock {
	pub columns: Vec<Column>,
}

const TAG_RAW: u8 = 0;
const TAG_CONST: u8 = 1;
const TAG_DICT: u8 = 2;

impl DataBlock {
	pub fn row_count(&self) -> usize {
		self.columns.first().map(|c| c.values.len()).unwrap_or(0)
	}

	pub fn column(&self, name: &str) -> Option<&Column> {
		self.columns.iter().find(|c| c.name == name)
	}

	/// Parses `_time` as RFC3339 for every row, returning `None` if the
	/// column is missing (a bug-assertion condition for callers per §7).
	pub fn timestamps(&self) -> Option<Vec<i64>> {
		let col = self.column(FIELD_TIME)?;
		(0..col.values.len())
			.map(|i| {
				col.values
					.get(i)
					.and_then(|v| crate::timeutil::parse_rfc3339_nsec(v).ok())
			})
			.collect()
	}

	pub fn marshal(&self, dst: &mut BytesMut) {
		dst.put_u64_le(self.row_count() as u64);
		dst.put_u64_le(self.columns.len() as u64);
		for col in &self.columns {
			put_str(dst, &col.name);
			match &col.values {
				ColumnValues::Raw(values) => {
					dst.put_u8(TAG_RAW);
					for v in values {
						put_str(dst, v);
					}
				}
				ColumnValues::Const { value, .. } => {
					dst.put_u8(TAG_CONST);
					put_str(dst, value);
				}
				ColumnValues::Dict { dict, indexes } => {
					dst.put_u8(TAG_DICT);
					put_varint(dst, dict.len() as u64);
					for v in dict {
						put_str(dst, v);
					}
					for &idx in indexes {
						put_varint(dst, idx as u64);
					}
				}
			}
		}
	}

	/// Unmarshals a DataBlock from the front of `buf`, returning the
	/// remaining tail. Order-insensitive: columns are read in whatever
	/// order they were written, keyed by name at read time.
	pub fn unmarshal(buf: &[u8]) -> Result<(DataBlock, &[u8])> {
		let mut cur = buf;
		require(cur, 16)?;
		let row_count = cur.get_u64_le() as usize;
		let column_count = cur.get_u64_le() as usize;
		let mut columns = Vec::with_capacity(column_count);
		for _ in 0..column_count {
			let name = get_str(&mut cur)?;
			require(cur, 1)?;
			let tag = cur.get_u8();
			let values = match tag {
				TAG_RAW => {
					let mut v = Vec::with_capacity(row_count);
					for _ in 0..row_count {
						v.push(get_str(&mut cur)?);
					}
					ColumnValues::Raw(v)
				}
				TAG_CONST => {
					let value = get_str(&mut cur)?;
					ColumnValues::Const {
						value,
						len: row_count,
					}
				}
				TAG_DICT => {
					let dict_len = get_varint(&mut cur)? as usize;
					let mut dict = Vec::with_capacity(dict_len);
					for _ in 0..dict_len {
						dict.push(get_str(&mut cur)?);
					}
					let mut indexes = Vec::with_capacity(row_count);
					for _ in 0..row_count {
						indexes.push(get_varint(&mut cur)? as u32);
					}
					ColumnValues::Dict { dict, indexes }
				}
				t => return Err(WireError::BadFrame(format!("unknown column tag {t}"))),
			};
			columns.push(Column { name, values });
		}
		Ok((DataBlock { columns }, cur))
	}
}

/// A `(value, hit-count)` pair returned by catalog endpoints
/// (`field_names`, `field_values`, `streams`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueWithHits {
	pub value: String,
	pub hits: u64,
}

impl ValueWithHits {
	pub fn new(value: impl Into<String>, hits: u64) -> Self {
		Self {
			value: value.into(),
			hits,
		}
	}

	pub fn marshal(&self, dst: &mut BytesMut) {
		put_str(dst, &self.value);
		put_varint(dst, self.hits);
	}

	pub fn unmarshal(buf: &[u8]) -> Result<(ValueWithHits, &[u8])> {
		let mut cur = buf;
		let value = get_str(&mut cur)?;
		let hits = get_varint(&mut cur)?;
		Ok((ValueWithHits { value, hits }, cur))
	}

	pub fn marshal_list(values: &[ValueWithHits]) -> Bytes {
		let mut dst = BytesMut::new();
		dst.put_u64_le(values.len() as u64);
		for v in values {
			v.marshal(&mut dst);
		}
		dst.freeze()
	}

	pub fn unmarshal_list(buf: &[u8]) -> Result<(Vec<ValueWithHits>, &[u8])> {
		let mut cur = buf;
		require(cur, 8)?;
		let count = cur.get_u64_le() as usize;
		let mut out = Vec::with_capacity(count);
		for _ in 0..count {
			let (vh, tail) = ValueWithHits::unmarshal(cur)?;
			out.push(vh);
			cur = tail;
		}
		Ok((out, cur))
	}

	/// Merges per-node `(value, hits)` vectors: values deduplicated, hits
	/// summed, sorted by descending hits. When `limit` is nonzero and the
	/// result would exceed it, the list is truncated; if
	/// `reset_hits_on_limit_exceeded` is set, hit counts are zeroed out
	/// since the aggregate is no longer globally accurate (§4.6).
	pub fn merge(
		per_node: &[Vec<ValueWithHits>],
		limit: u64,
		reset_hits_on_limit_exceeded: bool,
	) -> Vec<ValueWithHits> {
		use std::collections::HashMap;
		let mut merged: HashMap<String, u64> = HashMap::new();
		let mut order: Vec<String> = Vec::new();
		for node in per_node {
			for vh in node {
				match merged.get_mut(&vh.value) {
					Some(hits) => *hits += vh.hits,
					None => {
						merged.insert(vh.value.clone(), vh.hits);
						order.push(vh.value.clone());
					}
				}
			}
		}
		let mut out: Vec<ValueWithHits> = order
			.into_iter()
			.map(|v| {
				let hits = merged[&v];
				ValueWithHits::new(v, hits)
			})
			.collect();
		out.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.value.cmp(&b.value)));

		if limit > 0 && (out.len() as u64) > limit {
			out.truncate(limit as usize);
			if reset_hits_on_limit_exceeded {
				for vh in &mut out {
					vh.hits = 0;
				}
			}
		}
		out
	}
}
