//! Framed syslog line reader: IETF octet counting and octet stuffing
//! (RFC 6587 §3.4), as used by every TCP/Unix-stream syslog listener.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum FrameError {
	#[error("short read: EOF mid-record")]
	ShortRead,
	#[error("frame of {0} bytes exceeds the configured maximum")]
	FrameTooLarge(usize),
	#[error("malformed length prefix")]
	MalformedLength,
}

/// The 2 MiB hard ceiling from spec.md §6; `max_line_size` is a
/// per-listener setting that must not exceed this.
pub const HARD_MAX_LINE_SIZE: usize = 2 * 1024 * 1024;

/// Reads length-framed or newline-framed records from an async byte stream.
///
/// Once any [`FrameError`] is produced the reader is poisoned: every
/// subsequent call to [`next_record`](Self::next_record) returns the same
/// error without touching the underlying stream again.
pub struct LineReader<R> {
	inner: Option<BufReader<R>>,
	max_line_size: usize,
	sticky_error: Option<FrameError>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
	pub fn new(inner: R, max_line_size: usize) -> Self {
		Self {
			inner: Some(BufReader::new(inner)),
			max_line_size,
			sticky_error: None,
		}
	}

	/// Rebinds this reader to a new stream, clearing all accumulated state.
	/// The pooling contract (spec.md §4.1, §9): construction-equivalent,
	/// minus any retained buffer capacity inside `BufReader`.
	pub fn reset(&mut self, inner: R) {
		self.inner = Some(BufReader::new(inner));
		self.sticky_error = None;
	}

	/// Reads the next record. Returns `Ok(None)` at a clean end of stream
	/// (EOF between records), `Ok(Some(bytes))` for a record body, or an
	/// error which becomes sticky for the lifetime of this reader.
	pub async fn next_record(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
		if let Some(e) = &self.sticky_error {
			return Err(e.clone());
		}
		match self.read_one().await {
			Ok(record) => Ok(record),
			Err(e) => {
				self.sticky_error = Some(e.clone());
				Err(e)
			}
		}
	}

	async fn read_one(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
		let reader = self.inner.as_mut().expect("reader bound");

		// Strip leading empty lines.
		loop {
			match peek_byte(reader).await? {
				None => return Ok(None),
				Some(b'\n') => {
					read_byte(reader).await?;
					continue;
				}
				Some(_) => break,
			}
		}

		// Scan a prefix up to the first space, '\n', or EOF.
		let mut prefix = Vec::new();
		let mode = loop {
			match read_byte(reader).await? {
				None => break PrefixEnd::Eof,
				Some(b' ') => break PrefixEnd::Space,
				Some(b'\n') => break PrefixEnd::Newline,
				Some(b) => prefix.push(b),
			}
			if prefix.len() > self.max_line_size {
				return Err(FrameError::FrameTooLarge(prefix.len()));
			}
		};

		let all_digits = !prefix.is_empty() && prefix.iter().all(u8::is_ascii_digit);

		match mode {
			PrefixEnd::Space if all_digits => {
				let text = std::str::from_utf8(&prefix).map_err(|_| FrameError::MalformedLength)?;
				let n: usize = text.parse().map_err(|_| FrameError::MalformedLength)?;
				if n > self.max_line_size {
					return Err(FrameError::FrameTooLarge(n));
				}
				let mut body = vec![0u8; n];
				reader
					.read_exact(&mut body)
					.await
					.map_err(|_| FrameError::ShortRead)?;
				Ok(Some(body))
			}
			PrefixEnd::Space => {
				let mut line = prefix;
				line.push(b' ');
				self.read_until_newline(&mut line).await?;
				Ok(Some(line))
			}
			PrefixEnd::Newline => Ok(Some(prefix)),
			PrefixEnd::Eof if prefix.is_empty() => Ok(None),
			// Unterminated final line: lenient, return what we have.
			PrefixEnd::Eof => Ok(Some(prefix)),
		}
	}

	async fn read_until_newline(&mut self, line: &mut Vec<u8>) -> Result<(), FrameError> {
		let reader = self.inner.as_mut().expect("reader bound");
		loop {
			match read_byte(reader).await? {
				None => return Ok(()),
				Some(b'\n') => return Ok(()),
				Some(b) => line.push(b),
			}
			if line.len() > self.max_line_size {
				return Err(FrameError::FrameTooLarge(line.len()));
			}
		}
	}
}

enum PrefixEnd {
	Space,
	Newline,
	Eof,
}

async fn read_byte<R: AsyncRead + Unpin>(r: &mut BufReader<R>) -> Result<Option<u8>, FrameError> {
	let mut b = [0u8; 1];
	match r.read(&mut b).await {
		Ok(0) => Ok(None),
		Ok(_) => Ok(Some(b[0])),
		Err(_) => Err(FrameError::ShortRead),
	}
}

async fn peek_byte<R: AsyncRead + Unpin>(r: &mut BufReader<R>) -> Result<Option<u8>, FrameError> {
	use tokio::io::AsyncBufReadExt;
	match r.fill_buf().await {
		Ok(buf) if buf.is_empty() => Ok(None),
		Ok(buf) => Ok(Some(buf[0])),
		Err(_) => Err(FrameError::ShortRead),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::io::Cursor;

	async fn read_all(input: &str, max: usize) -> Result<Vec<Vec<u8>>, FrameError> {
		let mut reader = LineReader::new(Cursor::new(input.as_bytes().to_vec()), max);
		let mut out = Vec::new();
		while let Some(rec) = reader.next_record().await? {
			out.push(rec);
		}
		Ok(out)
	}

	#[tokio::test]
	async fn octet_counted_ingest_example() {
		// Two octet-counted frames back to back, each N matching its body
		// length exactly (spec.md §8 end-to-end scenario 1).
		let records = read_all("11 hello world22 another syslog message", 1024)
			.await
			.unwrap();
		assert_eq!(records[0], b"hello world");
		assert_eq!(records[1], b"another syslog message");
	}

	#[tokio::test]
	async fn octet_stuffed_lines_split_on_newline() {
		let records = read_all("<14>hello\n<14>world\n", 1024).await.unwrap();
		assert_eq!(records, vec![b"<14>hello".to_vec(), b"<14>world".to_vec()]);
	}

	#[tokio::test]
	async fn leading_empty_lines_are_stripped() {
		let records = read_all("\n\n<14>hi\n", 1024).await.unwrap();
		assert_eq!(records, vec![b"<14>hi".to_vec()]);
	}

	#[tokio::test]
	async fn eof_between_records_ends_cleanly() {
		let mut reader = LineReader::new(Cursor::new(b"<14>hi\n".to_vec()), 1024);
		assert_eq!(reader.next_record().await.unwrap(), Some(b"<14>hi".to_vec()));
		assert_eq!(reader.next_record().await.unwrap(), None);
	}

	#[tokio::test]
	async fn oversized_octet_count_is_frame_too_large() {
		let err = read_all("999999 x", 1024).await.unwrap_err();
		assert_eq!(err, FrameError::FrameTooLarge(999999));
	}

	#[tokio::test]
	async fn short_read_mid_frame_is_sticky() {
		let mut reader = LineReader::new(Cursor::new(b"100 short".to_vec()), 1024);
		let err1 = reader.next_record().await.unwrap_err();
		assert_eq!(err1, FrameError::ShortRead);
		let err2 = reader.next_record().await.unwrap_err();
		assert_eq!(err2, FrameError::ShortRead);
	}

	#[tokio::test]
	async fn frame_at_exactly_max_size_succeeds_one_byte_more_fails() {
		let body = "a".repeat(10);
		let input = format!("10 {body}");
		let ok = read_all(&input, 10).await.unwrap();
		assert_eq!(ok[0], body.as_bytes());

		let too_big = format!("11 {}", "a".repeat(11));
		let err = read_all(&too_big, 10).await.unwrap_err();
		assert_eq!(err, FrameError::FrameTooLarge(11));
	}

	#[tokio::test]
	async fn reset_clears_sticky_error_and_rebinds() {
		let mut reader = LineReader::new(Cursor::new(b"100 short".to_vec()), 1024);
		assert!(reader.next_record().await.is_err());
		reader.reset(Cursor::new(b"<14>ok\n".to_vec()));
		assert_eq!(reader.next_record().await.unwrap(), Some(b"<14>ok".to_vec()));
	}
}
