//! Wires the line reader and record parser together for a single ingest
//! stream or datagram (spec.md §4.3 "Pipeline stages").

use crate::config::{CompressMethod, ListenerConfig};
use crate::ingest::line_reader::{FrameError, LineReader};
use crate::ingest::pool::Pool;
use crate::ingest::record_parser::{ParseContext, RecordParser};
use async_compression::tokio::bufread::{DeflateDecoder, GzipDecoder, ZstdDecoder};
use common::TenantId;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::task::{Context, Poll};
use streamstore::{Store, StoreError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PipelineCounters {
	/// Fatal, stream-ending frame errors (spec.md §4.1: `ShortRead`,
	/// `FrameTooLarge`, `MalformedLength`) — distinct from the per-line
	/// parse errors §4.3 describes, which never abort the stream. This
	/// implementation's [`RecordParser::parse`] is infallible (it salvages
	/// anything unparseable into `_msg`), so there is no separate per-line
	/// error count to track here.
	pub frame_errors: AtomicU64,
	pub udp_requests: AtomicU64,
	pub udp_errors: AtomicU64,
	pub connections_active: AtomicU64,
}

#[derive(Debug, Error)]
pub enum PipelineError {
	#[error("store refused admission (overloaded)")]
	Overloaded,
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// A trait object wrapping any of the three decompression adapters behind
/// a single concrete `AsyncRead` type, so the line reader doesn't need to
/// be generic over compression method.
enum Decompressed<R> {
	Plain(R),
	Gzip(GzipDecoder<BufReader<R>>),
	Deflate(DeflateDecoder<BufReader<R>>),
	Zstd(ZstdDecoder<BufReader<R>>),
}

impl<R: AsyncRead + Unpin> AsyncRead for Decompressed<R> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Decompressed::Plain(r) => Pin::new(r).poll_read(cx, buf),
			Decompressed::Gzip(r) => Pin::new(r).poll_read(cx, buf),
			Decompressed::Deflate(r) => Pin::new(r).poll_read(cx, buf),
			Decompressed::Zstd(r) => Pin::new(r).poll_read(cx, buf),
		}
	}
}

fn wrap_decompression<R: AsyncRead + Unpin>(inner: R, method: CompressMethod) -> Decompressed<R> {
	match method {
		CompressMethod::None => Decompressed::Plain(inner),
		CompressMethod::Gzip => Decompressed::Gzip(GzipDecoder::new(BufReader::new(inner))),
		CompressMethod::Deflate => Decompressed::Deflate(DeflateDecoder::new(BufReader::new(inner))),
		CompressMethod::Zstd => Decompressed::Zstd(ZstdDecoder::new(BufReader::new(inner))),
	}
}

fn parse_context_for(cfg: &ListenerConfig, remote_ip: String) -> ParseContext {
	ParseContext {
		use_local_timestamp: cfg.use_local_timestamp,
		remote_ip,
		use_remote_ip: cfg.use_remote_ip,
		extra_fields: cfg
			.extra_fields
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect(),
		ignore_fields: cfg.ignore_fields.clone(),
		decolorize_fields: cfg.decolorize_fields.clone(),
	}
}

/// Runs the full pipeline for one stream-oriented connection (TCP or Unix
/// stream): admission check, write-concurrency limiter, decompression,
/// line framing, per-line parsing/enrichment, store write.
pub async fn run_stream_pipeline<S>(
	socket: S,
	cfg: &ListenerConfig,
	tenant: TenantId,
	remote_ip: String,
	store: Arc<dyn Store>,
	write_limiter: Arc<Semaphore>,
	counters: Arc<PipelineCounters>,
	parser_pool: Arc<Pool<RecordParser>>,
	cancel: CancellationToken,
) -> Result<(), PipelineError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	if !store.admit_write() {
		return Err(PipelineError::Overloaded);
	}
	let _permit = write_limiter
		.acquire_owned()
		.await
		.expect("write-concurrency semaphore never closed");
	counters.connections_active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	let _drop_guard = scopeguard(&counters);

	let (read_half, _write_half) = tokio::io::split(socket);
	let decompressed = wrap_decompression(read_half, cfg.compress_method);
	let mut reader = LineReader::new(decompressed, cfg.max_line_size_bytes);
	let parser = parser_pool.acquire();
	let ctx = parse_context_for(cfg, remote_ip);

	let mut batch = Vec::new();
	loop {
		let next = tokio::select! {
			_ = cancel.cancelled() => break,
			next = reader.next_record() => next,
		};
		match next {
			Ok(None) => break,
			Ok(Some(line)) => {
				let record = parser.parse(&line, &ctx);
				batch.push(record);
				if batch.len() >= 256 {
					flush_batch(&store, tenant, &mut batch).await?;
				}
			}
			Err(e) => {
				counters.frame_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
				debug!(error = %e, "line framing error, ending stream");
				flush_batch(&store, tenant, &mut batch).await?;
				parser_pool.release(parser);
				return Err(e.into());
			}
		}
	}
	flush_batch(&store, tenant, &mut batch).await?;
	parser_pool.release(parser);
	Ok(())
}

async fn flush_batch(store: &Arc<dyn Store>, tenant: TenantId, batch: &mut Vec<common::Record>) -> Result<(), PipelineError> {
	if batch.is_empty() {
		return Ok(());
	}
	let records = std::mem::take(batch);
	store.write(tenant, records).await?;
	Ok(())
}

/// Ingests a single UDP/Unix-datagram packet. Per §4.3 a datagram carries
/// one or more octet-stuffed lines; bad lines are counted, not fatal. The
/// parser is owned by the calling worker for its whole lifetime (spec.md
/// §4.3 "each worker owns a reusable ... buffer") rather than pulled from
/// the pool per packet.
pub async fn ingest_datagram(
	payload: &[u8],
	ctx: &ParseContext,
	tenant: TenantId,
	store: &Arc<dyn Store>,
	parser: &RecordParser,
) -> Result<(), PipelineError> {
	if !store.admit_write() {
		return Err(PipelineError::Overloaded);
	}
	let mut records = Vec::new();
	for line in payload.split(|&b| b == b'\n') {
		if line.is_empty() {
			continue;
		}
		records.push(parser.parse(line, ctx));
	}
	if !records.is_empty() {
		store.write(tenant, records).await?;
	}
	Ok(())
}

struct ActiveGuard<'a>(&'a PipelineCounters);

impl Drop for ActiveGuard<'_> {
	fn drop(&mut self) {
		self.0.connections_active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
	}
}

fn scopeguard(counters: &Arc<PipelineCounters>) -> ActiveGuard<'_> {
	ActiveGuard(counters)
}
