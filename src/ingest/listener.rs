//! Listener pool: binds each configured syslog address and drives its
//! accept/read loop (spec.md §4.3).

use crate::config::{CompressMethod, ListenerConfig, Transport};
use crate::ingest::pipeline::{run_stream_pipeline, PipelineCounters};
use common::TenantId;
use std::io::BufReader;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use streamstore::Store;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixDatagram, UnixListener};
use tokio::sync::{Notify, Semaphore};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tracks live stream connections for a single listener and arbitrates
/// admission and graceful shutdown (spec.md §4.3, §5).
pub struct ConnectionRegistry {
	active: AtomicU64,
	max_connections: u64,
	drained: Arc<Notify>,
	cancel: CancellationToken,
}

impl ConnectionRegistry {
	pub fn new(max_connections: u64) -> Arc<Self> {
		Arc::new(Self {
			active: AtomicU64::new(0),
			max_connections,
			drained: Arc::new(Notify::new()),
			cancel: CancellationToken::new(),
		})
	}

	/// Admits a new connection, returning a guard that decrements the
	/// count on drop. `None` means the connection must be rejected.
	pub fn admit(self: &Arc<Self>) -> Option<ConnectionGuard> {
		loop {
			let current = self.active.load(Ordering::Acquire);
			if self.max_connections != 0 && current >= self.max_connections {
				return None;
			}
			if self
				.active
				.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return Some(ConnectionGuard {
					registry: Arc::clone(self),
				});
			}
		}
	}

	pub fn cancellation(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Closes the listener to new accepts and waits (up to `grace_period`)
	/// for all in-flight connections to finish. Remaining connections are
	/// abandoned (their tasks are cancelled via the shared token) once the
	/// grace period elapses.
	pub async fn close_all(&self, grace_period: Duration) {
		self.cancel.cancel();
		let wait = async {
			while self.active.load(Ordering::Acquire) > 0 {
				self.drained.notified().await;
			}
		};
		if tokio::time::timeout(grace_period, wait).await.is_err() {
			warn!(
				remaining = self.active.load(Ordering::Acquire),
				"grace period elapsed; forcing remaining connections closed"
			);
		}
	}
}

pub struct ConnectionGuard {
	registry: Arc<ConnectionRegistry>,
}

impl Drop for ConnectionGuard {
	fn drop(&mut self) {
		self.registry.active.fetch_sub(1, Ordering::AcqRel);
		self.registry.drained.notify_waiters();
	}
}

/// Spawns every configured listener and returns a handle that, when
/// dropped or explicitly shut down, gracefully drains all of them.
pub struct ListenerPool {
	registries: Vec<Arc<ConnectionRegistry>>,
	tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ListenerPool {
	pub async fn spawn(
		configs: Vec<ListenerConfig>,
		store: Arc<dyn Store>,
		counters: Arc<PipelineCounters>,
	) -> anyhow::Result<Self> {
		let mut registries = Vec::new();
		let mut tasks = Vec::new();

		for cfg in configs {
			let tenant = cfg
				.tenant_id
				.parse::<TenantId>()
				.map_err(|e| anyhow::anyhow!("listener {}: {e}", cfg.bind))?;
			let registry = ConnectionRegistry::new(0);
			let write_limiter = Arc::new(Semaphore::new(cfg.write_concurrency_limit.max(1)));
			let parser_pool = Arc::new(crate::ingest::pool::Pool::new(
				cfg.write_concurrency_limit.max(1),
				crate::ingest::record_parser::RecordParser::new,
			));

			let task = match cfg.transport {
				Transport::Tcp => spawn_tcp(
					cfg,
					tenant,
					Arc::clone(&store),
					Arc::clone(&registry),
					write_limiter,
					Arc::clone(&counters),
					parser_pool,
				)
				.await?,
				Transport::Unix => spawn_unix_stream(
					cfg,
					tenant,
					Arc::clone(&store),
					Arc::clone(&registry),
					write_limiter,
					Arc::clone(&counters),
					parser_pool,
				)
				.await?,
				Transport::Udp => {
					spawn_udp(cfg, tenant, Arc::clone(&store), Arc::clone(&registry), Arc::clone(&counters)).await?
				}
				Transport::Unixpacket => {
					spawn_unix_datagram(cfg, tenant, Arc::clone(&store), Arc::clone(&registry), Arc::clone(&counters))
						.await?
				}
			};

			registries.push(registry);
			tasks.push(task);
		}

		Ok(Self { registries, tasks })
	}

	pub async fn shutdown(self, grace_period: Duration) {
		for registry in &self.registries {
			registry.close_all(grace_period).await;
		}
		for task in self.tasks {
			let _ = task.await;
		}
	}
}

/// Either a plain TCP stream or a terminated TLS one, behind a single
/// concrete type so [`run_stream_pipeline`]'s single `AsyncRead + AsyncWrite`
/// type parameter can be instantiated once per listener regardless of
/// whether that listener terminates TLS (spec.md §4.3: "TCP (optionally
/// TLS)"). Mirrors the `Decompressed` enum-over-`AsyncRead` pattern in
/// `pipeline.rs`.
enum MaybeTlsStream {
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for MaybeTlsStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

/// Builds a [`TlsAcceptor`] from the listener's configured cert/key PEM
/// files (spec.md §6 `tlsCertFile`/`tlsKeyFile`). `validate_listener`
/// (config.rs) already guarantees both paths are present whenever
/// `cfg.tls` is set.
fn load_tls_acceptor(cert_file: &str, key_file: &str) -> anyhow::Result<TlsAcceptor> {
	let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(cert_file)?))
		.collect::<Result<_, _>>()?;
	let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(std::fs::File::open(key_file)?))?
		.ok_or_else(|| anyhow::anyhow!("no private key found in {key_file}"))?;
	let config = TlsServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn spawn_tcp(
	cfg: ListenerConfig,
	tenant: TenantId,
	store: Arc<dyn Store>,
	registry: Arc<ConnectionRegistry>,
	write_limiter: Arc<Semaphore>,
	counters: Arc<PipelineCounters>,
	parser_pool: Arc<crate::ingest::pool::Pool<crate::ingest::record_parser::RecordParser>>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
	let addr: SocketAddr = cfg.bind.parse()?;
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, tls = cfg.tls, "syslog tcp listener bound");
	let cancel = registry.cancellation();

	let tls_acceptor = if cfg.tls {
		let cert_file = cfg.tls_cert_file.as_deref().expect("validated: tls_cert_file present");
		let key_file = cfg.tls_key_file.as_deref().expect("validated: tls_key_file present");
		Some(load_tls_acceptor(cert_file, key_file)?)
	} else {
		None
	};

	Ok(tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				accepted = listener.accept() => {
					let (socket, peer) = match accepted {
						Ok(pair) => pair,
						Err(e) => { warn!(error = %e, "tcp accept failed"); continue; }
					};
					let Some(guard) = registry.admit() else {
						continue;
					};

					let socket = if let Some(acceptor) = &tls_acceptor {
						match acceptor.accept(socket).await {
							Ok(tls) => MaybeTlsStream::Tls(Box::new(tls)),
							Err(e) => { warn!(error = %e, %peer, "tls handshake failed"); continue; }
						}
					} else {
						MaybeTlsStream::Plain(socket)
					};

					let cfg = cfg.clone();
					let tenant = tenant;
					let store = Arc::clone(&store);
					let write_limiter = Arc::clone(&write_limiter);
					let counters = Arc::clone(&counters);
					let parser_pool = Arc::clone(&parser_pool);
					let cancel = registry.cancellation();
					tokio::spawn(async move {
						let _guard = guard;
						let remote_ip = peer.ip().to_string();
						if let Err(e) = run_stream_pipeline(
							socket, &cfg, tenant, remote_ip, store, write_limiter, counters, parser_pool, cancel,
						)
						.await
						{
							warn!(error = %e, %peer, "ingest stream ended with error");
						}
					});
				}
			}
		}
	}))
}

async fn spawn_unix_stream(
	cfg: ListenerConfig,
	tenant: TenantId,
	store: Arc<dyn Store>,
	registry: Arc<ConnectionRegistry>,
	write_limiter: Arc<Semaphore>,
	counters: Arc<PipelineCounters>,
	parser_pool: Arc<crate::ingest::pool::Pool<crate::ingest::record_parser::RecordParser>>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
	let _ = std::fs::remove_file(&cfg.bind);
	let listener = UnixListener::bind(&cfg.bind)?;
	info!(path = %cfg.bind, "syslog unix listener bound");
	let cancel = registry.cancellation();

	Ok(tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				accepted = listener.accept() => {
					let (socket, _) = match accepted {
						Ok(pair) => pair,
						Err(e) => { warn!(error = %e, "unix accept failed"); continue; }
					};
					let Some(guard) = registry.admit() else {
						continue;
					};
					let cfg = cfg.clone();
					let store = Arc::clone(&store);
					let write_limiter = Arc::clone(&write_limiter);
					let counters = Arc::clone(&counters);
					let parser_pool = Arc::clone(&parser_pool);
					let cancel = registry.cancellation();
					tokio::spawn(async move {
						let _guard = guard;
						if let Err(e) = run_stream_pipeline(
							socket, &cfg, tenant, String::new(), store, write_limiter, counters, parser_pool, cancel,
						)
						.await
						{
							warn!(error = %e, "unix ingest stream ended with error");
						}
					});
				}
			}
		}
	}))
}

/// UDP worker pool sized to the CPU count (spec.md §4.3, §5); every worker
/// owns a reusable 64 KiB buffer and reads from the shared socket.
async fn spawn_udp(
	cfg: ListenerConfig,
	tenant: TenantId,
	store: Arc<dyn Store>,
	registry: Arc<ConnectionRegistry>,
	counters: Arc<PipelineCounters>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
	let addr: SocketAddr = cfg.bind.parse()?;
	let socket = Arc::new(UdpSocket::bind(addr).await?);
	info!(%addr, "syslog udp listener bound");
	let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
	let cancel = registry.cancellation();

	let handles: Vec<_> = (0..workers)
		.map(|_| {
			let socket = Arc::clone(&socket);
			let cfg = cfg.clone();
			let store = Arc::clone(&store);
			let counters = Arc::clone(&counters);
			let cancel = cancel.clone();
			tokio::spawn(async move {
				let mut buf = vec![0u8; 64 * 1024];
				let parser = crate::ingest::record_parser::RecordParser::new();
				loop {
					tokio::select! {
						_ = cancel.cancelled() => break,
						result = socket.recv_from(&mut buf) => {
							match result {
								Ok((n, peer)) => {
									counters.udp_requests.fetch_add(1, Ordering::Relaxed);
									let ctx = crate::ingest::record_parser::ParseContext {
										use_local_timestamp: cfg.use_local_timestamp,
										remote_ip: peer.ip().to_string(),
										use_remote_ip: cfg.use_remote_ip,
										extra_fields: cfg.extra_fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
										ignore_fields: cfg.ignore_fields.clone(),
										decolorize_fields: cfg.decolorize_fields.clone(),
									};
									if let Err(e) = crate::ingest::pipeline::ingest_datagram(&buf[..n], &ctx, tenant, &store, &parser).await {
										counters.udp_errors.fetch_add(1, Ordering::Relaxed);
										warn!(error = %e, "udp datagram rejected");
									}
								}
								Err(e) if is_temporary(&e) => {
									counters.udp_errors.fetch_add(1, Ordering::Relaxed);
									tokio::time::sleep(Duration::from_secs(1)).await;
								}
								Err(e) => {
									warn!(error = %e, "udp worker exiting");
									break;
								}
							}
						}
					}
				}
			})
		})
		.collect();

	Ok(tokio::spawn(async move {
		for h in handles {
			let _ = h.await;
		}
	}))
}

async fn spawn_unix_datagram(
	cfg: ListenerConfig,
	tenant: TenantId,
	store: Arc<dyn Store>,
	registry: Arc<ConnectionRegistry>,
	counters: Arc<PipelineCounters>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
	let _ = std::fs::remove_file(&cfg.bind);
	let socket = Arc::new(UnixDatagram::bind(&cfg.bind)?);
	info!(path = %cfg.bind, "syslog unix datagram listener bound");
	let cancel = registry.cancellation();

	Ok(tokio::spawn(async move {
		let mut buf = vec![0u8; 64 * 1024];
		let parser = crate::ingest::record_parser::RecordParser::new();
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				result = socket.recv(&mut buf) => {
					match result {
						Ok(n) => {
							counters.udp_requests.fetch_add(1, Ordering::Relaxed);
							let ctx = crate::ingest::record_parser::ParseContext {
								use_local_timestamp: cfg.use_local_timestamp,
								remote_ip: String::new(),
								use_remote_ip: false,
								extra_fields: cfg.extra_fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
								ignore_fields: cfg.ignore_fields.clone(),
								decolorize_fields: cfg.decolorize_fields.clone(),
							};
							if let Err(e) = crate::ingest::pipeline::ingest_datagram(&buf[..n], &ctx, tenant, &store, &parser).await {
								counters.udp_errors.fetch_add(1, Ordering::Relaxed);
								warn!(error = %e, "unix datagram rejected");
							}
						}
						Err(e) => {
							warn!(error = %e, "unix datagram worker exiting");
							break;
						}
					}
				}
			}
		}
	}))
}

fn is_temporary(e: &std::io::Error) -> bool {
	!matches!(e.kind(), std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe)
}

/// Per-listener decompression selection (spec.md §4.3 pipeline stage 3).
pub fn compress_method_of(cfg: &ListenerConfig) -> CompressMethod {
	cfg.compress_method
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn load_tls_acceptor_surfaces_missing_cert_file() {
		let err = load_tls_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
		assert!(err.to_string().to_lowercase().contains("no such file") || err.to_string().to_lowercase().contains("not found"));
	}

	#[tokio::test]
	async fn admission_rejects_past_capacity() {
		let registry = ConnectionRegistry::new(1);
		let g1 = registry.admit();
		assert!(g1.is_some());
		let g2 = registry.admit();
		assert!(g2.is_none());
		drop(g1);
		let g3 = registry.admit();
		assert!(g3.is_some());
	}

	#[tokio::test]
	async fn unlimited_registry_admits_everything() {
		let registry = ConnectionRegistry::new(0);
		let guards: Vec<_> = (0..100).map(|_| registry.admit().unwrap()).collect();
		assert_eq!(guards.len(), 100);
	}

	#[tokio::test]
	async fn close_all_returns_once_connections_drain() {
		let registry = ConnectionRegistry::new(0);
		let guard = registry.admit().unwrap();
		let registry2 = Arc::clone(&registry);
		let task = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			drop(guard);
		});
		registry.close_all(Duration::from_secs(5)).await;
		task.await.unwrap();
	}

	#[tokio::test]
	async fn close_all_times_out_past_grace_period() {
		let registry = ConnectionRegistry::new(0);
		let _guard = registry.admit().unwrap();
		let start = std::time::Instant::now();
		registry.close_all(Duration::from_millis(20)).await;
		assert!(start.elapsed() >= Duration::from_millis(20));
	}
}
