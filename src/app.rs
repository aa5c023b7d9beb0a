use crate::{config::AppConfig, ingest, metrics, routes, state};
use anyhow::Result;
use std::{fs::OpenOptions, sync::Arc, time::Duration};
use streamstore::{InMemoryStore, Store};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

/// Grace period given to in-flight syslog connections to drain before the
/// listeners are torn down on shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub async fn start() -> Result<()> {
	// load configuration
	let cfg = AppConfig::new().unwrap();
	cfg.validate().unwrap();

	init_tracing_subscriber(cfg.server.log.filter_directives.as_str());

	// installs the process-wide default crypto provider any TLS-terminating
	// syslog listener's rustls::ServerConfig needs; a no-op if the binary
	// has no TLS listener configured, so it's done unconditionally here
	// rather than threaded through listener setup.
	let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

	// init metrics
	let metrics_handle = metrics::setup_metrcis();

	// the process-wide current-year cell RFC3164 timestamps fall back to
	ingest::year::spawn_refresher();

	let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
	let counters = Arc::new(ingest::PipelineCounters::default());
	let listener_pool = ingest::ListenerPool::spawn(cfg.syslog.clone(), Arc::clone(&store), Arc::clone(&counters)).await?;

	let executor = state::build_executor(&cfg);
	let metrics_handle = Arc::new(metrics_handle);
	let app_state = state::AppState {
		config: Arc::new(cfg.clone()),
		store,
		executor,
		metrics: Arc::clone(&metrics_handle),
	};
	let app = routes::new_router(app_state);

	tokio::spawn(observe_pipeline_counters_loop(metrics_handle, counters));

	let listener = tokio::net::TcpListener::bind(cfg.server.listen_addr.clone()).await.unwrap();
	info!("Listening on: {}", cfg.server.listen_addr);
	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await
		.unwrap();

	listener_pool.shutdown(SHUTDOWN_GRACE_PERIOD).await;
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

/// Publishes the ingest pipeline's plain atomics as Prometheus series once
/// a second, for the lifetime of the process.
async fn observe_pipeline_counters_loop(metrics: Arc<metrics::Instrumentations>, counters: Arc<ingest::PipelineCounters>) {
	let mut last = metrics::PipelineCountersSnapshot::default();
	loop {
		metrics::observe_pipeline_counters(&metrics, &counters, &mut last);
		tokio::time::sleep(Duration::from_secs(1)).await;
	}
}

fn init_tracing_subscriber(filter_directives: &str) {
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter_directives))
		.with(tracing_subscriber::fmt::layer().json().with_writer(|| get_writer("stdout")))
		.init();
}

fn get_writer(file: &str) -> Box<dyn std::io::Write> {
	if file.eq_ignore_ascii_case("stdout") {
		Box::new(std::io::stdout())
	} else if file.eq_ignore_ascii_case("stderr") {
		Box::new(std::io::stderr())
	} else {
		Box::new(OpenOptions::new().append(true).create(true).open(file).unwrap())
	}
}
