use crate::cluster::{internal_handlers, query_handlers};
use crate::{metrics, state};
use axum::{
	extract::Request,
	http::StatusCode,
	middleware::from_fn_with_state,
	routing::{any, get, post},
	Router,
};
use http::Request as HttpRequest;
use tower::ServiceBuilder;
use tower_http::trace::DefaultOnResponse;
use tower_http::{
	compression::CompressionLayer, decompression::RequestDecompressionLayer,
	timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{info, Span};

static SKIP_LOGGING_PATHS: [&str; 2] = ["/ready", "/metrics"];

/// Builds the HTTP surface (spec.md §6): the public `/select/logsql/*`
/// query endpoints, the internal `/internal/select/*` storage-node-role
/// endpoints, and the ambient `/ready`/`/metrics` endpoints.
pub fn new_router(state: state::AppState) -> Router {
	let cfg = state.config.clone();
	let app = Router::new()
		.route("/ready", any(ok))
		.route("/metrics", get(metrics::export_metrics))
		// public query endpoints
		.route("/select/logsql/query", get(query_handlers::query))
		.route("/select/logsql/hits", get(query_handlers::hits))
		.route("/select/logsql/facets", get(query_handlers::facets))
		.route("/select/logsql/field_names", get(query_handlers::field_names))
		.route("/select/logsql/field_values", get(query_handlers::field_values))
		.route("/select/logsql/stream_field_names", get(query_handlers::stream_field_names))
		.route("/select/logsql/stream_field_values", get(query_handlers::stream_field_values))
		.route("/select/logsql/streams", get(query_handlers::streams))
		.route("/select/logsql/stream_ids", get(query_handlers::stream_ids))
		.route("/select/logsql/stats_query", get(query_handlers::stats_query))
		.route("/select/logsql/stats_query_range", get(query_handlers::stats_query_range))
		.route("/select/logsql/tail", get(query_handlers::tail))
		// internal cluster protocol, storage-node role
		.route("/internal/select/query", post(internal_handlers::query))
		.route("/internal/select/field_names", post(internal_handlers::field_names))
		.route("/internal/select/field_values", post(internal_handlers::field_values))
		.route("/internal/select/stream_field_names", post(internal_handlers::stream_field_names))
		.route("/internal/select/stream_field_values", post(internal_handlers::stream_field_values))
		.route("/internal/select/streams", post(internal_handlers::streams))
		.route("/internal/select/stream_ids", post(internal_handlers::stream_ids))
		.fallback(handler_404)
		.with_state(state.clone())
		.layer(
			ServiceBuilder::new()
				.layer(
					TraceLayer::new_for_http()
						.on_request(|req: &HttpRequest<_>, _: &Span| {
							let p = req.uri().path();
							if SKIP_LOGGING_PATHS.contains(&p) {
								return;
							}
							info!(method = ?req.method(), path = p, query = req.uri().query(), "request received");
						})
						.on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
				)
				.layer(from_fn_with_state(state, metrics::record_middleware))
				.layer(TimeoutLayer::new(cfg.server.timeout))
				.layer(CompressionLayer::new())
				.layer(RequestDecompressionLayer::new()),
		);
	app
}

async fn ok() -> StatusCode {
	StatusCode::OK
}

async fn handler_404(req: Request) -> StatusCode {
	dbg!(req.uri());
	StatusCode::NOT_FOUND
}
