//! The HTTP-facing error taxonomy (spec.md §7): how a failure anywhere in
//! the ingest or query path is classified, logged, and turned into a
//! response. Input errors are 400s counted but never logged at ERROR
//! level; cancellation is suppressed entirely (no counter, no log, no
//! distinguishing response status beyond the connection simply closing);
//! everything downstream of a storage node failing is 502 and counted.

use crate::cluster::executor::ExecutorError;
use crate::cluster::http_params::HttpParamError;
use crate::cluster::lastn::LastNError;
use crate::cluster::remote_client::RemoteClientError;
use crate::cluster::splitter::SplitError;
use crate::cluster::tail::TailError;
use crate::cluster::wire::WireError as ClusterWireError;
use crate::ingest::line_reader::FrameError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use streamstore::StoreError;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AppError {
	#[error("bad request: {0}")]
	BadRequest(String),
	#[error("request cancelled")]
	Cancellation,
	#[error("upstream storage node unavailable: {0}")]
	UpstreamUnavailable(String),
	#[error("malformed frame: {0}")]
	BadFrame(String),
	#[error("truncated stream")]
	TruncatedStream,
	#[error("failed to decode response body: {0}")]
	DecodeFailure(String),
	#[error("store overloaded, try again later")]
	Overloaded,
	#[error("frame of {0} bytes exceeds the configured maximum")]
	FrameTooLarge(usize),
	#[error("internal error: {0}")]
	Internal(String),
}

impl From<logql::QueryParseError> for AppError {
	fn from(e: logql::QueryParseError) -> Self {
		AppError::BadRequest(e.to_string())
	}
}

impl From<HttpParamError> for AppError {
	fn from(e: HttpParamError) -> Self {
		AppError::BadRequest(e.to_string())
	}
}

impl From<FrameError> for AppError {
	fn from(e: FrameError) -> Self {
		match e {
			FrameError::FrameTooLarge(n) => AppError::FrameTooLarge(n),
			FrameError::ShortRead | FrameError::MalformedLength => AppError::BadFrame(e.to_string()),
		}
	}
}

impl From<StoreError> for AppError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::Overloaded => AppError::Overloaded,
			StoreError::Internal(msg) => AppError::Internal(msg),
		}
	}
}

impl From<ClusterWireError> for AppError {
	fn from(e: ClusterWireError) -> Self {
		match e {
			ClusterWireError::TruncatedStream => AppError::TruncatedStream,
			ClusterWireError::BadFrame(msg) => AppError::BadFrame(msg),
		}
	}
}

impl From<RemoteClientError> for AppError {
	fn from(e: RemoteClientError) -> Self {
		match e {
			RemoteClientError::Cancelled => AppError::Cancellation,
			RemoteClientError::UpstreamUnavailable(msg) => AppError::UpstreamUnavailable(msg),
			RemoteClientError::NonOk { status, body } => {
				AppError::UpstreamUnavailable(format!("status {status}: {body}"))
			}
			RemoteClientError::Wire(w) => w.into(),
		}
	}
}

impl From<SplitError> for AppError {
	fn from(e: SplitError) -> Self {
		match e {
			SplitError::SubqueryFailed(msg) => AppError::UpstreamUnavailable(msg),
		}
	}
}

impl From<LastNError> for AppError {
	fn from(e: LastNError) -> Self {
		match e {
			LastNError::QueryFailed(msg) => AppError::UpstreamUnavailable(msg),
		}
	}
}

impl From<ExecutorError> for AppError {
	fn from(e: ExecutorError) -> Self {
		match e {
			ExecutorError::Split(e) => e.into(),
			ExecutorError::Remote(e) => e.into(),
			ExecutorError::LastN(e) => e.into(),
		}
	}
}

impl From<TailError> for AppError {
	fn from(e: TailError) -> Self {
		match e {
			TailError::QueryFailed(msg) => AppError::UpstreamUnavailable(msg),
			// A broken sink means the client went away mid-stream; treated
			// the same as a cancellation, not a server-side failure.
			TailError::SinkClosed(_) => AppError::Cancellation,
		}
	}
}

impl AppError {
	fn status(&self) -> StatusCode {
		match self {
			AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
			AppError::Cancellation => StatusCode::OK,
			AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
			AppError::BadFrame(_) | AppError::TruncatedStream | AppError::DecodeFailure(_) => StatusCode::BAD_GATEWAY,
			AppError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
			AppError::FrameTooLarge(_) => StatusCode::BAD_REQUEST,
			AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for AppError {
	fn into_response(self) -> Response {
		match &self {
			// Cancellation never reaches a log line or a distinguishing
			// body: the client already stopped listening.
			AppError::Cancellation => {}
			AppError::BadRequest(_) | AppError::FrameTooLarge(_) => info!(error = %self, "rejected request"),
			_ => warn!(error = %self, "request failed"),
		}
		let status = self.status();
		(status, self.to_string()).into_response()
	}
}
