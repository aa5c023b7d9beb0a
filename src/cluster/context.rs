//! Query context (spec.md §4.4): a request-scoped parameter bundle, not an
//! executor. Creating one runs nothing.

use common::{QueryStats, QueryStatsSnapshot, TenantId};
use logql::Query;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct QueryContext {
	pub tenants: Vec<TenantId>,
	pub query: Query,
	pub stats: Arc<QueryStats>,
	pub cancel: CancellationToken,
	started_at: Instant,
}

impl QueryContext {
	pub fn new(tenants: Vec<TenantId>, query: Query) -> Self {
		Self {
			tenants,
			query,
			stats: Arc::new(QueryStats::default()),
			cancel: CancellationToken::new(),
			started_at: Instant::now(),
		}
	}

	pub fn elapsed(&self) -> std::time::Duration {
		self.started_at.elapsed()
	}

	pub fn stats_snapshot(&self) -> QueryStatsSnapshot {
		let mut snap = self.stats.snapshot();
		snap.query_duration_nsecs = self.elapsed().as_nanos() as u64;
		snap
	}

	/// Returns a new context carrying a different query but the same
	/// tenants, stats accumulator, and cancellation token (spec.md §4.4
	/// "with new query").
	pub fn with_query(&self, query: Query) -> Self {
		Self {
			tenants: self.tenants.clone(),
			query,
			stats: Arc::clone(&self.stats),
			cancel: self.cancel.clone(),
			started_at: self.started_at,
		}
	}

	/// Returns a new context with a fresh child cancellation token derived
	/// from this one (spec.md §4.4 "with new context"); cancelling the
	/// parent still cancels the child.
	pub fn with_child_cancellation(&self) -> Self {
		Self {
			tenants: self.tenants.clone(),
			query: self.query.clone(),
			stats: Arc::clone(&self.stats),
			cancel: self.cancel.child_token(),
			started_at: self.started_at,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn with_query_preserves_stats_and_cancellation() {
		let ctx = QueryContext::new(vec![TenantId::new(1, 1)], Query::new("*", 0, 1));
		ctx.stats.rows_processed.fetch_add(5, std::sync::atomic::Ordering::Relaxed);
		let ctx2 = ctx.with_query(Query::new("level:error", 0, 1));
		assert_eq!(ctx2.stats_snapshot().rows_processed, 5);
		assert_eq!(ctx2.query.filter(), "level:error");
	}

	#[test]
	fn child_cancellation_is_triggered_by_parent() {
		let ctx = QueryContext::new(vec![], Query::new("*", 0, 1));
		let child = ctx.with_child_cancellation();
		assert!(!child.cancel.is_cancelled());
		ctx.cancel.cancel();
		assert!(child.cancel.is_cancelled());
	}

	#[test]
	fn creating_a_context_does_not_run_anything() {
		let ctx = QueryContext::new(vec![TenantId::new(1, 1)], Query::new("*", 0, 1));
		assert_eq!(ctx.stats_snapshot().rows_processed, 0);
	}
}
