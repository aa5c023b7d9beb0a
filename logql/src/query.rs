use crate::pipe::{parse_pipe, Pipe, PipeParseError};
use std::fmt;
use std::str::FromStr;

/// The maximum number of rows `last_n` scenarios are allowed to pull per
/// round; mirrors the fast-path fetch multiplier used by the optimizer
/// (spec.md §6).
pub const LAST_N_FAST_PATH_MULTIPLIER: u64 = 2;

/// A LogsQL query: an opaque filter expression plus a typed pipeline.
/// Only pipe boundaries are modeled structurally — the filter itself is
/// kept as text, since nothing this crate does needs to understand filter
/// semantics, only where a query can be split between storage nodes and
/// the local coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
	filter: String,
	start_nsec: i64,
	end_nsec: i64,
	pipes: Vec<Pipe>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryParseError {
	#[error("empty query")]
	Empty,
	#[error("query has no filter before the first pipe")]
	MissingFilter,
	#[error(transparent)]
	Pipe(#[from] PipeParseError),
}

impl Query {
	pub fn new(filter: impl Into<String>, start_nsec: i64, end_nsec: i64) -> Self {
		Self {
			filter: filter.into(),
			start_nsec,
			end_nsec,
			pipes: Vec::new(),
		}
	}

	pub fn filter(&self) -> &str {
		&self.filter
	}

	pub fn time_range(&self) -> (i64, i64) {
		(self.start_nsec, self.end_nsec)
	}

	pub fn pipes(&self) -> &[Pipe] {
		&self.pipes
	}

	/// Returns a copy of this query with its time range narrowed or
	/// widened and all pipes preserved. Used when re-issuing a query at a
	/// different window, e.g. each round of the last-N binary search.
	pub fn clone_with_time_filter(&self, start_nsec: i64, end_nsec: i64) -> Self {
		Self {
			start_nsec,
			end_nsec,
			..self.clone()
		}
	}

	pub fn set_filter_time_range(&mut self, start_nsec: i64, end_nsec: i64) {
		self.start_nsec = start_nsec;
		self.end_nsec = end_nsec;
	}

	/// Returns a copy of this query evaluated as of `timestamp_nsec`: the
	/// end of the time range is capped to `timestamp_nsec` so that a live
	/// tail loop issuing the same base query repeatedly never observes
	/// rows past the instant it last polled.
	pub fn clone_at(&self, timestamp_nsec: i64) -> Self {
		let end = self.end_nsec.min(timestamp_nsec);
		Self {
			end_nsec: end,
			..self.clone()
		}
	}

	pub fn append_pipe(&mut self, pipe: Pipe) {
		self.pipes.push(pipe);
	}

	/// A query can be live-tailed only if it has no pipe that needs a
	/// global view across the full result set (stats, joins, facets):
	/// each poll only ever has a partial window of rows available.
	pub fn can_live_tail(&self) -> bool {
		!self.pipes.iter().any(|p| p.requires_local_execution() || p.is_query_stats())
	}

	/// A query can use the last-N optimizer only if its pipeline is
	/// exactly `sort by (_time) desc` optionally followed by
	/// `offset`/`limit`, with nothing after it (spec.md §6).
	pub fn can_return_last_n(&self) -> Option<u64> {
		match self.pipes.as_slice() {
			[Pipe::SortTimeDesc] => None,
			[Pipe::SortTimeDesc, Pipe::OffsetLimit { offset: 0, limit }] => Some(*limit),
			_ => None,
		}
	}

	/// Field names referenced by `stats_by_time`/`stats` pipes, used to
	/// report which fields a query's aggregation groups by.
	pub fn get_stats_by_fields(&self) -> Vec<String> {
		self.pipes
			.iter()
			.flat_map(|p| match p {
				Pipe::StatsByTime { fields, .. } => fields.clone(),
				Pipe::StatsAggregation { fields, by } => {
					let mut f = fields.clone();
					f.extend(by.clone());
					f
				}
				_ => Vec::new(),
			})
			.collect()
	}

	/// Suggested fan-out concurrency: queries that only ever need a
	/// bounded prefix of rows (last-N) can run each storage node
	/// sequentially with early termination, everything else should fan
	/// out to every node concurrently.
	pub fn get_concurrency(&self, node_count: usize) -> usize {
		if self.can_return_last_n().is_some() {
			1
		} else {
			node_count
		}
	}

	/// Splits this query's pipeline into a remote-pushable prefix and a
	/// local-only suffix (spec.md §4.8). The base filter always travels
	/// with the remote portion.
	///
	/// `query_stats` gets special treatment (spec.md §4.8 step 3): everything
	/// up to and including the `query_stats` pipe itself is pushed remote
	/// (each node collects its own stats block there), and everything after
	/// it runs locally, with a companion `query_stats_local` appended so
	/// cluster-wide stats are aggregated exactly once. Absent a
	/// `query_stats` pipe, the general rule applies: the first pipe that
	/// cannot be pushed (and everything after it) runs locally.
	pub fn split_remote_local(&self) -> (Query, Vec<Pipe>) {
		let mut remote = Query::new(self.filter.clone(), self.start_nsec, self.end_nsec);
		let mut local = Vec::new();

		if let Some(stats_idx) = self.pipes.iter().position(|p| p.is_query_stats()) {
			for pipe in &self.pipes[..=stats_idx] {
				remote.append_pipe(pipe.clone());
			}
			local.extend(self.pipes[stats_idx + 1..].iter().cloned());
			local.push(Pipe::QueryStatsLocal);
			return (remote, local);
		}

		let mut splitting = false;
		for pipe in &self.pipes {
			if !splitting && !pipe.requires_local_execution() {
				remote.append_pipe(pipe.clone());
			} else {
				splitting = true;
				local.push(pipe.clone());
			}
		}
		(remote, local)
	}

	/// Columns actually needed by this query's pipeline, or `None` if some
	/// pipe needs every column (e.g. `facets`). Storage nodes use this to
	/// prune unrequested columns from their result set transparently.
	pub fn needed_columns(&self) -> Option<Vec<String>> {
		let mut needed = Vec::new();
		for pipe in &self.pipes {
			match pipe.needed_fields() {
				Some(fields) => needed.extend(fields),
				None => return None,
			}
		}
		needed.sort();
		needed.dedup();
		Some(needed)
	}
}

impl fmt::Display for Query {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.filter)?;
		for pipe in &self.pipes {
			write!(f, " | {pipe}")?;
		}
		Ok(())
	}
}

impl FromStr for Query {
	type Err = QueryParseError;

	/// Parses `<filter> | <pipe> | <pipe> ...`. The time range is not part
	/// of the textual form: callers set it via [`Query::new`] or
	/// [`Query::clone_with_time_filter`] from the request's own
	/// `start`/`end` parameters.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.trim().is_empty() {
			return Err(QueryParseError::Empty);
		}
		let mut parts = s.split('|');
		let filter = parts.next().ok_or(QueryParseError::MissingFilter)?.trim();
		if filter.is_empty() {
			return Err(QueryParseError::MissingFilter);
		}
		let mut query = Query::new(filter, 0, 0);
		for part in parts {
			query.append_pipe(parse_pipe(part)?);
		}
		Ok(query)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn roundtrips_through_display_and_fromstr() {
		let mut q = Query::new("level:error", 0, 100);
		q.append_pipe(Pipe::SortTimeDesc);
		q.append_pipe(Pipe::OffsetLimit { offset: 0, limit: 50 });
		let rendered = q.to_string();
		let reparsed: Query = rendered.parse().unwrap();
		assert_eq!(reparsed.filter(), q.filter());
		assert_eq!(reparsed.pipes(), q.pipes());
	}

	#[test]
	fn last_n_recognized_only_for_sort_then_bounded_offset_limit() {
		let mut q = Query::new("*", 0, 100);
		q.append_pipe(Pipe::SortTimeDesc);
		q.append_pipe(Pipe::OffsetLimit { offset: 0, limit: 20 });
		assert_eq!(q.can_return_last_n(), Some(20));

		let mut q2 = Query::new("*", 0, 100);
		q2.append_pipe(Pipe::SortTimeDesc);
		q2.append_pipe(Pipe::OffsetLimit { offset: 10, limit: 20 });
		assert_eq!(q2.can_return_last_n(), None);
	}

	#[test]
	fn live_tail_rejects_stats_and_joins() {
		let mut q = Query::new("*", 0, 100);
		q.append_pipe(Pipe::SortTimeDesc);
		assert!(q.can_live_tail());
		q.append_pipe(Pipe::TotalStats);
		assert!(!q.can_live_tail());
	}

	#[test]
	fn split_remote_local_stops_at_first_local_only_pipe() {
		let mut q = Query::new("*", 0, 100);
		q.append_pipe(Pipe::SortTimeDesc);
		q.append_pipe(Pipe::TotalStats);
		q.append_pipe(Pipe::FieldsProjection(vec!["x".into()]));
		let (remote, local) = q.split_remote_local();
		assert_eq!(remote.pipes(), &[Pipe::SortTimeDesc]);
		assert_eq!(local, vec![Pipe::TotalStats, Pipe::FieldsProjection(vec!["x".into()])]);
	}

	#[test]
	fn query_stats_pipe_and_everything_before_it_go_remote() {
		let mut q = Query::new("*", 0, 100);
		q.append_pipe(Pipe::FieldsProjection(vec!["x".into()]));
		q.append_pipe(Pipe::QueryStats);
		let (remote, local) = q.split_remote_local();
		assert_eq!(
			remote.pipes(),
			&[Pipe::FieldsProjection(vec!["x".into()]), Pipe::QueryStats]
		);
		assert_eq!(local, vec![Pipe::QueryStatsLocal]);
	}

	#[test]
	fn query_stats_pushes_everything_after_it_to_local_with_companion() {
		let mut q = Query::new("*", 0, 100);
		q.append_pipe(Pipe::QueryStats);
		q.append_pipe(Pipe::TotalStats);
		let (remote, local) = q.split_remote_local();
		assert_eq!(remote.pipes(), &[Pipe::QueryStats]);
		assert_eq!(local, vec![Pipe::TotalStats, Pipe::QueryStatsLocal]);
	}

	#[test]
	fn needed_columns_is_none_when_facets_present() {
		let mut q = Query::new("*", 0, 100);
		q.append_pipe(Pipe::Facets { limit: 5 });
		assert_eq!(q.needed_columns(), None);
	}

	#[test]
	fn needed_columns_unions_and_dedups_across_pipes() {
		let mut q = Query::new("*", 0, 100);
		q.append_pipe(Pipe::FieldsProjection(vec!["a".into(), "b".into()]));
		q.append_pipe(Pipe::StatsByTime { step_seconds: 60, fields: vec!["a".into()] });
		assert_eq!(
			q.needed_columns(),
			Some(vec!["_time".to_string(), "a".to_string(), "b".to_string()])
		);
	}

	#[test]
	fn clone_at_caps_end_but_not_start() {
		let q = Query::new("*", 0, 1000);
		let c = q.clone_at(500);
		assert_eq!(c.time_range(), (0, 500));
		let c2 = q.clone_at(2000);
		assert_eq!(c2.time_range(), (0, 1000));
	}

	#[test]
	fn rejects_empty_query() {
		assert_eq!("".parse::<Query>(), Err(QueryParseError::Empty));
	}
}
