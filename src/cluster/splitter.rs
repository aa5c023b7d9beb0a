//! Query splitter (spec.md §4.8): expands subqueries, then decomposes a
//! `Query` into a remote-pushable query and a local pipe chain, attaching
//! a column-pruning projection to the remote side.

use async_trait::async_trait;
use logql::{Pipe, Query};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitError {
	#[error("subquery execution failed: {0}")]
	SubqueryFailed(String),
}

/// Runs a nested query during planning and returns the literal values it
/// produced, so the planner stays independent of the execution layer
/// (spec.md §9 "Subquery expansion").
#[async_trait]
pub trait RunQuery: Send + Sync {
	async fn run_query(&self, query: &Query) -> Result<Vec<String>, SplitError>;
}

fn subquery_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"in\(subquery:([^)]*)\)").unwrap())
}

/// Replaces every `in(subquery:<inner filter>)` occurrence in `query`'s
/// filter text with a literal `in(v1,v2,...)` set, running each inner
/// query through `runner` at the same time range as the outer query.
pub async fn expand_subqueries(query: &Query, runner: &dyn RunQuery) -> Result<Query, SplitError> {
	let filter = query.filter().to_string();
	let pattern = subquery_pattern();

	let matches: Vec<_> = pattern.captures_iter(&filter).collect();
	if matches.is_empty() {
		return Ok(query.clone());
	}

	let (start, end) = query.time_range();
	let mut expanded = filter.clone();
	// Replace from the last match backward so earlier byte offsets stay valid.
	for cap in matches.into_iter().rev() {
		let whole = cap.get(0).unwrap();
		let inner_filter = cap.get(1).unwrap().as_str().trim();
		let inner_query = Query::new(inner_filter, start, end);
		let values = runner
			.run_query(&inner_query)
			.await
			.map_err(|e| SplitError::SubqueryFailed(e.to_string()))?;
		let replacement = format!("in({})", values.join(","));
		expanded.replace_range(whole.start()..whole.end(), &replacement);
	}

	let mut result = Query::new(expanded, start, end);
	for pipe in query.pipes() {
		result.append_pipe(pipe.clone());
	}
	Ok(result)
}

pub struct SplitResult {
	pub remote: Query,
	pub local: Vec<Pipe>,
}

/// Full split: subquery expansion, remote/local decomposition, then
/// column-pruning projection attached to the remote query (spec.md §4.8
/// steps 1, 2/3/4, 5).
pub async fn split_query(query: &Query, runner: &dyn RunQuery) -> Result<SplitResult, SplitError> {
	let expanded = expand_subqueries(query, runner).await?;
	let (mut remote, local) = expanded.split_remote_local();
	if let Some(needed) = expanded.needed_columns() {
		if !needed.is_empty() {
			remote.append_pipe(Pipe::FieldsProjection(needed));
		}
	}
	Ok(SplitResult { remote, local })
}
