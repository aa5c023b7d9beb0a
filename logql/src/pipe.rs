use nom::{
	branch::alt,
	bytes::complete::tag,
	character::complete::{char, digit1, multispace0, multispace1},
	combinator::{map, map_res, opt, value},
	multi::separated_list1,
	sequence::{delimited, preceded, tuple},
	IResult,
};
use std::fmt;

/// A single stage in a LogsQL pipeline. The filter/selector expression a
/// query starts from is kept as an opaque string on [`crate::Query`] — only
/// pipes are modeled structurally, since splitting a query into a remote
/// and a local portion only ever needs to reason about pipe boundaries
/// (spec.md §4.8), never about filter semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipe {
	SortTimeDesc,
	OffsetLimit { offset: u64, limit: u64 },
	StatsByTime { step_seconds: u64, fields: Vec<String> },
	Facets { limit: u64 },
	FieldsProjection(Vec<String>),
	QueryStats,
	QueryStatsLocal,
	Join,
	RunningStats,
	TotalStats,
	StatsAggregation { fields: Vec<String>, by: Vec<String> },
}

impl Pipe {
	/// Pipes that storage nodes can execute directly: filters (handled as
	/// part of the opaque base query), projections, non-last-N
	/// offset/limit. `sort by (_time) desc` is pushable on its own but
	/// `offset`/`limit` immediately after it is handled specially by the
	/// last-N optimizer rather than the generic splitter (spec.md §4.8.4).
	pub fn is_remote_pushable(&self) -> bool {
		matches!(
			self,
			Pipe::SortTimeDesc | Pipe::FieldsProjection(_) | Pipe::OffsetLimit { .. }
		)
	}

	/// Pipes that require a global view across all nodes and therefore can
	/// only run locally after fan-out merge.
	pub fn requires_local_execution(&self) -> bool {
		matches!(
			self,
			Pipe::Join
				| Pipe::RunningStats
				| Pipe::TotalStats
				| Pipe::StatsAggregation { .. }
				| Pipe::QueryStatsLocal
		)
	}

	pub fn is_query_stats(&self) -> bool {
		matches!(self, Pipe::QueryStats)
	}

	/// Field names this pipe reads, used to compute the "needed columns"
	/// projection pushed down to storage (spec.md §4.8.5). `None` means
	/// "all columns" (a conservative default for pipes this model doesn't
	/// otherwise understand).
	pub fn needed_fields(&self) -> Option<Vec<String>> {
		match self {
			Pipe::SortTimeDesc => Some(vec!["_time".to_string()]),
			Pipe::FieldsProjection(fields) => Some(fields.clone()),
			Pipe::OffsetLimit { .. } => Some(vec![]),
			Pipe::StatsByTime { fields, .. } => {
				let mut f = fields.clone();
				f.push("_time".to_string());
				Some(f)
			}
			Pipe::StatsAggregation { fields, by } => {
				let mut f = fields.clone();
				f.extend(by.clone());
				Some(f)
			}
			Pipe::Facets { .. } => None,
			Pipe::QueryStats | Pipe::QueryStatsLocal | Pipe::Join | Pipe::RunningStats | Pipe::TotalStats => None,
		}
	}
}

impl fmt::Display for Pipe {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Pipe::SortTimeDesc => write!(f, "sort by (_time) desc"),
			Pipe::OffsetLimit { offset, limit } => write!(f, "offset {offset} limit {limit}"),
			Pipe::StatsByTime { step_seconds, fields } => {
				write!(f, "stats_by_time step={step_seconds}s fields={}", fields.join(","))
			}
			Pipe::Facets { limit } => write!(f, "facets limit {limit}"),
			Pipe::FieldsProjection(fields) => write!(f, "fields {}", fields.join(",")),
			Pipe::QueryStats => write!(f, "query_stats"),
			Pipe::QueryStatsLocal => write!(f, "query_stats_local"),
			Pipe::Join => write!(f, "join"),
			Pipe::RunningStats => write!(f, "running_stats"),
			Pipe::TotalStats => write!(f, "total_stats"),
			Pipe::StatsAggregation { fields, by } => {
				if by.is_empty() {
					write!(f, "stats fields={}", fields.join(","))
				} else {
					write!(f, "stats fields={} by=({})", fields.join(","), by.join(","))
				}
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse pipe {0:?}")]
pub struct PipeParseError(pub String);

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
	F: FnMut(&'a str) -> IResult<&'a str, O>,
{
	delimited(multispace0, inner, multispace0)
}

fn field_ident(s: &str) -> IResult<&str, &str> {
	nom::bytes::complete::take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.')(s)
}

fn ident_list_loose(s: &str) -> IResult<&str, Vec<String>> {
	separated_list1(char(','), map(field_ident, |s: &str| s.to_string()))(s)
}

fn parse_u64(s: &str) -> IResult<&str, u64> {
	map_res(digit1, |d: &str| d.parse::<u64>())(s)
}

fn parse_sort_time_desc(s: &str) -> IResult<&str, Pipe> {
	value(Pipe::SortTimeDesc, tag("sort by (_time) desc"))(s)
}

fn parse_offset_limit(s: &str) -> IResult<&str, Pipe> {
	map(
		tuple((
			opt(preceded(tuple((tag("offset"), multispace1)), parse_u64)),
			preceded(
				tuple((multispace0, tag("limit"), multispace1)),
				parse_u64,
			),
		)),
		|(offset, limit)| Pipe::OffsetLimit {
			offset: offset.unwrap_or(0),
			limit,
		},
	)(s)
}

fn parse_stats_by_time(s: &str) -> IResult<&str, Pipe> {
	map(
		tuple((
			preceded(tuple((tag("stats_by_time"), multispace1, tag("step="))), parse_u64),
			preceded(
				tuple((tag("s"), multispace1, tag("fields="))),
				ident_list_loose,
			),
		)),
		|(step_seconds, fields)| Pipe::StatsByTime { step_seconds, fields },
	)(s)
}

fn parse_facets(s: &str) -> IResult<&str, Pipe> {
	map(
		preceded(tuple((tag("facets"), multispace1, tag("limit"), multispace1)), parse_u64),
		|limit| Pipe::Facets { limit },
	)(s)
}

fn parse_fields_projection(s: &str) -> IResult<&str, Pipe> {
	map(
		preceded(tuple((tag("fields"), multispace1)), ident_list_loose),
		Pipe::FieldsProjection,
	)(s)
}

fn parse_query_stats_local(s: &str) -> IResult<&str, Pipe> {
	value(Pipe::QueryStatsLocal, tag("query_stats_local"))(s)
}

fn parse_query_stats(s: &str) -> IResult<&str, Pipe> {
	value(Pipe::QueryStats, tag("query_stats"))(s)
}

fn parse_join(s: &str) -> IResult<&str, Pipe> {
	value(Pipe::Join, tag("join"))(s)
}

fn parse_running_stats(s: &str) -> IResult<&str, Pipe> {
	value(Pipe::RunningStats, tag("running_stats"))(s)
}

fn parse_total_stats(s: &str) -> IResult<&str, Pipe> {
	value(Pipe::TotalStats, tag("total_stats"))(s)
}

fn parse_stats_aggregation(s: &str) -> IResult<&str, Pipe> {
	map(
		tuple((
			preceded(tuple((tag("stats"), multispace1, tag("fields="))), ident_list_loose),
			opt(preceded(
				tuple((multispace1, tag("by="), char('('))),
				|rest| {
					let (rest, by) = ident_list_loose(rest)?;
					let (rest, _) = char(')')(rest)?;
					Ok((rest, by))
				},
			)),
		)),
		|(fields, by)| Pipe::StatsAggregation {
			fields,
			by: by.unwrap_or_default(),
		},
	)(s)
}

/// Parses the textual rendering of a single pipe (the part after a `|`).
/// This is intentionally a small, hand-rolled grammar over the fixed set
/// of pipe kinds this model understands — it is not a LogsQL parser.
pub fn parse_pipe(s: &str) -> Result<Pipe, PipeParseError> {
	let s = s.trim();
	let result = ws(alt((
		parse_sort_time_desc,
		parse_offset_limit,
		parse_stats_by_time,
		parse_facets,
		parse_query_stats_local,
		parse_query_stats,
		parse_join,
		parse_running_stats,
		parse_total_stats,
		parse_stats_aggregation,
		parse_fields_projection,
	)))(s);
	match result {
		Ok((rest, pipe)) if rest.trim().is_empty() => Ok(pipe),
		_ => Err(PipeParseError(s.to_string())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn renders_and_reparses_sort_time_desc() {
		let p = Pipe::SortTimeDesc;
		assert_eq!(parse_pipe(&p.to_string()).unwrap(), p);
	}

	#[test]
	fn renders_and_reparses_offset_limit() {
		let p = Pipe::OffsetLimit { offset: 5, limit: 10 };
		assert_eq!(parse_pipe(&p.to_string()).unwrap(), p);
	}

	#[test]
	fn renders_and_reparses_fields_projection() {
		let p = Pipe::FieldsProjection(vec!["a".into(), "b".into()]);
		assert_eq!(parse_pipe(&p.to_string()).unwrap(), p);
	}

	#[test]
	fn renders_and_reparses_stats_aggregation_with_by() {
		let p = Pipe::StatsAggregation {
			fields: vec!["count".into()],
			by: vec!["service".into(), "level".into()],
		};
		assert_eq!(parse_pipe(&p.to_string()).unwrap(), p);
	}

	#[test]
	fn remote_pushable_pipes() {
		assert!(Pipe::SortTimeDesc.is_remote_pushable());
		assert!(Pipe::FieldsProjection(vec![]).is_remote_pushable());
		assert!(!Pipe::Join.is_remote_pushable());
		assert!(!Pipe::TotalStats.is_remote_pushable());
	}
}
