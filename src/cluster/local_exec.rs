//! Applies the local-only suffix of a split query (spec.md §4.8) to a flat
//! set of records, after fan-out has merged every storage node's rows.
//!
//! Storage nodes in this model only ever apply `sort by (_time) desc`,
//! `offset`/`limit` and column projection themselves (`Store::execute`);
//! every other pipe kind — including the ones [`logql::Query::split_remote_local`]
//! happens to route to the "remote" side by default, like `stats_by_time`
//! and `facets` — still needs a real executor somewhere. This module is
//! that executor, shared by the frontend's own local-pipe-chain and by the
//! `/internal/select/query` handler that plays the storage-node role for
//! this binary's own loopback node.

use common::{Record, FIELD_MSG, FIELD_TIME};
use logql::Pipe;
use std::collections::{BTreeMap, HashMap};

pub fn apply_local_pipes(records: Vec<Record>, pipes: &[Pipe]) -> Vec<Record> {
	let mut records = records;
	for pipe in pipes {
		records = apply_one(records, pipe);
	}
	records
}

fn apply_one(records: Vec<Record>, pipe: &Pipe) -> Vec<Record> {
	match pipe {
		Pipe::SortTimeDesc => {
			let mut records = records;
			records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
			records
		}
		Pipe::OffsetLimit { offset, limit } => records
			.into_iter()
			.skip(*offset as usize)
			.take(*limit as usize)
			.collect(),
		Pipe::FieldsProjection(fields) => records.into_iter().map(|r| project(r, fields)).collect(),
		Pipe::StatsByTime { step_seconds, fields } => stats_by_time(&records, *step_seconds, fields),
		Pipe::StatsAggregation { fields, by } => stats_aggregation(&records, fields, by),
		Pipe::Facets { limit } => facets(&records, *limit),
		// Join/running_stats/total_stats/query_stats(_local) are recognized
		// for routing only (logql::Pipe carries no join target or running-
		// accumulator state to execute these against), so they pass their
		// input through unchanged. A real LogsQL grammar is an explicit
		// non-goal here.
		Pipe::Join | Pipe::RunningStats | Pipe::TotalStats | Pipe::QueryStats | Pipe::QueryStatsLocal => records,
	}
}

fn project(record: Record, fields: &[String]) -> Record {
	let mut out = Record::new(record.timestamp);
	for field in record.fields {
		if fields.iter().any(|name| name == &field.name) {
			out.fields.push(field);
		}
	}
	out
}

fn stats_by_time(records: &[Record], step_seconds: u64, fields: &[String]) -> Vec<Record> {
	let step_nsec = (step_seconds.max(1) as i64) * 1_000_000_000;
	let mut buckets: BTreeMap<i64, (u64, HashMap<String, HashMap<String, u64>>)> = BTreeMap::new();

	for record in records {
		let bucket = record.timestamp.div_euclid(step_nsec) * step_nsec;
		let entry = buckets.entry(bucket).or_default();
		entry.0 += 1;
		for field in fields {
			if let Some(value) = record.get(field) {
				*entry.1.entry(field.clone()).or_default().entry(value.to_string()).or_insert(0) += 1;
			}
		}
	}

	buckets
		.into_iter()
		.map(|(bucket, (count, field_hits))| {
			let mut rec = Record::new(bucket);
			rec.add_field(FIELD_TIME, bucket.to_string());
			rec.add_field("count", count.to_string());
			for (field, hits) in field_hits {
				for (value, n) in hits {
					rec.add_field(format!("{field}:{value}"), n.to_string());
				}
			}
			rec
		})
		.collect()
}

fn stats_aggregation(records: &[Record], fields: &[String], by: &[String]) -> Vec<Record> {
	let mut groups: BTreeMap<Vec<String>, u64> = BTreeMap::new();
	for record in records {
		let key: Vec<String> = by.iter().map(|f| record.get(f).unwrap_or("").to_string()).collect();
		*groups.entry(key).or_insert(0) += 1;
	}

	let count_field = fields.first().cloned().unwrap_or_else(|| "count".to_string());
	groups
		.into_iter()
		.map(|(key, count)| {
			let mut rec = Record::new(0);
			for (name, value) in by.iter().zip(key.iter()) {
				rec.add_field(name.clone(), value.clone());
			}
			rec.add_field(count_field.clone(), count.to_string());
			rec
		})
		.collect()
}

fn facets(records: &[Record], limit: u64) -> Vec<Record> {
	let mut hits: HashMap<(String, String), u64> = HashMap::new();
	for record in records {
		for field in &record.fields {
			if field.name == FIELD_TIME || field.name == FIELD_MSG {
				continue;
			}
			*hits.entry((field.name.clone(), field.value.clone())).or_insert(0) += 1;
		}
	}

	let mut entries: Vec<_> = hits.into_iter().collect();
	entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
	if limit > 0 {
		entries.truncate(limit as usize);
	}

	entries
		.into_iter()
		.map(|((field, value), hits)| {
			let mut rec = Record::new(0);
			rec.add_field("field", field);
			rec.add_field("value", value);
			rec.add_field("hits", hits.to_string());
			rec
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn rec(ts: i64, fields: &[(&str, &str)]) -> Record {
		let mut r = Record::new(ts);
		for (name, value) in fields {
			r.add_field(*name, *value);
		}
		r
	}

	#[test]
	fn sort_then_offset_limit_matches_remote_semantics() {
		let records = vec![rec(1, &[]), rec(3, &[]), rec(2, &[])];
		let out = apply_local_pipes(
			records,
			&[Pipe::SortTimeDesc, Pipe::OffsetLimit { offset: 1, limit: 1 }],
		);
		assert_eq!(out.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![2]);
	}

	#[test]
	fn fields_projection_drops_unlisted_fields() {
		let records = vec![rec(1, &[("a", "1"), ("b", "2")])];
		let out = apply_local_pipes(records, &[Pipe::FieldsProjection(vec!["a".into()])]);
		assert_eq!(out[0].fields.len(), 1);
		assert_eq!(out[0].get("a"), Some("1"));
		assert_eq!(out[0].get("b"), None);
	}

	#[test]
	fn stats_by_time_buckets_and_counts_per_step() {
		let records = vec![
			rec(0, &[("level", "info")]),
			rec(1_000_000_000, &[("level", "info")]),
			rec(60_000_000_000, &[("level", "error")]),
		];
		let out = stats_by_time(&records, 60, &["level".to_string()]);
		assert_eq!(out.len(), 2);
		let first = out.iter().find(|r| r.timestamp == 0).unwrap();
		assert_eq!(first.get("count"), Some("2"));
		assert_eq!(first.get("level:info"), Some("2"));
		let second = out.iter().find(|r| r.timestamp == 60_000_000_000).unwrap();
		assert_eq!(second.get("count"), Some("1"));
	}

	#[test]
	fn stats_aggregation_groups_by_fields_and_names_count_column() {
		let records = vec![
			rec(0, &[("service", "a")]),
			rec(0, &[("service", "a")]),
			rec(0, &[("service", "b")]),
		];
		let out = stats_aggregation(&records, &["total".to_string()], &["service".to_string()]);
		assert_eq!(out.len(), 2);
		let a = out.iter().find(|r| r.get("service") == Some("a")).unwrap();
		assert_eq!(a.get("total"), Some("2"));
	}

	#[test]
	fn facets_ranks_by_hits_and_truncates_to_limit() {
		let records = vec![
			rec(0, &[("level", "info")]),
			rec(0, &[("level", "info")]),
			rec(0, &[("level", "error")]),
		];
		let out = facets(&records, 1);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].get("field"), Some("level"));
		assert_eq!(out[0].get("value"), Some("info"));
		assert_eq!(out[0].get("hits"), Some("2"));
	}

	#[test]
	fn passthrough_pipes_leave_rows_untouched() {
		let records = vec![rec(1, &[("a", "1")])];
		let out = apply_local_pipes(records.clone(), &[Pipe::TotalStats, Pipe::QueryStatsLocal]);
		assert_eq!(out, records);
	}
}
