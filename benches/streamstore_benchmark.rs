use common::{Record, TenantId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use logql::Query;
use streamstore::{InMemoryStore, Store};
use tokio::runtime::Runtime;

fn generate_records(count: usize) -> Vec<Record> {
	let envs = ["prod", "staging", "dev"];
	let mut records = Vec::with_capacity(count);
	for i in 0..count {
		let mut r = Record::new(i as i64 * 1_000_000);
		r.add_field("env", envs[i % envs.len()]);
		r.add_field("service", format!("service-{i}"));
		r.add_field("_msg", "request handled");
		records.push(r);
	}
	records
}

fn bench_write(c: &mut Criterion) {
	let rt = Runtime::new().unwrap();
	let mut group = c.benchmark_group("store_write");
	for size in [100, 1000, 10000].iter() {
		group.bench_with_input(BenchmarkId::new("write_records", size), size, |b, &size| {
			let store = InMemoryStore::new();
			let records = generate_records(size);
			b.iter(|| {
				rt.block_on(store.write(TenantId::new(1, 1), black_box(records.clone())))
					.unwrap();
			});
		});
	}
	group.finish();
}

fn bench_execute(c: &mut Criterion) {
	let rt = Runtime::new().unwrap();
	let store = InMemoryStore::new();
	rt.block_on(store.write(TenantId::new(1, 1), generate_records(10_000)))
		.unwrap();

	let mut group = c.benchmark_group("store_execute");
	group.bench_function("filter_single_field", |b| {
		let query = Query::new("env:prod", 0, i64::MAX);
		b.iter(|| {
			rt.block_on(store.execute(black_box(&[TenantId::new(1, 1)]), &query))
				.unwrap();
		});
	});
	group.bench_function("match_all", |b| {
		let query = Query::new("*", 0, i64::MAX);
		b.iter(|| {
			rt.block_on(store.execute(black_box(&[TenantId::new(1, 1)]), &query))
				.unwrap();
		});
	});
	group.finish();
}

criterion_group!(benches, bench_write, bench_execute);
criterion_main!(benches);
