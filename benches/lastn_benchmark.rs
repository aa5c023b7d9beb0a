use async_trait::async_trait;
use common::{Record, TenantId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use logfront::cluster::lastn::{last_n, LastNError, LastNRunner};
use logql::Query;
use streamstore::{InMemoryStore, Store};
use tokio::runtime::Runtime;

fn generate_records(count: usize) -> Vec<Record> {
	(0..count)
		.map(|i| {
			let mut r = Record::new(i as i64 * 1_000_000);
			r.add_field("env", if i % 3 == 0 { "prod" } else { "staging" });
			r.add_field("_msg", "request handled");
			r
		})
		.collect()
}

/// Wraps the in-memory reference store as a `LastNRunner`, so the
/// benchmark exercises the optimizer against the same collaborator the
/// rest of the query path uses rather than a synthetic row source.
struct StoreRunner {
	store: InMemoryStore,
	tenant: TenantId,
}

#[async_trait]
impl LastNRunner for StoreRunner {
	async fn run(&self, query: &Query) -> Result<Vec<Record>, LastNError> {
		let execution = self
			.store
			.execute(&[self.tenant], query)
			.await
			.map_err(|e| LastNError::QueryFailed(e.to_string()))?;
		Ok(execution.into_records())
	}
}

fn bench_last_n(c: &mut Criterion) {
	let rt = Runtime::new().unwrap();
	let tenant = TenantId::new(1, 1);
	let mut group = c.benchmark_group("last_n_optimizer");
	for size in [1_000, 50_000, 500_000].iter() {
		let store = InMemoryStore::new();
		rt.block_on(store.write(tenant, generate_records(*size))).unwrap();
		let runner = StoreRunner { store, tenant };
		let base = Query::new("env:prod", 0, (*size as i64) * 1_000_000);

		group.bench_with_input(BenchmarkId::new("last_100_of", size), size, |b, _| {
			b.iter(|| rt.block_on(last_n(black_box(&base), 0, 100, &runner)).unwrap());
		});
	}
	group.finish();
}

criterion_group!(benches, bench_last_n);
criterion_main!(benches);
