//! Fan-out coordinator (spec.md §4.6): dispatches the remote portion of a
//! query to every storage node concurrently, sharing one cancellation
//! token so the first non-cancellation error aborts the rest.

use crate::cluster::context::QueryContext;
use crate::cluster::remote_client::{RemoteClient, RemoteClientError, StorageNode};
use common::{DataBlock, ValueWithHits};
use std::sync::Arc;

/// A data block tagged with the index of the node it came from, so the
/// local pipeline can partition per-node accumulation state (spec.md §5).
pub struct TaggedBlock {
	pub node_index: usize,
	pub block: DataBlock,
}

pub struct FanoutResult {
	pub blocks: Vec<TaggedBlock>,
}

/// Runs the remote-portion query against every node in `nodes` concurrently,
/// each in its own task (spec.md §5: "Query fan-out creates one task per
/// storage node"). On the first non-cancellation error, the shared token is
/// cancelled so sibling tasks stop producing further blocks; a pure
/// cancellation error never triggers this. Returns the first
/// non-cancellation error observed, if any (spec.md §4.6, §8 "Fan-out"
/// boundary behavior).
pub async fn run_query_fanout(
	client: Arc<RemoteClient>,
	ctx: &QueryContext,
	nodes: &[StorageNode],
	disable_compression: bool,
) -> Result<FanoutResult, RemoteClientError> {
	let mut handles = Vec::with_capacity(nodes.len());
	for (index, node) in nodes.iter().enumerate() {
		let node = node.clone();
		let tenants = ctx.tenants.clone();
		let query = ctx.query.clone();
		let cancel = ctx.cancel.clone();
		let client = Arc::clone(&client);
		handles.push(tokio::spawn(async move {
			let result = client.query(&node, &tenants, &query, disable_compression, &cancel).await;
			(index, result)
		}));
	}

	let mut blocks = Vec::new();
	let mut first_error: Option<RemoteClientError> = None;
	for handle in handles {
		let (index, result) = handle.await.expect("fan-out task panicked");
		match result {
			Ok((node_blocks, stats)) => {
				ctx.stats.update_atomic(&stats);
				blocks.extend(node_blocks.into_iter().map(|block| TaggedBlock { node_index: index, block }));
			}
			Err(RemoteClientError::Cancelled) => {
				// Pure cancellation: does not itself cancel siblings or
				// become the reported error.
			}
			Err(e) => {
				if first_error.is_none() {
					ctx.cancel.cancel();
					first_error = Some(e);
				}
			}
		}
	}

	match first_error {
		Some(e) => Err(e),
		None => Ok(FanoutResult { blocks }),
	}
}

/// Merges per-node `(value, hits)` vectors for aggregate endpoints
/// (`field_names`, `field_values`, `streams`, ...), per spec.md §4.6.
pub fn merge_aggregate(
	per_node: &[Vec<ValueWithHits>],
	limit: u64,
	reset_hits_on_limit_exceeded: bool,
) -> Vec<ValueWithHits> {
	ValueWithHits::merge(per_node, limit, reset_hits_on_limit_exceeded)
}
