use crate::cluster::{Executor, RemoteClient, StorageNode};
use crate::config::AppConfig;
use crate::metrics::Instrumentations;
use std::sync::Arc;
use streamstore::Store;

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<AppConfig>,
	pub store: Arc<dyn Store>,
	pub executor: Arc<Executor>,
	pub metrics: Arc<Instrumentations>,
}

/// Builds the client side of the cluster protocol (spec.md §4.4): one
/// [`RemoteClient`] shared by every configured storage node, including this
/// binary's own bind address when it's listed among them.
pub fn build_executor(cfg: &AppConfig) -> Arc<Executor> {
	let client = Arc::new(RemoteClient::new(reqwest::Client::new()));
	let nodes = cfg
		.cluster
		.storage_nodes
		.iter()
		.map(|n| StorageNode { addr: n.addr.clone(), tls: n.tls })
		.collect();
	Arc::new(Executor::new(client, nodes, cfg.cluster.disable_compression))
}
