//! Query distribution and execution core (spec.md §4.4-§4.10): splitting
//! a query into remote/local portions, fanning the remote portion out to
//! storage nodes, merging results, and the last-N/live-tail optimizers.

pub mod context;
pub mod executor;
pub mod fanout;
pub mod http_params;
pub mod internal_handlers;
pub mod lastn;
pub mod local_exec;
pub mod query_handlers;
pub mod remote_client;
pub mod splitter;
pub mod tail;
pub mod wire;
pub mod writer;

pub use context::QueryContext;
pub use executor::{Executor, ExecutorError};
pub use fanout::{run_query_fanout, FanoutResult, TaggedBlock};
pub use lastn::{last_n, LastNError, LastNRunner};
pub use local_exec::apply_local_pipes;
pub use remote_client::{RemoteClient, RemoteClientError, StorageNode};
pub use splitter::{split_query, RunQuery, SplitError, SplitResult};
pub use tail::{run_tail, TailError, TailRunner};
pub use writer::{BinaryWorker, NdjsonWorker, SharedSink};
