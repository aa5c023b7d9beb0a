pub mod filter;
mod store;

pub use store::{InMemoryStore, QueryExecution, Store, StoreError};
