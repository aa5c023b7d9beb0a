pub mod pipe;
pub mod query;

pub use pipe::{Pipe, PipeParseError};
pub use query::{Query, QueryParseError, LAST_N_FAST_PATH_MULTIPLIER};
