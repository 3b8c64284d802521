use thiserror::Error;

use sdk::error::{FrameError, RegionError};
use sdk::pool::PoolError;

/// Worker-side failure taxonomy. Configuration and state errors are fatal
/// on the worker: continuing after one would corrupt the output region.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error in {op}: {detail}")]
    Configuration { op: &'static str, detail: String },

    #[error("Unknown weight '{0}'")]
    UnknownWeight(String),

    #[error("Unknown KV cache {0}")]
    UnknownCache(u64),

    #[error("Parent process exited")]
    ParentExited,

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl ServerError {
    pub fn config(op: &'static str, detail: impl Into<String>) -> Self {
        ServerError::Configuration {
            op,
            detail: detail.into(),
        }
    }
}
