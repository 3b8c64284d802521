use thiserror::Error;

use sdk::error::{FrameError, RegionError};

/// Client-side failures. Configuration errors abort the op and carry the
/// offending op and dtype context for the caller.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error in {op}: {detail}")]
    Configuration { op: &'static str, detail: String },

    #[error("Server handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl ClientError {
    pub fn config(op: &'static str, detail: impl Into<String>) -> Self {
        ClientError::Configuration {
            op,
            detail: detail.into(),
        }
    }
}
