use thiserror::Error;

/// Errors from the shared region itself: mapping and bounds.
#[derive(Error, Debug)]
pub enum RegionError {
    #[error("Failed to open shared region {name}: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to map shared region {name}: {source}")]
    Map {
        name: String,
        source: std::io::Error,
    },

    #[error("Out of bounds: {offset} + {len} > {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Worker id {0} exceeds flag page count {1}")]
    BadWorker(usize, usize),
}

/// Errors from decoding request frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame truncated: need {need} bytes, {have} remain")]
    Truncated { need: usize, have: usize },

    #[error("Bad frame header: {0}")]
    BadHeader(String),

    #[error("Unknown data type tag {0}")]
    UnknownDataType(u32),

    #[error("Unknown task code {0}")]
    UnknownTaskCode(u32),
}
