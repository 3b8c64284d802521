//! Worker side of the NUMA compute plane: the dispatch loop, the weight
//! registry and shard extraction, the quantized kernels, MoE, causal
//! attention, and the KV cache store.

pub mod attention;
pub mod error;
pub mod kernels;
pub mod kvcache;
pub mod moe;
pub mod registry;
pub mod server;

pub use error::ServerError;
pub use server::{ComputeServer, ServerConfig, SERVER_VERSION};
