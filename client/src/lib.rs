//! Client side of the NUMA compute plane. The inference engine owns one
//! [`NumaClient`]; every op serializes a request frame into the mailbox,
//! kicks all workers, waits on their flags, and reduces the partials.

pub mod client;
pub mod error;
pub mod kv;
pub mod moe;
pub mod register;

pub use client::{NumaClient, WeightDesc};
pub use error::ClientError;
pub use kv::KvCacheHandle;
pub use moe::{MoeExpert, MoeRequest};
pub use register::{
    quantize_weight_int4_group, quantize_weight_int4_nozero, quantize_weight_int8, WeightKind,
};
