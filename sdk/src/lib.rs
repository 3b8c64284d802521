//! Shared foundation of the NUMA compute plane: the mailbox region and its
//! layout, element types and task codes, quantization, tensors, request
//! frames, and the per-worker alive thread pool.

pub mod dtype;
pub mod error;
pub mod frame;
pub mod layout;
pub mod mailbox;
pub mod pool;
pub mod quant;
pub mod shm;
pub mod task;
pub mod tensor;

pub use dtype::{DataType, GgufKind};
pub use error::{FrameError, RegionError};
pub use frame::{ExType, FrameReader, FrameWriter};
pub use mailbox::{Mailbox, WorkerPort};
pub use pool::AliveThreadPool;
pub use quant::{LowBitConfig, QuantKind};
pub use shm::SharedRegion;
pub use task::TaskCode;
pub use tensor::Tensor;
