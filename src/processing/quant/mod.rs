//! Secondary module: lossless PNG recompression and palette quantization.

mod bridge;
mod pool;
mod types;

pub use bridge::{QuantBridge, QuantVersions};
pub use pool::ThreadPool;
pub use types::{LosslessOptions, QuantParams, QuantResult, QuantStatus};
