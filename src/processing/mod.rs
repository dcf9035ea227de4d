//! Image conversion on top of the native codec modules.
//!
//! - [`native`]: module abstraction, invoker, configuration and diagnostics
//! - [`quant`]: the secondary quantization module and its thread pool
//! - [`context`]: the per-worker set of loaded modules
//! - [`strategy`]: per-format conversion with fallbacks

mod context;
pub mod native;
pub mod quant;
mod strategy;

pub use context::CodecContext;
pub use strategy::convert;
