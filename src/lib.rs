// Module declarations in dependency order
pub mod utils;
pub mod core;
pub mod processing;
pub mod worker;
pub mod commands;

// Public exports for external consumers
pub use core::{FormatOptions, InitInfo, OptionRecord, VersionInfo, WorkerConfig};
pub use processing::{convert, CodecContext};
pub use utils::{BridgeError, BridgeResult, OutputFormat};
pub use worker::{WorkerClient, WorkerError, WorkerRequest, WorkerResponse};

// The binary in main.rs is a thin CLI over this library.
