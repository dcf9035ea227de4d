//! Bridge to the precompiled native codec modules.
//!
//! - [`module`]: the export-table and linear-memory abstraction
//! - [`scope`]: per-call allocation arena
//! - [`config`]: typed options to native configuration handles
//! - [`invoker`]: the conversion entry points and PNG utilities
//! - [`diagnostics`]: native error registers to typed errors
//! - [`palette`]: prepare/finalize session for palette encoding
//! - `wasm`: the wasmtime backend (feature `wasm`)

pub mod config;
pub mod diagnostics;
pub mod invoker;
pub mod module;
pub mod palette;
pub mod scope;
#[cfg(feature = "wasm")]
pub mod wasm;

pub use config::{build_config, ConfigHandle, NativeOptions, NativeSetting};
pub use diagnostics::FailureDiagnostics;
pub use invoker::{decode_png_to_rgba, encode_indexed_png, execute_conversion, ConversionCall, RgbaImage};
pub use module::{AllocatorExports, ModuleImage, ModuleLoader, NativeModule, NativePtr, NativeValue};
pub use palette::{PaletteSession, PreparedPalette};
pub use scope::{NativeScope, Release};
#[cfg(feature = "wasm")]
pub use wasm::{WasmImage, WasmLoader};
