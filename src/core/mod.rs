//! Core types shared across the crate.
//!
//! - [`OptionRecord`]: caller-supplied, loosely typed conversion options
//! - [`FormatOptions`]: typed per-format options resolved from a record
//! - [`WorkerConfig`]: module locations and thread count for init
//! - [`VersionInfo`] / [`InitInfo`]: module metadata reported at init
//! - [`ConversionSummary`]: per-file result of a CLI conversion

pub mod options;
mod types;

pub use options::{
    AvifOptions, Dither, FormatOptions, LossyMode, OptionRecord, Palette256Tuning, PngxOptions,
    RgbaColor, WebpOptions,
};
pub use types::{ConversionSummary, InitInfo, VersionInfo, WorkerConfig};
