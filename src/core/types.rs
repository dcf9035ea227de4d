//! Core types shared by the worker protocol and the CLI.

use serde::{Deserialize, Serialize};

/// Version and build metadata reported by the loaded modules.
///
/// Every field is optional: a module that does not export the matching
/// query simply leaves it unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: Option<u32>,
    pub libwebp_version: Option<u32>,
    pub libpng_version: Option<u32>,
    pub libavif_version: Option<u32>,
    pub pngx_oxipng_version: Option<u32>,
    pub pngx_libimagequant_version: Option<u32>,
    /// Build timestamp as encoded by the module
    pub buildtime: Option<u32>,
}

impl VersionInfo {
    /// Human-readable `(component, version)` pairs for reporting.
    ///
    /// Each library packs its version differently, so each gets its own decoder.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        vec![
            ("codec", describe(self.version, decimal_version)),
            ("libwebp", describe(self.libwebp_version, byte_version)),
            ("libpng", describe(self.libpng_version, hundreds_version)),
            ("libavif", describe(self.libavif_version.filter(|v| *v > 0), avif_version)),
            ("oxipng", describe(self.pngx_oxipng_version.filter(|v| *v > 0), hundreds_version)),
            ("libimagequant", describe(self.pngx_libimagequant_version.filter(|v| *v > 0), hundreds_version)),
            ("buildtime", describe(self.buildtime, buildtime)),
        ]
    }
}

fn describe(value: Option<u32>, render: fn(u32) -> String) -> String {
    value.map(render).unwrap_or_else(|| "unknown".to_string())
}

/// `major * 1_000_000 + minor * 1_000 + patch`
fn decimal_version(v: u32) -> String {
    format!("{}.{}.{}", v / 1_000_000, (v % 1_000_000) / 1_000, v % 1_000)
}

/// `0x00MMmmpp`
fn byte_version(v: u32) -> String {
    format!("{}.{}.{}", (v >> 16) & 0xff, (v >> 8) & 0xff, v & 0xff)
}

/// `major * 10_000 + minor * 100 + patch`
fn hundreds_version(v: u32) -> String {
    format!("{}.{}.{}", v / 10_000, (v % 10_000) / 100, v % 100)
}

/// `major * 1_000_000 + minor * 10_000 + patch * 100 + build`
fn avif_version(v: u32) -> String {
    format!("{}.{}.{}", v / 1_000_000, (v % 1_000_000) / 10_000, (v % 10_000) / 100)
}

/// Bit-packed UTC build time: year 12 bits, month 4, day 5, hour 5, minute 6.
fn buildtime(v: u32) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02} UTC",
        (v >> 20) & 0xfff,
        (v >> 16) & 0xf,
        (v >> 11) & 0x1f,
        (v >> 6) & 0x1f,
        v & 0x3f
    )
}

/// Where to find the native modules and how many threads to give them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub module_location: String,
    #[serde(default)]
    pub secondary_location: Option<String>,
    /// Zero or absent means one thread per core
    #[serde(default)]
    pub thread_count: Option<usize>,
}

impl WorkerConfig {
    pub fn new(module_location: impl Into<String>) -> Self {
        Self {
            module_location: module_location.into(),
            ..Self::default()
        }
    }

    pub fn with_secondary(mut self, location: impl Into<String>) -> Self {
        self.secondary_location = Some(location.into());
        self
    }

    pub fn with_threads(mut self, count: usize) -> Self {
        self.thread_count = Some(count);
        self
    }
}

/// Capabilities reported once a codec context is ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitInfo {
    pub threads_enabled: bool,
    pub secondary_enabled: bool,
    pub secondary_threads_enabled: bool,
    pub versions: VersionInfo,
}

/// Result of converting one file.
///
/// Contains the input and output file information along with
/// compression statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionSummary {
    /// Path to the original input file
    pub input_path: String,
    /// Path to the converted output file
    pub output_path: String,
    /// Input size in bytes
    pub input_size: u64,
    /// Output size in bytes
    pub output_size: u64,
    /// Whether the conversion succeeded
    pub success: bool,
    /// Error message if the conversion failed
    pub error: Option<String>,
    /// Machine-readable error code if the conversion failed
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    /// Bytes saved (can be negative if the file grew)
    #[serde(rename = "savedBytes")]
    pub saved_bytes: i64,
    /// Space saved as a percentage of the input
    #[serde(rename = "compressionRatio")]
    pub compression_ratio: f64,
}

impl ConversionSummary {
    pub fn succeeded(input_path: String, output_path: String, input_size: u64, output_size: u64) -> Self {
        let saved_bytes = input_size as i64 - output_size as i64;
        let compression_ratio = if input_size == 0 {
            0.0
        } else {
            saved_bytes as f64 / input_size as f64 * 100.0
        };
        Self {
            input_path,
            output_path,
            input_size,
            output_size,
            success: true,
            error: None,
            error_code: None,
            saved_bytes,
            compression_ratio,
        }
    }

    pub fn failed(input_path: String, output_path: String, input_size: u64, error: String, error_code: Option<String>) -> Self {
        Self {
            input_path,
            output_path,
            input_size,
            output_size: 0,
            success: false,
            error: Some(error),
            error_code,
            saved_bytes: 0,
            compression_ratio: 0.0,
        }
    }
}
