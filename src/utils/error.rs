//! Error types for the codec bridge.
//!
//! Provides the typed error taxonomy used between the native modules, the
//! format strategies and the worker protocol, built on `thiserror`.

use std::fmt;
use std::io;
use thiserror::Error;

/// Error code the primary module reports when its own size check rejects a result.
pub const NATIVE_OUTPUT_NOT_SMALLER: i32 = 9;

/// Numeric error register of the primary codec module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeErrorCode {
    Ok,
    FileNotFound,
    InvalidPng,
    InvalidFormat,
    OutOfMemory,
    EncodeFailed,
    DecodeFailed,
    Io,
    InvalidParameter,
    OutputNotSmaller,
    /// A code this bridge does not know; kept verbatim.
    Unknown(i32),
}

impl NativeErrorCode {
    pub fn raw(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::FileNotFound => 1,
            Self::InvalidPng => 2,
            Self::InvalidFormat => 3,
            Self::OutOfMemory => 4,
            Self::EncodeFailed => 5,
            Self::DecodeFailed => 6,
            Self::Io => 7,
            Self::InvalidParameter => 8,
            Self::OutputNotSmaller => NATIVE_OUTPUT_NOT_SMALLER,
            Self::Unknown(code) => code,
        }
    }
}

impl From<i32> for NativeErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::FileNotFound,
            2 => Self::InvalidPng,
            3 => Self::InvalidFormat,
            4 => Self::OutOfMemory,
            5 => Self::EncodeFailed,
            6 => Self::DecodeFailed,
            7 => Self::Io,
            8 => Self::InvalidParameter,
            NATIVE_OUTPUT_NOT_SMALLER => Self::OutputNotSmaller,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for NativeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}

/// Main error type for bridge operations.
///
/// Every variant maps to a stable machine-readable [`code`](BridgeError::code)
/// so callers can localize messages without parsing `Display` output.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A foreign-heap allocation returned null
    #[error("Failed to allocate {resource} in WebAssembly heap")]
    AllocationFailure { resource: String },

    /// The native size check or the bridge's size policy rejected the result
    #[error("{format} result is larger than input (input: {input_size} bytes, output: {})", describe_size(.output_size))]
    OutputLargerThanInput {
        format: String,
        input_size: usize,
        output_size: Option<usize>,
    },

    /// Opaque native failure with whatever diagnostics the module exposes
    #[error("{format} conversion failed{}", describe_failure(.message, .code, .aux_code))]
    ConversionFailure {
        format: String,
        code: NativeErrorCode,
        aux_code: Option<i32>,
        message: Option<String>,
    },

    /// The loaded module does not export the requested entry point
    #[error("Operation not available: module does not export `{export}`")]
    ModuleUnavailable { export: String },

    /// The native module trapped or was handed an out-of-bounds pointer
    #[error("Native module fault: {0}")]
    NativeFault(String),

    /// Module loading or context initialization failed
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Request or option validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// File IO error
    #[error("IO error: {0}")]
    Io(String),
}

fn describe_size(size: &Option<usize>) -> String {
    match size {
        Some(size) => format!("{size} bytes"),
        None => "unknown size".to_string(),
    }
}

fn describe_failure(message: &Option<String>, code: &NativeErrorCode, aux_code: &Option<i32>) -> String {
    let mut out = String::new();
    if let Some(message) = message {
        out.push_str(": ");
        out.push_str(message);
    }
    match aux_code {
        Some(aux) => out.push_str(&format!(" (cpres: {code}, format: {aux})")),
        None => out.push_str(&format!(" (cpres: {code})")),
    }
    out
}

/// Convenience result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

// Helper methods for error creation
impl BridgeError {
    pub fn allocation<T: Into<String>>(resource: T) -> Self {
        Self::AllocationFailure { resource: resource.into() }
    }

    pub fn output_larger<T: Into<String>>(format: T, input_size: usize, output_size: Option<usize>) -> Self {
        Self::OutputLargerThanInput {
            format: format.into(),
            input_size,
            output_size,
        }
    }

    pub fn unavailable<T: Into<String>>(export: T) -> Self {
        Self::ModuleUnavailable { export: export.into() }
    }

    pub fn fault<T: Into<String>>(msg: T) -> Self {
        Self::NativeFault(msg.into())
    }

    pub fn initialization<T: Into<String>>(msg: T) -> Self {
        Self::Initialization(msg.into())
    }

    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }

    /// Machine-readable error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllocationFailure { .. } => "wasm_allocation_failed",
            Self::OutputLargerThanInput { .. } => "output_larger_than_input",
            Self::ConversionFailure { .. } => "conversion_failed",
            Self::ModuleUnavailable { .. } => "module_unavailable",
            Self::NativeFault(_) => "native_fault",
            Self::Initialization(_) => "initialization_failed",
            Self::Validation(_) => "invalid_request",
            Self::Io(_) => "io_error",
        }
    }

    /// Failures that indicate a broken environment rather than a bad image.
    ///
    /// These are never retried and bypass every fallback path.
    pub fn is_environmental(&self) -> bool {
        matches!(self, Self::AllocationFailure { .. } | Self::ModuleUnavailable { .. })
    }

    pub fn input_size(&self) -> Option<usize> {
        match self {
            Self::OutputLargerThanInput { input_size, .. } => Some(*input_size),
            _ => None,
        }
    }

    pub fn output_size(&self) -> Option<usize> {
        match self {
            Self::OutputLargerThanInput { output_size, .. } => *output_size,
            _ => None,
        }
    }
}

// Convert std::io::Error to BridgeError
impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
