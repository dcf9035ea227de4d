//! Turns the primary module's error registers into typed errors.

use tracing::debug;
use super::module::NativeModule;
use crate::utils::{BridgeError, NativeErrorCode};

pub const LAST_ERROR: &str = "emscripten_get_last_error";
pub const LAST_WEBP_ERROR: &str = "emscripten_get_last_webp_error";
pub const LAST_AVIF_ERROR: &str = "emscripten_get_last_avif_error";
pub const ERROR_STRING: &str = "emscripten_get_error_string";

/// What the decoder may consult for one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDiagnostics {
    pub format_label: &'static str,
    /// Format-specific sub-error register, if the format has one
    pub aux_error_export: Option<&'static str>,
    /// Ask the module for a message describing the error code
    pub describe_with_string: bool,
}

/// Reads the module's last error code. A module without the register reads as `Ok`.
pub fn last_error(module: &mut dyn NativeModule) -> NativeErrorCode {
    read_register(module, LAST_ERROR).map(NativeErrorCode::from).unwrap_or(NativeErrorCode::Ok)
}

/// Decodes a failed conversion.
///
/// `attempted_size` is the size the module wrote before failing; it is only
/// reported when positive. Diagnostics that themselves fail are logged and
/// left out rather than masking the original failure.
pub fn decode_failure(
    module: &mut dyn NativeModule,
    diagnostics: &FailureDiagnostics,
    input_size: usize,
    attempted_size: i64,
) -> BridgeError {
    let code = last_error(module);
    if code == NativeErrorCode::OutputNotSmaller {
        let output_size = usize::try_from(attempted_size).ok().filter(|size| *size > 0);
        return BridgeError::output_larger(diagnostics.format_label, input_size, output_size);
    }

    let aux_code = diagnostics.aux_error_export.and_then(|export| read_register(module, export));
    let message = if diagnostics.describe_with_string {
        error_string(module, code)
    } else {
        None
    };

    BridgeError::ConversionFailure {
        format: diagnostics.format_label.to_string(),
        code,
        aux_code,
        message,
    }
}

fn read_register(module: &mut dyn NativeModule, export: &str) -> Option<i32> {
    match module.query_u32(export) {
        Ok(value) => value.map(|v| v as i32),
        Err(e) => {
            debug!("Reading {} failed: {}", export, e);
            None
        }
    }
}

fn error_string(module: &mut dyn NativeModule, code: NativeErrorCode) -> Option<String> {
    if !module.has_export(ERROR_STRING) {
        return None;
    }
    let described = module
        .call_ptr(ERROR_STRING, &[code.raw().into()])
        .and_then(|ptr| if ptr == 0 { Ok(None) } else { module.read_c_string(ptr).map(Some) });
    match described {
        Ok(message) => message.filter(|m| !m.is_empty()),
        Err(e) => {
            debug!("Reading error string failed: {}", e);
            None
        }
    }
}
