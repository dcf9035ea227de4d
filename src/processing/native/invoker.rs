//! Drives one native conversion: buffers in, entry point, bytes out.

use tracing::debug;
use super::config::{build_config, NativeOptions};
use super::diagnostics::{decode_failure, last_error, FailureDiagnostics};
use super::module::NativeModule;
use super::scope::{NativeScope, Release};
use crate::utils::{BridgeError, BridgeResult, NativeErrorCode};

/// Describes one `png -> format` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionCall {
    pub entry_point: &'static str,
    pub diagnostics: FailureDiagnostics,
    /// Reject results larger than the input even if the module accepted them
    pub enforce_smaller_output: bool,
}

impl ConversionCall {
    pub fn webp() -> Self {
        Self {
            entry_point: "emscripten_convert_png_to_webp",
            diagnostics: FailureDiagnostics {
                format_label: "WebP",
                aux_error_export: Some(super::diagnostics::LAST_WEBP_ERROR),
                describe_with_string: true,
            },
            enforce_smaller_output: true,
        }
    }

    pub fn avif() -> Self {
        Self {
            entry_point: "emscripten_convert_png_to_avif",
            diagnostics: FailureDiagnostics {
                format_label: "AVIF",
                aux_error_export: Some(super::diagnostics::LAST_AVIF_ERROR),
                describe_with_string: false,
            },
            enforce_smaller_output: true,
        }
    }

    pub fn pngx(enforce_smaller_output: bool) -> Self {
        Self {
            entry_point: "emscripten_convert_png_to_pngx",
            diagnostics: FailureDiagnostics {
                format_label: "PNGX",
                aux_error_export: None,
                describe_with_string: false,
            },
            enforce_smaller_output,
        }
    }
}

/// Converts `input` through `call.entry_point`.
///
/// Every buffer allocated here, including the configuration built from
/// `options`, is released before returning, on success and failure alike.
pub fn execute_conversion(
    module: &mut dyn NativeModule,
    input: &[u8],
    call: &ConversionCall,
    options: &dyn NativeOptions,
) -> BridgeResult<Vec<u8>> {
    if !module.has_export(call.entry_point) {
        return Err(BridgeError::unavailable(call.entry_point));
    }
    let label = call.diagnostics.format_label;
    let mut scope = NativeScope::new(module);

    let input_ptr = scope.alloc(input.len(), "input PNG buffer")?;
    let size_ptr = scope.alloc(4, "output size buffer")?;
    let config = build_config(&mut scope, options)?;

    scope.module().write(input_ptr, input)?;
    scope.module().write_u32(size_ptr, 0)?;
    let result_ptr = scope.module().call_ptr(
        call.entry_point,
        &[input_ptr.into(), (input.len() as u32).into(), config.ptr.into(), size_ptr.into()],
    )?;
    scope.adopt(result_ptr, Release::ResultFree, "conversion result");
    let result_size = i64::from(scope.module().read_i32(size_ptr)?);

    if result_ptr == 0 || result_size <= 0 {
        scope.release(result_ptr)?;
        let error = decode_failure(scope.module(), &call.diagnostics, input.len(), result_size);
        debug!("{} conversion failed: {}", label, error);
        return Err(error);
    }

    let result_size = result_size as usize;
    if call.enforce_smaller_output && result_size > input.len() {
        scope.release(result_ptr)?;
        return Err(BridgeError::output_larger(label, input.len(), Some(result_size)));
    }

    let output = scope.take(result_ptr, result_size)?;
    debug!("{} conversion produced {} bytes from {}", label, output.len(), input.len());
    Ok(output)
}

/// Decoded RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

const DECODE_PNG: &str = "emscripten_decode_png_to_rgba";
const ENCODE_INDEXED: &str = "emscripten_encode_indexed_png";

/// Decodes a PNG to RGBA8 with the module's own decoder.
pub fn decode_png_to_rgba(module: &mut dyn NativeModule, png: &[u8]) -> BridgeResult<RgbaImage> {
    if !module.has_export(DECODE_PNG) {
        return Err(BridgeError::unavailable(DECODE_PNG));
    }
    let mut scope = NativeScope::new(module);
    let png_ptr = scope.alloc_bytes(png, "input PNG buffer")?;
    let dims_ptr = scope.alloc(8, "dimension buffer")?;
    scope.module().write(dims_ptr, &[0; 8])?;

    let rgba_ptr = scope.module().call_ptr(
        DECODE_PNG,
        &[png_ptr.into(), (png.len() as u32).into(), dims_ptr.into(), (dims_ptr + 4).into()],
    )?;
    scope.adopt(rgba_ptr, Release::ResultFree, "decoded pixels");
    if rgba_ptr == 0 {
        return Err(native_failure(scope.module(), "PNG decode"));
    }

    let width = scope.module().read_u32(dims_ptr)?;
    let height = scope.module().read_u32(dims_ptr + 4)?;
    let len = rgba_len(width, height)?;
    let pixels = scope.take(rgba_ptr, len)?;
    Ok(RgbaImage { width, height, pixels })
}

/// Encodes palette indices as an indexed PNG.
///
/// `palette` holds RGBA quads, at most 256 of them.
pub fn encode_indexed_png(
    module: &mut dyn NativeModule,
    indices: &[u8],
    palette: &[u8],
    width: u32,
    height: u32,
) -> BridgeResult<Vec<u8>> {
    if !module.has_export(ENCODE_INDEXED) {
        return Err(BridgeError::unavailable(ENCODE_INDEXED));
    }
    let palette_count = palette.len() / 4;
    if palette_count == 0 || palette_count > 256 {
        return Err(BridgeError::validation(format!("palette must hold 1 to 256 colors, got {palette_count}")));
    }

    let mut scope = NativeScope::new(module);
    let indices_ptr = scope.alloc_bytes(indices, "palette index buffer")?;
    let palette_ptr = scope.alloc_bytes(palette, "palette buffer")?;
    let size_ptr = scope.alloc(4, "output size buffer")?;
    scope.module().write_u32(size_ptr, 0)?;

    let png_ptr = scope.module().call_ptr(
        ENCODE_INDEXED,
        &[
            indices_ptr.into(),
            (indices.len() as u32).into(),
            palette_ptr.into(),
            (palette_count as u32).into(),
            width.into(),
            height.into(),
            size_ptr.into(),
        ],
    )?;
    scope.adopt(png_ptr, Release::ResultFree, "indexed PNG");
    let size = scope.module().read_u32(size_ptr)? as usize;
    if png_ptr == 0 || size == 0 {
        return Err(native_failure(scope.module(), "Indexed PNG encode"));
    }
    scope.take(png_ptr, size)
}

pub(crate) fn rgba_len(width: u32, height: u32) -> BridgeResult<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(4))
        .filter(|len| *len > 0)
        .ok_or_else(|| BridgeError::fault(format!("implausible image dimensions {width}x{height}")))
}

pub(crate) fn native_failure(module: &mut dyn NativeModule, label: &str) -> BridgeError {
    BridgeError::ConversionFailure {
        format: label.to_string(),
        code: match last_error(module) {
            NativeErrorCode::Ok => NativeErrorCode::Unknown(-1),
            code => code,
        },
        aux_code: None,
        message: None,
    }
}
