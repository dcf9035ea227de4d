//! Two-phase palette encoding on the primary module.
//!
//! `prepare` decodes and preprocesses the PNG, handing back RGBA pixels plus
//! the quantization parameters the module derived from the configuration.
//! Quantization itself happens elsewhere; `finalize` turns the resulting
//! palette and indices back into a PNG. The module keeps per-session state
//! between the two calls, released by `cleanup`.

use tracing::{debug, warn};
use super::config::{build_config, NativeOptions};
use super::invoker::{native_failure, rgba_len};
use super::module::{NativeModule, NativePtr, NativeValue};
use super::scope::{NativeScope, Release};
use crate::utils::{BridgeError, BridgeResult};

const PREPARE: &str = "emscripten_pngx_palette256_prepare";
const FINALIZE: &str = "emscripten_pngx_palette256_finalize";
const CLEANUP: &str = "emscripten_pngx_palette256_cleanup";

/// Out-parameter block passed to `prepare`, one 4-byte slot per value.
mod slot {
    pub const RGBA_PTR: u32 = 0;
    pub const WIDTH: u32 = 4;
    pub const HEIGHT: u32 = 8;
    pub const IMPORTANCE_PTR: u32 = 12;
    pub const IMPORTANCE_LEN: u32 = 16;
    pub const SPEED: u32 = 20;
    pub const QUALITY_MIN: u32 = 24;
    pub const QUALITY_MAX: u32 = 28;
    pub const MAX_COLORS: u32 = 32;
    pub const DITHER: u32 = 36;
    pub const FIXED_PTR: u32 = 40;
    /// Number of fixed colors, not bytes
    pub const FIXED_LEN: u32 = 44;
    pub const BLOCK_SIZE: usize = 48;
}

/// Pixels and quantization parameters produced by `prepare`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPalette {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub importance_map: Option<Vec<u8>>,
    pub speed: i32,
    pub quality_min: u8,
    pub quality_max: u8,
    pub max_colors: u32,
    pub dither_level: f32,
    /// RGBA quads the quantizer must keep
    pub fixed_colors: Option<Vec<u8>>,
}

/// An open palette session on the primary module.
///
/// Dropping the session releases the module-side state, so it is released
/// on every path out of the palette pipeline.
pub struct PaletteSession<'m> {
    module: &'m mut dyn NativeModule,
    prepared: PreparedPalette,
    active: bool,
}

impl<'m> PaletteSession<'m> {
    pub fn prepare(module: &'m mut dyn NativeModule, png: &[u8], options: &dyn NativeOptions) -> BridgeResult<Self> {
        if !module.has_export(PREPARE) {
            return Err(BridgeError::unavailable(PREPARE));
        }
        match run_prepare(&mut *module, png, options) {
            Ok(prepared) => {
                debug!(
                    "Palette prepared: {}x{}, quality {}-{}, {} colors",
                    prepared.width, prepared.height, prepared.quality_min, prepared.quality_max, prepared.max_colors
                );
                Ok(Self { module, prepared, active: true })
            }
            Err(e) => {
                cleanup(module);
                Err(e)
            }
        }
    }

    pub fn prepared(&self) -> &PreparedPalette {
        &self.prepared
    }

    /// Encodes the quantized image. The session is released either way.
    pub fn finalize(mut self, indices: &[u8], palette: &[u8]) -> BridgeResult<Vec<u8>> {
        let result = run_finalize(&mut *self.module, indices, palette);
        self.release();
        result
    }

    /// Releases the module-side session state now.
    pub fn release(&mut self) {
        if self.active {
            self.active = false;
            cleanup(&mut *self.module);
        }
    }
}

impl Drop for PaletteSession<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

fn cleanup(module: &mut dyn NativeModule) {
    if !module.has_export(CLEANUP) {
        return;
    }
    if let Err(e) = module.call(CLEANUP, &[]) {
        warn!("Palette cleanup failed: {}", e);
    }
}

fn run_prepare(module: &mut dyn NativeModule, png: &[u8], options: &dyn NativeOptions) -> BridgeResult<PreparedPalette> {
    let mut scope = NativeScope::new(module);
    let png_ptr = scope.alloc_bytes(png, "input PNG buffer")?;
    let config = build_config(&mut scope, options)?;
    let out = scope.alloc(slot::BLOCK_SIZE, "palette parameter block")?;
    scope.module().write(out, &[0; slot::BLOCK_SIZE])?;

    let at = |offset: u32| -> NativeValue { (out + offset).into() };
    let ok = scope.module().call_i32(
        PREPARE,
        &[
            png_ptr.into(),
            (png.len() as u32).into(),
            config.ptr.into(),
            at(slot::RGBA_PTR),
            at(slot::WIDTH),
            at(slot::HEIGHT),
            at(slot::IMPORTANCE_PTR),
            at(slot::IMPORTANCE_LEN),
            at(slot::SPEED),
            at(slot::QUALITY_MIN),
            at(slot::QUALITY_MAX),
            at(slot::MAX_COLORS),
            at(slot::DITHER),
            at(slot::FIXED_PTR),
            at(slot::FIXED_LEN),
        ],
    )?;
    if ok == 0 {
        return Err(native_failure(scope.module(), "PNGX palette prepare"));
    }

    // Buffers behind these pointers belong to the session; they are not freed here.
    let m = scope.module();
    let rgba_ptr = m.read_u32(out + slot::RGBA_PTR)?;
    let width = m.read_u32(out + slot::WIDTH)?;
    let height = m.read_u32(out + slot::HEIGHT)?;
    if rgba_ptr == 0 {
        return Err(BridgeError::fault("palette prepare returned no pixels"));
    }
    let rgba = m.read(rgba_ptr, rgba_len(width, height)?)?;

    let importance_ptr = m.read_u32(out + slot::IMPORTANCE_PTR)?;
    let importance_len = m.read_u32(out + slot::IMPORTANCE_LEN)? as usize;
    let fixed_ptr = m.read_u32(out + slot::FIXED_PTR)?;
    let fixed_count = m.read_u32(out + slot::FIXED_LEN)? as usize;

    Ok(PreparedPalette {
        rgba,
        width,
        height,
        importance_map: read_optional(m, importance_ptr, importance_len)?,
        speed: m.read_i32(out + slot::SPEED)?,
        quality_min: m.read_u8(out + slot::QUALITY_MIN)?,
        quality_max: m.read_u8(out + slot::QUALITY_MAX)?,
        max_colors: m.read_u32(out + slot::MAX_COLORS)?,
        dither_level: m.read_f32(out + slot::DITHER)?,
        fixed_colors: read_optional(m, fixed_ptr, fixed_count * 4)?,
    })
}

fn read_optional(module: &dyn NativeModule, ptr: NativePtr, len: usize) -> BridgeResult<Option<Vec<u8>>> {
    if ptr == 0 || len == 0 {
        return Ok(None);
    }
    module.read(ptr, len).map(Some)
}

fn run_finalize(module: &mut dyn NativeModule, indices: &[u8], palette: &[u8]) -> BridgeResult<Vec<u8>> {
    if !module.has_export(FINALIZE) {
        return Err(BridgeError::unavailable(FINALIZE));
    }
    let mut scope = NativeScope::new(module);
    let indices_ptr = scope.alloc_bytes(indices, "palette index buffer")?;
    let palette_ptr = scope.alloc_bytes(palette, "palette buffer")?;
    let size_ptr = scope.alloc(4, "output size buffer")?;
    scope.module().write_u32(size_ptr, 0)?;

    let png_ptr = scope.module().call_ptr(
        FINALIZE,
        &[
            indices_ptr.into(),
            (indices.len() as u32).into(),
            palette_ptr.into(),
            ((palette.len() / 4) as u32).into(),
            size_ptr.into(),
        ],
    )?;
    scope.adopt(png_ptr, Release::ResultFree, "palette PNG");
    let size = scope.module().read_u32(size_ptr)? as usize;
    if png_ptr == 0 || size == 0 {
        return Err(native_failure(scope.module(), "PNGX palette finalize"));
    }
    scope.take(png_ptr, size)
}
