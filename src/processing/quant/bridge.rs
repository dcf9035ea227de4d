//! Calls into the quantization module: lossless recompression and palette quantization.

use std::sync::Arc;
use tracing::{debug, info, warn};
use super::pool::ThreadPool;
use super::types::{LosslessOptions, QuantParams, QuantResult, QuantStatus};
use crate::processing::native::{ModuleImage, NativeModule, NativeScope, NativeValue, Release};
use crate::utils::{BridgeError, BridgeResult, NativeErrorCode};

const OPTIMIZE_LOSSLESS: &str = "pngx_bridge_optimize_lossless";
const QUANTIZE: &str = "pngx_bridge_quantize";
const QUANTIZE_ADVANCED: &str = "pngx_bridge_quantize_advanced";
const RESULT_STATUS: &str = "pngx_bridge_quant_result_status";
const RESULT_QUALITY: &str = "pngx_bridge_quant_result_quality";
const RESULT_PALETTE_PTR: &str = "pngx_bridge_quant_result_palette_ptr";
const RESULT_PALETTE_LEN: &str = "pngx_bridge_quant_result_palette_len";
const RESULT_INDICES_PTR: &str = "pngx_bridge_quant_result_indices_ptr";
const RESULT_INDICES_LEN: &str = "pngx_bridge_quant_result_indices_len";
const RESULT_FREE: &str = "pngx_bridge_quant_result_free";
const OXIPNG_VERSION: &str = "pngx_bridge_oxipng_version";
const LIBIMAGEQUANT_VERSION: &str = "pngx_bridge_libimagequant_version";
const THREADS_ENABLED: &str = "pngx_bridge_is_threads_enabled";

const REQUIRED_EXPORTS: &[&str] = &[
    "pngx_bridge_alloc",
    "pngx_bridge_free",
    "pngx_bridge_result_free",
    OPTIMIZE_LOSSLESS,
    QUANTIZE,
    RESULT_STATUS,
    RESULT_QUALITY,
    RESULT_PALETTE_PTR,
    RESULT_PALETTE_LEN,
    RESULT_INDICES_PTR,
    RESULT_INDICES_LEN,
    RESULT_FREE,
];

/// Library versions reported by the quantization module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantVersions {
    pub oxipng: Option<u32>,
    pub libimagequant: Option<u32>,
}

/// The loaded quantization module plus its optional thread pool.
pub struct QuantBridge {
    module: Box<dyn NativeModule>,
    pool: Option<ThreadPool>,
    versions: QuantVersions,
}

impl QuantBridge {
    /// Instantiates the module and, when it was built with threads, starts the pool.
    ///
    /// Missing required exports fail the load. A pool that cannot start only
    /// disables threading.
    pub fn load(image: Arc<dyn ModuleImage>, requested_threads: Option<usize>) -> BridgeResult<Self> {
        let mut module = image.instantiate()?;
        if let Some(missing) = REQUIRED_EXPORTS.iter().find(|e| !module.has_export(e)) {
            return Err(BridgeError::initialization(format!(
                "{} does not export `{}`",
                image.name(),
                missing
            )));
        }

        let versions = QuantVersions {
            oxipng: module.query_u32(OXIPNG_VERSION)?,
            libimagequant: module.query_u32(LIBIMAGEQUANT_VERSION)?,
        };

        let pool = if module.query_flag(THREADS_ENABLED)?.unwrap_or(false) {
            match ThreadPool::start(&image, module.as_mut(), requested_threads) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("Quantization thread pool unavailable, continuing single-threaded: {}", e);
                    None
                }
            }
        } else {
            debug!("{} built without threads", image.name());
            None
        };

        info!(
            "Loaded quantization module {} (threads: {})",
            image.name(),
            pool.as_ref().map_or(0, ThreadPool::size)
        );
        Ok(Self { module, pool, versions })
    }

    pub fn threads_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn versions(&self) -> QuantVersions {
        self.versions
    }

    /// Recompresses a PNG losslessly.
    ///
    /// When the module produces nothing the input comes back unchanged.
    pub fn optimize_lossless(&mut self, png: &[u8], options: &LosslessOptions) -> BridgeResult<Vec<u8>> {
        let mut scope = NativeScope::new(self.module.as_mut());
        let input_ptr = scope.alloc_bytes(png, "lossless input buffer")?;
        let size_ptr = scope.alloc(4, "output size buffer")?;
        scope.module().write_u32(size_ptr, 0)?;

        let result_ptr = scope.module().call_ptr(
            OPTIMIZE_LOSSLESS,
            &[
                input_ptr.into(),
                (png.len() as u32).into(),
                options.optimization_level.into(),
                options.strip_safe.into(),
                options.optimize_alpha.into(),
                size_ptr.into(),
            ],
        )?;
        scope.adopt(result_ptr, Release::ResultFree, "lossless result");
        let size = scope.module().read_u32(size_ptr)? as usize;
        if result_ptr == 0 || size == 0 {
            warn!("Lossless optimization returned no data, keeping the input");
            return Ok(png.to_vec());
        }

        let output = scope.take(result_ptr, size)?;
        debug!("Lossless optimization: {} -> {} bytes", png.len(), output.len());
        Ok(output)
    }

    /// Quantizes RGBA pixels to a palette.
    ///
    /// The native result handle is released before this returns, whatever
    /// the status.
    pub fn quantize(&mut self, pixels: &[u8], width: u32, height: u32, params: &QuantParams) -> BridgeResult<QuantResult> {
        let expected = (width as usize).checked_mul(height as usize).and_then(|px| px.checked_mul(4));
        if expected != Some(pixels.len()) || pixels.is_empty() {
            return Err(BridgeError::validation(format!(
                "{} bytes of pixels do not match {}x{} RGBA",
                pixels.len(),
                width,
                height
            )));
        }

        let advanced = params.is_advanced() && self.module.has_export(QUANTIZE_ADVANCED);
        if params.is_advanced() && !advanced {
            debug!("Module lacks advanced quantization, ignoring importance map and fixed colors");
        }

        let mut scope = NativeScope::new(self.module.as_mut());
        let pixels_ptr = scope.alloc_bytes(pixels, "quantization pixel buffer")?;
        let mut args: Vec<NativeValue> = vec![
            pixels_ptr.into(),
            (pixels.len() as u32).into(),
            width.into(),
            height.into(),
            params.speed.into(),
            i32::from(params.quality_min).into(),
            i32::from(params.quality_max).into(),
            params.max_colors.into(),
            params.min_posterization.into(),
            params.dithering_level.into(),
            params.remap.into(),
        ];

        let export = if advanced {
            let (importance_ptr, importance_len) = match &params.importance_map {
                Some(map) => (scope.alloc_bytes(map, "importance map buffer")?, map.len()),
                None => (0, 0),
            };
            let (fixed_ptr, fixed_count) = match &params.fixed_colors {
                Some(colors) => (scope.alloc_bytes(colors, "fixed color buffer")?, colors.len() / 4),
                None => (0, 0),
            };
            args.extend::<[NativeValue; 4]>([
                importance_ptr.into(),
                (importance_len as u32).into(),
                fixed_ptr.into(),
                (fixed_count as u32).into(),
            ]);
            QUANTIZE_ADVANCED
        } else {
            QUANTIZE
        };

        let handle = scope.module().call_ptr(export, &args)?;
        if handle == 0 {
            return Err(BridgeError::ConversionFailure {
                format: "PNGX quantization".to_string(),
                code: NativeErrorCode::Unknown(-1),
                aux_code: None,
                message: None,
            });
        }
        scope.adopt(handle, Release::Call(RESULT_FREE), "quantization result");

        let m = scope.module();
        let status = QuantStatus::from(m.call_i32(RESULT_STATUS, &[handle.into()])?);
        let quality = m.call_i32(RESULT_QUALITY, &[handle.into()])?;
        let (palette, indices) = if status == QuantStatus::Ok {
            // Both buffers are owned by the handle.
            let palette_ptr = m.call_ptr(RESULT_PALETTE_PTR, &[handle.into()])?;
            let palette_len = m.call_i32(RESULT_PALETTE_LEN, &[handle.into()])?.max(0) as usize;
            let indices_ptr = m.call_ptr(RESULT_INDICES_PTR, &[handle.into()])?;
            let indices_len = m.call_i32(RESULT_INDICES_LEN, &[handle.into()])?.max(0) as usize;
            (m.read(palette_ptr, palette_len)?, m.read(indices_ptr, indices_len)?)
        } else {
            (Vec::new(), Vec::new())
        };
        scope.release(handle)?;

        debug!(
            "Quantized {}x{} to {} colors: {:?}, quality {}",
            width,
            height,
            palette.len() / 4,
            status,
            quality
        );
        Ok(QuantResult { palette, indices, quality, status })
    }
}

impl Drop for QuantBridge {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown(self.module.as_mut());
        }
    }
}
