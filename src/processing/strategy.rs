//! Per-format conversion: which native calls to make, in what order, and
//! what to fall back to when one of them fails.

use tracing::{debug, warn};
use super::context::CodecContext;
use super::native::{execute_conversion, ConversionCall, NativeModule, PaletteSession, PreparedPalette};
use super::quant::{LosslessOptions, QuantBridge, QuantParams, QuantResult, QuantStatus};
use crate::core::{FormatOptions, LossyMode, PngxOptions};
use crate::utils::{BridgeError, BridgeResult};

/// Converts a PNG with the options of the requested format.
pub fn convert(ctx: &mut CodecContext, options: &FormatOptions, input: &[u8]) -> BridgeResult<Vec<u8>> {
    if input.is_empty() {
        return Err(BridgeError::validation("inputBytes is required"));
    }
    let (codec, quant) = ctx.parts();
    match options {
        FormatOptions::Webp(webp) => execute_conversion(codec, input, &ConversionCall::webp(), webp),
        FormatOptions::Avif(avif) => execute_conversion(codec, input, &ConversionCall::avif(), avif),
        FormatOptions::Pngx(pngx) => match quant {
            Some(quant) => convert_pngx(codec, quant, pngx, input),
            None => execute_conversion(codec, input, &ConversionCall::pngx(!pngx.allows_larger_output()), pngx),
        },
    }
}

fn convert_pngx(
    codec: &mut dyn NativeModule,
    quant: &mut QuantBridge,
    options: &PngxOptions,
    input: &[u8],
) -> BridgeResult<Vec<u8>> {
    if !options.lossy_enable {
        return lossless_or_original(quant, options, input);
    }
    match options.lossy_mode {
        // The encoder checks sizes itself in these modes; its result stands.
        LossyMode::Limited | LossyMode::Reduced => {
            execute_conversion(codec, input, &ConversionCall::pngx(false), options)
        }
        LossyMode::Palette => convert_palette(codec, quant, options, input),
    }
}

fn lossless_options(options: &PngxOptions) -> LosslessOptions {
    LosslessOptions {
        optimization_level: options.optimization_level(),
        strip_safe: options.strip_safe_or_default(),
        optimize_alpha: options.optimize_alpha_or_default(),
    }
}

/// Lossless recompression, or the input itself when that is no smaller.
fn lossless_or_original(quant: &mut QuantBridge, options: &PngxOptions, input: &[u8]) -> BridgeResult<Vec<u8>> {
    let optimized = quant.optimize_lossless(input, &lossless_options(options))?;
    if optimized.len() < input.len() {
        Ok(optimized)
    } else {
        debug!("Lossless result not smaller ({} >= {}), keeping input", optimized.len(), input.len());
        Ok(input.to_vec())
    }
}

/// Surfaces environmental failures, swallows the rest with a warning.
fn recoverable<T>(result: BridgeResult<T>, stage: &str) -> BridgeResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_environmental() => Err(e),
        Err(e) => {
            warn!("PNGX palette {} failed, falling back to lossless: {}", stage, e);
            Ok(None)
        }
    }
}

fn convert_palette(
    codec: &mut dyn NativeModule,
    quant: &mut QuantBridge,
    options: &PngxOptions,
    input: &[u8],
) -> BridgeResult<Vec<u8>> {
    let Some(mut session) = recoverable(PaletteSession::prepare(codec, input, options), "prepare")? else {
        return lossless_or_original(quant, options, input);
    };

    let quantized = recoverable(quantize_with_retry(quant, session.prepared()), "quantization")?;
    let Some(quantized) = quantized.filter(|q| q.status == QuantStatus::Ok) else {
        session.release();
        return lossless_or_original(quant, options, input);
    };

    let Some(finalized) = recoverable(session.finalize(&quantized.indices, &quantized.palette), "finalize")? else {
        return lossless_or_original(quant, options, input);
    };

    let lossless = lossless_options(options);
    let optimized = quant.optimize_lossless(&finalized, &lossless)?;
    let candidate = if optimized.len() < finalized.len() { optimized } else { finalized };
    debug!(
        "Palette candidate: {} bytes from {} (quality {})",
        candidate.len(),
        input.len(),
        quantized.quality
    );
    if candidate.len() < input.len() {
        return Ok(candidate);
    }

    let original = quant.optimize_lossless(input, &lossless)?;
    if original.len() < input.len() {
        debug!("Palette result not smaller, using lossless ({} bytes)", original.len());
        return Ok(original);
    }
    Err(BridgeError::output_larger("PNGX", input.len(), Some(candidate.len())))
}

fn quant_params(prepared: &PreparedPalette) -> QuantParams {
    QuantParams {
        speed: prepared.speed,
        quality_min: prepared.quality_min,
        quality_max: prepared.quality_max,
        max_colors: prepared.max_colors,
        dithering_level: prepared.dither_level,
        importance_map: prepared.importance_map.clone(),
        fixed_colors: prepared.fixed_colors.clone(),
        ..QuantParams::default()
    }
}

/// Quantizes once; a quality miss with a nonzero floor gets one more try with no floor.
fn quantize_with_retry(quant: &mut QuantBridge, prepared: &PreparedPalette) -> BridgeResult<QuantResult> {
    let mut params = quant_params(prepared);
    let result = quant.quantize(&prepared.rgba, prepared.width, prepared.height, &params)?;
    if result.status != QuantStatus::QualityTooLow || params.quality_min == 0 {
        return Ok(result);
    }
    debug!("Quality {} not reached, retrying without a minimum", params.quality_min);
    params.quality_min = 0;
    quant.quantize(&prepared.rgba, prepared.width, prepared.height, &params)
}
