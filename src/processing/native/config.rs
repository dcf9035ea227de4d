//! Marshals typed options into a native encoder configuration handle.

use tracing::{debug, trace};
use super::module::{NativePtr, NativeValue};
use super::scope::{NativeScope, Release};
use crate::core::{AvifOptions, FormatOptions, Palette256Tuning, PngxOptions, RgbaColor, WebpOptions};
use crate::core::options::MAX_PROTECTED_COLORS;
use crate::utils::{BridgeError, BridgeResult};

pub const CONFIG_CREATE: &str = "emscripten_config_create";
pub const CONFIG_FREE: &str = "emscripten_config_free";
pub const CONFIG_PROTECTED_COLORS: &str = "emscripten_config_pngx_protected_colors";

/// One setter call: `export(config, value)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeSetting {
    pub export: &'static str,
    pub value: NativeValue,
}

/// Options that can be written into a native configuration.
pub trait NativeOptions {
    /// Setter calls for every field that is present. Absent fields produce
    /// no entry, leaving the native default in place.
    fn native_settings(&self) -> Vec<NativeSetting>;

    fn protected_colors(&self) -> &[RgbaColor] {
        &[]
    }
}

/// A configuration registered in a [`NativeScope`]; freed with the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigHandle {
    pub ptr: NativePtr,
    pub protected_colors: usize,
}

/// Creates a configuration and applies `options` to it.
///
/// Setters the module does not export are skipped. The configuration and the
/// protected-color buffer are owned by `scope`, so every exit path frees them.
pub fn build_config(scope: &mut NativeScope<'_>, options: &dyn NativeOptions) -> BridgeResult<ConfigHandle> {
    if !scope.module().has_export(CONFIG_CREATE) {
        return Err(BridgeError::unavailable(CONFIG_CREATE));
    }
    let ptr = scope.module().call_ptr(CONFIG_CREATE, &[])?;
    if ptr == 0 {
        return Err(BridgeError::allocation("encoder configuration"));
    }
    scope.adopt(ptr, Release::Call(CONFIG_FREE), "encoder configuration");

    let mut applied = 0;
    for setting in options.native_settings() {
        if !scope.module().has_export(setting.export) {
            trace!("Module does not export {}, skipping", setting.export);
            continue;
        }
        scope.module().call(setting.export, &[ptr.into(), setting.value])?;
        applied += 1;
    }

    let colors = options.protected_colors();
    let colors = &colors[..colors.len().min(MAX_PROTECTED_COLORS)];
    if !colors.is_empty() {
        if scope.module().has_export(CONFIG_PROTECTED_COLORS) {
            let bytes: Vec<u8> = colors.iter().flat_map(|c| c.to_bytes()).collect();
            let colors_ptr = scope.alloc_bytes(&bytes, "protected color buffer")?;
            scope.module().call(
                CONFIG_PROTECTED_COLORS,
                &[ptr.into(), colors_ptr.into(), (colors.len() as i32).into()],
            )?;
        } else {
            trace!("Module does not export {}, skipping protected colors", CONFIG_PROTECTED_COLORS);
        }
    }

    debug!("Built native config: {} setters, {} protected colors", applied, colors.len());
    Ok(ConfigHandle { ptr, protected_colors: colors.len() })
}

/// Accumulates setter calls for present fields.
struct Settings(Vec<NativeSetting>);

impl Settings {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn set<V: Into<NativeValue>>(&mut self, export: &'static str, value: Option<V>) -> &mut Self {
        if let Some(value) = value {
            self.0.push(NativeSetting { export, value: value.into() });
        }
        self
    }

    fn finish(self) -> Vec<NativeSetting> {
        self.0
    }
}

impl NativeOptions for WebpOptions {
    fn native_settings(&self) -> Vec<NativeSetting> {
        let mut s = Settings::new();
        s.set("emscripten_config_webp_quality", self.quality)
            .set("emscripten_config_webp_lossless", self.lossless)
            .set("emscripten_config_webp_method", self.method)
            .set("emscripten_config_webp_target_size", self.target_size)
            .set("emscripten_config_webp_target_psnr", self.target_psnr)
            .set("emscripten_config_webp_segments", self.segments)
            .set("emscripten_config_webp_sns_strength", self.sns_strength)
            .set("emscripten_config_webp_filter_strength", self.filter_strength)
            .set("emscripten_config_webp_filter_sharpness", self.filter_sharpness)
            .set("emscripten_config_webp_filter_type", self.filter_type)
            .set("emscripten_config_webp_autofilter", self.autofilter)
            .set("emscripten_config_webp_alpha_compression", self.alpha_compression)
            .set("emscripten_config_webp_alpha_filtering", self.alpha_filtering)
            .set("emscripten_config_webp_alpha_quality", self.alpha_quality)
            .set("emscripten_config_webp_pass", self.pass)
            .set("emscripten_config_webp_preprocessing", self.preprocessing)
            .set("emscripten_config_webp_partitions", self.partitions)
            .set("emscripten_config_webp_partition_limit", self.partition_limit)
            .set("emscripten_config_webp_emulate_jpeg_size", self.emulate_jpeg_size)
            .set("emscripten_config_webp_low_memory", self.low_memory)
            .set("emscripten_config_webp_near_lossless", self.near_lossless)
            .set("emscripten_config_webp_exact", self.exact)
            .set("emscripten_config_webp_use_delta_palette", self.use_delta_palette)
            .set("emscripten_config_webp_use_sharp_yuv", self.use_sharp_yuv);
        s.finish()
    }
}

impl NativeOptions for AvifOptions {
    fn native_settings(&self) -> Vec<NativeSetting> {
        let mut s = Settings::new();
        s.set("emscripten_config_avif_quality", self.quality)
            .set("emscripten_config_avif_alpha_quality", self.alpha_quality)
            .set("emscripten_config_avif_lossless", self.lossless)
            .set("emscripten_config_avif_speed", self.speed);
        s.finish()
    }
}

impl NativeOptions for PngxOptions {
    fn native_settings(&self) -> Vec<NativeSetting> {
        let mut s = Settings::new();
        s.set("emscripten_config_pngx_level", self.level)
            .set("emscripten_config_pngx_strip_safe", self.strip_safe)
            .set("emscripten_config_pngx_optimize_alpha", self.optimize_alpha)
            .set("emscripten_config_pngx_threads", self.threads)
            .set("emscripten_config_pngx_lossy_enable", Some(self.lossy_enable))
            .set("emscripten_config_pngx_lossy_type", Some(self.lossy_mode.raw()))
            .set("emscripten_config_pngx_lossy_max_colors", Some(self.max_colors))
            .set("emscripten_config_pngx_reduced_colors", Some(self.reduced_colors))
            .set("emscripten_config_pngx_reduced_bits_rgb", self.reduced_bits_rgb)
            .set("emscripten_config_pngx_reduced_alpha_bits", self.reduced_alpha_bits)
            .set("emscripten_config_pngx_lossy_quality_min", self.quality_min)
            .set("emscripten_config_pngx_lossy_quality_max", self.quality_max)
            .set("emscripten_config_pngx_lossy_speed", self.speed)
            .set("emscripten_config_pngx_lossy_dither_level", Some(self.dither.native_value()))
            .set("emscripten_config_pngx_saliency_map_enable", self.saliency_map_enable)
            .set("emscripten_config_pngx_chroma_anchor_enable", self.chroma_anchor_enable)
            .set("emscripten_config_pngx_adaptive_dither_enable", self.adaptive_dither_enable)
            .set("emscripten_config_pngx_gradient_boost_enable", self.gradient_boost_enable)
            .set("emscripten_config_pngx_chroma_weight_enable", self.chroma_weight_enable)
            .set("emscripten_config_pngx_postprocess_smooth_enable", self.postprocess_smooth_enable)
            .set(
                "emscripten_config_pngx_postprocess_smooth_importance_cutoff",
                self.postprocess_smooth_importance_cutoff,
            );
        palette256_settings(&mut s, &self.palette256);
        s.finish()
    }

    fn protected_colors(&self) -> &[RgbaColor] {
        &self.protected_colors
    }
}

fn palette256_settings(s: &mut Settings, t: &Palette256Tuning) {
    s.set("emscripten_config_pngx_palette256_gradient_profile_enable", t.gradient_profile_enable)
        .set("emscripten_config_pngx_palette256_gradient_dither_floor", t.gradient_dither_floor)
        .set("emscripten_config_pngx_palette256_alpha_bleed_enable", t.alpha_bleed_enable)
        .set("emscripten_config_pngx_palette256_alpha_bleed_max_distance", t.alpha_bleed_max_distance)
        .set("emscripten_config_pngx_palette256_alpha_bleed_opaque_threshold", t.alpha_bleed_opaque_threshold)
        .set("emscripten_config_pngx_palette256_alpha_bleed_soft_limit", t.alpha_bleed_soft_limit)
        .set("emscripten_config_pngx_palette256_profile_opaque_ratio_threshold", t.profile_opaque_ratio_threshold)
        .set("emscripten_config_pngx_palette256_profile_gradient_mean_max", t.profile_gradient_mean_max)
        .set("emscripten_config_pngx_palette256_profile_saturation_mean_max", t.profile_saturation_mean_max)
        .set("emscripten_config_pngx_palette256_tune_opaque_ratio_threshold", t.tune_opaque_ratio_threshold)
        .set("emscripten_config_pngx_palette256_tune_gradient_mean_max", t.tune_gradient_mean_max)
        .set("emscripten_config_pngx_palette256_tune_saturation_mean_max", t.tune_saturation_mean_max)
        .set("emscripten_config_pngx_palette256_tune_speed_max", t.tune_speed_max)
        .set("emscripten_config_pngx_palette256_tune_quality_min_floor", t.tune_quality_min_floor)
        .set("emscripten_config_pngx_palette256_tune_quality_max_target", t.tune_quality_max_target);
}

impl NativeOptions for FormatOptions {
    fn native_settings(&self) -> Vec<NativeSetting> {
        match self {
            Self::Webp(o) => o.native_settings(),
            Self::Avif(o) => o.native_settings(),
            Self::Pngx(o) => o.native_settings(),
        }
    }

    fn protected_colors(&self) -> &[RgbaColor] {
        match self {
            Self::Pngx(o) => o.protected_colors(),
            _ => &[],
        }
    }
}
