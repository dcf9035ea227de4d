//! Conversion options: the loose string-keyed record callers send, and the
//! typed per-format option sets resolved from it.
//!
//! Coercion happens once, here, at the worker boundary. Everything past this
//! module works with typed values; an absent field means "leave the native
//! default alone".

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use crate::utils::OutputFormat;

/// Colors the PNGX palette quantizer must keep verbatim.
pub const MAX_PROTECTED_COLORS: usize = 256;

/// Palette size bounds for the 256-color palette mode.
const PALETTE_MIN_COLORS: u32 = 2;
const PALETTE_MAX_COLORS: u32 = 256;
/// Upper bound for the reduced RGBA32 color budget.
const REDUCED_MAX_COLORS: u32 = 32768;
/// Reduced-mode sentinel meaning "no color cap".
pub const REDUCED_COLORS_DISABLED: u32 = 1;
/// Dither slider position used when nothing usable was supplied.
const DEFAULT_DITHER_SLIDER: u8 = 60;

/// String-keyed option record as supplied by the caller.
///
/// Values may be numbers, numeric strings, booleans or `"true"`/`"false"`
/// strings. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionRecord(Map<String, Value>);

impl OptionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a key, builder style.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finite number from a JSON number or a numeric string.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    /// Integer setter argument; fractional values truncate toward zero.
    pub fn int(&self, key: &str) -> Option<i32> {
        self.number(key).map(|v| v.trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
    }

    pub fn float(&self, key: &str) -> Option<f32> {
        self.number(key).map(|v| v as f32)
    }

    /// Boolean with string and truthiness coercion.
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).map(truthy)
    }

    /// Parses `pngx_protected_colors`, dropping malformed entries.
    pub fn colors(&self, key: &str) -> Vec<RgbaColor> {
        let Some(Value::Array(items)) = self.get(key) else {
            return Vec::new();
        };
        let mut colors: Vec<RgbaColor> = items.iter().filter_map(RgbaColor::from_value).collect();
        if colors.len() < items.len() {
            warn!("Ignored {} malformed protected color(s)", items.len() - colors.len());
        }
        if colors.len() > MAX_PROTECTED_COLORS {
            warn!(
                "{} protected colors supplied, keeping the first {}",
                colors.len(), MAX_PROTECTED_COLORS
            );
            colors.truncate(MAX_PROTECTED_COLORS);
        }
        colors
    }
}

impl From<Map<String, Value>> for OptionRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) if s.eq_ignore_ascii_case("true") => true,
        Value::String(s) if s.eq_ignore_ascii_case("false") => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0 && !v.is_nan()),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// One RGBA color, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbaColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default = "opaque")]
    pub a: u8,
}

fn opaque() -> u8 {
    255
}

impl RgbaColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Accepts `{r,g,b[,a]}` objects or `#rrggbb[aa]` strings.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            Value::String(s) => Self::from_hex(s),
            _ => None,
        }
    }

    fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        let a = if hex.len() == 8 { channel(6)? } else { 255 };
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?, a))
    }
}

/// WebP encoder settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebpOptions {
    pub quality: Option<f32>,
    pub lossless: Option<bool>,
    pub method: Option<i32>,
    pub target_size: Option<i32>,
    pub target_psnr: Option<f32>,
    pub segments: Option<i32>,
    pub sns_strength: Option<i32>,
    pub filter_strength: Option<i32>,
    pub filter_sharpness: Option<i32>,
    pub filter_type: Option<i32>,
    pub autofilter: Option<bool>,
    pub alpha_compression: Option<bool>,
    pub alpha_filtering: Option<i32>,
    pub alpha_quality: Option<i32>,
    pub pass: Option<i32>,
    pub preprocessing: Option<i32>,
    pub partitions: Option<i32>,
    pub partition_limit: Option<i32>,
    pub emulate_jpeg_size: Option<bool>,
    pub low_memory: Option<bool>,
    pub near_lossless: Option<i32>,
    pub exact: Option<bool>,
    pub use_delta_palette: Option<bool>,
    pub use_sharp_yuv: Option<bool>,
}

impl WebpOptions {
    pub fn from_record(record: &OptionRecord) -> Self {
        Self {
            quality: record.float("quality"),
            lossless: record.flag("lossless"),
            method: record.int("method"),
            target_size: record.int("target_size"),
            target_psnr: record.float("target_psnr"),
            segments: record.int("segments"),
            sns_strength: record.int("sns_strength"),
            filter_strength: record.int("filter_strength"),
            filter_sharpness: record.int("filter_sharpness"),
            filter_type: record.int("filter_type"),
            autofilter: record.flag("autofilter"),
            alpha_compression: record.flag("alpha_compression"),
            alpha_filtering: record.int("alpha_filtering"),
            alpha_quality: record.int("alpha_quality"),
            pass: record.int("pass"),
            preprocessing: record.int("preprocessing"),
            partitions: record.int("partitions"),
            partition_limit: record.int("partition_limit"),
            emulate_jpeg_size: record.flag("emulate_jpeg_size"),
            low_memory: record.flag("low_memory"),
            near_lossless: record.int("near_lossless"),
            exact: record.flag("exact"),
            use_delta_palette: record.flag("use_delta_palette"),
            use_sharp_yuv: record.flag("use_sharp_yuv"),
        }
    }
}

/// AVIF encoder settings.
///
/// The `avif_`-prefixed keys win over the shared ones so a single record can
/// carry settings for several formats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvifOptions {
    pub quality: Option<f32>,
    pub alpha_quality: Option<i32>,
    pub lossless: Option<bool>,
    pub speed: Option<i32>,
}

impl AvifOptions {
    pub fn from_record(record: &OptionRecord) -> Self {
        Self {
            quality: record.float("avif_quality").or_else(|| record.float("quality")),
            alpha_quality: record.int("avif_alpha_quality").or_else(|| record.int("alpha_quality")),
            lossless: record.flag("avif_lossless").or_else(|| record.flag("lossless")),
            speed: record.int("avif_speed").or_else(|| record.int("speed")),
        }
    }
}

/// PNGX lossy reduction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossyMode {
    /// Indexed palette of at most 256 colors
    #[default]
    Palette,
    /// RGBA4444-style bit-depth reduction
    Limited,
    /// RGBA32 with a capped color count
    Reduced,
}

impl LossyMode {
    pub fn raw(self) -> i32 {
        match self {
            Self::Palette => 0,
            Self::Limited => 1,
            Self::Reduced => 2,
        }
    }

    fn from_number(value: Option<f64>) -> Self {
        match value {
            None => Self::default(),
            Some(v) if v == 0.0 => Self::Palette,
            Some(v) if v == 1.0 => Self::Limited,
            Some(v) if v == 2.0 => Self::Reduced,
            Some(v) => {
                warn!("Unknown PNGX lossy type {}, using palette mode", v);
                Self::default()
            }
        }
    }
}

/// Dithering choice after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dither {
    /// Let the native encoder pick (limited mode only)
    Auto,
    /// Slider position, 0 to 100
    Level(u8),
}

impl Dither {
    /// Value handed to the native dither setter.
    pub fn native_value(self) -> f32 {
        match self {
            Self::Auto => -1.0,
            Self::Level(level) => f32::from(level) / 100.0,
        }
    }
}

/// Palette-mode heuristics tuning; all optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Palette256Tuning {
    pub gradient_profile_enable: Option<bool>,
    pub gradient_dither_floor: Option<f32>,
    pub alpha_bleed_enable: Option<bool>,
    pub alpha_bleed_max_distance: Option<i32>,
    pub alpha_bleed_opaque_threshold: Option<i32>,
    pub alpha_bleed_soft_limit: Option<i32>,
    pub profile_opaque_ratio_threshold: Option<f32>,
    pub profile_gradient_mean_max: Option<f32>,
    pub profile_saturation_mean_max: Option<f32>,
    pub tune_opaque_ratio_threshold: Option<f32>,
    pub tune_gradient_mean_max: Option<f32>,
    pub tune_saturation_mean_max: Option<f32>,
    pub tune_speed_max: Option<i32>,
    pub tune_quality_min_floor: Option<i32>,
    pub tune_quality_max_target: Option<i32>,
}

impl Palette256Tuning {
    fn from_record(r: &OptionRecord) -> Self {
        Self {
            gradient_profile_enable: r.flag("pngx_palette256_gradient_profile_enable"),
            gradient_dither_floor: r.float("pngx_palette256_gradient_dither_floor"),
            alpha_bleed_enable: r.flag("pngx_palette256_alpha_bleed_enable"),
            alpha_bleed_max_distance: r.int("pngx_palette256_alpha_bleed_max_distance"),
            alpha_bleed_opaque_threshold: r.int("pngx_palette256_alpha_bleed_opaque_threshold"),
            alpha_bleed_soft_limit: r.int("pngx_palette256_alpha_bleed_soft_limit"),
            profile_opaque_ratio_threshold: r.float("pngx_palette256_profile_opaque_ratio_threshold"),
            profile_gradient_mean_max: r.float("pngx_palette256_profile_gradient_mean_max"),
            profile_saturation_mean_max: r.float("pngx_palette256_profile_saturation_mean_max"),
            tune_opaque_ratio_threshold: r.float("pngx_palette256_tune_opaque_ratio_threshold"),
            tune_gradient_mean_max: r.float("pngx_palette256_tune_gradient_mean_max"),
            tune_saturation_mean_max: r.float("pngx_palette256_tune_saturation_mean_max"),
            tune_speed_max: r.int("pngx_palette256_tune_speed_max"),
            tune_quality_min_floor: r.int("pngx_palette256_tune_quality_min_floor"),
            tune_quality_max_target: r.int("pngx_palette256_tune_quality_max_target"),
        }
    }
}

/// PNGX settings with the derived values already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PngxOptions {
    pub level: Option<i32>,
    pub strip_safe: Option<bool>,
    pub optimize_alpha: Option<bool>,
    pub threads: Option<i32>,
    pub lossy_enable: bool,
    pub lossy_mode: LossyMode,
    /// Palette size in palette mode, color cap in reduced mode
    pub max_colors: u32,
    /// Native reduced-colors value, -1 when disabled
    pub reduced_colors: i32,
    pub reduced_bits_rgb: Option<i32>,
    pub reduced_alpha_bits: Option<i32>,
    pub quality_min: Option<i32>,
    pub quality_max: Option<i32>,
    pub speed: Option<i32>,
    pub dither: Dither,
    pub saliency_map_enable: Option<bool>,
    pub chroma_anchor_enable: Option<bool>,
    pub adaptive_dither_enable: Option<bool>,
    pub gradient_boost_enable: Option<bool>,
    pub chroma_weight_enable: Option<bool>,
    pub postprocess_smooth_enable: Option<bool>,
    pub postprocess_smooth_importance_cutoff: Option<f32>,
    pub palette256: Palette256Tuning,
    pub protected_colors: Vec<RgbaColor>,
}

impl Default for PngxOptions {
    fn default() -> Self {
        Self::from_record(&OptionRecord::new())
    }
}

impl PngxOptions {
    pub fn from_record(record: &OptionRecord) -> Self {
        let lossy_mode = LossyMode::from_number(record.number("pngx_lossy_type"));
        let legacy_reduced = record.number("pngx_lossy_reduced_colors");
        let provided_max = record.number("pngx_lossy_max_colors");

        let max_colors = resolve_max_colors(lossy_mode, provided_max, legacy_reduced);
        let reduced_colors = match lossy_mode {
            LossyMode::Reduced if max_colors <= REDUCED_COLORS_DISABLED => -1,
            LossyMode::Reduced => max_colors as i32,
            _ => legacy_reduced.map(|v| v.trunc() as i32).unwrap_or(-1),
        };

        Self {
            level: record.int("pngx_level").or_else(|| record.int("level")),
            strip_safe: record.flag("pngx_strip_safe"),
            optimize_alpha: record.flag("pngx_optimize_alpha"),
            threads: record.int("pngx_threads"),
            lossy_enable: record.flag("pngx_lossy_enable").unwrap_or(true),
            lossy_mode,
            max_colors,
            reduced_colors,
            reduced_bits_rgb: record.int("pngx_lossy_reduced_bits_rgb"),
            reduced_alpha_bits: record.int("pngx_lossy_reduced_alpha_bits"),
            quality_min: record.int("pngx_lossy_quality_min"),
            quality_max: record.int("pngx_lossy_quality_max"),
            speed: record.int("pngx_lossy_speed"),
            dither: resolve_dither(
                lossy_mode,
                record.number("pngx_lossy_dither_level"),
                record.flag("pngx_lossy_dither_auto").unwrap_or(false),
            ),
            saliency_map_enable: record.flag("pngx_saliency_map_enable"),
            chroma_anchor_enable: record.flag("pngx_chroma_anchor_enable"),
            adaptive_dither_enable: record.flag("pngx_adaptive_dither_enable"),
            gradient_boost_enable: record.flag("pngx_gradient_boost_enable"),
            chroma_weight_enable: record.flag("pngx_chroma_weight_enable"),
            postprocess_smooth_enable: record.flag("pngx_postprocess_smooth_enable"),
            postprocess_smooth_importance_cutoff: record.float("pngx_postprocess_smooth_importance_cutoff"),
            palette256: Palette256Tuning::from_record(record),
            protected_colors: record.colors("pngx_protected_colors"),
        }
    }

    /// Lossless optimization level, native default 5.
    pub fn optimization_level(&self) -> i32 {
        self.level.unwrap_or(5)
    }

    pub fn strip_safe_or_default(&self) -> bool {
        self.strip_safe.unwrap_or(true)
    }

    pub fn optimize_alpha_or_default(&self) -> bool {
        self.optimize_alpha.unwrap_or(true)
    }

    /// Limited and reduced output may legitimately grow; the native encoder
    /// applies its own size check there.
    pub fn allows_larger_output(&self) -> bool {
        self.lossy_enable && matches!(self.lossy_mode, LossyMode::Limited | LossyMode::Reduced)
    }
}

fn resolve_max_colors(mode: LossyMode, provided: Option<f64>, legacy_reduced: Option<f64>) -> u32 {
    match mode {
        LossyMode::Reduced => match legacy_reduced.or(provided) {
            Some(v) if v > 1.0 => v.trunc().clamp(2.0, REDUCED_MAX_COLORS as f64) as u32,
            _ => REDUCED_COLORS_DISABLED,
        },
        _ => provided
            .unwrap_or(PALETTE_MAX_COLORS as f64)
            .trunc()
            .clamp(PALETTE_MIN_COLORS as f64, PALETTE_MAX_COLORS as f64) as u32,
    }
}

fn resolve_dither(mode: LossyMode, raw: Option<f64>, auto_requested: bool) -> Dither {
    let slider = match raw {
        Some(v) if v < 0.0 => DEFAULT_DITHER_SLIDER,
        Some(v) if v <= 1.0 => (v * 100.0).round().clamp(0.0, 100.0) as u8,
        Some(v) => v.round().clamp(0.0, 100.0) as u8,
        None => DEFAULT_DITHER_SLIDER,
    };
    let auto = auto_requested || raw.is_some_and(|v| v < 0.0);
    if auto && mode == LossyMode::Limited {
        Dither::Auto
    } else {
        Dither::Level(slider)
    }
}

/// Typed options for one conversion, resolved once per request.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatOptions {
    Webp(WebpOptions),
    Avif(AvifOptions),
    Pngx(PngxOptions),
}

impl FormatOptions {
    pub fn from_record(format: OutputFormat, record: &OptionRecord) -> Self {
        match format {
            OutputFormat::WebP => Self::Webp(WebpOptions::from_record(record)),
            OutputFormat::Avif => Self::Avif(AvifOptions::from_record(record)),
            OutputFormat::Pngx => Self::Pngx(PngxOptions::from_record(record)),
        }
    }

    pub fn format(&self) -> OutputFormat {
        match self {
            Self::Webp(_) => OutputFormat::WebP,
            Self::Avif(_) => OutputFormat::Avif,
            Self::Pngx(_) => OutputFormat::Pngx,
        }
    }
}
