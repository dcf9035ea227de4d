//! Parameter and result types for the quantization engine.

/// Lossless recompression settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LosslessOptions {
    pub optimization_level: i32,
    pub strip_safe: bool,
    pub optimize_alpha: bool,
}

impl Default for LosslessOptions {
    fn default() -> Self {
        Self {
            optimization_level: 5,
            strip_safe: true,
            optimize_alpha: true,
        }
    }
}

/// Palette quantization parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub speed: i32,
    pub quality_min: u8,
    pub quality_max: u8,
    pub max_colors: u32,
    pub min_posterization: i32,
    pub dithering_level: f32,
    pub remap: bool,
    /// Per-pixel weights, one byte per pixel
    pub importance_map: Option<Vec<u8>>,
    /// RGBA quads that must appear in the palette
    pub fixed_colors: Option<Vec<u8>>,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            speed: 3,
            quality_min: 0,
            quality_max: 100,
            max_colors: 256,
            min_posterization: 0,
            dithering_level: 1.0,
            remap: true,
            importance_map: None,
            fixed_colors: None,
        }
    }
}

impl QuantParams {
    pub fn is_advanced(&self) -> bool {
        self.importance_map.is_some() || self.fixed_colors.is_some()
    }
}

/// Outcome reported by the quantizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantStatus {
    Ok,
    /// The minimum quality could not be reached
    QualityTooLow,
    Error(i32),
}

impl From<i32> for QuantStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::QualityTooLow,
            other => Self::Error(other),
        }
    }
}

/// Quantized image, copied out of the module.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantResult {
    /// RGBA quads
    pub palette: Vec<u8>,
    pub indices: Vec<u8>,
    pub quality: i32,
    pub status: QuantStatus,
}
