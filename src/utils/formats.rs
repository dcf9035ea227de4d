use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use crate::utils::BridgeError;

/// Output formats the bridge can produce from a PNG input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    WebP,
    Avif,
    Pngx,
}

impl OutputFormat {
    /// All registered formats, default first.
    pub const ALL: [OutputFormat; 3] = [Self::WebP, Self::Avif, Self::Pngx];

    /// Stable identifier used on the worker protocol
    pub fn id(&self) -> &'static str {
        match self {
            Self::WebP => "webp",
            Self::Avif => "avif",
            Self::Pngx => "pngx",
        }
    }

    /// Label used in user-facing error messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::WebP => "WebP",
            Self::Avif => "AVIF",
            Self::Pngx => "PNGX",
        }
    }

    /// File extension of converted output
    pub fn output_extension(&self) -> &'static str {
        match self {
            Self::WebP => "webp",
            Self::Avif => "avif",
            Self::Pngx => "png",
        }
    }

    /// Resolves a protocol format id, falling back to the default format.
    ///
    /// Unknown or missing ids are not an error: the worker converts with
    /// the default format and logs the substitution.
    pub fn from_id_or_default(id: Option<&str>) -> Self {
        match id {
            Some(id) => id.parse().unwrap_or_else(|_| {
                warn!("Unknown format id '{}', using {}", id, Self::default().id());
                Self::default()
            }),
            None => Self::default(),
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::ALL[0]
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for OutputFormat {
    type Err = BridgeError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let id = id.to_lowercase();
        match id.as_str() {
            "webp" => Ok(Self::WebP),
            "avif" => Ok(Self::Avif),
            "pngx" | "png" => Ok(Self::Pngx),
            _ => Err(BridgeError::validation(format!(
                "Unsupported output format: {}", id
            ))),
        }
    }
}
