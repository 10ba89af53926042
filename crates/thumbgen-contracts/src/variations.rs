use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of candidates every completed generation returns.
pub const GALLERY_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    #[default]
    Free,
    Pro,
}

impl GenerationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }

    pub fn badge(self) -> &'static str {
        match self {
            Self::Free => "⚡ Free",
            Self::Pro => "✨ Pro",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            other => Err(format!(
                "Unknown generation mode '{other}'; expected 'free' or 'pro'."
            )),
        }
    }
}

/// One candidate thumbnail in a gallery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailVariation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "promptUsed")]
    pub prompt_used: String,
    pub mode: GenerationMode,
}

impl ThumbnailVariation {
    /// Renderable address, treating an empty string the same as a missing one.
    pub fn image_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn download_file_name(&self) -> String {
        format!("thumbnail-{}.png", self.id)
    }
}

pub fn variation_id(mode: GenerationMode, index: usize, stamp_millis: i64) -> String {
    format!("{}-{}-{}", mode.as_str(), index, stamp_millis)
}

/// Checks the invariants every returned gallery must hold.
pub fn ensure_gallery(variations: &[ThumbnailVariation]) -> Result<(), String> {
    if variations.len() != GALLERY_SIZE {
        return Err(format!(
            "Expected {GALLERY_SIZE} variations, got {}.",
            variations.len()
        ));
    }
    let mut seen = HashSet::new();
    for variation in variations {
        if !seen.insert(variation.id.as_str()) {
            return Err(format!("Duplicate variation id '{}'.", variation.id));
        }
        if variation.prompt_used.trim().is_empty() {
            return Err(format!("Variation '{}' has an empty prompt.", variation.id));
        }
    }
    Ok(())
}
