use std::env;
use std::time::Duration;

use thumbgen_contracts::models::DEFAULT_ANALYSIS_MODEL;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_PLACEHOLDER_BASE: &str = "https://picsum.photos";
pub const THUMBNAIL_WIDTH: u32 = 1280;
pub const THUMBNAIL_HEIGHT: u32 = 720;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_base: String,
    pub analysis_model: String,
    pub placeholder_base: String,
    pub width: u32,
    pub height: u32,
    /// `None` leaves the analysis call without a client-side timeout.
    pub request_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            analysis_model: DEFAULT_ANALYSIS_MODEL.to_string(),
            placeholder_base: DEFAULT_PLACEHOLDER_BASE.to_string(),
            width: THUMBNAIL_WIDTH,
            height: THUMBNAIL_HEIGHT,
            request_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Reads `GEMINI_API_BASE`, `THUMBGEN_PLACEHOLDER_BASE` and
    /// `THUMBGEN_REQUEST_TIMEOUT_S` over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            placeholder_base: non_empty_env("THUMBGEN_PLACEHOLDER_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.placeholder_base),
            request_timeout: non_empty_env("THUMBGEN_REQUEST_TIMEOUT_S")
                .and_then(|value| parse_timeout_seconds(&value)),
            ..defaults
        }
    }

    pub fn with_analysis_model(mut self, model: impl Into<String>) -> Self {
        self.analysis_model = model.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn parse_timeout_seconds(raw: &str) -> Option<Duration> {
    let seconds = raw.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
