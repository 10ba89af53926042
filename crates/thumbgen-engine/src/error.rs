use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::stages::GenerationStage;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("API key not found. Please add your Gemini API key for Pro mode.")]
    MissingCredential,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed reading image {}", .path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Remote(String),
    #[error("generation cancelled while {stage}")]
    Cancelled { stage: GenerationStage },
    #[error("generation superseded by a newer request")]
    Superseded,
    #[error("illegal stage transition {from} -> {to}")]
    IllegalTransition {
        from: GenerationStage,
        to: GenerationStage,
    },
    #[error("invalid gallery: {0}")]
    InvalidGallery(String),
    #[error("event log write failed: {0}")]
    EventLog(String),
}

impl GenerationError {
    /// Stable label used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "configuration",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Input { .. } => "input",
            Self::Remote(_) => "remote",
            Self::Cancelled { .. } => "cancelled",
            Self::Superseded => "superseded",
            Self::IllegalTransition { .. } | Self::InvalidGallery(_) => "internal",
            Self::EventLog(_) => "event_log",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Superseded)
    }
}

/// Joins an error and its sources into one line, dropping repeated messages.
pub fn error_chain_text(err: &(dyn StdError + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(": "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
