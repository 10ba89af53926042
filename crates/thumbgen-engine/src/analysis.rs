use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use thumbgen_contracts::credentials::ApiCredential;

use crate::config::EngineConfig;
use crate::error::{truncate_text, GenerationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub model: String,
    pub instruction: String,
    pub media_type: String,
    /// Base64 (standard alphabet) image bytes.
    pub encoded_image: String,
}

/// Turns an image plus instruction into free text. This is the only
/// network-bound step of a Pro run.
pub trait PromptAnalyzer: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(
        &self,
        request: &AnalysisRequest,
        credential: &ApiCredential,
    ) -> Result<String, GenerationError>;
}

pub struct GeminiAnalyzer {
    api_base: String,
    http: HttpClient,
}

impl GeminiAnalyzer {
    pub fn new(config: &EngineConfig) -> Result<Self, GenerationError> {
        Self::with_timeout(&config.api_base, config.request_timeout)
    }

    pub fn with_timeout(
        api_base: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, GenerationError> {
        // the blocking client defaults to a 30s timeout; `None` clears it
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GenerationError::Remote(format!("HTTP client setup failed: {err}")))?;
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub fn build_payload(request: &AnalysisRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": request.instruction },
                    {
                        "inlineData": {
                            "mimeType": request.media_type,
                            "data": request.encoded_image,
                        }
                    },
                ],
            }],
        })
    }
}

impl PromptAnalyzer for GeminiAnalyzer {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(
        &self,
        request: &AnalysisRequest,
        credential: &ApiCredential,
    ) -> Result<String, GenerationError> {
        let endpoint = self.endpoint_for_model(&request.model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", credential.expose())])
            .json(&Self::build_payload(request))
            .send()
            .map_err(|err| {
                // reqwest embeds the full URL, key included
                let err = err.without_url();
                GenerationError::Remote(format!("Gemini request failed ({endpoint}): {err}"))
            })?;
        let body = response_body_or_error(response)?;
        extract_response_text(&body)
    }
}

fn response_body_or_error(response: HttpResponse) -> Result<String, GenerationError> {
    let status = response.status();
    let body = response.text().map_err(|err| {
        GenerationError::Remote(format!("Gemini response body read failed: {}", err.without_url()))
    })?;
    if !status.is_success() {
        return Err(GenerationError::Remote(format!(
            "Gemini request failed ({}): {}",
            status.as_u16(),
            truncate_text(body.trim(), 512)
        )));
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Concatenated text parts of the first candidate.
///
/// An envelope that does not match the expected shape, or has no candidate,
/// is an error. A candidate with no text is not: it yields an empty string.
pub fn extract_response_text(body: &str) -> Result<String, GenerationError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body).map_err(|err| {
        GenerationError::Remote(format!("Gemini returned an unexpected payload: {err}"))
    })?;
    let Some(candidate) = parsed.candidates.into_iter().next() else {
        let reason = parsed
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .map(|reason| format!(" (blocked: {reason})"))
            .unwrap_or_default();
        return Err(GenerationError::Remote(format!(
            "Gemini returned no candidates{reason}"
        )));
    };
    if candidate.finish_reason.as_deref() == Some("SAFETY") && candidate.content.is_none() {
        return Err(GenerationError::Remote(
            "Gemini withheld the response for safety reasons".to_string(),
        ));
    }
    Ok(candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<String>>()
                .join("")
        })
        .unwrap_or_default())
}
