pub mod analysis;
pub mod cancel;
pub mod config;
pub mod error;
pub mod placeholder;
pub mod prompts;
pub mod stages;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use thumbgen_contracts::credentials::ApiCredential;
use thumbgen_contracts::events::EventWriter;
use thumbgen_contracts::variations::{
    ensure_gallery, variation_id, GenerationMode, ThumbnailVariation, GALLERY_SIZE,
};

pub use analysis::{AnalysisRequest, GeminiAnalyzer, PromptAnalyzer};
pub use cancel::{CancelToken, GenerationSession, GenerationTicket};
pub use config::EngineConfig;
pub use error::GenerationError;
pub use placeholder::{FixedSeeds, RandomSeeds, SeedSource};
pub use stages::{GenerationStage, StageTracker};

use crate::error::error_chain_text;
use crate::placeholder::{placeholder_url, PRO_SEED_OFFSET};
use crate::prompts::{
    analysis_instruction, pad_prompts, split_prompt_segments, styled_prompt,
    FREE_STYLE_SUFFIXES,
};

/// An image on disk. Bytes are only read once a Pro run reaches `Encoding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub path: PathBuf,
    pub media_type: Option<String>,
}

impl ImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn encode(&self) -> Result<EncodedImage, GenerationError> {
        if let Some(declared) = self.declared_media_type() {
            if !declared.starts_with("image/") {
                return Err(GenerationError::InvalidRequest(format!(
                    "{} is declared as '{declared}', not an image",
                    self.path.display()
                )));
            }
        }
        let bytes = fs::read(&self.path).map_err(|source| GenerationError::Input {
            path: self.path.clone(),
            source,
        })?;
        let media_type = self
            .declared_media_type()
            .or_else(|| media_type_for_path(&self.path).map(str::to_string))
            .or_else(|| sniff_media_type(&bytes))
            .unwrap_or_else(|| "image/png".to_string());
        Ok(EncodedImage {
            media_type,
            byte_len: bytes.len(),
            data: BASE64.encode(&bytes),
        })
    }

    fn declared_media_type(&self) -> Option<String> {
        self.media_type
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_ascii_lowercase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub media_type: String,
    pub byte_len: usize,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub image: Option<ImageSource>,
    pub prompt: String,
    pub mode: GenerationMode,
    pub credential: Option<ApiCredential>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, mode: GenerationMode) -> Self {
        Self {
            prompt: prompt.into(),
            mode,
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: ImageSource) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_credential(mut self, credential: Option<ApiCredential>) -> Self {
        self.credential = credential;
        self
    }

    /// Pro only runs with an image; everything else degrades to Free.
    pub fn resolved_mode(&self) -> GenerationMode {
        match (self.mode, &self.image) {
            (GenerationMode::Pro, Some(_)) => GenerationMode::Pro,
            _ => GenerationMode::Free,
        }
    }
}

/// Placeholder-only gallery with fixed style suffixes.
pub struct FreeStrategy<'a> {
    config: &'a EngineConfig,
    seeds: &'a dyn SeedSource,
}

impl<'a> FreeStrategy<'a> {
    pub fn new(config: &'a EngineConfig, seeds: &'a dyn SeedSource) -> Self {
        Self { config, seeds }
    }

    pub fn generate(&self, prompt: &str) -> Vec<ThumbnailVariation> {
        let base = self.seeds.next_base();
        let stamp = chrono::Utc::now().timestamp_millis();
        FREE_STYLE_SUFFIXES
            .iter()
            .enumerate()
            .map(|(idx, suffix)| ThumbnailVariation {
                id: variation_id(GenerationMode::Free, idx, stamp),
                url: Some(placeholder_url(
                    &self.config.placeholder_base,
                    base + idx as u32,
                    self.config.width,
                    self.config.height,
                )),
                prompt_used: styled_prompt(prompt, suffix),
                mode: GenerationMode::Free,
            })
            .collect()
    }
}

/// Model-derived prompts paired with placeholder images.
pub struct ProStrategy<'a> {
    config: &'a EngineConfig,
    seeds: &'a dyn SeedSource,
    analyzer: &'a dyn PromptAnalyzer,
    events: Option<&'a EventWriter>,
}

impl<'a> ProStrategy<'a> {
    pub fn new(
        config: &'a EngineConfig,
        seeds: &'a dyn SeedSource,
        analyzer: &'a dyn PromptAnalyzer,
        events: Option<&'a EventWriter>,
    ) -> Self {
        Self {
            config,
            seeds,
            analyzer,
            events,
        }
    }

    pub fn generate(
        &self,
        image: &ImageSource,
        prompt: &str,
        credential: Option<&ApiCredential>,
        tracker: &mut StageTracker<'_>,
    ) -> Result<Vec<ThumbnailVariation>, GenerationError> {
        let credential = credential.ok_or(GenerationError::MissingCredential)?;

        tracker.advance(GenerationStage::Encoding)?;
        let encoded = image.encode()?;

        tracker.advance(GenerationStage::AwaitingModelResponse)?;
        let request = AnalysisRequest {
            model: self.config.analysis_model.clone(),
            instruction: analysis_instruction(prompt),
            media_type: encoded.media_type,
            encoded_image: encoded.data,
        };
        emit(
            self.events,
            "analysis_request",
            json!({
                "analyzer": self.analyzer.name(),
                "model": request.model,
                "media_type": request.media_type,
                "image_bytes": encoded.byte_len,
                "encoded_len": request.encoded_image.len(),
            }),
        )?;
        let text = self.analyzer.analyze(&request, credential)?;

        tracker.advance(GenerationStage::Parsing)?;
        let segments = split_prompt_segments(&text);
        let segment_count = segments.len();
        let usable = segment_count.min(GALLERY_SIZE);
        let prompts = pad_prompts(segments, prompt);
        emit(
            self.events,
            "analysis_response",
            json!({
                "segments": segment_count,
                "used": usable,
                "padded": prompts.len() - usable,
            }),
        )?;

        tracker.advance(GenerationStage::Assembling)?;
        let base = self.seeds.next_base();
        let stamp = chrono::Utc::now().timestamp_millis();
        Ok(prompts
            .into_iter()
            .enumerate()
            .map(|(idx, prompt_used)| ThumbnailVariation {
                id: variation_id(GenerationMode::Pro, idx, stamp),
                url: Some(placeholder_url(
                    &self.config.placeholder_base,
                    base + idx as u32 + PRO_SEED_OFFSET,
                    self.config.width,
                    self.config.height,
                )),
                prompt_used,
                mode: GenerationMode::Pro,
            })
            .collect())
    }
}

/// Request Dispatcher: routes a request to the Free or Pro strategy.
pub struct ThumbnailEngine {
    config: EngineConfig,
    analyzer: Arc<dyn PromptAnalyzer>,
    seeds: Arc<dyn SeedSource>,
    events: Option<EventWriter>,
}

impl ThumbnailEngine {
    pub fn new(config: EngineConfig) -> Result<Self, GenerationError> {
        let analyzer = GeminiAnalyzer::new(&config)?;
        Ok(Self {
            config,
            analyzer: Arc::new(analyzer),
            seeds: Arc::new(RandomSeeds::new()),
            events: None,
        })
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn PromptAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_seeds(mut self, seeds: Arc<dyn SeedSource>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_writer(&self) -> Option<&EventWriter> {
        self.events.as_ref()
    }

    pub fn generate_free(&self, prompt: &str) -> Vec<ThumbnailVariation> {
        FreeStrategy::new(&self.config, self.seeds.as_ref()).generate(prompt)
    }

    pub fn generate_pro(
        &self,
        image: &ImageSource,
        prompt: &str,
        credential: Option<&ApiCredential>,
        cancel: &CancelToken,
    ) -> Result<Vec<ThumbnailVariation>, GenerationError> {
        let mut tracker = StageTracker::new(cancel, self.events.as_ref());
        let result = self
            .pro_strategy()
            .generate(image, prompt, credential, &mut tracker)
            .and_then(|variations| {
                ensure_gallery(&variations).map_err(GenerationError::InvalidGallery)?;
                tracker.advance(GenerationStage::Done)?;
                Ok(variations)
            });
        if result.is_err() {
            tracker.fail();
        }
        result
    }

    pub fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<ThumbnailVariation>, GenerationError> {
        let resolved = request.resolved_mode();
        self.emit(
            "generation_started",
            json!({
                "mode_requested": request.mode.as_str(),
                "mode": resolved.as_str(),
                "prompt": request.prompt,
                "has_image": request.image.is_some(),
                "has_credential": request.credential.is_some(),
            }),
        )?;

        let mut tracker = StageTracker::new(cancel, self.events.as_ref());
        match self.dispatch(request, resolved, &mut tracker) {
            Ok(variations) => {
                self.emit(
                    "generation_finished",
                    json!({
                        "mode": resolved.as_str(),
                        "count": variations.len(),
                        "ids": variations.iter().map(|row| row.id.clone()).collect::<Vec<_>>(),
                    }),
                )?;
                Ok(variations)
            }
            Err(err) => {
                let failed_in = tracker.fail();
                // log write failures are dropped; the generation error is returned
                let _ = self.emit(
                    "generation_failed",
                    json!({
                        "mode": resolved.as_str(),
                        "stage": failed_in.as_str(),
                        "error_kind": err.kind(),
                        "message": error_chain_text(&err, 512),
                    }),
                );
                Err(err)
            }
        }
    }

    /// Runs under a fresh session ticket. A result that finishes after a
    /// newer call started is dropped and reported as `Superseded`.
    pub fn generate_in_session(
        &self,
        session: &GenerationSession,
        request: &GenerationRequest,
    ) -> Result<Vec<ThumbnailVariation>, GenerationError> {
        let ticket = session.begin();
        let result = self.generate(request, ticket.cancel_token());
        if !session.is_current(&ticket) {
            let _ = self.emit(
                "generation_superseded",
                json!({ "ticket": ticket.id(), "latest": session.latest_id() }),
            );
            return Err(GenerationError::Superseded);
        }
        result
    }

    fn dispatch(
        &self,
        request: &GenerationRequest,
        resolved: GenerationMode,
        tracker: &mut StageTracker<'_>,
    ) -> Result<Vec<ThumbnailVariation>, GenerationError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "prompt must not be blank".to_string(),
            ));
        }
        let variations = match (resolved, request.image.as_ref()) {
            (GenerationMode::Pro, Some(image)) => self.pro_strategy().generate(
                image,
                &request.prompt,
                request.credential.as_ref(),
                tracker,
            )?,
            _ => {
                tracker.advance(GenerationStage::Assembling)?;
                self.generate_free(&request.prompt)
            }
        };
        ensure_gallery(&variations).map_err(GenerationError::InvalidGallery)?;
        tracker.advance(GenerationStage::Done)?;
        Ok(variations)
    }

    fn pro_strategy(&self) -> ProStrategy<'_> {
        ProStrategy::new(
            &self.config,
            self.seeds.as_ref(),
            self.analyzer.as_ref(),
            self.events.as_ref(),
        )
    }

    fn emit(&self, event_type: &str, payload: Value) -> Result<(), GenerationError> {
        emit(self.events.as_ref(), event_type, payload)
    }
}

fn emit(
    events: Option<&EventWriter>,
    event_type: &str,
    payload: Value,
) -> Result<(), GenerationError> {
    let Some(events) = events else {
        return Ok(());
    };
    events
        .emit_value(event_type, payload)
        .map(|_| ())
        .map_err(|err| GenerationError::EventLog(format!("{err:#}")))
}

pub fn media_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "heic" | "heif" => Some("image/heic"),
        _ => None,
    }
}

fn sniff_media_type(bytes: &[u8]) -> Option<String> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type().to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use base64::Engine as _;
    use serde_json::Value;
    use thumbgen_contracts::credentials::ApiCredential;
    use thumbgen_contracts::events::{read_event_types, EventWriter};
    use thumbgen_contracts::variations::{GenerationMode, ThumbnailVariation};

    use super::{
        AnalysisRequest, CancelToken, EngineConfig, FixedSeeds, GenerationError,
        GenerationRequest, GenerationSession, GenerationStage, ImageSource, PromptAnalyzer,
        RandomSeeds, ThumbnailEngine, BASE64,
    };

    const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    type Hook = Box<dyn Fn() + Send + Sync>;

    struct ScriptedAnalyzer {
        reply: Result<String, String>,
        calls: AtomicUsize,
        seen: Mutex<Vec<AnalysisRequest>>,
        on_call: Option<Hook>,
    }

    impl ScriptedAnalyzer {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                on_call: None,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                ..Self::replying("")
            }
        }

        fn with_hook(mut self, hook: Hook) -> Self {
            self.on_call = Some(hook);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> Option<AnalysisRequest> {
            self.seen.lock().unwrap().last().cloned()
        }
    }

    impl PromptAnalyzer for ScriptedAnalyzer {
        fn name(&self) -> &str {
            "scripted"
        }

        fn analyze(
            &self,
            request: &AnalysisRequest,
            _credential: &ApiCredential,
        ) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            if let Some(hook) = &self.on_call {
                hook();
            }
            self.reply.clone().map_err(GenerationError::Remote)
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        image: PathBuf,
        events_path: PathBuf,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("subject.jpg");
        std::fs::write(&image, b"fake-jpeg-bytes")?;
        let events_path = temp.path().join("events.jsonl");
        Ok(Fixture {
            _temp: temp,
            image,
            events_path,
        })
    }

    fn engine(
        analyzer: Arc<ScriptedAnalyzer>,
        seeds: Vec<u32>,
    ) -> anyhow::Result<ThumbnailEngine> {
        Ok(ThumbnailEngine::new(EngineConfig::default())?
            .with_analyzer(analyzer)
            .with_seeds(Arc::new(FixedSeeds::new(seeds))))
    }

    fn key() -> Option<ApiCredential> {
        ApiCredential::new("test-key")
    }

    fn pro_request(fixture: &Fixture, prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt, GenerationMode::Pro)
            .with_image(ImageSource::new(&fixture.image))
            .with_credential(key())
    }

    fn prompts(variations: &[ThumbnailVariation]) -> Vec<&str> {
        variations
            .iter()
            .map(|row| row.prompt_used.as_str())
            .collect()
    }

    fn assert_gallery_shape(variations: &[ThumbnailVariation], mode: GenerationMode) {
        assert_eq!(variations.len(), 3);
        let ids: HashSet<&str> = variations.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        for row in variations {
            assert_eq!(row.mode, mode);
            assert!(!row.prompt_used.trim().is_empty());
            assert!(row.image_url().is_some());
            assert!(row.id.starts_with(mode.as_str()));
        }
    }

    #[test]
    fn free_gaming_setup_scenario() -> anyhow::Result<()> {
        let analyzer = Arc::new(ScriptedAnalyzer::replying("unused"));
        let engine = engine(analyzer.clone(), vec![10])?;
        let request = GenerationRequest::new("gaming setup", GenerationMode::Free);

        let variations = engine.generate(&request, &CancelToken::new())?;

        assert_gallery_shape(&variations, GenerationMode::Free);
        assert_eq!(
            prompts(&variations),
            vec![
                "gaming setup - vibrant, professional style",
                "gaming setup - cinematic, modern style",
                "gaming setup - artistic, unique style",
            ]
        );
        let urls: Vec<_> = variations.iter().filter_map(|row| row.image_url()).collect();
        assert_eq!(
            urls,
            vec![
                "https://picsum.photos/seed/10/1280/720",
                "https://picsum.photos/seed/11/1280/720",
                "https://picsum.photos/seed/12/1280/720",
            ]
        );
        assert_eq!(analyzer.calls(), 0);
        Ok(())
    }

    #[test]
    fn repeated_free_runs_change_urls_but_not_suffix_order() -> anyhow::Result<()> {
        let engine = ThumbnailEngine::new(EngineConfig::default())?
            .with_seeds(Arc::new(RandomSeeds::new()));
        for _ in 0..50 {
            let first = engine.generate_free("desk");
            let second = engine.generate_free("desk");
            assert_eq!(prompts(&first), prompts(&second));
            for (left, right) in first.iter().zip(second.iter()) {
                assert_ne!(left.url, right.url);
            }
        }
        Ok(())
    }

    #[test]
    fn pro_without_image_degrades_to_free() -> anyhow::Result<()> {
        let analyzer = Arc::new(ScriptedAnalyzer::replying("A---B---C"));
        let engine = engine(analyzer.clone(), vec![1])?;
        let request =
            GenerationRequest::new("city", GenerationMode::Pro).with_credential(key());
        assert_eq!(request.resolved_mode(), GenerationMode::Free);

        let variations = engine.generate(&request, &CancelToken::new())?;
        assert_gallery_shape(&variations, GenerationMode::Free);
        assert_eq!(analyzer.calls(), 0);
        Ok(())
    }

    #[test]
    fn pro_keeps_model_order_and_offsets_seeds() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let analyzer = Arc::new(ScriptedAnalyzer::replying("A\n---\nB\n---\nC"));
        let engine = engine(analyzer.clone(), vec![5])?;

        let variations = engine.generate(&pro_request(&fixture, "cats"), &CancelToken::new())?;

        assert_gallery_shape(&variations, GenerationMode::Pro);
        assert_eq!(prompts(&variations), vec!["A", "B", "C"]);
        assert_eq!(
            variations[2].image_url(),
            Some("https://picsum.photos/seed/107/1280/720")
        );
        assert_eq!(analyzer.calls(), 1);

        let sent = analyzer.last_request().unwrap();
        assert_eq!(sent.model, "gemini-2.5-flash-image");
        assert_eq!(sent.media_type, "image/jpeg");
        assert_eq!(sent.encoded_image, BASE64.encode(b"fake-jpeg-bytes"));
        assert!(sent.instruction.contains("\"cats\""));
        Ok(())
    }

    #[test]
    fn pro_pads_single_segment_with_fallbacks() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let analyzer = Arc::new(ScriptedAnalyzer::replying("OnlyOne"));
        let engine = engine(analyzer, vec![0])?;

        let variations =
            engine.generate(&pro_request(&fixture, "gaming setup"), &CancelToken::new())?;

        assert_gallery_shape(&variations, GenerationMode::Pro);
        assert_eq!(variations[0].prompt_used, "OnlyOne");
        for row in &variations[1..] {
            assert!(row.prompt_used.contains("gaming setup"));
            assert!(row.prompt_used.starts_with("professional thumbnail:"));
        }
        Ok(())
    }

    #[test]
    fn pro_truncates_and_pads_any_segment_count() -> anyhow::Result<()> {
        let fixture = fixture()?;
        for (reply, expected_first) in [
            ("", None),
            ("one", Some("one")),
            ("one---two", Some("one")),
            ("1---2---3---4---5", Some("1")),
        ] {
            let analyzer = Arc::new(ScriptedAnalyzer::replying(reply));
            let engine = engine(analyzer, vec![3])?;
            let variations =
                engine.generate(&pro_request(&fixture, "topic"), &CancelToken::new())?;
            assert_gallery_shape(&variations, GenerationMode::Pro);
            if let Some(first) = expected_first {
                assert_eq!(variations[0].prompt_used, first);
            }
        }

        let analyzer = Arc::new(ScriptedAnalyzer::replying("1---2---3---4---5"));
        let variations = engine(analyzer, vec![3])?
            .generate(&pro_request(&fixture, "topic"), &CancelToken::new())?;
        assert_eq!(prompts(&variations), vec!["1", "2", "3"]);
        Ok(())
    }

    #[test]
    fn missing_credential_fails_before_any_io() -> anyhow::Result<()> {
        let analyzer = Arc::new(ScriptedAnalyzer::replying("A---B---C"));
        let engine = engine(analyzer.clone(), vec![0])?;
        let request = GenerationRequest::new("cats", GenerationMode::Pro)
            .with_image(ImageSource::new("/definitely/not/here.png"));

        let err = engine.generate(&request, &CancelToken::new()).err();

        assert!(matches!(err, Some(GenerationError::MissingCredential)));
        assert_eq!(analyzer.calls(), 0);
        Ok(())
    }

    #[test]
    fn unreadable_image_is_an_input_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let analyzer = Arc::new(ScriptedAnalyzer::replying("A"));
        let engine = engine(analyzer.clone(), vec![0])?;
        let request = GenerationRequest::new("cats", GenerationMode::Pro)
            .with_image(ImageSource::new(temp.path().join("gone.png")))
            .with_credential(key());

        match engine.generate(&request, &CancelToken::new()) {
            Err(GenerationError::Input { path, .. }) => assert!(path.ends_with("gone.png")),
            other => panic!("expected input error, got {other:?}"),
        }
        assert_eq!(analyzer.calls(), 0);
        Ok(())
    }

    #[test]
    fn remote_failure_propagates_without_retry() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let analyzer = Arc::new(ScriptedAnalyzer::failing(
            "Gemini request failed (429): quota exceeded",
        ));
        let engine = engine(analyzer.clone(), vec![0])?
            .with_events(EventWriter::new(&fixture.events_path, "s"));

        let err = engine
            .generate(&pro_request(&fixture, "cats"), &CancelToken::new())
            .err()
            .map(|err| err.to_string());

        assert_eq!(
            err.as_deref(),
            Some("Gemini request failed (429): quota exceeded")
        );
        assert_eq!(analyzer.calls(), 1);

        let raw = std::fs::read_to_string(&fixture.events_path)?;
        let failed = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .find(|row| row["type"] == "generation_failed")
            .unwrap();
        assert_eq!(failed["stage"], "awaiting_model_response");
        assert_eq!(failed["error_kind"], "remote");
        Ok(())
    }

    #[test]
    fn blank_prompt_is_rejected() -> anyhow::Result<()> {
        let engine = engine(Arc::new(ScriptedAnalyzer::replying("")), vec![0])?;
        let request = GenerationRequest::new("  \n", GenerationMode::Free);
        assert!(matches!(
            engine.generate(&request, &CancelToken::new()),
            Err(GenerationError::InvalidRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn media_type_comes_from_declaration_extension_or_content() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let sniffed = temp.path().join("upload.bin");
        std::fs::write(&sniffed, PNG_SIGNATURE)?;
        assert_eq!(ImageSource::new(&sniffed).encode()?.media_type, "image/png");

        let webp = temp.path().join("still.WEBP");
        std::fs::write(&webp, b"x")?;
        assert_eq!(ImageSource::new(&webp).encode()?.media_type, "image/webp");

        let declared = ImageSource::new(&webp).with_media_type("Image/AVIF");
        assert_eq!(declared.encode()?.media_type, "image/avif");

        let opaque = temp.path().join("blob");
        std::fs::write(&opaque, b"zz")?;
        assert_eq!(ImageSource::new(&opaque).encode()?.media_type, "image/png");

        let wrong = ImageSource::new(&webp).with_media_type("text/plain");
        assert!(matches!(
            wrong.encode(),
            Err(GenerationError::InvalidRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn cancelled_before_start_never_reaches_network() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let analyzer = Arc::new(ScriptedAnalyzer::replying("A"));
        let engine = engine(analyzer.clone(), vec![0])?;
        let cancel = CancelToken::new();
        cancel.cancel();

        match engine.generate(&pro_request(&fixture, "cats"), &cancel) {
            Err(GenerationError::Cancelled { stage }) => assert_eq!(stage, GenerationStage::Idle),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(analyzer.calls(), 0);
        Ok(())
    }

    #[test]
    fn cancellation_during_model_call_discards_response() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let analyzer = Arc::new(
            ScriptedAnalyzer::replying("A---B---C").with_hook(Box::new(move || trigger.cancel())),
        );
        let engine = engine(analyzer.clone(), vec![0])?;

        match engine.generate(&pro_request(&fixture, "cats"), &cancel) {
            Err(GenerationError::Cancelled { stage }) => {
                assert_eq!(stage, GenerationStage::AwaitingModelResponse)
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(analyzer.calls(), 1);
        Ok(())
    }

    #[test]
    fn newer_session_call_supersedes_in_flight_one() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let session = Arc::new(GenerationSession::new());
        let interloper = Arc::clone(&session);
        let analyzer = Arc::new(
            ScriptedAnalyzer::replying("A---B---C").with_hook(Box::new(move || {
                let _ = interloper.begin();
            })),
        );
        let engine = engine(analyzer, vec![0])?
            .with_events(EventWriter::new(&fixture.events_path, "s"));

        let result = engine.generate_in_session(&session, &pro_request(&fixture, "cats"));
        assert!(matches!(result, Err(GenerationError::Superseded)));
        assert!(read_event_types(&fixture.events_path)?
            .contains(&"generation_superseded".to_string()));

        let free = GenerationRequest::new("cats", GenerationMode::Free);
        let variations = engine.generate_in_session(&session, &free)?;
        assert_eq!(variations.len(), 3);
        Ok(())
    }

    #[test]
    fn pro_event_order_contract() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let analyzer = Arc::new(ScriptedAnalyzer::replying("A---B"));
        let engine = engine(analyzer, vec![0])?
            .with_events(EventWriter::new(&fixture.events_path, "s"));

        engine.generate(&pro_request(&fixture, "cats"), &CancelToken::new())?;

        let raw = std::fs::read_to_string(&fixture.events_path)?;
        let rows: Vec<Value> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let stages: Vec<&str> = rows
            .iter()
            .filter(|row| row["type"] == "stage_changed")
            .filter_map(|row| row["to"].as_str())
            .collect();
        assert_eq!(
            stages,
            vec![
                "encoding",
                "awaiting_model_response",
                "parsing",
                "assembling",
                "done"
            ]
        );

        let types: Vec<&str> = rows.iter().filter_map(|row| row["type"].as_str()).collect();
        let position = |name: &str| types.iter().position(|value| *value == name).unwrap();
        assert_eq!(position("generation_started"), 0);
        assert!(position("analysis_request") < position("analysis_response"));
        assert_eq!(types.last().copied(), Some("generation_finished"));

        let response = &rows[position("analysis_response")];
        assert_eq!(response["segments"], 2);
        assert_eq!(response["padded"], 1);
        assert!(!raw.contains("test-key"));
        Ok(())
    }

    #[test]
    fn direct_pro_call_requires_credential() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let analyzer = Arc::new(ScriptedAnalyzer::replying("A---B---C"));
        let engine = engine(analyzer.clone(), vec![0])?;
        let image = ImageSource::new(&fixture.image);

        assert!(matches!(
            engine.generate_pro(&image, "cats", None, &CancelToken::new()),
            Err(GenerationError::MissingCredential)
        ));
        let credential = key();
        let variations =
            engine.generate_pro(&image, "cats", credential.as_ref(), &CancelToken::new())?;
        assert_eq!(prompts(&variations), vec!["A", "B", "C"]);
        assert_eq!(analyzer.calls(), 1);
        Ok(())
    }
}
