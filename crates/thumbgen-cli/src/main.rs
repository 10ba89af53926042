use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use thumbgen_contracts::credentials::{ApiCredential, CredentialStore};
use thumbgen_contracts::events::EventWriter;
use thumbgen_contracts::models::{ModelSelector, DEFAULT_ANALYSIS_MODEL};
use thumbgen_contracts::variations::{GenerationMode, ThumbnailVariation};
use thumbgen_engine::{
    EngineConfig, GenerationRequest, GenerationSession, ImageSource, ThumbnailEngine,
};

#[derive(Debug, Parser)]
#[command(
    name = "thumbgen",
    version,
    about = "Video thumbnail candidates from a prompt and an image"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate three thumbnail candidates.
    Generate(GenerateArgs),
    /// Manage the stored Gemini API key.
    Key(KeyArgs),
    /// List models usable for image analysis.
    Models,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "free")]
    mode: GenerationMode,
    #[arg(long)]
    image: Option<PathBuf>,
    /// Overrides the media type guessed from the image.
    #[arg(long)]
    media_type: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    /// Directory to save the candidate images into.
    #[arg(long)]
    download: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct KeyArgs {
    #[command(subcommand)]
    action: KeyAction,
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum KeyAction {
    Set { key: String },
    Clear,
    Show,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("thumbgen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Key(args) => run_key(args),
        Command::Models => {
            print!("{}", format_models());
            Ok(0)
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let store = credential_store(args.store.as_deref());
    let credential = resolve_credential(args.api_key.as_deref(), &store, first_non_empty_env);
    for warning in generate_warnings(args.mode, args.image.is_some(), credential.is_some()) {
        eprintln!("warning: {warning}");
    }

    let selection = ModelSelector::new(None)
        .select(args.model.as_deref(), "vision")
        .map_err(|err| anyhow!(err))?;
    if args.model.is_some() {
        if let Some(reason) = selection.fallback_reason.as_deref() {
            eprintln!("warning: {reason} Using {}.", selection.model.name);
        }
    }

    let config = EngineConfig::from_env().with_analysis_model(selection.model.name.clone());
    let mut engine = ThumbnailEngine::new(config)?;
    if let Some(path) = args.events.as_ref() {
        let session_id = format!("session-{}", unix_epoch_millis());
        engine = engine.with_events(EventWriter::new(path, session_id));
    }

    let mut request = GenerationRequest::new(args.prompt.clone(), args.mode)
        .with_credential(credential);
    if let Some(path) = args.image.as_ref() {
        let mut image = ImageSource::new(path);
        if let Some(media_type) = args.media_type.as_deref() {
            image = image.with_media_type(media_type);
        }
        request = request.with_image(image);
    }

    let session = GenerationSession::new();
    let variations = engine.generate_in_session(&session, &request)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&variations)?);
    } else {
        print!("{}", format_gallery(&variations));
    }

    if let Some(dir) = args.download.as_ref() {
        for path in download_gallery(&variations, dir)? {
            eprintln!("saved {}", path.display());
        }
    }
    Ok(0)
}

fn run_key(args: KeyArgs) -> Result<i32> {
    let store = credential_store(args.store.as_deref());
    match args.action {
        KeyAction::Set { key } => {
            let saved = store.save(&key)?;
            println!("Saved API key {saved} to {}", store.path().display());
        }
        KeyAction::Clear => {
            if store.clear()? {
                println!("Cleared API key from {}", store.path().display());
            } else {
                println!("No API key stored in {}", store.path().display());
            }
        }
        KeyAction::Show => match store.load() {
            Some(credential) => println!("{credential} ({})", store.path().display()),
            None => println!("not configured ({})", store.path().display()),
        },
    }
    Ok(0)
}

fn credential_store(path: Option<&Path>) -> CredentialStore {
    path.map(CredentialStore::new)
        .unwrap_or_else(CredentialStore::default_location)
}

/// Flag, then the stored key, then `GEMINI_API_KEY` / `GOOGLE_API_KEY`.
fn resolve_credential<F>(
    flag: Option<&str>,
    store: &CredentialStore,
    env_lookup: F,
) -> Option<ApiCredential>
where
    F: Fn(&[&str]) -> Option<String>,
{
    flag.and_then(ApiCredential::new)
        .or_else(|| store.load())
        .or_else(|| {
            env_lookup(&["GEMINI_API_KEY", "GOOGLE_API_KEY"]).and_then(ApiCredential::new)
        })
}

fn generate_warnings(mode: GenerationMode, has_image: bool, has_credential: bool) -> Vec<String> {
    let mut warnings = Vec::new();
    if mode != GenerationMode::Pro {
        return warnings;
    }
    if !has_image {
        warnings.push(
            "Pro mode needs --image; generating free placeholders instead.".to_string(),
        );
    } else if !has_credential {
        warnings.push("Pro mode requires a Gemini API key (thumbgen key set <KEY>).".to_string());
    }
    warnings
}

fn format_gallery(variations: &[ThumbnailVariation]) -> String {
    let mut out = String::new();
    for (idx, variation) in variations.iter().enumerate() {
        out.push_str(&format!(
            "[{}] {} {}\n",
            idx + 1,
            variation.mode.badge(),
            variation.id
        ));
        match variation.image_url() {
            Some(url) => out.push_str(&format!("    url: {url}\n")),
            None => out.push_str("    url: (prompt only, no image available)\n"),
        }
        out.push_str(&format!("    prompt: \"{}\"\n", variation.prompt_used));
    }
    out
}

fn format_models() -> String {
    let selector = ModelSelector::new(None);
    let mut out = String::new();
    for model in selector.registry.by_capability("vision") {
        let marker = if model.name == DEFAULT_ANALYSIS_MODEL {
            "*"
        } else {
            " "
        };
        out.push_str(&format!("{marker} {} ({})\n", model.name, model.provider));
    }
    out
}

fn download_target(dir: &Path, variation: &ThumbnailVariation) -> PathBuf {
    dir.join(variation.download_file_name())
}

fn download_gallery(variations: &[ThumbnailVariation], dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("failed creating {}", dir.display()))?;
    let http = HttpClient::new();
    let mut saved = Vec::new();
    for variation in variations {
        let Some(url) = variation.image_url() else {
            continue;
        };
        let response = http
            .get(url)
            .send()
            .with_context(|| format!("download failed ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("download failed ({url}): HTTP {}", status.as_u16()));
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("download body read failed ({url})"))?;
        let path = download_target(dir, variation);
        fs::write(&path, &bytes)
            .with_context(|| format!("failed writing {}", path.display()))?;
        saved.push(path);
    }
    Ok(saved)
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn unix_epoch_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
