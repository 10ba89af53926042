use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde_json::{Map, Value};

/// Key under which the Gemini credential is stored.
pub const CREDENTIAL_KEY: &str = "google_gemini_api_key";

const MASK: &str = "••••••••••••••••";

/// An API key. Formatting never reveals the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential(String);

impl ApiCredential {
    /// Returns `None` for blank input.
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiCredential").field(&MASK).finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

/// File-backed store holding a single named credential.
///
/// Other keys already present in the file are preserved on save and clear.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$THUMBGEN_CREDENTIALS`, then `$HOME/.thumbgen/credentials.json`,
    /// then `./.thumbgen/credentials.json`.
    pub fn default_location() -> Self {
        if let Some(path) = non_empty_env("THUMBGEN_CREDENTIALS") {
            return Self::new(path);
        }
        let root = non_empty_env("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(root.join(".thumbgen").join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absence, an unreadable file, or a blank entry all mean "not configured".
    pub fn load(&self) -> Option<ApiCredential> {
        read_json_object(&self.path)?
            .get(CREDENTIAL_KEY)
            .and_then(Value::as_str)
            .and_then(ApiCredential::new)
    }

    pub fn is_configured(&self) -> bool {
        self.load().is_some()
    }

    pub fn save(&self, raw: &str) -> anyhow::Result<ApiCredential> {
        let Some(credential) = ApiCredential::new(raw) else {
            bail!("API key is empty");
        };
        let mut payload = read_json_object(&self.path).unwrap_or_default();
        payload.insert(
            CREDENTIAL_KEY.to_string(),
            Value::String(credential.expose().to_string()),
        );
        write_json_object(&self.path, &payload)?;
        Ok(credential)
    }

    /// Returns whether a credential was removed.
    pub fn clear(&self) -> anyhow::Result<bool> {
        let Some(mut payload) = read_json_object(&self.path) else {
            return Ok(false);
        };
        if payload.remove(CREDENTIAL_KEY).is_none() {
            return Ok(false);
        }
        write_json_object(&self.path, &payload)?;
        Ok(true)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )
    .with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}
