//! Settings Persistence
//!
//! Persists default and last-used transcription settings with atomic
//! file writes (temp file + rename) and tolerant deserialization:
//! corrupted or old files fall back to defaults instead of failing.
//!
//! Storage location: `{data_dir}/scribeflow/settings.json`

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::EngineResult;

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

// =============================================================================
// Transcription Settings
// =============================================================================

/// Job settings sent with start/restart actions.
///
/// The engine treats these as payload; interpretation happens backend-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeSettings {
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,
    /// BCP-47 language tag; `None` means auto-detect
    #[serde(default)]
    pub language: Option<String>,
    /// Whether to run speaker diarization
    #[serde(default)]
    pub diarization: bool,
}

fn default_model() -> String {
    "base".to_string()
}

impl Default for TranscribeSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            language: None,
            diarization: false,
        }
    }
}

impl TranscribeSettings {
    /// Corrects bad values instead of failing, so old or hand-edited
    /// files don't brick the client.
    pub fn normalize(&mut self) {
        if self.model.trim().is_empty() {
            self.model = default_model();
        }
        if let Some(language) = &self.language {
            if language.trim().is_empty() {
                self.language = None;
            }
        }
    }
}

// =============================================================================
// Stored Settings
// =============================================================================

/// On-disk settings document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,
    /// Settings applied to new jobs when the user picks nothing
    #[serde(default)]
    pub defaults: TranscribeSettings,
    /// Settings from the most recent user-started job
    #[serde(default)]
    pub last_used: Option<TranscribeSettings>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            defaults: TranscribeSettings::default(),
            last_used: None,
        }
    }
}

impl StoredSettings {
    fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;
        self.defaults.normalize();
        if let Some(last_used) = &mut self.last_used {
            last_used.normalize();
        }
    }
}

// =============================================================================
// Settings Store
// =============================================================================

/// Loads and saves the settings document
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Creates a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a store at the platform data directory.
    pub fn at_default_location() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("scribeflow").join(SETTINGS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads settings, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn load(&self) -> StoredSettings {
        let mut settings = match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<StoredSettings>(&contents) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(
                        "Failed to parse settings at {}: {}, using defaults",
                        self.path.display(),
                        e
                    );
                    StoredSettings::default()
                }
            },
            Err(_) => StoredSettings::default(),
        };
        settings.normalize();
        settings
    }

    /// Saves settings atomically (temp file + rename).
    pub fn save(&self, settings: &StoredSettings) -> EngineResult<()> {
        let mut settings = settings.clone();
        settings.normalize();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&settings)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Records the settings of the most recent user-started job.
    pub fn record_last_used(&self, used: &TranscribeSettings) -> EngineResult<()> {
        let mut settings = self.load();
        settings.last_used = Some(used.clone());
        self.save(&settings)
    }

    /// Settings to pre-fill for the next job: last used, else defaults.
    pub fn effective(&self) -> TranscribeSettings {
        let settings = self.load();
        settings.last_used.unwrap_or(settings.defaults)
    }
}
