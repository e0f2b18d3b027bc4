//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Every section is `#[serde(default)]`, so a settings file only needs the
//! keys it wants to change.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::AppPaths;

/// Environment variable consulted when `synthesis.api_key` is empty.
pub const SPEECH_API_KEY_ENV: &str = "NARRATOR_SPEECH_API_KEY";
/// Environment variable consulted when `description.api_key` is empty.
pub const VISION_API_KEY_ENV: &str = "NARRATOR_VISION_API_KEY";

// ---------------------------------------------------------------------------
// SynthesisEngine
// ---------------------------------------------------------------------------

/// Which speech backend family to build.
///
/// | Variant | Primary                  | Safe fallback                 |
/// |---------|--------------------------|-------------------------------|
/// | Tone    | local tone generator     | local tone generator          |
/// | Api     | speech API at `base_url` | speech API at `fallback_url`  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisEngine {
    /// Deterministic sine-tone WAV output; no network.
    Tone,
    /// OpenAI-compatible `/v1/audio/speech` endpoint.
    Api,
}

impl Default for SynthesisEngine {
    fn default() -> Self {
        Self::Tone
    }
}

impl SynthesisEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tone => "tone",
            Self::Api => "api",
        }
    }
}

// ---------------------------------------------------------------------------
// SynthesisConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub engine: SynthesisEngine,
    /// Base URL of the primary speech server.
    pub base_url: String,
    /// Base URL of the CPU / safe-mode server.  Empty disables the fallback.
    pub fallback_url: String,
    /// Bearer token; falls back to `NARRATOR_SPEECH_API_KEY` when empty.
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// Playback speed multiplier (1.0 = normal).
    pub speed: f32,
    /// Audio container requested from the server (`wav`, `mp3`, ...).
    pub response_format: String,
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base of the exponential backoff, in milliseconds.
    pub retry_base_ms: u64,
    /// Hardware faults tolerated before leaving the primary backend.
    pub failure_threshold: u32,
    /// Pause after releasing backend resources, before each attempt.
    pub cleanup_pause_ms: u64,
    /// Run chunks on a worker pool when the backend allows it.
    pub parallel: bool,
    pub max_workers: usize,
    /// Delay between items when running sequentially.
    pub rate_limit_delay_ms: u64,
    /// Upper bound on characters per synthesis request.
    pub max_chunk_chars: usize,
    /// Case-insensitive substrings that mark an error as a hardware fault.
    pub hardware_fault_signatures: Vec<String>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            engine: SynthesisEngine::default(),
            base_url: "http://127.0.0.1:8880".to_string(),
            fallback_url: String::new(),
            api_key: String::new(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            response_format: "wav".to_string(),
            timeout_secs: 120,
            max_retries: 3,
            retry_base_ms: 1_000,
            failure_threshold: 2,
            cleanup_pause_ms: 100,
            parallel: true,
            max_workers: 2,
            rate_limit_delay_ms: 500,
            max_chunk_chars: 2_500,
            hardware_fault_signatures: default_fault_signatures(),
        }
    }
}

fn default_fault_signatures() -> Vec<String> {
    [
        "metal",
        "mps",
        "cuda",
        "out of memory",
        "device lost",
        "command buffer",
        "gpu",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl SynthesisConfig {
    /// The configured key, or the environment variable when the key is empty.
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_key(&self.api_key, SPEECH_API_KEY_ENV)
    }
}

// ---------------------------------------------------------------------------
// DescriptionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptionConfig {
    pub enabled: bool,
    /// Base URL of an OpenAI-compatible vision server (LM Studio by default).
    pub base_url: String,
    /// Bearer token; falls back to `NARRATOR_VISION_API_KEY` when empty.
    pub api_key: String,
    pub model: String,
    /// Maximum characters kept from a caption.
    pub max_description_length: usize,
    /// Captions below this confidence are not integrated into the text.
    pub min_confidence: f32,
    pub max_workers: usize,
    pub timeout_secs: u64,
    /// Retries after the first attempt for rate limits, timeouts and 5xx.
    pub max_retries: u32,
    /// Base of the exponential backoff, in milliseconds.
    pub retry_base_ms: u64,
    /// Reuse descriptions from earlier runs.
    pub cache_enabled: bool,
    /// Cached descriptions older than this are pruned when the cache opens.
    pub cache_max_age_days: u64,
}

impl Default for DescriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:1234".to_string(),
            api_key: String::new(),
            model: "gemma-3n-e4b".to_string(),
            max_description_length: 100,
            min_confidence: 0.5,
            max_workers: 2,
            timeout_secs: 60,
            max_retries: 3,
            retry_base_ms: 1_000,
            cache_enabled: true,
            cache_max_age_days: 30,
        }
    }
}

impl DescriptionConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_key(&self.api_key, VISION_API_KEY_ENV)
    }
}

fn resolve_key(configured: &str, env_var: &str) -> Option<String> {
    if !configured.is_empty() {
        return Some(configured.to_string());
    }
    std::env::var(env_var).ok().filter(|k| !k.is_empty())
}

// ---------------------------------------------------------------------------
// OutputConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Concatenate per-chunk audio into one audiobook file.
    pub merge_audio: bool,
    /// Write the integrated book text.
    pub write_text: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            merge_audio: true,
            write_text: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Recent events kept per pipeline.
    pub recent_events: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            recent_events: 10,
            shutdown_timeout_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Top-level configuration.
///
/// # Persistence
///
/// ```rust,no_run
/// use narrator::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub synthesis: SynthesisConfig,
    pub description: DescriptionConfig,
    pub output: OutputConfig,
    pub progress: ProgressConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.synthesis;
        if !(s.speed > 0.0 && s.speed.is_finite()) {
            bail!("synthesis.speed must be positive, got {}", s.speed);
        }
        if s.failure_threshold == 0 {
            bail!("synthesis.failure_threshold must be at least 1");
        }
        if s.max_chunk_chars < 100 {
            bail!(
                "synthesis.max_chunk_chars must be at least 100, got {}",
                s.max_chunk_chars
            );
        }
        if s.engine == SynthesisEngine::Api && s.base_url.trim().is_empty() {
            bail!("synthesis.base_url is required for the api engine");
        }
        let d = &self.description;
        if !(0.0..=1.0).contains(&d.min_confidence) {
            bail!(
                "description.min_confidence must be within 0..=1, got {}",
                d.min_confidence
            );
        }
        if d.max_description_length == 0 {
            bail!("description.max_description_length must be positive");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let mut original = AppConfig::default();
        original.synthesis.engine = SynthesisEngine::Api;
        original.synthesis.fallback_url = "http://127.0.0.1:8881".into();
        original.description.min_confidence = 0.7;
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.synthesis.engine, SynthesisEngine::Api);
        assert_eq!(loaded.synthesis.fallback_url, "http://127.0.0.1:8881");
        assert_eq!(loaded.synthesis.max_retries, original.synthesis.max_retries);
        assert_eq!(
            loaded.synthesis.hardware_fault_signatures,
            original.synthesis.hardware_fault_signatures
        );
        assert_eq!(loaded.description.min_confidence, 0.7);
        assert_eq!(loaded.description.model, "gemma-3n-e4b");
        assert_eq!(loaded.output.merge_audio, original.output.merge_audio);
        assert_eq!(loaded.progress.recent_events, 10);
        assert_eq!(loaded.description.cache_max_age_days, 30);
    }

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config.synthesis.engine, SynthesisEngine::Tone);
        assert_eq!(config.synthesis.failure_threshold, 2);
        assert_eq!(config.description.base_url, "http://127.0.0.1:1234");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[synthesis]\nvoice = \"nova\"\nmax_workers = 4\n").unwrap();

        let config = AppConfig::load_from(&path).expect("load");
        assert_eq!(config.synthesis.voice, "nova");
        assert_eq!(config.synthesis.max_workers, 4);
        assert_eq!(config.synthesis.max_chunk_chars, 2_500);
        assert!(config.description.enabled);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[description]\nmin_confidence = 1.5\n").unwrap();
        assert!(AppConfig::load_from(&path).is_err());

        let mut config = AppConfig::default();
        config.synthesis.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.synthesis.speed = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn configured_api_key_wins_over_environment() {
        let mut cfg = SynthesisConfig::default();
        cfg.api_key = "from-file".into();
        assert_eq!(cfg.resolved_api_key().as_deref(), Some("from-file"));
    }

    #[test]
    fn default_signatures_cover_common_gpu_faults() {
        let sigs = SynthesisConfig::default().hardware_fault_signatures;
        for expected in ["metal", "cuda", "out of memory"] {
            assert!(sigs.iter().any(|s| s == expected), "missing {expected}");
        }
    }
}
