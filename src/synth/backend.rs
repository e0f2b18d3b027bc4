//! Speech synthesis backend trait, error kinds and backend selection.
//!
//! [`SynthesisBackend`] is object-safe and `Send + Sync` so a backend can sit
//! behind an `Arc<dyn SynthesisBackend>` and be called from blocking-pool
//! workers.  Backends are chosen by a closed [`BackendVariant`] through
//! [`create_backend`] (or any [`BackendFactory`] closure in tests).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{SynthesisConfig, SynthesisEngine};

use super::api::SpeechApiBackend;
use super::tone::ToneBackend;

// ---------------------------------------------------------------------------
// SynthesisError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    /// Accelerator-level failure (GPU/Metal/CUDA, device memory).  Counts
    /// towards degradation.
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    /// Worth retrying at the same level (rate limit, timeout, 5xx).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help (bad credentials, quota, unknown voice).
    #[error("configuration error: {0}")]
    FatalConfig(String),

    /// No backend left to try.
    #[error("synthesis unavailable: {0}")]
    Unavailable(String),
}

impl SynthesisError {
    pub fn message(&self) -> &str {
        match self {
            SynthesisError::HardwareFault(m)
            | SynthesisError::Transient(m)
            | SynthesisError::FatalConfig(m)
            | SynthesisError::Unavailable(m) => m,
        }
    }
}

// ---------------------------------------------------------------------------
// FaultSignatures
// ---------------------------------------------------------------------------

/// Case-insensitive substrings identifying hardware faults in error text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultSignatures {
    needles: Vec<String>,
}

impl FaultSignatures {
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let needles = signatures
            .into_iter()
            .map(|s| s.as_ref().trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { needles }
    }

    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(&config.hardware_fault_signatures)
    }

    pub fn matches(&self, message: &str) -> bool {
        let haystack = message.to_lowercase();
        self.needles.iter().any(|n| haystack.contains(n.as_str()))
    }

    /// Promote a transient error to a hardware fault when its text matches.
    pub fn classify(&self, error: SynthesisError) -> SynthesisError {
        match error {
            SynthesisError::Transient(msg) if self.matches(&msg) => {
                SynthesisError::HardwareFault(msg)
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// SynthesisBackend trait
// ---------------------------------------------------------------------------

/// One speech engine.  Implementations must be safe to call from any thread.
pub trait SynthesisBackend: Send + Sync {
    /// Render `text` as encoded audio bytes.
    fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>, SynthesisError>;

    /// Drop caches / free device memory before the next attempt.
    fn release_resources(&self) {}

    fn name(&self) -> &str;

    /// Whether concurrent calls are allowed.
    fn parallel_safe(&self) -> bool {
        true
    }

    /// Pause between consecutive items when running sequentially.
    fn inter_item_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// File extension of the produced audio.
    fn file_extension(&self) -> &str {
        "wav"
    }
}

// Compile-time assertion: Box<dyn SynthesisBackend> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn SynthesisBackend>) {}
};

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendVariant {
    /// Accelerated / preferred backend.
    Primary,
    /// CPU-equivalent backend used after repeated hardware faults.
    SafeFallback,
    /// Deterministic local backend with no external dependencies.
    Mock,
}

/// Produces a backend for a variant, or `None` when that variant is not
/// configured.
pub type BackendFactory =
    Arc<dyn Fn(BackendVariant) -> Option<Arc<dyn SynthesisBackend>> + Send + Sync>;

/// Build the backend `variant` describes under `config`.
pub fn create_backend(
    variant: BackendVariant,
    config: &SynthesisConfig,
) -> Option<Arc<dyn SynthesisBackend>> {
    match (variant, config.engine) {
        (BackendVariant::Mock, _) | (_, SynthesisEngine::Tone) => {
            Some(Arc::new(ToneBackend::new()))
        }
        (BackendVariant::Primary, SynthesisEngine::Api) => Some(Arc::new(
            SpeechApiBackend::from_config(config, &config.base_url, "speech-api"),
        )),
        (BackendVariant::SafeFallback, SynthesisEngine::Api) => {
            if config.fallback_url.trim().is_empty() {
                None
            } else {
                Some(Arc::new(SpeechApiBackend::from_config(
                    config,
                    &config.fallback_url,
                    "speech-api-fallback",
                )))
            }
        }
    }
}

/// A [`BackendFactory`] over [`create_backend`] with a captured config.
pub fn config_factory(config: SynthesisConfig) -> BackendFactory {
    Arc::new(move |variant| create_backend(variant, &config))
}

// ---------------------------------------------------------------------------
// ScriptedBackend (test only)
// ---------------------------------------------------------------------------

/// Test double that replays scripted outcomes, then succeeds.
///
/// Successful calls return the input text as bytes.
#[cfg(test)]
pub struct ScriptedBackend {
    name: String,
    script: std::sync::Mutex<std::collections::VecDeque<Result<Vec<u8>, SynthesisError>>>,
    /// Texts containing this marker always fail with `FatalConfig`.
    poison: Option<String>,
    parallel: bool,
    pub calls: std::sync::atomic::AtomicUsize,
    pub releases: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedBackend {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            poison: None,
            parallel: true,
            calls: std::sync::atomic::AtomicUsize::new(0),
            releases: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_script(name: &str, script: Vec<Result<Vec<u8>, SynthesisError>>) -> Self {
        let backend = Self::ok(name);
        *backend.script.lock().unwrap() = script.into();
        backend
    }

    pub fn failing_on(name: &str, marker: &str) -> Self {
        Self {
            poison: Some(marker.to_string()),
            ..Self::ok(name)
        }
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl SynthesisBackend for ScriptedBackend {
    fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<Vec<u8>, SynthesisError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(marker) = &self.poison {
            if text.contains(marker.as_str()) {
                return Err(SynthesisError::FatalConfig(format!("voice rejected: {text}")));
            }
        }
        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(text.as_bytes().to_vec()),
        }
    }

    fn release_resources(&self) {
        self.releases.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parallel_safe(&self) -> bool {
        self.parallel
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
