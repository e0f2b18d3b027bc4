//! Degrading backend: keeps synthesis usable while the accelerated engine
//! keeps failing.
//!
//! # State machine
//!
//! ```text
//!            threshold hardware faults            any hardware fault
//!  Primary ─────────────────────────────▶ SafeFallback ───────────────▶ Unavailable
//!     │                                                                     ▲
//!     └──── threshold reached, no fallback configured ──────────────────────┘
//! ```
//!
//! Levels never go back down for the lifetime of one [`DegradingBackend`].
//! The state lives behind a mutex so one instance can be shared by every
//! worker of a batch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::SynthesisConfig;

use super::backend::{
    BackendFactory, BackendVariant, FaultSignatures, SynthesisBackend, SynthesisError,
};

// ---------------------------------------------------------------------------
// DegradationLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Primary,
    SafeFallback,
    Unavailable,
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DegradationLevel::Primary => "primary",
            DegradationLevel::SafeFallback => "safe-fallback",
            DegradationLevel::Unavailable => "unavailable",
        })
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `n` is `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Pause after `release_resources`, before each attempt.
    pub cleanup_pause: Duration,
    /// Hardware faults tolerated at `Primary`.
    pub failure_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            cleanup_pause: Duration::from_millis(100),
            failure_threshold: 2,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_ms),
            cleanup_pause: Duration::from_millis(config.cleanup_pause_ms),
            failure_threshold: config.failure_threshold.max(1),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

// ---------------------------------------------------------------------------
// DegradingBackend
// ---------------------------------------------------------------------------

struct State {
    level: DegradationLevel,
    failures: u32,
    backend: Option<Arc<dyn SynthesisBackend>>,
}

pub struct DegradingBackend {
    state: Mutex<State>,
    factory: BackendFactory,
    policy: RetryPolicy,
    signatures: FaultSignatures,
    extension: String,
}

impl std::fmt::Debug for DegradingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DegradingBackend")
            .field("level", &state.level)
            .field("failures", &state.failures)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DegradingBackend {
    /// Start at `Primary`.  Returns `None` when the factory has no primary
    /// backend.
    pub fn new(
        factory: BackendFactory,
        policy: RetryPolicy,
        signatures: FaultSignatures,
    ) -> Option<Self> {
        let primary = factory(BackendVariant::Primary)?;
        let extension = primary.file_extension().to_string();
        Some(Self {
            state: Mutex::new(State {
                level: DegradationLevel::Primary,
                failures: 0,
                backend: Some(primary),
            }),
            factory,
            policy,
            signatures,
            extension,
        })
    }

    pub fn level(&self) -> DegradationLevel {
        self.lock().level
    }

    /// Hardware faults counted at the current level.
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> (DegradationLevel, Option<Arc<dyn SynthesisBackend>>) {
        let state = self.lock();
        (state.level, state.backend.clone())
    }

    /// Count a hardware fault observed at `observed` and transition if the
    /// threshold is reached.  Returns the level after the update.
    fn record_hardware_fault(&self, observed: DegradationLevel, message: &str) -> DegradationLevel {
        let mut state = self.lock();
        if state.level != observed {
            // Another worker already moved the level on.
            return state.level;
        }
        state.failures += 1;

        match state.level {
            DegradationLevel::Primary if state.failures >= self.policy.failure_threshold => {
                match (self.factory)(BackendVariant::SafeFallback) {
                    Some(fallback) => {
                        log::warn!(
                            "synthesis: {} hardware faults on primary ({message}); switching to {}",
                            state.failures,
                            fallback.name()
                        );
                        state.level = DegradationLevel::SafeFallback;
                        state.backend = Some(fallback);
                    }
                    None => {
                        log::error!(
                            "synthesis: {} hardware faults on primary and no fallback configured",
                            state.failures
                        );
                        state.level = DegradationLevel::Unavailable;
                        state.backend = None;
                    }
                }
                state.failures = 0;
            }
            DegradationLevel::SafeFallback => {
                log::error!("synthesis: hardware fault on safe fallback ({message}); giving up");
                state.level = DegradationLevel::Unavailable;
                state.backend = None;
                state.failures = 0;
            }
            _ => {}
        }
        state.level
    }

    /// Every call into a backend counts against `max_retries + 1`, the
    /// re-issue after a transition included.  That re-issue skips the
    /// backoff and keeps the backoff exponent where it was.
    fn run(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>, SynthesisError> {
        let budget = self.policy.max_retries.saturating_add(1);
        let mut calls: u32 = 0;
        let mut attempt: u32 = 0;
        let mut last_error = None;

        while calls < budget {
            let (level, backend) = self.active();
            let Some(backend) = backend else {
                return Err(SynthesisError::Unavailable(format!(
                    "backend degraded to {level}"
                )));
            };

            backend.release_resources();
            if !self.policy.cleanup_pause.is_zero() {
                std::thread::sleep(self.policy.cleanup_pause);
            }

            calls += 1;
            let error = match backend.synthesize(text, voice, speed) {
                Ok(audio) => return Ok(audio),
                Err(e) => self.signatures.classify(e),
            };

            match &error {
                SynthesisError::FatalConfig(_) | SynthesisError::Unavailable(_) => {
                    return Err(error)
                }
                SynthesisError::HardwareFault(msg) => {
                    let now = self.record_hardware_fault(level, msg);
                    if now == DegradationLevel::Unavailable {
                        return Err(SynthesisError::Unavailable(msg.clone()));
                    }
                    if now > level {
                        // Re-issue the same attempt at the new level.
                        last_error = Some(error);
                        continue;
                    }
                }
                SynthesisError::Transient(msg) => {
                    log::debug!(
                        "synthesis: transient failure on {} (attempt {}): {msg}",
                        backend.name(),
                        attempt + 1
                    );
                }
            }

            last_error = Some(error);
            if calls < budget {
                std::thread::sleep(self.policy.backoff(attempt));
            }
            attempt += 1;
        }

        Err(last_error.unwrap_or_else(|| SynthesisError::Unavailable("no attempts made".into())))
    }
}

impl SynthesisBackend for DegradingBackend {
    fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>, SynthesisError> {
        self.run(text, voice, speed)
    }

    fn release_resources(&self) {
        if let (_, Some(backend)) = self.active() {
            backend.release_resources();
        }
    }

    fn name(&self) -> &str {
        "degrading"
    }

    fn parallel_safe(&self) -> bool {
        matches!(self.active(), (_, Some(b)) if b.parallel_safe())
    }

    fn inter_item_delay(&self) -> Duration {
        match self.active() {
            (_, Some(b)) => b.inter_item_delay(),
            _ => Duration::ZERO,
        }
    }

    /// Primary and fallback are built from one config and share a format.
    fn file_extension(&self) -> &str {
        &self.extension
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
