//! `SpeechApiBackend`: client for an OpenAI-compatible `/v1/audio/speech`
//! endpoint (Kokoro-FastAPI, OpenAI, LocalAI, ...).
//!
//! Calls are blocking; the batch runner already runs every item on tokio's
//! blocking pool.  The HTTP client is created on first use because
//! `reqwest::blocking` must not be constructed inside an async context.

use std::sync::OnceLock;
use std::time::Duration;

use crate::config::SynthesisConfig;

use super::backend::{FaultSignatures, SynthesisBackend, SynthesisError};

/// Error-body fragments that mean retrying is pointless.
const FATAL_MARKERS: [&str; 5] = [
    "quota",
    "unauthorized",
    "invalid api key",
    "voice not found",
    "insufficient",
];

pub struct SpeechApiBackend {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    response_format: String,
    timeout: Duration,
    rate_limit_delay: Duration,
    signatures: FaultSignatures,
    client: OnceLock<reqwest::blocking::Client>,
}

impl std::fmt::Debug for SpeechApiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechApiBackend")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl SpeechApiBackend {
    /// Build a client for the server at `base_url`, taking everything else
    /// from `config`.
    pub fn from_config(config: &SynthesisConfig, base_url: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: format!("{}/v1/audio/speech", base_url.trim_end_matches('/')),
            api_key: config.resolved_api_key(),
            model: config.model.clone(),
            response_format: config.response_format.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            rate_limit_delay: Duration::from_millis(config.rate_limit_delay_ms),
            signatures: FaultSignatures::from_config(config),
            client: OnceLock::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, SynthesisError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SynthesisError::FatalConfig(format!("HTTP client: {e}")))?;
        // A racing thread may have won; either client is fine.
        let _ = self.client.set(client);
        self.client
            .get()
            .ok_or_else(|| SynthesisError::Unavailable("HTTP client not initialised".into()))
    }
}

impl SynthesisBackend for SpeechApiBackend {
    fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>, SynthesisError> {
        let body = serde_json::json!({
            "model":           self.model,
            "input":           text,
            "voice":           voice,
            "speed":           speed,
            "response_format": self.response_format,
        });

        let mut req = self.client()?.post(&self.endpoint).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .map_err(|e| classify_failure(None, &e.to_string(), &self.signatures))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(classify_failure(Some(status.as_u16()), &text, &self.signatures));
        }

        let audio = response
            .bytes()
            .map_err(|e| classify_failure(None, &e.to_string(), &self.signatures))?;
        if audio.is_empty() {
            return Err(SynthesisError::Transient("server returned no audio".into()));
        }
        Ok(audio.to_vec())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parallel_safe(&self) -> bool {
        false
    }

    fn inter_item_delay(&self) -> Duration {
        self.rate_limit_delay
    }

    fn file_extension(&self) -> &str {
        &self.response_format
    }
}

/// Map an HTTP failure to a [`SynthesisError`] kind.
///
/// `status` is `None` for transport errors (connect, timeout, body read).
pub(crate) fn classify_failure(
    status: Option<u16>,
    message: &str,
    signatures: &FaultSignatures,
) -> SynthesisError {
    let detail = match status {
        Some(code) => format!("HTTP {code}: {}", message.trim()),
        None => message.trim().to_string(),
    };

    if signatures.matches(message) {
        return SynthesisError::HardwareFault(detail);
    }
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return SynthesisError::FatalConfig(detail);
    }
    match status {
        None | Some(408) | Some(429) => SynthesisError::Transient(detail),
        Some(code) if code >= 500 => SynthesisError::Transient(detail),
        Some(_) => SynthesisError::FatalConfig(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigs() -> FaultSignatures {
        FaultSignatures::from_config(&SynthesisConfig::default())
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let cfg = SynthesisConfig::default();
        let b = SpeechApiBackend::from_config(&cfg, "http://localhost:8880/", "x");
        assert_eq!(b.endpoint(), "http://localhost:8880/v1/audio/speech");
    }

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        assert!(matches!(
            classify_failure(Some(429), "slow down", &sigs()),
            SynthesisError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(Some(503), "overloaded", &sigs()),
            SynthesisError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(None, "connection refused", &sigs()),
            SynthesisError::Transient(_)
        ));
    }

    #[test]
    fn auth_and_quota_are_fatal() {
        assert!(matches!(
            classify_failure(Some(401), "bad token", &sigs()),
            SynthesisError::FatalConfig(_)
        ));
        assert!(matches!(
            classify_failure(Some(500), "monthly quota exceeded", &sigs()),
            SynthesisError::FatalConfig(_)
        ));
    }

    #[test]
    fn hardware_text_wins_over_status() {
        let err = classify_failure(Some(500), "MPS backend out of memory", &sigs());
        assert!(matches!(err, SynthesisError::HardwareFault(_)));
        assert!(err.message().contains("HTTP 500"));
    }

    #[test]
    fn not_parallel_safe_and_rate_limited() {
        let cfg = SynthesisConfig {
            rate_limit_delay_ms: 750,
            ..SynthesisConfig::default()
        };
        let b = SpeechApiBackend::from_config(&cfg, "http://x", "x");
        assert!(!b.parallel_safe());
        assert_eq!(b.inter_item_delay(), Duration::from_millis(750));
        assert_eq!(b.file_extension(), "wav");
    }

    #[test]
    fn unreachable_server_is_transient() {
        let cfg = SynthesisConfig {
            timeout_secs: 2,
            ..SynthesisConfig::default()
        };
        // Port 9 (discard) on localhost is essentially never listening.
        let b = SpeechApiBackend::from_config(&cfg, "http://127.0.0.1:9", "x");
        let err = b.synthesize("hello", "alloy", 1.0).unwrap_err();
        assert!(matches!(err, SynthesisError::Transient(_)), "{err:?}");
    }
}
