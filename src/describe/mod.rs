//! Image description (captioning) for images found in the document.
//!
//! [`ImageDescriber`] is object-safe and `Send + Sync`; the orchestrator holds
//! it as `Arc<dyn ImageDescriber>` and calls it from blocking-pool workers.
//! [`ApiDescriber`] talks to an OpenAI-compatible vision endpoint.
//! Raw captions are cleaned up for narration by [`postprocess_description`].
//!
//! ```text
//! CachedDescriber ─miss─▶ RetryingDescriber ─▶ ApiDescriber
//!      │                    (429, 5xx, timeouts)
//!      └─hit─▶ descriptions.json
//! ```

pub mod api;
pub mod cache;
pub mod postprocess;
pub mod retry;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use api::ApiDescriber;
pub use cache::{CacheError, CachedDescriber, DescriptionCache};
pub use postprocess::postprocess_description;
pub use retry::RetryingDescriber;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("image not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failure before any HTTP status was received.
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("vision API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Authentication, billing or quota problems.  Retrying cannot help.
    #[error("vision API rejected the request: {0}")]
    Rejected(String),

    #[error("vision request timed out")]
    Timeout,

    #[error("failed to parse vision response: {0}")]
    Parse(String),

    #[error("vision model returned an empty description")]
    EmptyResponse,
}

impl DescribeError {
    /// Rate limits, server errors, timeouts and dropped connections.
    pub fn is_retryable(&self) -> bool {
        match self {
            DescribeError::Timeout | DescribeError::Request(_) => true,
            DescribeError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DescribeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DescribeError::Timeout
        } else {
            DescribeError::Request(e.to_string())
        }
    }
}

/// A caption with the model's confidence in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub text: String,
    pub confidence: f32,
    pub model: String,
}

// ---------------------------------------------------------------------------
// ImageDescriber trait
// ---------------------------------------------------------------------------

pub trait ImageDescriber: Send + Sync {
    /// Describe the image at `path`; `context` is nearby document text.
    fn describe(&self, path: &Path, context: &str) -> Result<ImageDescription, DescribeError>;
}

// Compile-time assertion: Box<dyn ImageDescriber> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn ImageDescriber>) {}
};

// ---------------------------------------------------------------------------
// MockDescriber (test only)
// ---------------------------------------------------------------------------

/// Test double: describes every image as "A picture of <file name>." with a
/// fixed confidence, except names registered as failing, rate limited or
/// with their own confidence.
#[cfg(test)]
pub struct MockDescriber {
    confidence: f32,
    overrides: std::collections::HashMap<String, f32>,
    failing: std::collections::HashSet<String>,
    rejecting: std::collections::HashSet<String>,
    /// Name → number of leading calls answered with HTTP 429.
    flaky: std::collections::HashMap<String, usize>,
    seen: std::sync::Mutex<std::collections::HashMap<String, usize>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockDescriber {
    pub fn new(confidence: f32) -> Self {
        Self {
            confidence,
            overrides: Default::default(),
            failing: Default::default(),
            rejecting: Default::default(),
            flaky: Default::default(),
            seen: Default::default(),
            calls: Default::default(),
        }
    }

    pub fn with_confidence(mut self, name: &str, confidence: f32) -> Self {
        self.overrides.insert(name.to_string(), confidence);
        self
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Answer every call for `name` with an authentication error.
    pub fn rejecting(mut self, name: &str) -> Self {
        self.rejecting.insert(name.to_string());
        self
    }

    /// Answer the first `times` calls for `name` with a rate-limit error.
    pub fn rate_limited(mut self, name: &str, times: usize) -> Self {
        self.flaky.insert(name.to_string(), times);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ImageDescriber for MockDescriber {
    fn describe(&self, path: &Path, _context: &str) -> Result<ImageDescription, DescribeError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let seen = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if self.failing.contains(&name) {
            return Err(DescribeError::Parse(format!("cannot describe {name}")));
        }
        if self.rejecting.contains(&name) {
            return Err(DescribeError::Rejected("HTTP 401: invalid api key".into()));
        }
        if self.flaky.get(&name).is_some_and(|&times| seen <= times) {
            return Err(DescribeError::Http {
                status: 429,
                body: "rate limit exceeded".into(),
            });
        }
        Ok(ImageDescription {
            text: format!("A picture of {name}."),
            confidence: self.overrides.get(&name).copied().unwrap_or(self.confidence),
            model: "mock".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_the_transient_ones() {
        let http = |status| DescribeError::Http {
            status,
            body: String::new(),
        };
        assert!(http(429).is_retryable());
        assert!(http(503).is_retryable());
        assert!(DescribeError::Timeout.is_retryable());
        assert!(DescribeError::Request("connection reset".into()).is_retryable());

        assert!(!http(400).is_retryable());
        assert!(!DescribeError::Rejected("401".into()).is_retryable());
        assert!(!DescribeError::EmptyResponse.is_retryable());
        assert!(!DescribeError::UnsupportedFormat("svg".into()).is_retryable());
    }
}
