//! Retry wrapper for any [`ImageDescriber`].
//!
//! Rate limits, server errors, timeouts and dropped connections are retried
//! with exponential backoff.  Everything else (missing files, rejected keys,
//! unparseable answers) is returned on the first attempt.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DescriptionConfig;

use super::{DescribeError, ImageDescriber, ImageDescription};

pub struct RetryingDescriber {
    inner: Arc<dyn ImageDescriber>,
    /// Retries after the first attempt.
    max_retries: u32,
    /// Backoff before retry `n` is `base_delay * 2^n`.
    base_delay: Duration,
}

impl RetryingDescriber {
    pub fn new(inner: Arc<dyn ImageDescriber>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(inner: Arc<dyn ImageDescriber>, config: &DescriptionConfig) -> Self {
        Self::new(
            inner,
            config.max_retries,
            Duration::from_millis(config.retry_base_ms),
        )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

impl ImageDescriber for RetryingDescriber {
    fn describe(&self, path: &Path, context: &str) -> Result<ImageDescription, DescribeError> {
        let mut attempt = 0;
        loop {
            match self.inner.describe(path, context) {
                Ok(description) => return Ok(description),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    log::debug!(
                        "describe: {} failed ({e}); retry {}/{} in {delay:?}",
                        path.display(),
                        attempt + 1,
                        self.max_retries
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        log::warn!(
                            "describe: {} still failing after {} retries: {e}",
                            path.display(),
                            self.max_retries
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}
