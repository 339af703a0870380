use std::future::Future;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use serde::Deserialize;
use tracing::warn;

use crate::{Error, Result};

/// Retry policy applied by the batcher to every search page and document read.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub max_retries: u16,
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub factor: f64,
    /// Fraction in `[0, 1]` by which every delay is randomly stretched or shrunk.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_interval_ms: 100,
            max_interval_ms: 5_000,
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.factor < 1.0 {
            return Err(Error::InvalidConfig(
                "retry factor must be at least 1.0".to_string(),
            ));
        }
        if self.base_interval_ms > self.max_interval_ms {
            return Err(Error::InvalidConfig(
                "retry baseIntervalMs can not exceed maxIntervalMs".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidConfig(
                "retry jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Exponential {
        Exponential::from_millis(
            self.base_interval_ms,
            self.max_interval_ms,
            self.factor,
            self.jitter,
            Some(self.max_retries),
        )
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or the backoff is
/// exhausted. The last error is returned in the latter two cases.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Retry::new(config.backoff(), operation, |e: &Error| {
        let transient = e.is_transient();
        if transient {
            warn!(error = %e, what, "Transient failure");
        }
        transient
    })
    .await
}
