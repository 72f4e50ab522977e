//! Opt-in exponential backoff around a write.
//!
//! Retries only server errors, 429 and transport failures. Any other 4xx,
//! version conflicts included, is returned immediately.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::WriteResult;
use crate::error::SmartError;

pub const DEFAULT_WRITE_MAX_RETRIES: u32 = 3;
pub const DEFAULT_WRITE_INITIAL_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_WRITE_MAX_RETRIES,
            initial_delay: DEFAULT_WRITE_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), doubling each time
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429
}

fn is_retryable(result: &Result<WriteResult, SmartError>) -> bool {
    match result {
        Ok(r) if r.success => false,
        Ok(r) => r.status_code.map(is_retryable_status).unwrap_or(true),
        Err(SmartError::Network(e)) => {
            e.is_connect()
                || e.is_timeout()
                || e.is_request()
                || e.status().map(|s| is_retryable_status(s.as_u16())).unwrap_or(false)
        }
        Err(SmartError::VendorRateLimit { .. }) => true,
        Err(_) => false,
    }
}

/// Run `operation` up to `max_retries + 1` times, sleeping
/// `initial_delay * 2^n` between attempts. Returns the last result.
pub async fn retry_write_operation<F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<WriteResult, SmartError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<WriteResult, SmartError>>,
{
    let mut attempt = 0;
    loop {
        let result = operation().await;
        if !is_retryable(&result) || attempt >= policy.max_retries {
            return result;
        }

        let delay = policy.delay_for(attempt);
        warn!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "FHIR write failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
