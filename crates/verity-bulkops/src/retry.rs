//! Retry policy for transport calls.
//!
//! Retryable failures (see [`TransportError::is_retryable`]) are retried with
//! exponential backoff. A 401 triggers one re-authentication followed by one
//! replay, which does not count against the retry budget; a second 401 is
//! returned to the caller.

use crate::config::BulkConfig;
use crate::transport::{Transport, TransportError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff and timeout parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BulkConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.retry_backoff(),
            max_backoff: config.max_backoff(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Delay before retry number `attempt` (0-based): initial * 2^attempt,
    /// capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BulkConfig::default())
    }
}

/// Runs `call` under the policy.
///
/// `what` names the call in logs (e.g. "PUT badge").
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    transport: &dyn Transport,
    what: &str,
    mut call: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0u32;
    let mut reauthenticated = false;

    loop {
        let result = match tokio::time::timeout(policy.request_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::network(format!(
                "request timed out after {:?}",
                policy.request_timeout
            ))),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 0 || reauthenticated {
                    debug!(call = %what, attempt, "Transport call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if err.is_auth() {
            if reauthenticated {
                warn!(call = %what, "Still unauthorized after re-authentication");
                return Err(err);
            }
            reauthenticated = true;
            warn!(call = %what, "Token rejected, re-authenticating");
            transport.authenticate().await?;
            continue;
        }

        if err.is_retryable() && attempt < policy.max_retries {
            let delay = policy.backoff(attempt);
            attempt += 1;
            warn!(
                call = %what,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retryable transport failure"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return Err(err);
    }
}
