//! Bounded retries for meter and gateway requests
//!
//! Every network call a device makes goes through [`RetryPolicy::execute`].
//! Transport failures and the configured HTTP status codes are retried with
//! exponential backoff; anything else is returned immediately.

use crate::config::ControlConfig;
use crate::error::{Result, ZeroFeedError};
use crate::logging::StructuredLogger;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 tries once
    pub max_retries: u32,
    /// Seconds; retry `n` waits `factor * 2^(n-1)`, the first one is immediate
    pub backoff_factor: f64,
    /// HTTP statuses worth another attempt
    pub status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_control(&ControlConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_control(control: &ControlConfig) -> Self {
        Self {
            max_retries: control.max_retries,
            backoff_factor: control.retry_backoff_factor,
            status_codes: control.retry_status_codes.clone(),
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_factor: 0.0,
            status_codes: Vec::new(),
        }
    }

    /// Delay before retry number `retry`, counted from 1
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(self.backoff_factor * 2f64.powi(exponent))
            .unwrap_or(Duration::ZERO)
    }

    /// HTTP errors are retried only for listed statuses, everything else
    /// when it is transient.
    pub fn should_retry(&self, err: &ZeroFeedError) -> bool {
        match err.status_code() {
            Some(status) => self.status_codes.contains(&status),
            None => err.is_transient(),
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent. The last error is returned.
    pub async fn execute<F, Fut, T>(
        &self,
        logger: &StructuredLogger,
        what: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if retries >= self.max_retries || !self.should_retry(&e) {
                        return Err(e);
                    }
                    retries += 1;
                    logger.warn(&format!(
                        "{} failed, retry {}/{}: {}",
                        what, retries, self.max_retries, e
                    ));
                    let delay = self.backoff(retries);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::get_logger;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_factor: 0.1,
            status_codes: vec![500, 502, 503, 504],
        }
    }

    #[test]
    fn backoff_doubles_after_an_immediate_first_retry() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::ZERO);
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn classification_follows_status_list() {
        let p = policy();
        assert!(p.should_retry(&ZeroFeedError::http_status(503, "busy")));
        assert!(!p.should_retry(&ZeroFeedError::http_status(401, "denied")));
        assert!(p.should_retry(&ZeroFeedError::network("reset")));
        assert!(!p.should_retry(&ZeroFeedError::command("rejected")));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let started = tokio::time::Instant::now();

        let result = policy()
            .execute(&get_logger("test"), "read", move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ZeroFeedError::http_status(502, "bad gateway"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_last_error() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: Result<()> = policy()
            .execute(&get_logger("test"), "read", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ZeroFeedError::timeout("no answer"))
            })
            .await;

        assert!(matches!(result, Err(ZeroFeedError::Timeout { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: Result<()> = policy()
            .execute(&get_logger("test"), "command", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ZeroFeedError::http_status(404, "not found"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let once = RetryPolicy::none();
        let result: Result<()> = once
            .execute(&get_logger("test"), "read", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ZeroFeedError::network("down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
