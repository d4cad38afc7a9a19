//! Bounded retry with exponential backoff for exchange calls.
//!
//! Every exchange call made by the lifecycle components goes through
//! [`with_timeout`]; calls that may be repeated safely also go through
//! [`RetryPolicy::run`].

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::BracketError;
use crate::exchange::ExchangeError;

/// Retry configuration for exchange calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before retry number `attempt` (0 = after the first failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only transient errors (timeouts, rate limits) are retried. Non-transient
    /// errors are returned as-is; exhaustion becomes
    /// [`BracketError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(
        &self,
        action: &'static str,
        client_order_id: &str,
        call_timeout: Duration,
        mut call: F,
    ) -> Result<T, BracketError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match with_timeout(call_timeout, call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(
                        action,
                        client_order_id,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Transient exchange error, will retry"
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                }
                Err(e) => return Err(BracketError::Exchange(e)),
            }
        }

        Err(BracketError::RetriesExhausted {
            action,
            client_order_id: client_order_id.to_string(),
            attempts,
            source: last_error.unwrap_or_else(|| ExchangeError::Transient("no attempt made".into())),
        })
    }
}

/// Bound an exchange call by `limit`, mapping expiry to [`ExchangeError::Timeout`].
pub async fn with_timeout<T, Fut>(limit: Duration, call: Fut) -> Result<T, ExchangeError>
where
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout(limit.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_ok;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(100), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = assert_ok!(
            RetryPolicy::immediate(3)
                .run("cancel", "1-1-sl", Duration::from_secs(1), || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ExchangeError::RateLimited)
                        } else {
                            Ok(n)
                        }
                    }
                })
                .await
        );

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let err = RetryPolicy::immediate(2)
            .run("place", "1-1-tp", Duration::from_secs(1), || async {
                Err::<(), _>(ExchangeError::Transient("503".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BracketError::RetriesExhausted { attempts: 2, action: "place", .. }
        ));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::immediate(5)
            .run("place", "1-1-entry", Duration::from_secs(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ExchangeError::Rejected("insufficient margin".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BracketError::Exchange(ExchangeError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_exchange_timeout() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(ExchangeError::Timeout(50)));
    }
}
