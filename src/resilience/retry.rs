//! Exponential-backoff retry wrapper.
//!
//! The delay before attempt n (n ≥ 2) is `min(min_timeout * factor^(n-2),
//! max_timeout)`. Callers pass a classifier so terminal errors (an empty
//! mailbox, an auth rejection) return immediately instead of burning the
//! whole budget.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters. `retries` is the total attempt budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub factor: f64,
    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(60),
            factor: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before attempt `attempt` (1-based). Attempt 1 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2) as i32;
        let millis = self.min_timeout.as_millis() as f64 * self.factor.powi(exp);
        let capped = millis.min(self.max_timeout.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn sleep_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Run `f` up to `policy.retries` times.
///
/// `is_retryable` classifies errors; a terminal error is returned at once.
/// `on_retry` observes every failed attempt (error, attempt number) before
/// the backoff delay. Exhaustion returns the last error unchanged.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut on_retry: impl FnMut(&E, u32),
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.retries.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                on_retry(&err, attempt);
                if !is_retryable(&err) || attempt >= attempts {
                    return Err(err);
                }
                attempt += 1;
                tokio::time::sleep(policy.sleep_for_attempt(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::IngestError;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(4),
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_sequence_capped() {
        let policy = RetryPolicy {
            retries: 5,
            min_timeout: Duration::from_millis(1_000),
            max_timeout: Duration::from_millis(10_000),
            factor: 2.0,
            jitter: false,
        };
        let delays: Vec<u64> = (2..=5)
            .map(|n| policy.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);

        // Attempt 6 would be 16s uncapped.
        assert_eq!(policy.delay_for_attempt(6).as_millis(), 10_000);
    }

    #[test]
    fn first_attempt_has_no_delay() {
        assert_eq!(policy(5).delay_for_attempt(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, IngestError> = retry(
            &policy(5),
            |e| e.is_retryable(),
            |_, _| {},
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(IngestError::Connection {
                            host: "imap.test".into(),
                            reason: "reset".into(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_skips_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), IngestError> = retry(
            &policy(5),
            |e| e.is_retryable(),
            |_, _| {},
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(IngestError::ReportNotFound {
                        vendor: "VinSolutions".into(),
                    })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(IngestError::ReportNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let observed = Arc::new(AtomicU32::new(0));
        let observer = Arc::clone(&observed);
        let result: Result<(), IngestError> = retry(
            &policy(3),
            |e| e.is_retryable(),
            move |_, attempt| {
                observer.store(attempt, Ordering::SeqCst);
            },
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(IngestError::Connection {
                        host: "imap.test".into(),
                        reason: "down".into(),
                    })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(IngestError::Connection { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // on_retry saw the final attempt too.
        assert_eq!(observed.load(Ordering::SeqCst), 3);
    }
}
