//! Per-operation fixed-window rate limiter with a backpressure pause switch.
//!
//! A call within the window budget proceeds immediately; over budget it either
//! waits for the next window (bounded by `max_wait`) or fails. The `paused`
//! flag blocks every call regardless of window occupancy — that is the
//! backpressure signal, distinct from ordinary throttling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::IngestError;

/// Window budget for one named operation.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Admission options for a single call.
#[derive(Debug, Clone, Copy)]
pub struct AdmitOptions {
    /// Queue for the next window instead of failing immediately.
    pub wait: bool,
    /// Upper bound on queueing time.
    pub max_wait: Duration,
}

impl Default for AdmitOptions {
    fn default() -> Self {
        Self {
            wait: true,
            max_wait: Duration::from_secs(30),
        }
    }
}

struct Inner {
    window_start: Instant,
    count: u32,
    paused: Option<String>,
}

enum Admission {
    Admitted,
    Blocked { retry_in: Duration, reason: Option<String> },
}

/// A rate limiter for one named operation.
pub struct RateLimiter {
    name: String,
    config: LimiterConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: LimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                window_start: Instant::now(),
                count: 0,
                paused: None,
            }),
        }
    }

    /// Block all calls until `resume`. Idempotent — a second pause keeps the
    /// original reason.
    pub fn pause(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().expect("limiter mutex poisoned");
        if inner.paused.is_none() {
            let reason = reason.into();
            tracing::warn!(operation = %self.name, %reason, "Rate limiter paused");
            inner.paused = Some(reason);
        }
    }

    /// Clear the pause flag. Idempotent.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().expect("limiter mutex poisoned");
        if inner.paused.take().is_some() {
            tracing::info!(operation = %self.name, "Rate limiter resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().expect("limiter mutex poisoned").paused.is_some()
    }

    /// Run `f` once admission is granted.
    pub async fn execute<T, F, Fut>(&self, options: AdmitOptions, f: F) -> Result<T, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        self.admit(options).await?;
        f().await
    }

    /// Wait for a slot in the current or a future window.
    async fn admit(&self, options: AdmitOptions) -> Result<(), IngestError> {
        let deadline = Instant::now() + options.max_wait;

        loop {
            match self.try_admit() {
                Admission::Admitted => return Ok(()),
                Admission::Blocked { retry_in, reason } => {
                    let retry_at = Instant::now() + retry_in;
                    if !options.wait || retry_at > deadline {
                        return Err(match reason {
                            Some(reason) => IngestError::Paused {
                                operation: self.name.clone(),
                                reason,
                            },
                            None => IngestError::RateLimitExceeded {
                                operation: self.name.clone(),
                            },
                        });
                    }
                    tokio::time::sleep(retry_in).await;
                }
            }
        }
    }

    fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock().expect("limiter mutex poisoned");

        if let Some(ref reason) = inner.paused {
            // Re-check at a coarse interval; resume() can land at any time.
            return Admission::Blocked {
                retry_in: Duration::from_millis(250),
                reason: Some(reason.clone()),
            };
        }

        let now = Instant::now();
        let elapsed = now.duration_since(inner.window_start);
        if elapsed >= self.config.window {
            inner.window_start = now;
            inner.count = 0;
        }

        if inner.count < self.config.max_requests {
            inner.count += 1;
            Admission::Admitted
        } else {
            Admission::Blocked {
                retry_in: self.config.window - elapsed,
                reason: None,
            }
        }
    }
}

/// Keyed registry of limiters sharing one config.
pub struct LimiterRegistry {
    config: LimiterConfig,
    map: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl LimiterRegistry {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or create) the limiter for a named operation.
    pub fn limiter(&self, name: &str) -> Arc<RateLimiter> {
        let mut map = self.map.lock().expect("registry mutex poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(name, self.config.clone())))
            .clone()
    }
}
