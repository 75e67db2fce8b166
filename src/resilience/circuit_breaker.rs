//! Per-operation circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures; Open rejects
//! every call until `reset_timeout` has elapsed, then admits the next call as
//! a half-open trial; `success_threshold` consecutive trial successes close
//! the circuit, a single trial failure reopens it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::IngestError;

/// Breaker states, visible for health/dashboard consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Observer invoked on every state transition with `(operation, from, to)`.
pub type TransitionObserver = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// A circuit breaker for one named operation.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    observer: Option<TransitionObserver>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current state (Open flips to HalfOpen lazily on the next `execute`).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    /// Run `f` through the breaker.
    ///
    /// Fails fast with `IngestError::CircuitOpen` while the circuit is open.
    /// `ReportNotFound` does not count as a failure signal — an empty mailbox
    /// means the dependency answered.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        self.admit()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.counts_as_breaker_failure() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(err)
            }
        }
    }

    /// Gate a call: reject while open, admit a trial once the timeout elapsed.
    fn admit(&self) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed < self.config.reset_timeout {
                return Err(IngestError::CircuitOpen {
                    operation: self.name.clone(),
                });
            }
            self.transition(&mut inner, BreakerState::HalfOpen);
            inner.success_count = 0;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        tracing::info!(operation = %self.name, %from, %to, "Circuit breaker transition");
        if let Some(ref observer) = self.observer {
            observer(&self.name, from, to);
        }
    }
}

/// Keyed registry of breakers sharing one config and observer.
pub struct BreakerRegistry {
    config: BreakerConfig,
    observer: Option<TransitionObserver>,
    map: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            observer: None,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Get (or create) the breaker for a named operation.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut map = self.map.lock().expect("registry mutex poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(name, self.config.clone());
                if let Some(ref observer) = self.observer {
                    breaker = breaker.with_observer(Arc::clone(observer));
                }
                Arc::new(breaker)
            })
            .clone()
    }
}
