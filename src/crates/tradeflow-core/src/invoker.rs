//! Tool Invoker — resilience wrapper for every outbound collaborator call.
//!
//! Agent nodes never call an LLM or data provider directly; they go through
//! a [`ToolInvoker`], which layers, in order:
//!
//! 1. **Result cache** (optional, per-endpoint TTL, keyed by endpoint plus
//!    canonical argument JSON);
//! 2. **Circuit breaker** per endpoint — opens after a run of consecutive
//!    failures, half-opens after a cooldown, closes again on the first
//!    success;
//! 3. **Retry** with exponential backoff and jitter, for transient errors
//!    only.
//!
//! Blocking or CPU-bound work (the indicator engine, any provider library
//! that does synchronous I/O) must go through [`ToolInvoker::offload`],
//! which pushes it onto a worker thread; running it on the event loop is a
//! defect.
//!
//! # Error classification
//!
//! Operations return [`ToolError`]; the invoker retries only
//! [`ErrorClass::Transient`] failures. Permanent errors (4xx, auth, unknown
//! ticker) surface immediately and the node records `failed`.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::LlmError;
use crate::providers::ProviderError;

/// Classification of a failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on retry (rate limits, timeouts, 5xx).
    Transient,
    /// Will not succeed on retry (4xx, invalid auth, unsupported).
    Permanent,
}

/// Failure of an invoked tool call.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Retryable failure.
    #[error("transient tool error: {0}")]
    Transient(String),

    /// Non-retryable failure.
    #[error("permanent tool error: {0}")]
    Permanent(String),

    /// The endpoint's circuit breaker is open; the call was not attempted.
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen {
        /// Endpoint whose breaker rejected the call.
        endpoint: String,
    },

    /// All retry attempts failed.
    #[error("endpoint '{endpoint}' exhausted {attempts} attempts: {last}")]
    Exhausted {
        /// Endpoint that kept failing.
        endpoint: String,
        /// Attempts made.
        attempts: usize,
        /// Message of the final failure.
        last: String,
    },
}

impl ToolError {
    /// Retry classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            ToolError::Transient(_) => ErrorClass::Transient,
            ToolError::Permanent(_) | ToolError::CircuitOpen { .. } | ToolError::Exhausted { .. } => {
                ErrorClass::Permanent
            }
        }
    }
}

impl From<LlmError> for ToolError {
    fn from(err: LlmError) -> Self {
        match err.class() {
            ErrorClass::Transient => ToolError::Transient(err.to_string()),
            ErrorClass::Permanent => ToolError::Permanent(err.to_string()),
        }
    }
}

impl From<ProviderError> for ToolError {
    fn from(err: ProviderError) -> Self {
        match err.class() {
            ErrorClass::Transient => ToolError::Transient(err.to_string()),
            ErrorClass::Permanent => ToolError::Permanent(err.to_string()),
        }
    }
}

/// Exponential backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry, in seconds.
    pub initial_interval: f64,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Ceiling on the delay, in seconds.
    pub max_interval: f64,
    /// Randomize delays by 0.5–1.5x to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: 1.0,
            backoff_factor: 2.0,
            max_interval: 60.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and default backoff.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the delay before the first retry.
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set the per-retry multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let base = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval);
        let final_delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay.max(0.0))
    }
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Per-endpoint circuit breaker: `Closed` → (threshold consecutive
/// failures) → `Open` → (cooldown) → `HalfOpen` → first success → `Closed`.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    reset_after: Duration,
}

impl CircuitBreaker {
    /// Breaker opening after `threshold` consecutive failures and
    /// half-opening after `reset_after`.
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
            threshold,
            reset_after,
        }
    }

    /// Whether a call may proceed right now. An open breaker transitions to
    /// half-open once the cooldown has elapsed, admitting one probe.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.reset_after {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: the breaker closes.
    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Record a failed call. A half-open probe failure reopens immediately.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    BreakerState::Open {
                        since: Instant::now(),
                    }
                } else {
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            BreakerState::HalfOpen | BreakerState::Open { .. } => BreakerState::Open {
                since: Instant::now(),
            },
        };
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Resilience wrapper shared by all nodes of a run. Caches and breakers are
/// per-invoker (per-run by construction) and concurrency-safe.
pub struct ToolInvoker {
    retry: RetryPolicy,
    breaker_threshold: u32,
    breaker_reset: Duration,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    cache: DashMap<String, CacheEntry>,
    cache_ttls: DashMap<String, Duration>,
}

impl ToolInvoker {
    /// Invoker with the given retry schedule and breaker parameters.
    pub fn new(retry: RetryPolicy, breaker_threshold: u32, breaker_reset: Duration) -> Self {
        Self {
            retry,
            breaker_threshold,
            breaker_reset,
            breakers: DashMap::new(),
            cache: DashMap::new(),
            cache_ttls: DashMap::new(),
        }
    }

    /// Enable result caching for `endpoint` with the given TTL.
    pub fn set_cache_ttl(&self, endpoint: impl Into<String>, ttl: Duration) {
        self.cache_ttls.insert(endpoint.into(), ttl);
    }

    /// Invoke `op` against `endpoint` with caching, circuit breaking and
    /// retry. `args` identify the call for the cache key; pass
    /// `Value::Null` for uncacheable or argument-free calls.
    pub async fn invoke<T, F, Fut>(
        &self,
        endpoint: &str,
        args: &Value,
        op: F,
    ) -> Result<T, ToolError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let cache_key = self.cache_key(endpoint, args);
        if let Some(key) = &cache_key {
            if let Some(entry) = self.cache.get(key) {
                if !entry.is_expired() {
                    debug!(endpoint, "tool cache hit");
                    if let Ok(value) = serde_json::from_value(entry.value.clone()) {
                        return Ok(value);
                    }
                }
            }
        }

        let result = self.call_with_retry(endpoint, &op).await?;

        if let Some(key) = cache_key {
            let ttl = self
                .cache_ttls
                .get(endpoint)
                .map(|t| *t)
                .unwrap_or_default();
            if let Ok(value) = serde_json::to_value(&result) {
                self.cache.insert(
                    key,
                    CacheEntry {
                        value,
                        inserted_at: Instant::now(),
                        ttl,
                    },
                );
            }
        }
        Ok(result)
    }

    /// Invoke with a declared secondary. The fallback runs when the primary
    /// fails, or when the primary succeeds but `is_partial` says its result
    /// is incomplete — in the latter case both results are merged rather
    /// than replaced.
    pub async fn invoke_with_fallback<T, F, Fut, G, Gut>(
        &self,
        primary_endpoint: &str,
        args: &Value,
        primary: F,
        secondary_endpoint: &str,
        secondary: G,
        is_partial: impl Fn(&T) -> bool,
        merge: impl Fn(T, T) -> T,
    ) -> Result<T, ToolError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
        G: Fn() -> Gut,
        Gut: Future<Output = Result<T, ToolError>>,
    {
        match self.invoke(primary_endpoint, args, primary).await {
            Ok(result) if !is_partial(&result) => Ok(result),
            Ok(partial) => {
                debug!(
                    primary = primary_endpoint,
                    secondary = secondary_endpoint,
                    "primary returned partial data, merging fallback"
                );
                match self.invoke(secondary_endpoint, args, secondary).await {
                    Ok(extra) => Ok(merge(partial, extra)),
                    Err(_) => Ok(partial),
                }
            }
            Err(primary_err) => {
                warn!(
                    primary = primary_endpoint,
                    secondary = secondary_endpoint,
                    error = %primary_err,
                    "primary provider failed, trying fallback"
                );
                self.invoke(secondary_endpoint, args, secondary).await
            }
        }
    }

    /// Run blocking or CPU-bound `f` on a worker thread. Required for the
    /// indicator engine and any provider library that blocks.
    pub async fn offload<T, F>(&self, f: F) -> Result<T, ToolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| ToolError::Transient(format!("worker thread failed: {e}")))
    }

    fn cache_key(&self, endpoint: &str, args: &Value) -> Option<String> {
        if !self.cache_ttls.contains_key(endpoint) {
            return None;
        }
        Some(format!("{endpoint}:{args}"))
    }

    async fn call_with_retry<T, F, Fut>(&self, endpoint: &str, op: &F) -> Result<T, ToolError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        // Clone the Arc out so no shard lock is held across an await.
        let breaker = self
            .breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.breaker_threshold,
                    self.breaker_reset,
                ))
            })
            .clone();

        let mut attempts = 0usize;
        loop {
            if !breaker.allow() {
                return Err(ToolError::CircuitOpen {
                    endpoint: endpoint.to_string(),
                });
            }

            attempts += 1;
            match op().await {
                Ok(result) => {
                    breaker.record_success();
                    return Ok(result);
                }
                Err(err) => {
                    breaker.record_failure();
                    if err.class() == ErrorClass::Permanent {
                        return Err(err);
                    }
                    if !self.retry.should_retry(attempts) {
                        return Err(ToolError::Exhausted {
                            endpoint: endpoint.to_string(),
                            attempts,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.retry.calculate_delay(attempts - 1);
                    debug!(endpoint, attempts, ?delay, error = %err, "retrying tool call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
