use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;

use crate::error::PipelineError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, PipelineError>>>;

/// Tuning knobs shared by all keys of one executor instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Consecutive failed executions before the circuit opens for a key.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe.
    pub circuit_timeout: Duration,
    /// Default retry budget per execution (attempts = retries + 1).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            circuit_timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Per-call overrides. `None` falls back to the executor defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub max_retries: Option<u32>,
    /// Per-attempt timeout; expiry counts as a transient failure.
    pub timeout: Option<Duration>,
    /// Retry predicate; defaults to [`PipelineError::is_retryable`].
    pub retry_on: Option<fn(&PipelineError) -> bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { until: Instant },
    /// The open window elapsed and exactly one probe call is in flight.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    circuit: CircuitState,
}

/// Bookkeeping for one logical operation key.
struct KeyEntry {
    breaker: Mutex<BreakerState>,
    /// Type-erased [`SharedResult<T>`] of the in-flight execution, if any.
    inflight: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl KeyEntry {
    fn new() -> Self {
        Self {
            breaker: Mutex::new(BreakerState {
                consecutive_failures: 0,
                circuit: CircuitState::Closed,
            }),
            inflight: Mutex::new(None),
        }
    }
}

/// Retry / circuit-breaker / deduplication wrapper for fallible async
/// operations, keyed by a logical operation identifier.
///
/// Concurrent `execute` calls under the same key share a single in-flight
/// execution; every caller gets the same result. Consecutive failures open a
/// per-key circuit that fails fast until a timed probe succeeds. Keys are
/// independent: breaker state for one key never serializes another.
pub struct ResilientExecutor {
    config: ExecutorConfig,
    keys: Arc<Mutex<HashMap<String, Arc<KeyEntry>>>>,
}

impl ResilientExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `operation` under `key` with retry, circuit-breaker and in-flight
    /// deduplication semantics.
    ///
    /// `operation` is invoked once per attempt; it must produce a fresh
    /// future each call. `T: Clone` because the result may be handed to
    /// several deduplicated callers.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T, PipelineError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let entry = self.key_entry(key);

        // The guard must be released before any await so the returned
        // future stays `Send` and can run on detached tasks.
        let (shared, joined): (SharedResult<T>, bool) = {
            let mut inflight = entry.inflight.lock().unwrap();

            match inflight
                .as_ref()
                .and_then(|fut| fut.downcast_ref::<SharedResult<T>>())
            {
                // Join an execution already in flight under this key.
                Some(existing) => (existing.clone(), true),
                None => {
                    self.check_circuit(key, &entry)?;

                    let fut = Self::run_attempts(
                        key.to_string(),
                        entry.clone(),
                        self.keys.clone(),
                        self.config.clone(),
                        options,
                        operation,
                    )
                    .boxed()
                    .shared();
                    *inflight = Some(Box::new(fut.clone()));
                    (fut, false)
                }
            }
        };

        if joined {
            tracing::debug!(key, "joining in-flight execution");
        }
        shared.await
    }

    fn key_entry(&self, key: &str) -> Arc<KeyEntry> {
        let mut keys = self.keys.lock().unwrap();
        keys.entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyEntry::new()))
            .clone()
    }

    /// Keys currently holding breaker or dedup bookkeeping.
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    /// Fail fast while the circuit is open; flip Open → HalfOpen when the
    /// window has elapsed so the current caller becomes the sole probe.
    fn check_circuit(&self, key: &str, entry: &KeyEntry) -> Result<(), PipelineError> {
        let mut breaker = entry.breaker.lock().unwrap();
        match breaker.circuit {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(PipelineError::CircuitOpen {
                key: key.to_string(),
            }),
            CircuitState::Open { until } => {
                if Instant::now() < until {
                    Err(PipelineError::CircuitOpen {
                        key: key.to_string(),
                    })
                } else {
                    breaker.circuit = CircuitState::HalfOpen;
                    tracing::info!(key, "circuit half-open, admitting probe");
                    Ok(())
                }
            }
        }
    }

    /// The retry loop. Runs exactly once per deduplicated execution.
    async fn run_attempts<T, F, Fut>(
        key: String,
        entry: Arc<KeyEntry>,
        keys: Arc<Mutex<HashMap<String, Arc<KeyEntry>>>>,
        config: ExecutorConfig,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T, PipelineError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let max_retries = options.max_retries.unwrap_or(config.max_retries);
        let mut attempt: u32 = 0;

        let result = loop {
            let outcome = match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(res) => res,
                    Err(_) => Err(PipelineError::Timeout(limit)),
                },
                None => operation().await,
            };

            match outcome {
                Ok(value) => break Ok(value),
                Err(err) => {
                    let retryable = match options.retry_on {
                        Some(predicate) => predicate(&err),
                        None => err.is_retryable(),
                    };
                    if !retryable || attempt >= max_retries {
                        break Err(err);
                    }
                    let exp = config.base_delay.saturating_mul(1u32 << attempt.min(16));
                    let delay = exp.min(config.max_delay);
                    tracing::warn!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        match &result {
            Ok(_) => Self::record_success(&key, &entry),
            Err(err) => Self::record_failure(&key, &entry, &config, err),
        }

        // Clear the dedup slot so later calls start a fresh execution.
        *entry.inflight.lock().unwrap() = None;

        // A healthy key carries no state worth keeping; drop it so per-item
        // keys (one per upload, download, recognition) do not accumulate for
        // the life of the process. Failed keys stay for the breaker.
        if result.is_ok() {
            let mut keys = keys.lock().unwrap();
            if let Some(current) = keys.get(&key) {
                if Arc::ptr_eq(current, &entry) && current.inflight.lock().unwrap().is_none() {
                    keys.remove(&key);
                }
            }
        }

        result
    }

    fn record_success(key: &str, entry: &KeyEntry) {
        let mut breaker = entry.breaker.lock().unwrap();
        if breaker.circuit != CircuitState::Closed {
            tracing::info!(key, "circuit closed");
        }
        breaker.consecutive_failures = 0;
        breaker.circuit = CircuitState::Closed;
    }

    fn record_failure(key: &str, entry: &KeyEntry, config: &ExecutorConfig, err: &PipelineError) {
        let mut breaker = entry.breaker.lock().unwrap();
        breaker.consecutive_failures += 1;
        match breaker.circuit {
            CircuitState::HalfOpen => {
                breaker.circuit = CircuitState::Open {
                    until: Instant::now() + config.circuit_timeout,
                };
                metrics::counter!("executor_circuit_opened_total").increment(1);
                tracing::warn!(key, error = %err, "probe failed, circuit re-opened");
            }
            CircuitState::Closed if breaker.consecutive_failures >= config.failure_threshold => {
                breaker.circuit = CircuitState::Open {
                    until: Instant::now() + config.circuit_timeout,
                };
                metrics::counter!("executor_circuit_opened_total").increment(1);
                tracing::warn!(
                    key,
                    failures = breaker.consecutive_failures,
                    timeout_s = config.circuit_timeout.as_secs(),
                    "failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            failure_threshold: 3,
            circuit_timeout: Duration::from_secs(30),
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    fn failing_op(
        calls: Arc<AtomicU32>,
        err: PipelineError,
    ) -> impl Fn() -> BoxFuture<'static, Result<u32, PipelineError>> {
        move || {
            let calls = calls.clone();
            let err = err.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_gets_single_attempt() {
        let exec = ResilientExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_op(calls.clone(), PipelineError::Validation("bad".into()));

        let res = exec.execute("k1", ExecuteOptions::default(), op).await;
        assert!(matches!(res, Err(PipelineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_error_exhausts_retry_budget() {
        let exec = ResilientExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_op(calls.clone(), PipelineError::Transient("boom".into()));

        let res = exec.execute("k2", ExecuteOptions::default(), op).await;
        assert!(matches!(res, Err(PipelineError::Transient(_))));
        // max_retries = 2 -> 3 attempts
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_predicate_overrides_classification() {
        let exec = ResilientExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_op(calls.clone(), PipelineError::Transient("boom".into()));

        let opts = ExecuteOptions {
            retry_on: Some(|_| false),
            ..Default::default()
        };
        let _ = exec.execute("k3", opts, op).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_after_threshold_and_fails_fast() {
        let exec = ResilientExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let opts = ExecuteOptions {
            max_retries: Some(0),
            ..Default::default()
        };

        for _ in 0..3 {
            let op = failing_op(calls.clone(), PipelineError::Transient("down".into()));
            let _ = exec.execute("k4", opts, op).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Circuit is now open: the operation must not run at all.
        let op = failing_op(calls.clone(), PipelineError::Transient("down".into()));
        let res = exec.execute("k4", opts, op).await;
        assert!(matches!(res, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_after_timeout_closes_circuit_on_success() {
        let exec = ResilientExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let opts = ExecuteOptions {
            max_retries: Some(0),
            ..Default::default()
        };

        for _ in 0..3 {
            let op = failing_op(calls.clone(), PipelineError::Transient("down".into()));
            let _ = exec.execute("k5", opts, op).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        // First post-timeout call is the probe and goes through.
        let probe_calls = Arc::new(AtomicU32::new(0));
        let ok_op = {
            let probe_calls = probe_calls.clone();
            move || {
                let probe_calls = probe_calls.clone();
                async move {
                    probe_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7u32)
                }
                .boxed()
            }
        };
        let res = exec.execute("k5", opts, ok_op).await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(probe_calls.load(Ordering::SeqCst), 1);

        // Circuit closed again: normal calls run.
        let more = Arc::new(AtomicU32::new(0));
        let op = failing_op(more.clone(), PipelineError::Transient("down".into()));
        let _ = exec.execute("k5", opts, op).await;
        assert_eq!(more.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_circuit() {
        let exec = ResilientExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let opts = ExecuteOptions {
            max_retries: Some(0),
            ..Default::default()
        };

        for _ in 0..3 {
            let op = failing_op(calls.clone(), PipelineError::Transient("down".into()));
            let _ = exec.execute("k6", opts, op).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        // Probe fails -> circuit re-opens immediately.
        let op = failing_op(calls.clone(), PipelineError::Transient("down".into()));
        let _ = exec.execute("k6", opts, op).await;
        let op = failing_op(calls.clone(), PipelineError::Transient("down".into()));
        let res = exec.execute("k6", opts, op).await;
        assert!(matches!(res, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_execution() {
        let exec = Arc::new(ResilientExecutor::new(fast_config()));
        let calls = Arc::new(AtomicU32::new(0));

        let make_op = |calls: Arc<AtomicU32>| {
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(42u32)
                }
                .boxed()
            }
        };

        let a = exec.execute("k7", ExecuteOptions::default(), make_op(calls.clone()));
        let b = exec.execute("k7", ExecuteOptions::default(), make_op(calls.clone()));
        let (ra, rb) = tokio::join!(a, b);

        assert_eq!(ra.unwrap(), 42);
        assert_eq!(rb.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The slot is cleared afterwards, so the next call runs fresh.
        let r = exec
            .execute("k7", ExecuteOptions::default(), make_op(calls.clone()))
            .await;
        assert_eq!(r.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_runs_on_detached_tasks() {
        // `execute` futures must be `Send`: the trigger dispatcher runs them
        // inside `tokio::spawn`.
        let exec = Arc::new(ResilientExecutor::new(fast_config()));
        let calls = Arc::new(AtomicU32::new(0));

        let spawn_one = |exec: Arc<ResilientExecutor>, calls: Arc<AtomicU32>| {
            tokio::spawn(async move {
                exec.execute("k9", ExecuteOptions::default(), move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(5u32)
                    }
                    .boxed()
                })
                .await
            })
        };

        let a = spawn_one(exec.clone(), calls.clone());
        let b = spawn_one(exec.clone(), calls.clone());
        assert_eq!(a.await.unwrap().unwrap(), 5);
        assert_eq!(b.await.unwrap().unwrap(), 5);
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_keys_are_dropped_from_bookkeeping() {
        let exec = ResilientExecutor::new(fast_config());

        let r = exec
            .execute("k10", ExecuteOptions::default(), || {
                async { Ok(1u32) }.boxed()
            })
            .await;
        assert_eq!(r.unwrap(), 1);
        assert_eq!(exec.tracked_keys(), 0);

        // Failed keys keep their breaker state.
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_op(calls.clone(), PipelineError::Transient("down".into()));
        let opts = ExecuteOptions {
            max_retries: Some(0),
            ..Default::default()
        };
        let _ = exec.execute("k11", opts, op).await;
        assert_eq!(exec.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_counts_as_transient() {
        let exec = ResilientExecutor::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let op = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(0u32)
                }
                .boxed()
            }
        };
        let opts = ExecuteOptions {
            max_retries: Some(1),
            timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let res = exec.execute("k8", opts, op).await;
        assert!(matches!(res, Err(PipelineError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
