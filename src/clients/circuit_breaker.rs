use std::{collections::VecDeque, future::Future, time::Duration};

use parking_lot::Mutex;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::{
    error::CircuitOpenError,
    models::{
        circuit_breaker::{CircuitBreakerConfig, CircuitSnapshot, CircuitState},
        provider::ProviderOutcome,
    },
};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started_at: Instant,
    successes: u32,
    failures: u32,
}

/// Bucketed counters over a trailing time window.
#[derive(Debug)]
struct RollingWindow {
    span: Duration,
    bucket_span: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    fn new(span: Duration, bucket_count: u32) -> Self {
        let bucket_span = (span / bucket_count.max(1)).max(Duration::from_millis(1));
        Self {
            span,
            bucket_span,
            buckets: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.started_at) >= self.span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, failed: bool) {
        self.evict(now);

        let needs_bucket = match self.buckets.back() {
            Some(last) => now.saturating_duration_since(last.started_at) >= self.bucket_span,
            None => true,
        };
        if needs_bucket {
            self.buckets.push_back(Bucket {
                started_at: now,
                successes: 0,
                failures: 0,
            });
        }

        if let Some(bucket) = self.buckets.back_mut() {
            if failed {
                bucket.failures += 1;
            } else {
                bucket.successes += 1;
            }
        }
    }

    fn totals(&mut self, now: Instant) -> (u32, u32) {
        self.evict(now);
        self.buckets.iter().fold((0, 0), |(total, failures), b| {
            (total + b.successes + b.failures, failures + b.failures)
        })
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }
}

fn error_rate(total: u32, failures: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(failures) * 100.0 / f64::from(total)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    transitioned_at: Instant,
    window: RollingWindow,
    trial_in_flight: bool,
}

/// Failure-rate gate for a single provider.
///
/// Counter updates, state transitions and the half-open trial slot all live under
/// one short lock that is never held across a send, so only one caller at a time
/// can become the recovery trial and only while the circuit is half-open.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call. Settled with [`Permit::record`]; a trial
/// permit dropped unsettled frees the half-open slot.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record(mut self, outcome: &ProviderOutcome) {
        self.settled = true;
        self.breaker.on_outcome(self.trial, outcome.is_transient());
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            debug!(provider = %self.breaker.provider_id, "Abandoned half-open trial released");
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let provider_id = provider_id.into();
        info!(
            provider = %provider_id,
            error_threshold_percentage = config.error_threshold_percentage,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );

        let window = RollingWindow::new(config.rolling_window, config.window_buckets);
        Self {
            provider_id,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                transitioned_at: Instant::now(),
                window,
                trial_in_flight: false,
            }),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Runs `operation` if the circuit admits it, bounded by the per-call timeout,
    /// and feeds the outcome back into the breaker.
    pub async fn call<F, Fut>(&self, operation: F) -> Result<ProviderOutcome, CircuitOpenError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProviderOutcome>,
    {
        let permit = self.try_acquire()?;

        let outcome = match timeout(self.config.timeout, operation()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    provider = %self.provider_id,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Provider call timed out"
                );
                ProviderOutcome::transient(
                    self.provider_id.clone(),
                    format!("send timed out after {}ms", self.config.timeout.as_millis()),
                )
            }
        };

        permit.record(&outcome);
        Ok(outcome)
    }

    pub fn try_acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open
            && inner.transitioned_at.elapsed() >= self.config.reset_timeout
        {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen => {
                if !inner.trial_in_flight {
                    inner.trial_in_flight = true;
                    debug!(provider = %self.provider_id, "Half-open trial call admitted");
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::Open => {
                debug!(provider = %self.provider_id, "Circuit breaker is open, rejecting call");
                Err(self.open_error())
            }
        }
    }

    fn on_outcome(&self, trial: bool, failed: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen if trial => {
                if failed {
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(provider = %self.provider_id, "Circuit breaker reopened after failed trial call");
                } else {
                    inner.window.reset();
                    self.transition(&mut inner, CircuitState::Closed);
                    info!(provider = %self.provider_id, "Circuit breaker closed after successful trial call");
                }
            }
            CircuitState::Closed => {
                inner.window.record(now, failed);
                let (total, failures) = inner.window.totals(now);
                let rate = error_rate(total, failures);

                debug!(
                    provider = %self.provider_id,
                    total,
                    failures,
                    error_rate = rate,
                    "Circuit breaker outcome recorded"
                );

                if failed
                    && total >= self.config.volume_threshold
                    && rate > f64::from(self.config.error_threshold_percentage)
                {
                    inner.window.reset();
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        provider = %self.provider_id,
                        total,
                        failures,
                        error_rate = rate,
                        "Circuit breaker opened due to error rate"
                    );
                }
            }
            // Late results from calls admitted before the circuit opened.
            _ => {}
        }

        if trial {
            inner.trial_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        // Instants are monotonic, so a transition can never be backdated.
        inner.transitioned_at = Instant::now().max(inner.transitioned_at);
        debug!(
            provider = %self.provider_id,
            from = inner.state.as_str(),
            to = to.as_str(),
            "Circuit breaker state transition"
        );
        inner.state = to;
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            provider_id: self.provider_id.clone(),
        }
    }

    /// Current state; an open circuit whose reset timeout has elapsed reports
    /// half-open, without mutating anything.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if inner.transitioned_at.elapsed() >= self.config.reset_timeout => {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let mut inner = self.inner.lock();
        let (total_calls, failures) = inner.window.totals(Instant::now());

        CircuitSnapshot {
            provider_id: self.provider_id.clone(),
            state,
            total_calls,
            failures,
            error_rate: error_rate(total_calls, failures),
        }
    }
}
