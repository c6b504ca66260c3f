use super::types::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerOverrides, CircuitState,
    MAX_WINDOW_SAMPLES,
};
use crate::error::{ProtectedCallError, ResilienceError, Result};
use crate::events::{EventBus, ResilienceEvent};
use crate::metrics;
use chrono::Utc;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Adaptive circuit breaker for a single `service:operation` key
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Registry key
    key: String,
    /// Current state
    state: Arc<RwLock<State>>,
    /// Bus for transition and lifecycle events
    event_bus: EventBus,
}

#[derive(Debug)]
struct State {
    /// Active configuration
    config: CircuitBreakerConfig,
    /// Current circuit state
    circuit_state: CircuitState,
    /// Outcomes recorded while closed: (when, failed)
    window: VecDeque<(Instant, bool)>,
    /// Number of consecutive successes in half-open state
    consecutive_successes: u32,
    /// Number of half-open requests in flight
    half_open_requests: u32,
    /// Time when the circuit was opened
    opened_at: Option<Instant>,
    /// Bumped on every transition
    generation: u64,
    shut_down: bool,
    /// Metrics
    metrics: CircuitBreakerMetrics,
}

impl State {
    fn prune_window(&mut self, now: Instant) {
        let window = self.config.monitoring_window();
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn push_outcome(&mut self, now: Instant, failed: bool) {
        self.prune_window(now);
        self.window.push_back((now, failed));
        if self.window.len() > MAX_WINDOW_SAMPLES {
            self.window.pop_front();
        }
    }

    fn release_probe(&mut self, generation: u64) {
        if self.generation == generation && self.circuit_state == CircuitState::HalfOpen {
            self.half_open_requests = self.half_open_requests.saturating_sub(1);
        }
    }

    /// Reason to trip, if the window breaches a threshold
    fn breach(&self) -> Option<String> {
        let failures = self.window.iter().filter(|(_, failed)| *failed).count() as u32;
        if failures >= self.config.failure_threshold {
            return Some(format!(
                "{} failures within {}ms",
                failures, self.config.monitoring_window_ms
            ));
        }

        let thresholds = self.config.error_thresholds?;
        let calls = self.window.len() as u32;
        if calls >= thresholds.minimum_calls && calls > 0 {
            let rate = failures as f64 / calls as f64;
            if rate >= thresholds.error_rate {
                return Some(format!(
                    "error rate {:.2} over {} calls exceeds {:.2}",
                    rate, calls, thresholds.error_rate
                ));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Admission handed out by [`CircuitBreaker::try_acquire`]
///
/// Tied to the state the call was admitted under. Dropping it unsettled,
/// for example when the caller's future is cancelled, frees its half-open
/// probe slot.
#[derive(Debug)]
pub struct CallPermit {
    state: Arc<RwLock<State>>,
    generation: u64,
    probe: bool,
    timeout: Duration,
    settled: bool,
}

impl CallPermit {
    /// Timeout to apply to the admitted call
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether this call is a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }

        let generation = self.generation;
        match self.state.try_write() {
            Ok(mut state) => state.release_probe(generation),
            Err(_) => {
                let state = self.state.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        state.write().await.release_probe(generation);
                    });
                }
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(key: String, config: CircuitBreakerConfig, event_bus: EventBus) -> Self {
        info!(
            key = %key,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_ms = config.timeout_ms,
            reset_timeout_ms = config.reset_timeout_ms,
            "Creating circuit breaker"
        );

        Self {
            key,
            state: Arc::new(RwLock::new(State {
                config,
                circuit_state: CircuitState::Closed,
                window: VecDeque::new(),
                consecutive_successes: 0,
                half_open_requests: 0,
                opened_at: None,
                generation: 0,
                shut_down: false,
                metrics: CircuitBreakerMetrics::default(),
            })),
            event_bus,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Admit a call, or `None` when the breaker rejects it.
    ///
    /// The returned permit must be settled through [`record_success`],
    /// [`record_failure`] or [`record_timeout`]. A permit dropped unsettled
    /// gives its half-open probe slot back.
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    /// [`record_timeout`]: Self::record_timeout
    pub async fn try_acquire(&self) -> Option<CallPermit> {
        let mut state = self.state.write().await;

        if state.shut_down {
            state.metrics.rejected_requests += 1;
            debug!(key = %self.key, "Circuit breaker shut down, rejecting request");
            return None;
        }

        let probe = match state.circuit_state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let reset_timeout = state.config.reset_timeout();
                let opened_at = state.opened_at;
                match opened_at {
                    Some(opened_at) if opened_at.elapsed() >= reset_timeout => {
                        self.transition(&mut state, CircuitState::HalfOpen, "reset timeout elapsed");
                        true
                    }
                    Some(opened_at) => {
                        state.metrics.rejected_requests += 1;
                        debug!(
                            key = %self.key,
                            time_remaining = ?reset_timeout.saturating_sub(opened_at.elapsed()),
                            "Circuit breaker open, rejecting request"
                        );
                        return None;
                    }
                    None => {
                        warn!(key = %self.key, "Circuit open but no opened_at timestamp");
                        state.metrics.rejected_requests += 1;
                        return None;
                    }
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_requests >= state.config.success_threshold {
                    state.metrics.rejected_requests += 1;
                    debug!(key = %self.key, "Max half-open requests reached, rejecting");
                    return None;
                }
                true
            }
        };

        state.metrics.total_requests += 1;
        if probe {
            state.half_open_requests += 1;
            debug!(
                key = %self.key,
                half_open_requests = state.half_open_requests,
                max = state.config.success_threshold,
                "Allowing half-open probe request"
            );
        }

        Some(CallPermit {
            state: self.state.clone(),
            generation: state.generation,
            probe,
            timeout: state.config.timeout(),
            settled: false,
        })
    }

    /// Run `f` through the breaker
    ///
    /// The closure is not called when the breaker rejects. A call running
    /// longer than `timeout_ms` is dropped and counted as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, ProtectedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let Some(permit) = self.try_acquire().await else {
            return Err(ProtectedCallError::Rejected {
                key: self.key.clone(),
                state: self.state().await,
            });
        };

        let timeout = permit.timeout();
        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success(permit).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(permit).await;
                Err(ProtectedCallError::Operation(e))
            }
            Err(_) => {
                self.record_timeout(permit).await;
                Err(ProtectedCallError::Timeout {
                    key: self.key.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Record a successful request
    pub async fn record_success(&self, permit: CallPermit) {
        self.settle(permit, Outcome::Success).await;
    }

    /// Record a failed request
    pub async fn record_failure(&self, permit: CallPermit) {
        self.settle(permit, Outcome::Failure).await;
    }

    /// Record a timeout, counted as a failure
    pub async fn record_timeout(&self, permit: CallPermit) {
        self.settle(permit, Outcome::Timeout).await;
    }

    async fn settle(&self, mut permit: CallPermit, outcome: Outcome) {
        permit.settled = true;
        let mut state = self.state.write().await;

        match outcome {
            Outcome::Success => state.metrics.successful_requests += 1,
            Outcome::Failure => state.metrics.failed_requests += 1,
            Outcome::Timeout => {
                state.metrics.timeout_count += 1;
                state.metrics.failed_requests += 1;
            }
        }

        // Admitted under an earlier state; the outcome says nothing about this one
        if permit.generation != state.generation {
            debug!(
                key = %self.key,
                state = %state.circuit_state,
                "Ignoring outcome of a call admitted before the last state change"
            );
            return;
        }

        let failed = outcome != Outcome::Success;
        match state.circuit_state {
            CircuitState::Closed => {
                state.push_outcome(Instant::now(), failed);
                if failed {
                    debug!(
                        key = %self.key,
                        window_samples = state.window.len(),
                        threshold = state.config.failure_threshold,
                        "Request failed in closed state"
                    );
                    if let Some(reason) = state.breach() {
                        self.transition(&mut state, CircuitState::Open, &reason);
                    }
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_requests = state.half_open_requests.saturating_sub(1);
                if failed {
                    warn!(key = %self.key, "Half-open probe request failed, reopening circuit");
                    self.transition(&mut state, CircuitState::Open, "half-open probe failed");
                } else {
                    state.consecutive_successes += 1;
                    debug!(
                        key = %self.key,
                        consecutive_successes = state.consecutive_successes,
                        threshold = state.config.success_threshold,
                        "Half-open probe request succeeded"
                    );
                    if state.consecutive_successes >= state.config.success_threshold {
                        self.transition(&mut state, CircuitState::Closed, "success threshold reached");
                    }
                }
            }
            CircuitState::Open => {
                debug!(key = %self.key, "Recording outcome in open state");
            }
        }
    }

    /// Force the breaker into `to`, regardless of its counters
    pub async fn force_state(&self, to: CircuitState, reason: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.shut_down {
            return Err(ResilienceError::BreakerShutdown(self.key.clone()));
        }

        if state.circuit_state == to {
            if to == CircuitState::Open {
                state.opened_at = Some(Instant::now());
            }
            debug!(key = %self.key, state = %to, reason, "Circuit breaker already in requested state");
            return Ok(());
        }

        let reason = format!("forced: {}", reason);
        self.transition(&mut state, to, &reason);
        Ok(())
    }

    /// Merge `overrides` into the active configuration
    pub async fn update_config(
        &self,
        overrides: &CircuitBreakerOverrides,
    ) -> Result<CircuitBreakerConfig> {
        let mut state = self.state.write().await;
        if state.shut_down {
            return Err(ResilienceError::BreakerShutdown(self.key.clone()));
        }

        let updated = state.config.merged(overrides);
        updated.validate()?;
        state.config = updated.clone();

        info!(key = %self.key, config = ?updated, "Circuit breaker configuration updated");
        self.event_bus.publish(ResilienceEvent::ConfigUpdated {
            key: self.key.clone(),
            config: updated.clone(),
            timestamp: Utc::now(),
        });

        Ok(updated)
    }

    /// Stop admitting calls. Fails if already shut down.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.shut_down {
            return Err(ResilienceError::BreakerShutdown(self.key.clone()));
        }
        state.shut_down = true;
        drop(state);

        info!(key = %self.key, "Circuit breaker shut down");
        self.event_bus.publish(ResilienceEvent::BreakerShutdown {
            key: self.key.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.read().await.shut_down
    }

    /// Get current state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.circuit_state
    }

    /// Get the active configuration
    pub async fn config(&self) -> CircuitBreakerConfig {
        self.state.read().await.config.clone()
    }

    /// Get metrics
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        self.state.read().await.metrics.clone()
    }

    fn transition(&self, state: &mut State, to: CircuitState, reason: &str) {
        let from = state.circuit_state;

        info!(
            key = %self.key,
            from = %from,
            to = %to,
            reason,
            "Circuit breaker state change"
        );

        state.circuit_state = to;
        state.generation += 1;
        state.consecutive_successes = 0;
        state.half_open_requests = 0;

        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                state.window.clear();
                state.metrics.circuit_opened_count += 1;
            }
            CircuitState::HalfOpen => {
                state.opened_at = None;
                state.metrics.circuit_half_opened_count += 1;
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.window.clear();
                state.metrics.circuit_closed_count += 1;
            }
        }

        metrics::record_circuit_breaker_transition(&self.key, &from.to_string(), &to.to_string());
        metrics::record_circuit_breaker_state(&self.key, to.as_gauge());

        self.event_bus.publish(ResilienceEvent::StateChanged {
            key: self.key.clone(),
            from,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::types::ErrorThresholds;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("svc:op".to_string(), config, EventBus::new(16))
    }

    async fn succeed(cb: &CircuitBreaker) {
        let permit = cb.try_acquire().await.expect("call admitted");
        cb.record_success(permit).await;
    }

    async fn fail(cb: &CircuitBreaker) {
        let permit = cb.try_acquire().await.expect("call admitted");
        cb.record_failure(permit).await;
    }

    fn half_open_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            reset_timeout_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let cb = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.try_acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = breaker(config);

        for _ in 0..3 {
            fail(&cb).await;
        }

        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.try_acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_forgotten() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            monitoring_window_ms: 30,
            ..Default::default()
        };
        let cb = breaker(config);

        for _ in 0..2 {
            fail(&cb).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        fail(&cb).await;

        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_error_rate_threshold_opens_circuit() {
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            error_thresholds: Some(ErrorThresholds {
                error_rate: 0.5,
                minimum_calls: 4,
            }),
            ..Default::default()
        };
        let cb = breaker(config);

        succeed(&cb).await;
        succeed(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_allows_limited_requests() {
        let cb = breaker(half_open_config());

        for _ in 0..2 {
            fail(&cb).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = cb.try_acquire().await.expect("first probe");
        assert!(first.is_probe());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        let _second = cb.try_acquire().await.expect("second probe");

        // Probes are capped at success_threshold
        assert!(cb.try_acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_half_open_closes_on_success() {
        let cb = breaker(half_open_config());

        for _ in 0..2 {
            fail(&cb).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        succeed(&cb).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        succeed(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_failure() {
        let cb = breaker(half_open_config());

        for _ in 0..2 {
            fail(&cb).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let permit = cb.try_acquire().await.expect("probe");
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_failure(permit).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_dropped_half_open_permit_frees_its_slot() {
        let cb = breaker(half_open_config());
        cb.force_state(CircuitState::HalfOpen, "test").await.unwrap();

        drop(cb.try_acquire().await.expect("first probe"));
        drop(cb.try_acquire().await.expect("second probe"));

        // Both slots are free again, so two probes can still close the circuit
        succeed(&cb).await;
        succeed(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_half_open_call_frees_its_slot() {
        let cb = breaker(half_open_config());
        cb.force_state(CircuitState::HalfOpen, "test").await.unwrap();

        for _ in 0..2 {
            let slow = cb.execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            });
            assert!(tokio::time::timeout(Duration::from_millis(10), slow)
                .await
                .is_err());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = cb.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_outcome_from_earlier_state_is_ignored() {
        let cb = breaker(half_open_config());

        let closed_era = cb.try_acquire().await.expect("admitted while closed");
        assert!(!closed_era.is_probe());

        cb.force_state(CircuitState::HalfOpen, "test").await.unwrap();
        let probe = cb.try_acquire().await.expect("probe");

        cb.record_success(closed_era).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // The late success neither counted as a probe nor freed a slot
        let _second = cb.try_acquire().await.expect("second probe");
        assert!(cb.try_acquire().await.is_none());

        cb.record_success(probe).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert_eq!(cb.metrics().await.successful_requests, 2);
    }

    #[tokio::test]
    async fn test_metrics_tracking() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let cb = breaker(config);

        succeed(&cb).await;
        fail(&cb).await;
        fail(&cb).await;

        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.try_acquire().await.is_none());

        let metrics = cb.metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.rejected_requests, 1);
        assert_eq!(metrics.circuit_opened_count, 1);
    }

    #[tokio::test]
    async fn test_execute_passes_through_result() {
        let cb = breaker(CircuitBreakerConfig::default());

        let ok: std::result::Result<u32, ProtectedCallError<String>> =
            cb.execute(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = cb
            .execute(|| async { Err::<u32, _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err.into_operation_error(), Some("boom".to_string()));

        let metrics = cb.metrics().await;
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_execute_rejects_without_calling_when_open() {
        let cb = breaker(CircuitBreakerConfig::default());
        cb.force_state(CircuitState::Open, "test").await.unwrap();

        let mut called = false;
        let result = cb
            .execute(|| {
                called = true;
                async { Ok::<_, String>(()) }
            })
            .await;

        assert!(!called);
        assert!(matches!(
            result,
            Err(ProtectedCallError::Rejected {
                state: CircuitState::Open,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let config = CircuitBreakerConfig {
            timeout_ms: 20,
            ..Default::default()
        };
        let cb = breaker(config);

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(ProtectedCallError::Timeout { timeout_ms: 20, .. })
        ));
        let metrics = cb.metrics().await;
        assert_eq!(metrics.timeout_count, 1);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_force_state_publishes_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let cb = CircuitBreaker::new("db:query".to_string(), CircuitBreakerConfig::default(), bus);

        cb.force_state(CircuitState::Open, "maintenance").await.unwrap();
        assert_eq!(cb.state().await, CircuitState::Open);

        match rx.recv().await.unwrap() {
            ResilienceEvent::StateChanged {
                key, from, to, reason, ..
            } => {
                assert_eq!(key, "db:query");
                assert_eq!(from, CircuitState::Closed);
                assert_eq!(to, CircuitState::Open);
                assert_eq!(reason, "forced: maintenance");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let cb = breaker(CircuitBreakerConfig::default());

        let updated = cb
            .update_config(&CircuitBreakerOverrides {
                failure_threshold: Some(9),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.failure_threshold, 9);
        assert_eq!(cb.config().await.failure_threshold, 9);

        let invalid = cb
            .update_config(&CircuitBreakerOverrides {
                success_threshold: Some(0),
                ..Default::default()
            })
            .await;
        assert!(invalid.is_err());
        assert_eq!(cb.config().await.success_threshold, 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let cb = breaker(CircuitBreakerConfig::default());

        cb.shutdown().await.unwrap();
        assert!(cb.is_shut_down().await);
        assert!(cb.try_acquire().await.is_none());
        assert!(matches!(
            cb.shutdown().await,
            Err(ResilienceError::BreakerShutdown(_))
        ));
        assert!(cb.force_state(CircuitState::Open, "late").await.is_err());
        assert!(cb
            .update_config(&CircuitBreakerOverrides::default())
            .await
            .is_err());
    }
}
