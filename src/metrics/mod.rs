use crate::classifier::ErrorSeverity;
use crate::error::{ResilienceError, Result};
use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService")
            .field("handle", &"<PrometheusHandle>")
            .finish()
    }
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            ResilienceError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "resilience_protected_calls_total",
            "Total number of calls executed through a circuit breaker"
        );
        describe_histogram!(
            "resilience_protected_call_duration_seconds",
            "Latency of protected calls in seconds"
        );
        describe_counter!(
            "resilience_errors_classified_total",
            "Total number of failed calls classified by severity"
        );
        describe_gauge!(
            "resilience_circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
        );
        describe_counter!(
            "resilience_circuit_breaker_transitions_total",
            "Total number of circuit breaker state transitions"
        );
        describe_gauge!(
            "resilience_circuit_breakers",
            "Number of registered circuit breakers"
        );
        describe_counter!(
            "resilience_bulk_operations_total",
            "Total number of entries processed by bulk operations"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record the outcome of a protected call
pub fn record_protected_call(key: &str, outcome: &str, duration: f64) {
    let labels = [("key", key.to_string()), ("outcome", outcome.to_string())];

    counter!("resilience_protected_calls_total", &labels).increment(1);
    histogram!("resilience_protected_call_duration_seconds", &labels).record(duration);
}

/// Record a classified error
pub fn record_error_classified(key: &str, severity: ErrorSeverity) {
    let labels = [
        ("key", key.to_string()),
        ("severity", severity.to_string()),
    ];
    counter!("resilience_errors_classified_total", &labels).increment(1);
}

/// Record circuit breaker state
/// State: 0 = Closed, 1 = Open, 2 = HalfOpen
pub fn record_circuit_breaker_state(key: &str, state: u8) {
    let labels = [("key", key.to_string())];
    gauge!("resilience_circuit_breaker_state", &labels).set(state as f64);
}

/// Record circuit breaker transition
pub fn record_circuit_breaker_transition(key: &str, from_state: &str, to_state: &str) {
    let labels = [
        ("key", key.to_string()),
        ("from", from_state.to_string()),
        ("to", to_state.to_string()),
    ];
    counter!("resilience_circuit_breaker_transitions_total", &labels).increment(1);
}

/// Record registry size
pub fn record_registry_size(count: usize) {
    gauge!("resilience_circuit_breakers").set(count as f64);
}

/// Record a bulk operation result
pub fn record_bulk_operation(operation: &str, successful: usize, failed: usize) {
    let ok = [
        ("operation", operation.to_string()),
        ("result", "success".to_string()),
    ];
    let err = [
        ("operation", operation.to_string()),
        ("result", "failure".to_string()),
    ];
    counter!("resilience_bulk_operations_total", &ok).increment(successful as u64);
    counter!("resilience_bulk_operations_total", &err).increment(failed as u64);
}

#[derive(Debug, Default)]
struct KeyCounters {
    errors: AtomicU64,
    recoveries: AtomicU64,
}

/// Counters for every protected call made through one manager
#[derive(Debug, Default)]
pub struct ResilienceMetrics {
    calls: AtomicU64,
    errors: AtomicU64,
    recoveries: AtomicU64,
    per_key: DashMap<String, KeyCounters>,
}

/// Per-key counters in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    pub calls: u64,
    pub errors: u64,
    pub recoveries: u64,
    pub error_rate: f64,
}

/// Point-in-time copy of [`ResilienceMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceMetricsSnapshot {
    pub total_calls: u64,
    pub errors: u64,
    pub recoveries: u64,
    pub error_rate: f64,
    pub recovery_rate: f64,
    pub per_key: BTreeMap<String, KeyMetrics>,
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl ResilienceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a successful protected call
    pub fn record_recovery(&self, key: &str) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.per_key
            .entry(key.to_string())
            .or_default()
            .recoveries
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed protected call
    pub fn record_error(&self, key: &str) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.per_key
            .entry(key.to_string())
            .or_default()
            .errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ResilienceMetricsSnapshot {
        let total_calls = self.calls.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let recoveries = self.recoveries.load(Ordering::Relaxed);

        let per_key = self
            .per_key
            .iter()
            .map(|entry| {
                let errors = entry.errors.load(Ordering::Relaxed);
                let recoveries = entry.recoveries.load(Ordering::Relaxed);
                let calls = errors + recoveries;
                (
                    entry.key().clone(),
                    KeyMetrics {
                        calls,
                        errors,
                        recoveries,
                        error_rate: ratio(errors, calls),
                    },
                )
            })
            .collect();

        ResilienceMetricsSnapshot {
            total_calls,
            errors,
            recoveries,
            error_rate: ratio(errors, total_calls),
            recovery_rate: ratio(recoveries, total_calls),
            per_key,
        }
    }
}
