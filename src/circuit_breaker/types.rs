use crate::error::{ResilienceError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on outcomes kept in a breaker's sliding window
pub const MAX_WINDOW_SAMPLES: usize = 4096;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, allowing probe requests
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by the metrics exporter
    pub fn as_gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// What a caller gets while the breaker is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    /// Reject immediately
    FailFast,
    /// Serve the caller-provided fallback
    UseFallback,
}

/// Error-rate trip rule evaluated over the monitoring window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorThresholds {
    /// Failure ratio (0.0 - 1.0] at which the circuit opens
    pub error_rate: f64,
    /// Calls required in the window before the ratio is considered
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,
}

fn default_minimum_calls() -> u32 {
    10
}

/// Fully resolved circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures inside the monitoring window before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Timeout for individual calls in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Duration to wait in open state before transitioning to half-open
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Consecutive successes in half-open state before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Sliding window over which failures are counted
    #[serde(default = "default_monitoring_window_ms")]
    pub monitoring_window_ms: u64,

    /// Interval for health checks of this breaker
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default)]
    pub degradation_mode: Option<DegradationMode>,

    #[serde(default)]
    pub error_thresholds: Option<ErrorThresholds>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_success_threshold() -> u32 {
    2
}

fn default_monitoring_window_ms() -> u64 {
    60_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_ms: default_timeout_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
            monitoring_window_ms: default_monitoring_window_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            degradation_mode: None,
            error_thresholds: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }

    /// Effective degradation mode (fail fast unless configured otherwise)
    pub fn degradation(&self) -> DegradationMode {
        self.degradation_mode.unwrap_or(DegradationMode::FailFast)
    }

    /// Return a copy with every field present in `overrides` replaced
    pub fn merged(&self, overrides: &CircuitBreakerOverrides) -> Self {
        Self {
            failure_threshold: overrides.failure_threshold.unwrap_or(self.failure_threshold),
            timeout_ms: overrides.timeout_ms.unwrap_or(self.timeout_ms),
            reset_timeout_ms: overrides.reset_timeout_ms.unwrap_or(self.reset_timeout_ms),
            success_threshold: overrides.success_threshold.unwrap_or(self.success_threshold),
            monitoring_window_ms: overrides
                .monitoring_window_ms
                .unwrap_or(self.monitoring_window_ms),
            health_check_interval_ms: overrides
                .health_check_interval_ms
                .unwrap_or(self.health_check_interval_ms),
            degradation_mode: overrides.degradation_mode.or(self.degradation_mode),
            error_thresholds: overrides.error_thresholds.or(self.error_thresholds),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be > 0".to_string(),
            ));
        }
        if self.failure_threshold as usize > MAX_WINDOW_SAMPLES {
            return Err(ResilienceError::InvalidConfig(format!(
                "failure_threshold must be <= {}, got {}",
                MAX_WINDOW_SAMPLES, self.failure_threshold
            )));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "success_threshold must be > 0".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ResilienceError::InvalidConfig(
                "timeout_ms must be > 0".to_string(),
            ));
        }
        if self.monitoring_window_ms == 0 {
            return Err(ResilienceError::InvalidConfig(
                "monitoring_window_ms must be > 0".to_string(),
            ));
        }
        if let Some(thresholds) = &self.error_thresholds {
            if !(thresholds.error_rate > 0.0 && thresholds.error_rate <= 1.0) {
                return Err(ResilienceError::InvalidConfig(format!(
                    "error_rate must be in (0, 1], got {}",
                    thresholds.error_rate
                )));
            }
            if thresholds.minimum_calls as usize > MAX_WINDOW_SAMPLES {
                return Err(ResilienceError::InvalidConfig(format!(
                    "minimum_calls must be <= {}, got {}",
                    MAX_WINDOW_SAMPLES, thresholds.minimum_calls
                )));
            }
        }
        Ok(())
    }
}

/// Partial configuration used for every layer above the base defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub reset_timeout_ms: Option<u64>,
    pub success_threshold: Option<u32>,
    pub monitoring_window_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub degradation_mode: Option<DegradationMode>,
    pub error_thresholds: Option<ErrorThresholds>,
}

impl CircuitBreakerOverrides {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of admitted requests
    pub total_requests: u64,
    /// Number of successful requests
    pub successful_requests: u64,
    /// Number of failed requests (timeouts included)
    pub failed_requests: u64,
    /// Number of requests rejected (circuit open)
    pub rejected_requests: u64,
    /// Number of timeouts
    pub timeout_count: u64,
    /// Number of times circuit opened
    pub circuit_opened_count: u64,
    /// Number of times circuit closed
    pub circuit_closed_count: u64,
    /// Number of times circuit half-opened
    pub circuit_half_opened_count: u64,
}
