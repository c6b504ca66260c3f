//! Registry and orchestration over many circuit breakers.
//!
//! Breakers are keyed by `"{service}:{operation}"` and created on first use.
//! Configuration for a new breaker is resolved in layers, each replacing the
//! fields it sets: base defaults, the service's defaults, the first matching
//! pattern, then caller overrides. State transitions belong to the breakers;
//! the manager only reads state for reporting and forces it when an error is
//! classified as critical or fatal.

use super::breaker::CircuitBreaker;
use super::bulk::{BulkFailure, BulkFilter, BulkOperationResult, CleanupResult};
use super::factory::CircuitBreakerFactory;
use super::health::{BreakerHealth, HealthSummary};
use super::pattern::{CircuitBreakerPattern, PatternSet};
use super::types::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerOverrides, CircuitState,
    DegradationMode,
};
use crate::classifier::{ErrorClassifier, ErrorContext, ErrorInfo, RuleBasedClassifier};
use crate::error::{ProtectedCallError, ResilienceError, Result};
use crate::events::{EventBus, ResilienceEvent, MANAGER_SOURCE};
use crate::metrics::{self, ResilienceMetrics, ResilienceMetricsSnapshot};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60 * 60);

/// Registry key for a service/operation pair
pub fn registry_key(service: &str, operation: &str) -> String {
    format!("{}:{}", service, operation)
}

/// Construction parameters for [`CircuitBreakerManager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub base_config: CircuitBreakerConfig,
    /// Keyed by exact service name
    pub service_defaults: HashMap<String, CircuitBreakerOverrides>,
    pub patterns: Vec<CircuitBreakerPattern>,
    pub health_check_interval: Duration,
    /// Idle time after which the health monitor removes a breaker
    pub idle_cleanup_after: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            base_config: CircuitBreakerConfig::default(),
            service_defaults: HashMap::new(),
            patterns: super::pattern::builtin_patterns(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            idle_cleanup_after: None,
        }
    }
}

/// A resolved configuration and the layers it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub config: CircuitBreakerConfig,
    pub pattern_id: Option<String>,
    pub pattern_tags: Vec<String>,
    pub sources: Vec<String>,
}

#[derive(Debug)]
struct CircuitBreakerEntry {
    service: String,
    operation: String,
    breaker: Arc<CircuitBreaker>,
    config: CircuitBreakerConfig,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    usage_count: u64,
    tags: Vec<String>,
    metadata: Map<String, Value>,
    pattern_id: Option<String>,
}

impl CircuitBreakerEntry {
    fn touch(&mut self) {
        self.last_used = Utc::now();
        self.usage_count += 1;
    }

    fn add_tags<I: IntoIterator<Item = String>>(&mut self, tags: I) {
        for tag in tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }
}

/// Serializable view of one registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub key: String,
    pub service: String,
    pub operation: String,
    pub state: CircuitState,
    pub config: CircuitBreakerConfig,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub pattern_id: Option<String>,
    pub metrics: CircuitBreakerMetrics,
}

#[derive(Debug)]
struct Rules {
    service_defaults: HashMap<String, CircuitBreakerOverrides>,
    patterns: PatternSet,
}

#[derive(Debug)]
struct Monitor {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Registry of circuit breakers keyed by `service:operation`
pub struct CircuitBreakerManager {
    entries: DashMap<String, CircuitBreakerEntry>,
    rules: RwLock<Rules>,
    base_config: CircuitBreakerConfig,
    factory: CircuitBreakerFactory,
    classifier: Arc<dyn ErrorClassifier>,
    event_bus: EventBus,
    metrics: ResilienceMetrics,
    health_cache: RwLock<Option<HealthSummary>>,
    monitor: Mutex<Option<Monitor>>,
    health_check_interval: Duration,
    idle_cleanup_after: Option<Duration>,
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("entries", &self.entries.len())
            .field("base_config", &self.base_config)
            .field("classifier", &"<dyn ErrorClassifier>")
            .field("health_check_interval", &self.health_check_interval)
            .finish()
    }
}

impl CircuitBreakerManager {
    pub fn new(
        options: ManagerOptions,
        event_bus: EventBus,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        let base_config = match options.base_config.validate() {
            Ok(()) => options.base_config,
            Err(e) => {
                warn!(error = %e, "Invalid base circuit breaker config, using built-in defaults");
                CircuitBreakerConfig::default()
            }
        };

        let health_check_interval = if options.health_check_interval.is_zero() {
            warn!(
                default_ms = DEFAULT_HEALTH_CHECK_INTERVAL.as_millis() as u64,
                "Health check interval must be non-zero, using default"
            );
            DEFAULT_HEALTH_CHECK_INTERVAL
        } else {
            options.health_check_interval
        };

        info!(
            patterns = options.patterns.len(),
            service_defaults = options.service_defaults.len(),
            health_check_interval_ms = health_check_interval.as_millis() as u64,
            "Circuit breaker manager created"
        );

        Self {
            entries: DashMap::new(),
            rules: RwLock::new(Rules {
                service_defaults: options.service_defaults,
                patterns: PatternSet::new(options.patterns),
            }),
            base_config,
            factory: CircuitBreakerFactory::new(event_bus.clone()),
            classifier,
            event_bus,
            metrics: ResilienceMetrics::new(),
            health_cache: RwLock::new(None),
            monitor: Mutex::new(None),
            health_check_interval,
            idle_cleanup_after: options.idle_cleanup_after,
        }
    }

    /// Manager with built-in patterns, a default bus, and the rule-based classifier
    pub fn with_defaults() -> Self {
        Self::new(
            ManagerOptions::default(),
            EventBus::default(),
            Arc::new(RuleBasedClassifier::default()),
        )
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn base_config(&self) -> &CircuitBreakerConfig {
        &self.base_config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the configuration a new breaker for this pair would get
    pub async fn resolve_config(
        &self,
        service: &str,
        operation: &str,
        overrides: Option<&CircuitBreakerOverrides>,
    ) -> ResolvedConfig {
        let rules = self.rules.read().await;

        let mut config = self.base_config.clone();
        let mut sources = vec!["base".to_string()];

        if let Some(defaults) = rules.service_defaults.get(service) {
            config = config.merged(defaults);
            sources.push(format!("service:{}", service));
        }

        let pattern = rules.patterns.find_match(service, operation);
        if let Some(pattern) = pattern {
            config = config.merged(&pattern.config);
            sources.push(format!("pattern:{}", pattern.id));
        }
        let pattern_id = pattern.map(|p| p.id.clone());
        let pattern_tags = pattern.map(|p| p.tags.clone()).unwrap_or_default();

        if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
            config = config.merged(overrides);
            sources.push("overrides".to_string());
        }

        if let Err(e) = config.validate() {
            warn!(
                key = %registry_key(service, operation),
                error = %e,
                "Resolved circuit breaker config is invalid, falling back to base defaults"
            );
            return ResolvedConfig {
                config: self.base_config.clone(),
                pattern_id: None,
                pattern_tags: Vec::new(),
                sources: vec!["base".to_string()],
            };
        }

        ResolvedConfig {
            config,
            pattern_id,
            pattern_tags,
            sources,
        }
    }

    /// Existing breaker for the pair, or a newly configured and registered one.
    ///
    /// Overrides only apply when the breaker is created.
    pub async fn get_circuit_breaker(
        &self,
        service: &str,
        operation: &str,
        overrides: Option<&CircuitBreakerOverrides>,
    ) -> Arc<CircuitBreaker> {
        let key = registry_key(service, operation);

        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.touch();
            return entry.breaker.clone();
        }

        let resolved = self.resolve_config(service, operation, overrides).await;
        let pattern_id = resolved.pattern_id.clone();

        let mut created = false;
        let breaker = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
                created = true;
                let now = Utc::now();
                let mut metadata = Map::new();
                metadata.insert("config_sources".to_string(), json!(resolved.sources));
                CircuitBreakerEntry {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    breaker: self.factory.create(&key, resolved.config.clone()),
                    config: resolved.config,
                    created_at: now,
                    last_used: now,
                    usage_count: 1,
                    tags: resolved.pattern_tags,
                    metadata,
                    pattern_id: resolved.pattern_id,
                }
            });
            if !created {
                // Lost a creation race; the winner's breaker is used
                entry.touch();
            }
            entry.breaker.clone()
        };

        if created {
            if let Some(id) = &pattern_id {
                self.rules.write().await.patterns.record_usage(id);
            }
            debug!(key = %key, pattern = ?pattern_id, "Registered circuit breaker");
            metrics::record_registry_size(self.entries.len());
        }

        breaker
    }

    /// Run `f` through the breaker for `service:operation`.
    ///
    /// Failures are classified and published. Critical and fatal errors force
    /// the breaker open. The error is always returned to the caller; an
    /// operation error is returned unchanged inside
    /// [`ProtectedCallError::Operation`].
    pub async fn execute_with_protection<F, Fut, T, E>(
        &self,
        service: &str,
        operation: &str,
        f: F,
        overrides: Option<&CircuitBreakerOverrides>,
    ) -> std::result::Result<T, ProtectedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let key = registry_key(service, operation);
        let breaker = self.get_circuit_breaker(service, operation, overrides).await;

        let started = Instant::now();
        let result = breaker.execute(f).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(_) => {
                self.metrics.record_recovery(&key);
                metrics::record_protected_call(&key, "success", elapsed);
                self.record_pattern_outcome(&key, true).await;
            }
            Err(error) => {
                let outcome = match error {
                    ProtectedCallError::Rejected { .. } => "rejected",
                    ProtectedCallError::Timeout { .. } => "timeout",
                    ProtectedCallError::Operation(_) => "error",
                };
                metrics::record_protected_call(&key, outcome, elapsed);
                self.handle_failure(service, operation, &key, &breaker, error)
                    .await;
            }
        }

        result
    }

    /// Like [`execute_with_protection`](Self::execute_with_protection), but serves
    /// `fallback` when the breaker rejects the call and its degradation mode
    /// is `use_fallback`.
    pub async fn execute_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        service: &str,
        operation: &str,
        f: F,
        fallback: FB,
    ) -> std::result::Result<T, ProtectedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = T>,
        E: Display,
    {
        match self
            .execute_with_protection(service, operation, f, None)
            .await
        {
            Err(ProtectedCallError::Rejected { key, state }) => {
                let mode = self
                    .entries
                    .get(&key)
                    .map(|entry| entry.config.degradation())
                    .unwrap_or(DegradationMode::FailFast);

                if mode == DegradationMode::UseFallback {
                    debug!(key = %key, state = %state, "Circuit breaker rejected call, serving fallback");
                    Ok(fallback().await)
                } else {
                    Err(ProtectedCallError::Rejected { key, state })
                }
            }
            other => other,
        }
    }

    async fn handle_failure<E: Display>(
        &self,
        service: &str,
        operation: &str,
        key: &str,
        breaker: &CircuitBreaker,
        error: &ProtectedCallError<E>,
    ) {
        // Key-free messages so service names never steer classification
        let info = match error {
            ProtectedCallError::Rejected { state, .. } => ErrorInfo::new(
                "CircuitOpen",
                format!("circuit open: call rejected in state {}", state),
            ),
            ProtectedCallError::Timeout { timeout_ms, .. } => {
                ErrorInfo::new("Timeout", format!("call timed out after {}ms", timeout_ms))
            }
            ProtectedCallError::Operation(e) => {
                ErrorInfo::new(short_type_name::<E>(), e.to_string())
            }
        };
        let rejected = matches!(error, ProtectedCallError::Rejected { .. });

        let usage_count = self
            .entries
            .get(key)
            .map(|entry| entry.usage_count)
            .unwrap_or_default();
        let context = ErrorContext {
            service: service.to_string(),
            operation: operation.to_string(),
            key: key.to_string(),
            state: breaker.state().await,
            usage_count,
            timestamp: Utc::now(),
        };

        let classification = self.classifier.classify(&info, &context);
        metrics::record_error_classified(key, classification.severity);

        if classification.severity.forces_open() && !rejected {
            let reason = format!("{} error: {}", classification.severity, info.message);
            match breaker.force_state(CircuitState::Open, &reason).await {
                Ok(()) => warn!(
                    key = %key,
                    severity = %classification.severity,
                    error = %info.message,
                    "Forced circuit breaker open"
                ),
                Err(e) => warn!(key = %key, error = %e, "Could not force circuit breaker open"),
            }
        }

        self.event_bus.publish(ResilienceEvent::ErrorClassified {
            service: service.to_string(),
            operation: operation.to_string(),
            classification,
            error: info,
            timestamp: context.timestamp,
            source: MANAGER_SOURCE.to_string(),
        });

        self.metrics.record_error(key);
        self.record_pattern_outcome(key, false).await;
    }

    async fn record_pattern_outcome(&self, key: &str, success: bool) {
        let pattern_id = self
            .entries
            .get(key)
            .and_then(|entry| entry.pattern_id.clone());
        if let Some(id) = pattern_id {
            self.rules.write().await.patterns.record_outcome(&id, success);
        }
    }

    /// Entries matching `filter`, sorted by key
    async fn select(&self, filter: &BulkFilter) -> Vec<(String, Arc<CircuitBreaker>)> {
        let mut candidates: Vec<(String, Arc<CircuitBreaker>)> = self
            .entries
            .iter()
            .filter(|entry| filter.matches_static(&entry.service, &entry.operation, &entry.tags))
            .map(|entry| (entry.key().clone(), entry.breaker.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        if !filter.needs_state() {
            return candidates;
        }

        let mut selected = Vec::with_capacity(candidates.len());
        for (key, breaker) in candidates {
            if filter.matches_state(breaker.state().await) {
                selected.push((key, breaker));
            }
        }
        selected
    }

    /// Force every matching breaker into `state`
    pub async fn bulk_force_state(
        &self,
        filter: &BulkFilter,
        state: CircuitState,
        reason: &str,
    ) -> BulkOperationResult {
        let started = Instant::now();
        let mut result = BulkOperationResult::default();

        for (key, breaker) in self.select(filter).await {
            match breaker.force_state(state, reason).await {
                Ok(()) => result.successful.push(key),
                Err(e) => result.failed.push(BulkFailure {
                    key,
                    error: e.to_string(),
                }),
            }
        }

        finish_bulk(result, started, "force_state")
    }

    /// Merge `updates` into every matching breaker's configuration
    pub async fn bulk_update_config(
        &self,
        filter: &BulkFilter,
        updates: &CircuitBreakerOverrides,
    ) -> BulkOperationResult {
        let started = Instant::now();
        let mut result = BulkOperationResult::default();

        for (key, breaker) in self.select(filter).await {
            match breaker.update_config(updates).await {
                Ok(updated) => {
                    if let Some(mut entry) = self.entries.get_mut(&key) {
                        entry.config = updated;
                    }
                    result.successful.push(key);
                }
                Err(e) => result.failed.push(BulkFailure {
                    key,
                    error: e.to_string(),
                }),
            }
        }

        finish_bulk(result, started, "update_config")
    }

    /// Recompute health over every registered breaker and cache the result
    pub async fn get_health_summary(&self) -> HealthSummary {
        let snapshot: Vec<(String, String, Arc<CircuitBreaker>)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.service.clone(),
                    entry.breaker.clone(),
                )
            })
            .collect();

        let mut breakers = Vec::with_capacity(snapshot.len());
        for (key, service, breaker) in snapshot {
            breakers.push(BreakerHealth {
                key,
                service,
                state: breaker.state().await,
            });
        }

        let summary = HealthSummary::compute(breakers);
        *self.health_cache.write().await = Some(summary.clone());
        summary
    }

    /// Summary computed by the last health check, if any
    pub async fn cached_health_summary(&self) -> Option<HealthSummary> {
        self.health_cache.read().await.clone()
    }

    /// Shut down and remove every breaker unused for longer than `max_idle`
    pub async fn cleanup(&self, max_idle: Duration) -> CleanupResult {
        let mut result = CleanupResult::default();

        let cutoff = match chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        {
            Some(cutoff) => cutoff,
            None => return result,
        };

        let mut idle: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.last_used < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        idle.sort();

        for key in idle {
            // Re-checked under the shard lock; the entry may have been used since
            let Some((key, entry)) = self
                .entries
                .remove_if(&key, |_, entry| entry.last_used < cutoff)
            else {
                continue;
            };

            match entry.breaker.shutdown().await {
                Ok(()) => debug!(key = %key, "Removed idle circuit breaker"),
                Err(e) => result.failed.push(BulkFailure {
                    key: key.clone(),
                    error: e.to_string(),
                }),
            }
            result.removed.push(key);
        }

        if !result.removed.is_empty() {
            info!(
                removed = result.removed.len(),
                failed = result.failed.len(),
                "Cleaned up idle circuit breakers"
            );
            metrics::record_registry_size(self.entries.len());
        }

        result
    }

    /// Shut down and remove one breaker
    pub async fn remove_circuit_breaker(&self, service: &str, operation: &str) -> Result<()> {
        let key = registry_key(service, operation);
        let (_, entry) = self
            .entries
            .remove(&key)
            .ok_or_else(|| ResilienceError::NotFound(format!("circuit breaker {}", key)))?;

        metrics::record_registry_size(self.entries.len());
        info!(key = %key, "Removed circuit breaker");
        entry.breaker.shutdown().await
    }

    /// Insert or replace a pattern by id. Returns true when an existing pattern was replaced.
    pub async fn add_pattern(&self, pattern: CircuitBreakerPattern) -> Result<bool> {
        pattern.validate()?;
        let id = pattern.id.clone();
        let replaced = self.rules.write().await.patterns.upsert(pattern);
        info!(pattern = %id, replaced, "Circuit breaker pattern registered");
        Ok(replaced)
    }

    pub async fn remove_pattern(&self, id: &str) -> Option<CircuitBreakerPattern> {
        self.rules.write().await.patterns.remove(id)
    }

    /// Patterns in match order
    pub async fn patterns(&self) -> Vec<CircuitBreakerPattern> {
        self.rules.read().await.patterns.as_slice().to_vec()
    }

    pub async fn find_matching_pattern(
        &self,
        service: &str,
        operation: &str,
    ) -> Option<CircuitBreakerPattern> {
        self.rules
            .read()
            .await
            .patterns
            .find_match(service, operation)
            .cloned()
    }

    pub async fn set_service_defaults(&self, service: &str, defaults: CircuitBreakerOverrides) {
        self.rules
            .write()
            .await
            .service_defaults
            .insert(service.to_string(), defaults);
    }

    /// Swap service defaults and patterns. Existing breakers keep their configuration.
    pub async fn replace_rules(
        &self,
        service_defaults: HashMap<String, CircuitBreakerOverrides>,
        patterns: Vec<CircuitBreakerPattern>,
    ) -> Result<()> {
        for pattern in &patterns {
            pattern.validate()?;
        }

        let mut rules = self.rules.write().await;
        rules.service_defaults = service_defaults;
        rules.patterns = PatternSet::new(patterns);

        info!(
            patterns = rules.patterns.len(),
            service_defaults = rules.service_defaults.len(),
            "Circuit breaker rules replaced"
        );
        Ok(())
    }

    pub fn add_tags(&self, service: &str, operation: &str, tags: &[&str]) -> Result<()> {
        let key = registry_key(service, operation);
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| ResilienceError::NotFound(format!("circuit breaker {}", key)))?;
        entry.add_tags(tags.iter().map(|t| t.to_string()));
        Ok(())
    }

    /// Attach a serializable value to an entry's metadata under `name`
    pub fn set_metadata<T: Serialize>(
        &self,
        service: &str,
        operation: &str,
        name: &str,
        value: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| {
            ResilienceError::Serialization(format!("Failed to serialize metadata: {}", e))
        })?;

        let key = registry_key(service, operation);
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| ResilienceError::NotFound(format!("circuit breaker {}", key)))?;
        entry.metadata.insert(name.to_string(), value);
        Ok(())
    }

    pub async fn entry_info(&self, service: &str, operation: &str) -> Option<EntryInfo> {
        let key = registry_key(service, operation);
        let (info, breaker) = {
            let entry = self.entries.get(&key)?;
            (partial_info(&key, &entry), entry.breaker.clone())
        };
        Some(complete_info(info, &breaker).await)
    }

    /// Every entry, sorted by key
    pub async fn entries(&self) -> Vec<EntryInfo> {
        let mut partial: Vec<(EntryInfo, Arc<CircuitBreaker>)> = self
            .entries
            .iter()
            .map(|entry| (partial_info(entry.key(), &entry), entry.breaker.clone()))
            .collect();
        partial.sort_by(|a, b| a.0.key.cmp(&b.0.key));

        let mut infos = Vec::with_capacity(partial.len());
        for (info, breaker) in partial {
            infos.push(complete_info(info, &breaker).await);
        }
        infos
    }

    pub fn metrics(&self) -> ResilienceMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Start the periodic health check task. No-op when already running.
    pub async fn start_health_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            debug!("Health monitoring already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::downgrade(self);
        let period = self.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(interval_ms = period.as_millis() as u64, "Started health monitoring");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            debug!("Manager dropped, stopping health monitoring");
                            break;
                        };
                        manager.run_health_check().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Stopped health monitoring");
        });

        *monitor = Some(Monitor {
            shutdown_tx,
            handle,
        });
    }

    pub async fn stop_health_monitoring(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            let _ = monitor.shutdown_tx.send(true);
            if let Err(e) = monitor.handle.await {
                error!(error = %e, "Health monitoring task ended abnormally");
            }
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    async fn run_health_check(&self) {
        let summary = self.get_health_summary().await;

        for info in self.entries().await {
            metrics::record_circuit_breaker_state(&info.key, info.state.as_gauge());
        }

        if summary.unhealthy > 0 || summary.degraded > 0 {
            warn!(
                total = summary.total,
                unhealthy = summary.unhealthy,
                degraded = summary.degraded,
                alerts = ?summary.alerts,
                "Circuit breaker health check found open breakers"
            );
        } else {
            debug!(total = summary.total, "Circuit breaker health check passed");
        }

        if let Some(max_idle) = self.idle_cleanup_after {
            let result = self.cleanup(max_idle).await;
            for failure in &result.failed {
                error!(
                    key = %failure.key,
                    error = %failure.error,
                    "Failed to shut down idle circuit breaker"
                );
            }
        }
    }

    /// Stop monitoring, shut down every breaker concurrently, and clear the registry
    pub async fn shutdown(&self) -> CleanupResult {
        self.stop_health_monitoring().await;

        let breakers: Vec<(String, Arc<CircuitBreaker>)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.breaker.clone()))
            .collect();

        let outcomes = join_all(breakers.into_iter().map(|(key, breaker)| async move {
            let outcome = breaker.shutdown().await;
            (key, outcome)
        }))
        .await;

        self.entries.clear();
        metrics::record_registry_size(0);

        let mut result = CleanupResult::default();
        for (key, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(key = %key, error = %e, "Circuit breaker shutdown failed");
                result.failed.push(BulkFailure {
                    key: key.clone(),
                    error: e.to_string(),
                });
            }
            result.removed.push(key);
        }
        result.removed.sort();
        result.failed.sort_by(|a, b| a.key.cmp(&b.key));

        info!(
            removed = result.removed.len(),
            failed = result.failed.len(),
            "Circuit breaker manager shut down"
        );
        result
    }
}

fn finish_bulk(
    mut result: BulkOperationResult,
    started: Instant,
    operation: &str,
) -> BulkOperationResult {
    result.total_processed = result.successful.len() + result.failed.len();
    result.duration_ms = started.elapsed().as_millis() as u64;

    metrics::record_bulk_operation(operation, result.successful.len(), result.failed.len());
    info!(
        operation,
        processed = result.total_processed,
        failed = result.failed.len(),
        duration_ms = result.duration_ms,
        "Bulk circuit breaker operation finished"
    );
    result
}

fn partial_info(key: &str, entry: &CircuitBreakerEntry) -> EntryInfo {
    EntryInfo {
        key: key.to_string(),
        service: entry.service.clone(),
        operation: entry.operation.clone(),
        state: CircuitState::Closed,
        config: entry.config.clone(),
        created_at: entry.created_at,
        last_used: entry.last_used,
        usage_count: entry.usage_count,
        tags: entry.tags.clone(),
        metadata: entry.metadata.clone(),
        pattern_id: entry.pattern_id.clone(),
        metrics: CircuitBreakerMetrics::default(),
    }
}

async fn complete_info(mut info: EntryInfo, breaker: &CircuitBreaker) -> EntryInfo {
    info.state = breaker.state().await;
    info.metrics = breaker.metrics().await;
    info
}

/// Last path segment of a type name, e.g. `std::io::Error` -> `Error`
fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::pattern::NameMatcher;

    fn manager_without_patterns() -> CircuitBreakerManager {
        CircuitBreakerManager::new(
            ManagerOptions {
                patterns: Vec::new(),
                ..Default::default()
            },
            EventBus::new(64),
            Arc::new(RuleBasedClassifier::default()),
        )
    }

    #[test]
    fn test_registry_key() {
        assert_eq!(registry_key("db", "query"), "db:query");
        assert_eq!(registry_key("a:b", "c"), "a:b:c");
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<String>(), "String");
        assert_eq!(short_type_name::<Vec<u8>>(), "Vec");
    }

    #[tokio::test]
    async fn test_zero_health_check_interval_uses_default() {
        let manager = Arc::new(CircuitBreakerManager::new(
            ManagerOptions {
                health_check_interval: Duration::ZERO,
                ..Default::default()
            },
            EventBus::new(16),
            Arc::new(RuleBasedClassifier::default()),
        ));
        assert_eq!(manager.health_check_interval, DEFAULT_HEALTH_CHECK_INTERVAL);

        manager.start_health_monitoring().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let handle_finished = manager
            .monitor
            .lock()
            .await
            .as_ref()
            .map(|monitor| monitor.handle.is_finished());
        assert_eq!(handle_finished, Some(false));

        manager.stop_health_monitoring().await;
        assert!(!manager.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_same_breaker_returned_for_same_key() {
        let manager = manager_without_patterns();

        let first = manager.get_circuit_breaker("db", "query", None).await;
        let created_at = manager.entry_info("db", "query").await.unwrap().created_at;
        let second = manager.get_circuit_breaker("db", "query", None).await;

        assert!(Arc::ptr_eq(&first, &second));
        let info = manager.entry_info("db", "query").await.unwrap();
        assert_eq!(info.usage_count, 2);
        assert_eq!(info.created_at, created_at);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_overrides_ignored_for_existing_breaker() {
        let manager = manager_without_patterns();
        manager.get_circuit_breaker("db", "query", None).await;

        let overrides = CircuitBreakerOverrides {
            failure_threshold: Some(42),
            ..Default::default()
        };
        let breaker = manager
            .get_circuit_breaker("db", "query", Some(&overrides))
            .await;

        assert_eq!(breaker.config().await.failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_resolution_precedence() {
        let manager = manager_without_patterns();
        manager
            .set_service_defaults(
                "payments",
                CircuitBreakerOverrides {
                    failure_threshold: Some(7),
                    timeout_ms: Some(7_000),
                    reset_timeout_ms: Some(7_000),
                    ..Default::default()
                },
            )
            .await;
        manager
            .add_pattern(CircuitBreakerPattern::new(
                "payments-pattern",
                NameMatcher::Prefix("pay".to_string()),
                NameMatcher::Any,
                CircuitBreakerOverrides {
                    timeout_ms: Some(8_000),
                    reset_timeout_ms: Some(8_000),
                    ..Default::default()
                },
                0.8,
            ))
            .await
            .unwrap();

        let overrides = CircuitBreakerOverrides {
            reset_timeout_ms: Some(9_000),
            ..Default::default()
        };
        let resolved = manager
            .resolve_config("payments", "charge", Some(&overrides))
            .await;

        // base < service < pattern < caller
        assert_eq!(resolved.config.success_threshold, 2);
        assert_eq!(resolved.config.failure_threshold, 7);
        assert_eq!(resolved.config.timeout_ms, 8_000);
        assert_eq!(resolved.config.reset_timeout_ms, 9_000);
        assert_eq!(
            resolved.sources,
            vec!["base", "service:payments", "pattern:payments-pattern", "overrides"]
        );
        assert_eq!(resolved.pattern_id.as_deref(), Some("payments-pattern"));
    }

    #[tokio::test]
    async fn test_invalid_resolution_falls_back_to_base() {
        let manager = manager_without_patterns();
        let overrides = CircuitBreakerOverrides {
            failure_threshold: Some(0),
            ..Default::default()
        };

        let breaker = manager
            .get_circuit_breaker("db", "query", Some(&overrides))
            .await;
        assert_eq!(breaker.config().await, CircuitBreakerConfig::default());
    }

    #[tokio::test]
    async fn test_pattern_usage_is_counted_on_creation() {
        let manager = CircuitBreakerManager::with_defaults();
        manager.get_circuit_breaker("openai-llm", "chat", None).await;
        manager.get_circuit_breaker("openai-llm", "chat", None).await;
        manager.get_circuit_breaker("openai-llm", "embed", None).await;

        let patterns = manager.patterns().await;
        let llm = patterns.iter().find(|p| p.id == "llm-api-pattern").unwrap();
        assert_eq!(llm.usage_count, 2);

        let info = manager.entry_info("openai-llm", "chat").await.unwrap();
        assert_eq!(info.pattern_id.as_deref(), Some("llm-api-pattern"));
        assert!(info.tags.contains(&"llm".to_string()));
    }

    #[tokio::test]
    async fn test_add_tags_and_missing_entry() {
        let manager = manager_without_patterns();
        manager.get_circuit_breaker("db", "query", None).await;

        manager.add_tags("db", "query", &["critical", "critical"]).unwrap();
        let info = manager.entry_info("db", "query").await.unwrap();
        assert_eq!(info.tags, vec!["critical".to_string()]);

        assert!(matches!(
            manager.add_tags("db", "missing", &["x"]),
            Err(ResilienceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_metadata() {
        let manager = manager_without_patterns();
        manager.get_circuit_breaker("db", "query", None).await;

        manager
            .set_metadata("db", "query", "owner", &"storage-team")
            .unwrap();
        let info = manager.entry_info("db", "query").await.unwrap();
        assert_eq!(info.metadata["owner"], json!("storage-team"));
        assert!(info.metadata.contains_key("config_sources"));

        // Maps with non-string keys have no JSON form
        let unserializable: std::collections::BTreeMap<(u8, u8), u8> =
            [((1, 2), 3)].into_iter().collect();
        let err = manager
            .set_metadata("db", "query", "grid", &unserializable)
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Serialization(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);

        assert!(matches!(
            manager.set_metadata("db", "missing", "owner", &"x"),
            Err(ResilienceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_circuit_breaker() {
        let manager = manager_without_patterns();
        let breaker = manager.get_circuit_breaker("db", "query", None).await;

        manager.remove_circuit_breaker("db", "query").await.unwrap();
        assert!(manager.is_empty());
        assert!(breaker.is_shut_down().await);
        assert!(manager.remove_circuit_breaker("db", "query").await.is_err());
    }

    #[tokio::test]
    async fn test_health_monitoring_refreshes_cache() {
        let manager = Arc::new(CircuitBreakerManager::new(
            ManagerOptions {
                health_check_interval: Duration::from_millis(20),
                ..Default::default()
            },
            EventBus::new(64),
            Arc::new(RuleBasedClassifier::default()),
        ));
        manager.get_circuit_breaker("db", "query", None).await;

        manager.start_health_monitoring().await;
        manager.start_health_monitoring().await;
        assert!(manager.is_monitoring().await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let cached = manager.cached_health_summary().await.unwrap();
        assert_eq!(cached.total, 1);

        manager.stop_health_monitoring().await;
        assert!(!manager.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_monitor_removes_idle_breakers() {
        let manager = Arc::new(CircuitBreakerManager::new(
            ManagerOptions {
                health_check_interval: Duration::from_millis(20),
                idle_cleanup_after: Some(Duration::from_millis(10)),
                ..Default::default()
            },
            EventBus::new(64),
            Arc::new(RuleBasedClassifier::default()),
        ));
        manager.get_circuit_breaker("db", "query", None).await;

        manager.start_health_monitoring().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(manager.is_empty());
        manager.shutdown().await;
    }
}
