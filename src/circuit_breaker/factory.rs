use super::breaker::CircuitBreaker;
use super::types::CircuitBreakerConfig;
use crate::events::EventBus;
use std::sync::Arc;

/// Builds circuit breakers wired to a shared event bus
#[derive(Debug, Clone)]
pub struct CircuitBreakerFactory {
    event_bus: EventBus,
}

impl CircuitBreakerFactory {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }

    pub fn create(&self, key: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            key.to_string(),
            config,
            self.event_bus.clone(),
        ))
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}
