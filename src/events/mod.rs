//! In-process event bus for resilience events.
//!
//! Publishing never fails the caller. Events emitted while nobody is
//! subscribed are dropped.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use crate::classifier::{ErrorClassification, ErrorInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

pub const TOPIC_ERROR_CLASSIFIED: &str = "resilience.error_classified";
pub const TOPIC_STATE_CHANGED: &str = "circuit_breaker.state_changed";
pub const TOPIC_CONFIG_UPDATED: &str = "circuit_breaker.config_updated";
pub const TOPIC_BREAKER_SHUTDOWN: &str = "circuit_breaker.shutdown";

/// Source tag carried by events the manager emits
pub const MANAGER_SOURCE: &str = "circuit-breaker-manager";

pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// Resilience events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum ResilienceEvent {
    /// A failed protected call was classified
    #[serde(rename = "resilience.error_classified")]
    ErrorClassified {
        service: String,
        operation: String,
        classification: ErrorClassification,
        error: ErrorInfo,
        timestamp: DateTime<Utc>,
        source: String,
    },

    /// A breaker moved between states
    #[serde(rename = "circuit_breaker.state_changed")]
    StateChanged {
        key: String,
        from: CircuitState,
        to: CircuitState,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A breaker's configuration was replaced at runtime
    #[serde(rename = "circuit_breaker.config_updated")]
    ConfigUpdated {
        key: String,
        config: CircuitBreakerConfig,
        timestamp: DateTime<Utc>,
    },

    /// A breaker was shut down
    #[serde(rename = "circuit_breaker.shutdown")]
    BreakerShutdown {
        key: String,
        timestamp: DateTime<Utc>,
    },
}

impl ResilienceEvent {
    /// Topic name of this event
    pub fn topic(&self) -> &'static str {
        match self {
            ResilienceEvent::ErrorClassified { .. } => TOPIC_ERROR_CLASSIFIED,
            ResilienceEvent::StateChanged { .. } => TOPIC_STATE_CHANGED,
            ResilienceEvent::ConfigUpdated { .. } => TOPIC_CONFIG_UPDATED,
            ResilienceEvent::BreakerShutdown { .. } => TOPIC_BREAKER_SHUTDOWN,
        }
    }
}

/// Broadcast bus shared by the manager and every breaker it creates
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, returning the number of subscribers that received it
    pub fn publish(&self, event: ResilienceEvent) -> usize {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(topic, "No subscribers for event");
                0
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}
