use super::types::CircuitState;
use serde::{Deserialize, Serialize};

/// Entry filter for bulk operations.
///
/// Each present list matches if any of its values matches; all present
/// lists must match. An absent or empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkFilter {
    pub services: Option<Vec<String>>,
    pub operations: Option<Vec<String>>,
    pub states: Option<Vec<CircuitState>>,
    pub tags: Option<Vec<String>>,
}

fn list_matches<T: PartialEq>(list: &Option<Vec<T>>, value: &T) -> bool {
    match list {
        Some(values) if !values.is_empty() => values.contains(value),
        _ => true,
    }
}

impl BulkFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn services(services: &[&str]) -> Self {
        Self {
            services: Some(services.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn with_operations(mut self, operations: &[&str]) -> Self {
        self.operations = Some(operations.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_states(mut self, states: &[CircuitState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = Some(tags.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Whether the filter needs the breaker's live state
    pub fn needs_state(&self) -> bool {
        self.states.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Match on everything but state
    pub fn matches_static(&self, service: &str, operation: &str, tags: &[String]) -> bool {
        let service = service.to_string();
        let operation = operation.to_string();

        list_matches(&self.services, &service)
            && list_matches(&self.operations, &operation)
            && match &self.tags {
                Some(wanted) if !wanted.is_empty() => wanted.iter().any(|t| tags.contains(t)),
                _ => true,
            }
    }

    pub fn matches_state(&self, state: CircuitState) -> bool {
        list_matches(&self.states, &state)
    }
}

/// One entry a bulk operation could not process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of a bulk operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub successful: Vec<String>,
    pub failed: Vec<BulkFailure>,
    pub total_processed: usize,
    pub duration_ms: u64,
}

/// Outcome of an idle cleanup or registry shutdown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub removed: Vec<String>,
    pub failed: Vec<BulkFailure>,
}
