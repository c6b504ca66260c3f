pub mod breaker;
pub mod bulk;
pub mod factory;
pub mod health;
pub mod manager;
pub mod pattern;
pub mod types;

pub use breaker::{CallPermit, CircuitBreaker};
pub use bulk::{BulkFailure, BulkFilter, BulkOperationResult, CleanupResult};
pub use factory::CircuitBreakerFactory;
pub use health::{HealthSummary, ServiceHealth};
pub use manager::{registry_key, CircuitBreakerManager, EntryInfo, ManagerOptions, ResolvedConfig};
pub use pattern::{builtin_patterns, CircuitBreakerPattern, NameMatcher, PatternSet};
pub use types::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerOverrides, CircuitState,
    DegradationMode, ErrorThresholds,
};
