use crate::circuit_breaker::manager::DEFAULT_MAX_IDLE;
use crate::circuit_breaker::{
    builtin_patterns, CircuitBreakerConfig, CircuitBreakerOverrides, CircuitBreakerPattern,
    ManagerOptions,
};
use crate::classifier::{ClassificationRule, ClassifierRuleConfig};
use crate::error::{ResilienceError, Result};
use crate::events::DEFAULT_EVENT_BUS_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Admin API listener
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Applied on top of the built-in base config
    #[serde(default)]
    pub defaults: CircuitBreakerOverrides,
    /// Per-service defaults, keyed by exact service name
    #[serde(default)]
    pub service_defaults: HashMap<String, CircuitBreakerOverrides>,
    /// Replaces the built-in patterns when non-empty
    #[serde(default)]
    pub patterns: Vec<CircuitBreakerPattern>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Manager runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    #[serde(default)]
    pub idle_cleanup: IdleCleanupConfig,
}

/// Periodic removal of unused breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleCleanupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
}

/// Extra classification rules, evaluated before the built-in ones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub rules: Vec<ClassifierRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_event_bus_capacity() -> usize {
    DEFAULT_EVENT_BUS_CAPACITY
}

fn default_max_idle_ms() -> u64 {
    DEFAULT_MAX_IDLE.as_millis() as u64
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            event_bus_capacity: default_event_bus_capacity(),
            idle_cleanup: IdleCleanupConfig::default(),
        }
    }
}

impl Default for IdleCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_idle_ms: default_max_idle_ms(),
        }
    }
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ResilienceError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ResilienceError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Base breaker config: built-in defaults with `defaults` applied
    pub fn base_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default().merged(&self.defaults)
    }

    /// Configured patterns, or the built-in set when none are given
    pub fn effective_patterns(&self) -> Vec<CircuitBreakerPattern> {
        if self.patterns.is_empty() {
            builtin_patterns()
        } else {
            self.patterns.clone()
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        let idle = &self.manager.idle_cleanup;
        ManagerOptions {
            base_config: self.base_config(),
            service_defaults: self.service_defaults.clone(),
            patterns: self.effective_patterns(),
            health_check_interval: Duration::from_millis(self.manager.health_check_interval_ms),
            idle_cleanup_after: idle
                .enabled
                .then(|| Duration::from_millis(idle.max_idle_ms)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.base_config().validate().map_err(|e| {
            ResilienceError::Config(format!("Invalid circuit breaker defaults: {}", e))
        })?;

        for (service, defaults) in &self.service_defaults {
            self.base_config()
                .merged(defaults)
                .validate()
                .map_err(|e| {
                    ResilienceError::Config(format!(
                        "Invalid defaults for service '{}': {}",
                        service, e
                    ))
                })?;
        }

        let mut ids = HashSet::new();
        for pattern in &self.patterns {
            if !ids.insert(pattern.id.as_str()) {
                return Err(ResilienceError::Config(format!(
                    "Duplicate pattern id: {}",
                    pattern.id
                )));
            }
            pattern
                .validate()
                .map_err(|e| ResilienceError::Config(format!("Invalid pattern: {}", e)))?;
        }

        for rule in &self.classifier.rules {
            ClassificationRule::compile(rule)?;
        }

        if self.manager.health_check_interval_ms == 0 {
            return Err(ResilienceError::Config(
                "Health check interval must be > 0".to_string(),
            ));
        }
        if self.manager.event_bus_capacity == 0 {
            return Err(ResilienceError::Config(
                "Event bus capacity must be > 0".to_string(),
            ));
        }
        if self.manager.idle_cleanup.enabled && self.manager.idle_cleanup.max_idle_ms == 0 {
            return Err(ResilienceError::Config(
                "Idle cleanup max_idle_ms must be > 0".to_string(),
            ));
        }
        if self.hot_reload.enabled && self.hot_reload.debounce_ms == 0 {
            return Err(ResilienceError::Config(
                "Hot reload debounce must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
