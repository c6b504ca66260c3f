use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::AppConfig;
use crate::error::{ResilienceError, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Load, validate, and apply the service defaults and patterns from `path`.
///
/// Breakers that already exist keep their configuration; only breakers
/// created afterwards see the new rules.
pub async fn reload_rules(path: &Path, manager: &CircuitBreakerManager) -> Result<()> {
    let config = AppConfig::from_file(path)?;
    config.validate()?;

    manager
        .replace_rules(config.service_defaults.clone(), config.effective_patterns())
        .await
}

/// Watches the configuration file and reapplies rules on change
pub struct HotReloadService {
    config_path: PathBuf,
    manager: Arc<CircuitBreakerManager>,
    debounce_duration: Duration,
}

impl HotReloadService {
    pub fn new(config_path: PathBuf, manager: Arc<CircuitBreakerManager>, debounce_ms: u64) -> Self {
        Self {
            config_path,
            manager,
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    /// Start watching the configuration file for changes
    pub async fn start(self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                    ) {
                        let _ = tx.blocking_send(event);
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| ResilienceError::Internal(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ResilienceError::Internal(format!("Failed to watch config file: {}", e))
            })?;

        info!(
            path = %self.config_path.display(),
            debounce_ms = self.debounce_duration.as_millis() as u64,
            "Hot reload watcher started"
        );

        tokio::spawn(async move {
            let mut last_reload: Option<Instant> = None;

            while let Some(event) = rx.recv().await {
                debug!(kind = ?event.kind, "Config file change detected");

                let now = Instant::now();
                if last_reload.is_some_and(|last| now.duration_since(last) < self.debounce_duration) {
                    debug!("Ignoring event due to debounce");
                    continue;
                }
                last_reload = Some(now);

                match reload_rules(&self.config_path, &self.manager).await {
                    Ok(()) => info!(path = %self.config_path.display(), "Circuit breaker rules reloaded"),
                    Err(e) => error!(error = %e, "Failed to reload configuration, keeping current rules"),
                }
            }

            // Keep watcher alive
            drop(watcher);
        });

        Ok(())
    }
}

/// Watch a configuration file and reapply rules on changes
pub async fn watch_config_file<P: AsRef<Path>>(
    config_path: P,
    manager: Arc<CircuitBreakerManager>,
    debounce_ms: u64,
) -> Result<()> {
    HotReloadService::new(config_path.as_ref().to_path_buf(), manager, debounce_ms)
        .start()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    const RULES_YAML: &str = r#"
service_defaults:
  payments:
    failure_threshold: 9
patterns:
  - id: queue-pattern
    name: Queue
    service: { match: contains, value: queue }
    config:
      failure_threshold: 4
    confidence: 0.8
"#;

    #[tokio::test]
    async fn test_reload_rules_replaces_patterns_and_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), RULES_YAML).unwrap();

        let manager = CircuitBreakerManager::with_defaults();
        reload_rules(temp_file.path(), &manager).await.unwrap();

        let patterns = manager.patterns().await;
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].id, "queue-pattern");

        let breaker = manager.get_circuit_breaker("payments", "charge", None).await;
        assert_eq!(breaker.config().await.failure_threshold, 9);
        let breaker = manager.get_circuit_breaker("orders-queue", "push", None).await;
        assert_eq!(breaker.config().await.failure_threshold, 4);
    }

    #[tokio::test]
    async fn test_existing_breakers_keep_their_config() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), RULES_YAML).unwrap();

        let manager = CircuitBreakerManager::with_defaults();
        let before = manager.get_circuit_breaker("payments", "charge", None).await;
        reload_rules(temp_file.path(), &manager).await.unwrap();

        assert_eq!(before.config().await.failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_invalid_file_leaves_rules_untouched() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "defaults:\n  failure_threshold: 0\n").unwrap();

        let manager = CircuitBreakerManager::with_defaults();
        let before = manager.patterns().await.len();

        assert!(reload_rules(temp_file.path(), &manager).await.is_err());
        assert_eq!(manager.patterns().await.len(), before);
    }

    #[tokio::test]
    async fn test_watcher_requires_existing_file() {
        let manager = Arc::new(CircuitBreakerManager::with_defaults());
        let result = watch_config_file("/nonexistent/resilience.yaml", manager, 100).await;
        assert!(result.is_err());
    }
}
