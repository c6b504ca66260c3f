pub mod admin;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod hotreload;
pub mod metrics;
pub mod observability;

use crate::admin::AdminState;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::classifier::RuleBasedClassifier;
use crate::config::AppConfig;
use crate::error::{ResilienceError, Result};
use crate::events::EventBus;
use crate::metrics::MetricsService;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Build a manager from validated configuration
pub fn build_manager(config: &AppConfig) -> Result<CircuitBreakerManager> {
    let classifier = RuleBasedClassifier::new(&config.classifier.rules)?;
    let event_bus = EventBus::new(config.manager.event_bus_capacity);

    Ok(CircuitBreakerManager::new(
        config.manager_options(),
        event_bus,
        Arc::new(classifier),
    ))
}

/// Run the resilience manager and its admin API until Ctrl-C
pub async fn init_server(config: AppConfig, config_path: Option<&Path>) -> Result<()> {
    config.validate()?;

    info!("Starting resilience manager");

    let manager = Arc::new(build_manager(&config)?);
    info!(
        patterns = manager.patterns().await.len(),
        "Circuit breaker manager ready"
    );

    manager.start_health_monitoring().await;

    if config.hot_reload.enabled {
        match config_path {
            Some(path) => {
                hotreload::watch_config_file(path, manager.clone(), config.hot_reload.debounce_ms)
                    .await?
            }
            None => warn!("Hot reload enabled but no config file was given"),
        }
    }

    let metrics = match MetricsService::new() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, "Prometheus metrics disabled");
            None
        }
    };

    let app = admin::router(AdminState::new(manager.clone(), metrics));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(ResilienceError::Io)?;

    info!(addr = %addr, "Admin API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ResilienceError::Internal(format!("Server error: {}", e)));

    let result = manager.shutdown().await;
    info!(
        removed = result.removed.len(),
        failed = result.failed.len(),
        "Resilience manager stopped"
    );

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
