//! Admin HTTP API over a [`CircuitBreakerManager`].

use crate::circuit_breaker::manager::DEFAULT_MAX_IDLE;
use crate::circuit_breaker::{
    BulkFilter, BulkOperationResult, CircuitBreakerManager, CircuitBreakerOverrides,
    CircuitBreakerPattern, CircuitState, CleanupResult, EntryInfo, HealthSummary,
};
use crate::error::{ResilienceError, Result};
use crate::metrics::{MetricsService, ResilienceMetricsSnapshot};
use crate::observability::request_id_middleware;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for admin handlers
#[derive(Debug, Clone)]
pub struct AdminState {
    pub manager: Arc<CircuitBreakerManager>,
    /// Absent when no Prometheus recorder is installed
    pub metrics: Option<MetricsService>,
}

impl AdminState {
    pub fn new(manager: Arc<CircuitBreakerManager>, metrics: Option<MetricsService>) -> Self {
        Self { manager, metrics }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceStateRequest {
    #[serde(default)]
    pub filter: BulkFilter,
    pub state: CircuitState,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigRequest {
    #[serde(default)]
    pub filter: BulkFilter,
    pub updates: CircuitBreakerOverrides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub max_idle_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternUpsertResponse {
    pub id: String,
    pub replaced: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/cached", get(cached_health))
        .route("/breakers", get(list_breakers))
        .route("/breakers/force", post(force_state))
        .route("/breakers/config", post(update_config))
        .route("/breakers/cleanup", post(cleanup))
        .route(
            "/breakers/:service/:operation",
            get(get_breaker).delete(remove_breaker),
        )
        .route("/patterns", get(list_patterns).post(upsert_pattern))
        .route("/patterns/:id", delete(remove_pattern))
        .route("/metrics", get(prometheus_metrics))
        .route("/metrics/resilience", get(resilience_metrics))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                tracing::info_span!(
                    "admin_request",
                    method = %req.method(),
                    uri = %req.uri(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
}

async fn health(State(state): State<AdminState>) -> Json<HealthSummary> {
    Json(state.manager.get_health_summary().await)
}

async fn cached_health(State(state): State<AdminState>) -> Result<Json<HealthSummary>> {
    state
        .manager
        .cached_health_summary()
        .await
        .map(Json)
        .ok_or_else(|| ResilienceError::NotFound("no health check has run yet".to_string()))
}

async fn list_breakers(State(state): State<AdminState>) -> Json<Vec<EntryInfo>> {
    Json(state.manager.entries().await)
}

async fn get_breaker(
    State(state): State<AdminState>,
    Path((service, operation)): Path<(String, String)>,
) -> Result<Json<EntryInfo>> {
    state
        .manager
        .entry_info(&service, &operation)
        .await
        .map(Json)
        .ok_or_else(|| {
            ResilienceError::NotFound(format!("circuit breaker {}:{}", service, operation))
        })
}

async fn remove_breaker(
    State(state): State<AdminState>,
    Path((service, operation)): Path<(String, String)>,
) -> Result<StatusCode> {
    state
        .manager
        .remove_circuit_breaker(&service, &operation)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn force_state(
    State(state): State<AdminState>,
    Json(request): Json<ForceStateRequest>,
) -> Json<BulkOperationResult> {
    let reason = request.reason.as_deref().unwrap_or("admin request");
    info!(state = %request.state, reason, "Bulk force state requested");

    Json(
        state
            .manager
            .bulk_force_state(&request.filter, request.state, reason)
            .await,
    )
}

async fn update_config(
    State(state): State<AdminState>,
    Json(request): Json<UpdateConfigRequest>,
) -> Result<Json<BulkOperationResult>> {
    if request.updates.is_empty() {
        return Err(ResilienceError::InvalidRequest(
            "updates must set at least one field".to_string(),
        ));
    }

    Ok(Json(
        state
            .manager
            .bulk_update_config(&request.filter, &request.updates)
            .await,
    ))
}

async fn cleanup(
    State(state): State<AdminState>,
    request: Option<Json<CleanupRequest>>,
) -> Json<CleanupResult> {
    let max_idle = request
        .and_then(|Json(r)| r.max_idle_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_MAX_IDLE);

    Json(state.manager.cleanup(max_idle).await)
}

async fn list_patterns(State(state): State<AdminState>) -> Json<Vec<CircuitBreakerPattern>> {
    Json(state.manager.patterns().await)
}

async fn upsert_pattern(
    State(state): State<AdminState>,
    Json(pattern): Json<CircuitBreakerPattern>,
) -> Result<(StatusCode, Json<PatternUpsertResponse>)> {
    pattern
        .validate()
        .map_err(|e| ResilienceError::InvalidConfig(e.to_string()))?;

    let id = pattern.id.clone();
    let replaced = state.manager.add_pattern(pattern).await?;
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((status, Json(PatternUpsertResponse { id, replaced })))
}

async fn remove_pattern(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<CircuitBreakerPattern>> {
    state
        .manager
        .remove_pattern(&id)
        .await
        .map(Json)
        .ok_or_else(|| ResilienceError::NotFound(format!("pattern {}", id)))
}

async fn prometheus_metrics(State(state): State<AdminState>) -> Result<impl IntoResponse> {
    let metrics = state
        .metrics
        .as_ref()
        .ok_or_else(|| ResilienceError::NotFound("metrics recorder not installed".to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    ))
}

async fn resilience_metrics(State(state): State<AdminState>) -> Json<ResilienceMetricsSnapshot> {
    Json(state.manager.metrics())
}
