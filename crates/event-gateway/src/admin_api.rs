//! Admin API for the event gateway

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use events_core::error::{GatewayError, Result};
use events_core::strategy::HealthCheck;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::{CacheStats, DispatchEngine};
use crate::route::{Route, RouteRegistry, RouteState, RouteStats};
use crate::{GatewayCounters, GatewayStats};

/// Admin API state
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<RouteRegistry>,
    pub engine: Arc<DispatchEngine>,
    pub counters: Arc<GatewayCounters>,
}

/// Health response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Stats response
#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub gateway: GatewayStats,
    pub clients: CacheStats,
    pub partial_failure_rate: f64,
}

/// Route description
#[derive(Serialize)]
pub struct RouteResponse {
    pub name: String,
    pub source_type: &'static str,
    pub endpoint: String,
    pub method: String,
    pub port: u16,
    pub state: RouteState,
    #[serde(flatten)]
    pub stats: RouteStats,
}

impl From<&Route> for RouteResponse {
    fn from(route: &Route) -> Self {
        Self {
            name: route.name().to_string(),
            source_type: route.source_type().as_str(),
            endpoint: route.endpoint().to_string(),
            method: route.method().to_string(),
            port: route.port(),
            state: route.state(),
            stats: route.stats(),
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn live() -> &'static str {
    "OK"
}

async fn ready(State(state): State<AdminState>) -> Response {
    let registry = &state.registry;
    match registry.health_check().await {
        Ok(()) => "OK".into_response(),
        Err(e) => {
            warn!(component = registry.component_name(), error = %e, "Not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{}: {}", registry.component_name(), e),
            )
                .into_response()
        }
    }
}

async fn stats(State(state): State<AdminState>) -> Json<StatsResponse> {
    let s = state.counters.snapshot();
    let partial_failure_rate = if s.dispatched > 0 {
        s.partial_failures as f64 / s.dispatched as f64 * 100.0
    } else {
        0.0
    };
    Json(StatsResponse {
        gateway: s,
        clients: state.engine.cache_stats().await,
        partial_failure_rate,
    })
}

async fn list_routes(State(state): State<AdminState>) -> Json<Vec<RouteResponse>> {
    let mut routes: Vec<RouteResponse> = state
        .registry
        .routes()
        .map(|route| RouteResponse::from(route.as_ref()))
        .collect();
    routes.sort_by(|a, b| a.name.cmp(&b.name));
    Json(routes)
}

async fn activate_route(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    let Some(route) = state.registry.by_name(&name) else {
        return (StatusCode::NOT_FOUND, format!("route {} not found", name)).into_response();
    };
    route_transition(&route, route.activate().await)
}

async fn deactivate_route(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    let Some(route) = state.registry.by_name(&name) else {
        return (StatusCode::NOT_FOUND, format!("route {} not found", name)).into_response();
    };
    route_transition(&route, route.deactivate().await)
}

fn route_transition(route: &Route, result: Result<bool>) -> Response {
    match result {
        Ok(_) => Json(RouteResponse::from(route)).into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

/// Admin router
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/stats", get(stats))
        .route("/routes", get(list_routes))
        .route("/routes/{name}/activate", post(activate_route))
        .route("/routes/{name}/deactivate", post(deactivate_route))
        .with_state(state)
}

/// Run admin server until `shutdown` fires
pub async fn run_admin_server(
    listen: String,
    state: AdminState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| GatewayError::config(format!("failed to bind admin API on {}: {}", listen, e)))?;
    info!(listen, "Admin API started");
    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| GatewayError::Internal(format!("admin API failed: {}", e)))
}
