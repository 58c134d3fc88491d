//! Health check handlers
//!
//! `GET /health` is the liveness + reachability probe; `GET /health/detailed`
//! adds per-dependency latency and a request-stats snapshot.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy" or "degraded"
    pub status: String,

    /// Service name
    pub service: String,

    /// Version
    pub version: String,

    /// Dependency statuses
    pub dependencies: HashMap<String, DependencyStatus>,
}

/// Individual dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    /// Dependency is reachable
    pub healthy: bool,

    /// Probe round-trip in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Detailed health response with request statistics
#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedHealthResponse {
    #[serde(flatten)]
    pub health: HealthResponse,

    /// Aggregated request statistics from the shared cache
    pub stats: MetricsSnapshot,
}

/// `GET /health` — liveness plus cache and database reachability
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (response, all_healthy) = probe(&state).await;
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// `GET /health/detailed` — dependency latency and request stats snapshot
pub async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let (health, all_healthy) = probe(&state).await;

    let routes = state.routes().route_names().await;
    let stats = match state.metrics().snapshot(&routes).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!("metrics snapshot failed: {e}");
            MetricsSnapshot::default()
        }
    };

    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(DetailedHealthResponse { health, stats }))
}

async fn probe(state: &AppState) -> (HealthResponse, bool) {
    let mut dependencies = HashMap::new();

    let db = probe_database(state).await;
    let redis = probe_redis(state).await;
    let all_healthy = db.healthy && redis.healthy;

    dependencies.insert("database".to_string(), db);
    dependencies.insert("redis".to_string(), redis);

    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "degraded" }.to_string(),
        service: state.config().service.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dependencies,
    };
    (response, all_healthy)
}

async fn probe_database(state: &AppState) -> DependencyStatus {
    let started = Instant::now();
    match sqlx::query("SELECT 1").fetch_one(state.db()).await {
        Ok(_) => DependencyStatus {
            healthy: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            message: None,
        },
        Err(e) => {
            tracing::error!("database health check failed: {e}");
            DependencyStatus {
                healthy: false,
                latency_ms: None,
                message: Some(e.to_string()),
            }
        }
    }
}

async fn probe_redis(state: &AppState) -> DependencyStatus {
    let started = Instant::now();
    let ping = async {
        let mut conn = state.redis().get().await.map_err(|e| e.to_string())?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| e.to_string())
    }
    .await;

    match ping {
        Ok(_) => DependencyStatus {
            healthy: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            message: None,
        },
        Err(e) => {
            tracing::error!("redis health check failed: {e}");
            DependencyStatus {
                healthy: false,
                latency_ms: None,
                message: Some(e),
            }
        }
    }
}
