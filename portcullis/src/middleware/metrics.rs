//! Metrics stage
//!
//! Stage 6. Times everything downstream of it (the proxy round-trip
//! dominates) and records counters off the hot path once the response is
//! built.

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::state::AppState;

use super::is_management_path;
use super::rate_limit::MatchedRoute;

/// Pipeline stage 6
pub async fn middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_management_path(request.uri().path()) {
        return next.run(request).await;
    }

    let method = request.method().as_str().to_string();
    let route_name = request
        .extensions()
        .get::<MatchedRoute>()
        .map(|m| m.0.def.name.clone())
        .unwrap_or_else(|| "unmatched".to_string());

    let started = Instant::now();
    let response = next.run(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    let metrics = state.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = metrics.record(&route_name, &method, status, latency_ms).await {
            tracing::debug!("metrics recording failed: {e}");
        }
    });

    response
}
