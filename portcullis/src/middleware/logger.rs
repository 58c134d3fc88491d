//! Request/response logging
//!
//! One structured event per request, emitted after the response is built.
//! Nothing is persisted from the hot path; the tracing subscriber decides
//! where events go.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};

use super::context::RequestContext;

/// Pipeline stage 2; wraps every subsequent stage
pub async fn middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let ctx = request.extensions().get::<RequestContext>().cloned();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let (request_id, client_ip, latency_ms) = match &ctx {
        Some(ctx) => (
            ctx.request_id.as_str(),
            ctx.client_ip.to_string(),
            ctx.started_at.elapsed().as_millis() as u64,
        ),
        None => ("", String::new(), 0),
    };

    if status >= 500 {
        tracing::error!(%method, %path, status, request_id, client_ip = %client_ip, latency_ms, "request failed");
    } else if status >= 400 {
        tracing::info!(%method, %path, status, request_id, client_ip = %client_ip, latency_ms, "request rejected");
    } else {
        tracing::info!(%method, %path, status, request_id, client_ip = %client_ip, latency_ms, "request completed");
    }

    response
}
