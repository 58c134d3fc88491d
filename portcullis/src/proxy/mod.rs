//! Upstream forwarding
//!
//! Stage 7. Consults the per-route circuit breaker, forwards the request to
//! the route's backend with retry-on-5xx and exponential backoff, and passes
//! the upstream response through byte-for-byte (minus hop-by-hop headers).
//! Upstream 4xx is the backend's business logic and is never treated as a
//! gateway failure.

pub mod breaker;
pub mod headers;

pub use breaker::{BreakerDecision, BreakerState, CircuitBreaker};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{Method, StatusCode},
    response::Response,
};

use crate::error::{Error, Result};
use crate::middleware::{Identity, MatchedRoute, RequestContext};
use crate::state::AppState;

/// Upstream statuses worth another attempt
const RETRYABLE_STATUSES: [u16; 3] = [502, 503, 504];

/// Pipeline stage 7: the router fallback for every non-management path
pub async fn handler(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response> {
    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .ok_or_else(|| Error::Internal("request context missing in proxy".to_string()))?;
    let identity = request.extensions().get::<Identity>().cloned();

    let route = match request.extensions().get::<MatchedRoute>() {
        Some(matched) => matched.0.clone(),
        // Management prefixes without a mounted handler land here with no
        // prior resolution; resolve for the 404/403 taxonomy
        None => {
            let method = request.method().as_str().to_string();
            let path = request.uri().path().to_string();
            state.routes().resolve(&method, &path).await?
        }
    };

    if state.config().auth.enforce_scopes {
        if let Some(Identity::ApiKey { key, .. }) = &identity {
            let required = format!(
                "{}:{}",
                route.def.name,
                request.method().as_str().to_lowercase()
            );
            if !key.has_scope(&required) {
                return Err(Error::InsufficientScope { required });
            }
        }
    }

    let route_name = route.def.name.clone();
    match state.breaker().check(&route_name).await {
        BreakerDecision::Allow { state: breaker_state, failures } => {
            forward(state, request, &route, &ctx, identity.as_ref(), breaker_state, failures).await
        }
        BreakerDecision::Reject { retry_after } => Err(Error::Upstream(format!(
            "circuit breaker open for {route_name}; retry in {}s",
            retry_after.as_secs()
        ))),
    }
}

/// Forward with retries, recording breaker outcomes per attempt
#[allow(clippy::too_many_arguments)]
async fn forward(
    state: AppState,
    request: Request<Body>,
    route: &crate::routing::CompiledRoute,
    ctx: &RequestContext,
    identity: Option<&Identity>,
    breaker_state: BreakerState,
    prior_failures: u64,
) -> Result<Response> {
    let route_name = &route.def.name;
    let method = request.method().clone();
    let scheme = request.uri().scheme_str().unwrap_or("http").to_string();
    let url = upstream_url(&route.def.backend_url, request.uri());
    let outbound_headers = headers::upstream_headers(request.headers(), ctx, identity, &scheme);

    let body_limit = state.config().service.body_limit_mb * 1024 * 1024;
    let body = axum::body::to_bytes(request.into_body(), body_limit)
        .await
        .map_err(|e| Error::Validation(format!("request body unreadable: {e}")))?;

    let timeout = state.config().proxy.upstream_timeout();
    let max_attempts = state.config().proxy.retry_max_attempts;

    let mut attempt: u32 = 0;
    loop {
        let result = state
            .http()
            .request(method.clone(), &url)
            .headers(outbound_headers.clone())
            .body(reqwest_body(&method, &body))
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(upstream) => {
                let status = upstream.status();

                if status.is_server_error() {
                    state.breaker().record_failure(route_name).await;

                    if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt < max_attempts {
                        attempt += 1;
                        let delay = state.config().proxy.retry_delay(attempt);
                        tracing::info!(
                            route = %route_name,
                            status = status.as_u16(),
                            attempt,
                            "upstream 5xx, retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                } else if breaker_state == BreakerState::HalfOpen || prior_failures > 0 {
                    // Skipped when the circuit is known-clean; one script
                    // call per request otherwise
                    state.breaker().record_success(route_name).await;
                }

                return pass_through(upstream).await;
            }
            Err(e) => {
                state.breaker().record_failure(route_name).await;

                if e.is_timeout() {
                    return Err(Error::UpstreamTimeout(timeout));
                }
                return Err(Error::Upstream(format!(
                    "request to {route_name} backend failed: {e}"
                )));
            }
        }
    }
}

/// Join the backend base URL with the original path and query
fn upstream_url(backend_url: &str, uri: &axum::http::Uri) -> String {
    let base = backend_url.trim_end_matches('/');
    match uri.query() {
        Some(query) => format!("{}{}?{}", base, uri.path(), query),
        None => format!("{}{}", base, uri.path()),
    }
}

/// Body for an outbound attempt; bodiless methods send nothing
fn reqwest_body(method: &Method, body: &Bytes) -> reqwest::Body {
    match *method {
        Method::GET | Method::HEAD => reqwest::Body::from(Bytes::new()),
        _ => reqwest::Body::from(body.clone()),
    }
}

/// Convert the upstream response, stripping hop-by-hop headers
async fn pass_through(upstream: reqwest::Response) -> Result<Response> {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let filtered = headers::response_headers(upstream.headers());

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| Error::Upstream(format!("upstream body read failed: {e}")))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = filtered;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_url_join() {
        let uri: axum::http::Uri = "/orders/42?expand=items".parse().unwrap();
        assert_eq!(
            upstream_url("http://orders.internal:8080/", &uri),
            "http://orders.internal:8080/orders/42?expand=items"
        );

        let uri: axum::http::Uri = "/orders/42".parse().unwrap();
        assert_eq!(
            upstream_url("http://orders.internal:8080", &uri),
            "http://orders.internal:8080/orders/42"
        );
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(RETRYABLE_STATUSES.contains(&502));
        assert!(RETRYABLE_STATUSES.contains(&503));
        assert!(RETRYABLE_STATUSES.contains(&504));
        // Other 5xx count against the breaker but are not retried
        assert!(!RETRYABLE_STATUSES.contains(&500));
        assert!(!RETRYABLE_STATUSES.contains(&501));
    }
}
