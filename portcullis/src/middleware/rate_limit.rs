//! Rate-limit stage
//!
//! Stage 5. Resolves the route (the proxy stage reuses the match), selects
//! the policy for the caller's tier, and runs the policy's strategy
//! atomically in the shared cache. Rate headers ride on both allowed and
//! denied responses; a concurrency admission is released exactly once at
//! the response-completion edge.

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::error::{Error, RateLimitRejection, Result};
use crate::ratelimit::{RateIdentifier, RateLimitDecision, Verdict};
use crate::routing::CompiledRoute;
use crate::state::AppState;

use super::context::RequestContext;
use super::identity::Identity;
use super::is_management_path;

/// The resolved route, attached for the proxy stage
#[derive(Clone)]
pub struct MatchedRoute(pub Arc<CompiledRoute>);

/// Pipeline stage 5
pub async fn middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let path = request.uri().path().to_string();
    if is_management_path(&path) {
        return Ok(next.run(request).await);
    }

    let method = request.method().as_str().to_string();
    let route = state.routes().resolve(&method, &path).await?;
    request
        .extensions_mut()
        .insert(MatchedRoute(Arc::clone(&route)));

    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .ok_or_else(|| Error::Internal("request context missing in rate limiter".to_string()))?;
    let identity = request.extensions().get::<Identity>().cloned();

    let tier = identity
        .as_ref()
        .map(|i| i.tier())
        .unwrap_or(crate::model::Tier::Free);
    let identifier = identity
        .as_ref()
        .map(|i| i.rate_identifier())
        .unwrap_or(RateIdentifier::Ip(ctx.client_ip));

    let Some(policy) = route.policy_for(tier) else {
        // No policy configured for this route: not rate limited
        return Ok(next.run(request).await);
    };
    let strategy = policy.strategy;

    match state
        .limiter()
        .check(policy, route.def.id, tier, &identifier)
        .await?
    {
        Verdict::Allowed { decision, token } => {
            let mut response = next.run(request).await;

            // Release at the response-completion edge, after every inner
            // stage (including upstream error paths) has finished
            if let Some(token) = token {
                token.release().await;
            }

            apply_rate_headers(&mut response, &decision);
            Ok(response)
        }
        Verdict::Denied(decision) => {
            let rejection = RateLimitRejection {
                strategy: strategy.as_str(),
                limit: decision.limit,
                remaining: decision.remaining,
                retry_after: decision.retry_after,
                reset_at: decision.reset_at,
            };
            let error = Error::RateLimitExceeded(rejection);

            if let Some(kind) = crate::autoblock::ViolationKind::for_error(&error) {
                if let Err(e) = state.autoblock().record(kind, ctx.client_ip).await {
                    tracing::warn!(client_ip = %ctx.client_ip, "violation recording failed: {e}");
                }
            }

            Err(error)
        }
        Verdict::Unavailable => Ok(next.run(request).await),
    }
}

/// Attach `X-RateLimit-*` to an allowed response
fn apply_rate_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    let entries = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_rate_headers_applied() {
        let decision = RateLimitDecision {
            limit: 100,
            remaining: 42,
            retry_after: Duration::ZERO,
            reset_at: Utc::now() + chrono::Duration::seconds(30),
        };

        let mut response = Response::new(axum::body::Body::empty());
        apply_rate_headers(&mut response, &decision);

        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "42"
        );
        let reset: i64 = response
            .headers()
            .get("x-ratelimit-reset")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(reset >= Utc::now().timestamp());
    }
}
