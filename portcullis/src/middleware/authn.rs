//! Authentication stage
//!
//! Stage 4. Two credential surfaces tried in order: `Authorization: Bearer`
//! then `X-API-Key`. Every access token passes four gates: signature +
//! expiry, type, nonce blacklist, and `token_version` against the current
//! user row (both revocation mechanisms are consulted on every request).
//! API keys are resolved by digest, via the `apikey:<digest>` cache.
//!
//! Rejections feed the auto-blocker synchronously so a block rule created by
//! the Nth bad request is visible to the N+1th. Successful authentication
//! clears the caller IP's violation counters (fire-and-forget).

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::net::IpAddr;
use std::sync::Arc;

use crate::auth::ApiKeyGenerator;
use crate::error::{Error, Result};
use crate::model::{ApiKey, KeyStatus};
use crate::state::AppState;

use super::context::RequestContext;
use super::identity::Identity;
use super::is_management_path;

/// Header carrying an API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Pipeline stage 4
pub async fn middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    if is_management_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let client_ip = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.client_ip)
        .ok_or_else(|| Error::Internal("request context missing in authenticator".to_string()))?;

    match authenticate(&state, request.headers()).await {
        Ok(identity) => {
            clear_violations(&state, client_ip);
            request.extensions_mut().insert(identity);
            Ok(next.run(request).await)
        }
        Err(error) => {
            if let Some(kind) = crate::autoblock::ViolationKind::for_error(&error) {
                if let Err(e) = state.autoblock().record(kind, client_ip).await {
                    tracing::warn!(%client_ip, "violation recording failed: {e}");
                }
            }
            Err(error)
        }
    }
}

/// Resolve an identity from the credential headers
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity> {
    if let Some(token) = bearer_token(headers) {
        return authenticate_bearer(state, token).await;
    }
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return authenticate_api_key(state, key).await;
    }
    Err(Error::MissingCredentials)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn authenticate_bearer(state: &AppState, token: &str) -> Result<Identity> {
    let claims = state.tokens().decode_access(token)?;

    if state.token_store().is_blacklisted(&claims.jti).await? {
        return Err(Error::TokenRevoked);
    }

    // token_version is read fresh so a bump invalidates outstanding tokens
    // on the very next request
    let user = state
        .users()
        .find_by_id(claims.sub)
        .await?
        .ok_or(Error::InvalidToken)?;

    if claims.token_version != user.token_version {
        return Err(Error::TokenVersionMismatch);
    }

    Ok(Identity::Bearer { claims })
}

async fn authenticate_api_key(state: &AppState, presented: &str) -> Result<Identity> {
    let digest = ApiKeyGenerator::digest(presented);

    let key = match lookup_cached_key(state.redis(), &digest).await {
        Ok(Some(key)) => key,
        Ok(None) | Err(_) => {
            let key = state
                .api_keys()
                .find_by_digest(&digest)
                .await?
                .ok_or(Error::InvalidApiKey)?;
            cache_key(
                state.redis(),
                &digest,
                &key,
                state.config().auth.api_key_cache_ttl_secs,
            )
            .await;
            key
        }
    };

    if key.status != KeyStatus::Active {
        return Err(Error::InvalidApiKey);
    }
    if key.is_expired(Utc::now()) {
        return Err(Error::ApiKeyExpired);
    }

    // The owner's tier drives policy selection
    let user = state
        .users()
        .find_by_id(key.user_id)
        .await?
        .ok_or(Error::InvalidApiKey)?;

    touch_last_used(state, key.id);

    Ok(Identity::ApiKey {
        key: Arc::new(key),
        tier: user.tier,
    })
}

fn apikey_cache_key(digest: &str) -> String {
    format!("apikey:{digest}")
}

async fn lookup_cached_key(pool: &Pool, digest: &str) -> Result<Option<ApiKey>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::CachePool(e.to_string()))?;
    let json: Option<String> = conn.get(apikey_cache_key(digest)).await?;
    match json {
        Some(json) => {
            let key = serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("cached API key is malformed: {e}")))?;
            Ok(Some(key))
        }
        None => Ok(None),
    }
}

async fn cache_key(pool: &Pool, digest: &str, key: &ApiKey, ttl_secs: u64) {
    let result: Result<()> = async {
        let json = serde_json::to_string(key)
            .map_err(|e| Error::Internal(format!("API key serialization failed: {e}")))?;
        let mut conn = pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))?;
        let _: () = conn
            .set_ex(apikey_cache_key(digest), json, ttl_secs.max(1))
            .await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        tracing::debug!("API key cache write failed: {e}");
    }
}

/// Best-effort `last_used_at` touch; never blocks the request
fn touch_last_used(state: &AppState, key_id: uuid::Uuid) {
    let repo = state.api_keys().clone();
    tokio::spawn(async move {
        if let Err(e) = repo.touch_last_used(key_id).await {
            tracing::debug!(%key_id, "last_used_at touch failed: {e}");
        }
    });
}

/// Fire-and-forget violation clearing on successful authentication
fn clear_violations(state: &AppState, ip: IpAddr) {
    let autoblock = state.autoblock().clone();
    tokio::spawn(async move {
        if let Err(e) = autoblock.clear(ip).await {
            tracing::debug!(%ip, "violation clear failed: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn test_bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert_eq!(bearer_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert_eq!(bearer_token(&headers), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_apikey_cache_key_layout() {
        assert_eq!(apikey_cache_key("deadbeef"), "apikey:deadbeef");
    }
}
