//! Auth surface: signup, login, refresh, logout
//!
//! Refresh rotation is the delicate part: the presented refresh token's
//! nonce is blacklisted with SET NX *before* the new pair is issued, so two
//! concurrent refreshes with the same token produce exactly one winner; the
//! loser sees `TOKEN_REVOKED`.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::{IssuedTokens, TokenPair};
use crate::autoblock::ViolationKind;
use crate::error::{Error, Result};
use crate::middleware::RequestContext;
use crate::model::{AuditRecord, Role, Tier, User};
use crate::state::AppState;

/// Signup / login request body
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

/// Refresh request body
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Plain acknowledgement body
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

/// `POST /auth/signup` — create an account, return a token pair
pub async fn signup(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<TokenPair>)> {
    if !body.email.contains('@') {
        return Err(Error::Validation("email address is malformed".to_string()));
    }

    let digest = crate::auth::PasswordHasher::new().hash(&body.password)?;
    let user = state
        .users()
        .create(&body.email, &digest, Role::User, Tier::Free)
        .await?;

    let issued = issue_and_track(&state, &user).await?;

    state
        .audit()
        .append(
            AuditRecord::new("auth.signup")
                .by_user(user.id)
                .from_ip(ctx.client_ip.to_string())
                .on_resource("user", user.id.to_string()),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(issued.pair)))
}

/// `POST /auth/login` — verify credentials, return a token pair
pub async fn login(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<TokenPair>> {
    let user = match verify_credentials(&state, &body).await {
        Ok(user) => user,
        Err(error) => {
            if ViolationKind::for_error(&error).is_some() {
                if let Err(e) = state
                    .autoblock()
                    .record(ViolationKind::AuthFailure, ctx.client_ip)
                    .await
                {
                    tracing::warn!(client_ip = %ctx.client_ip, "violation recording failed: {e}");
                }
            }
            return Err(error);
        }
    };

    let issued = issue_and_track(&state, &user).await?;

    state
        .audit()
        .append(
            AuditRecord::new("auth.login")
                .by_user(user.id)
                .from_ip(ctx.client_ip.to_string()),
        )
        .await?;

    Ok(Json(issued.pair))
}

async fn verify_credentials(state: &AppState, body: &CredentialsRequest) -> Result<User> {
    let user = state
        .users()
        .find_by_email(&body.email)
        .await?
        .ok_or(Error::InvalidCredentials)?;

    let matches =
        crate::auth::PasswordHasher::new().verify(&body.password, &user.password_digest)?;
    if !matches {
        return Err(Error::InvalidCredentials);
    }
    Ok(user)
}

/// `POST /auth/refresh` — rotate the refresh token, return a new pair
pub async fn refresh(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>> {
    let claims = state.tokens().decode_refresh(&body.refresh_token)?;

    let user = state
        .users()
        .find_by_id(claims.sub)
        .await?
        .ok_or(Error::InvalidToken)?;
    if claims.token_version != user.token_version {
        return Err(Error::TokenVersionMismatch);
    }

    // A refresh token the cache has never seen (or has already dropped) is
    // treated as revoked
    if !state
        .token_store()
        .refresh_tracked(claims.sub, &claims.jti)
        .await?
    {
        return Err(Error::TokenRevoked);
    }

    // Blacklist-before-issue; SET NX makes this the rotation's linearization
    // point under concurrent attempts
    let won = state
        .token_store()
        .blacklist(&claims.jti, claims.remaining_ttl())
        .await?;
    if !won {
        return Err(Error::TokenRevoked);
    }
    state
        .token_store()
        .untrack_refresh(claims.sub, &claims.jti)
        .await?;

    let issued = issue_and_track(&state, &user).await?;

    state
        .audit()
        .append(
            AuditRecord::new("auth.token.refresh")
                .by_user(user.id)
                .from_ip(ctx.client_ip.to_string())
                .with_metadata(serde_json::json!({ "rotated_jti": claims.jti })),
        )
        .await?;

    Ok(Json(issued.pair))
}

/// `POST /auth/logout` — revoke the presented access token's nonce
pub async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
) -> Result<Json<AckResponse>> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingCredentials)?;

    let claims = state.tokens().decode_access(token)?;
    state
        .token_store()
        .blacklist(&claims.jti, claims.remaining_ttl())
        .await?;

    state
        .audit()
        .append(
            AuditRecord::new("auth.logout")
                .by_user(claims.sub)
                .from_ip(ctx.client_ip.to_string())
                .with_metadata(serde_json::json!({ "jti": claims.jti })),
        )
        .await?;

    Ok(Json(AckResponse { success: true }))
}

/// Issue a pair and register the refresh nonce as outstanding
async fn issue_and_track(state: &AppState, user: &User) -> Result<IssuedTokens> {
    let issued = state.tokens().issue_pair(user)?;
    state
        .token_store()
        .track_refresh(user.id, &issued.refresh.jti, state.tokens().refresh_ttl())
        .await?;
    Ok(issued)
}
