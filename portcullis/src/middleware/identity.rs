//! Authenticated caller identity

use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Claims;
use crate::model::{ApiKey, Role, Tier};
use crate::ratelimit::RateIdentifier;

/// The identity the authentication stage attaches to the request
#[derive(Debug, Clone)]
pub enum Identity {
    /// Authenticated via bearer access token
    Bearer { claims: Claims },

    /// Authenticated via API key; the owner's tier is resolved at auth time
    ApiKey { key: Arc<ApiKey>, tier: Tier },
}

impl Identity {
    /// The user behind the credential
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Bearer { claims } => claims.sub,
            Self::ApiKey { key, .. } => key.user_id,
        }
    }

    /// Caller tier for policy selection
    pub fn tier(&self) -> Tier {
        match self {
            Self::Bearer { claims } => claims.tier,
            Self::ApiKey { tier, .. } => *tier,
        }
    }

    /// Caller role
    pub fn role(&self) -> Role {
        match self {
            Self::Bearer { claims } => claims.role,
            // Keys act with their owner's normal privileges, never admin
            Self::ApiKey { .. } => Role::User,
        }
    }

    /// Identifier the rate limiter keys on
    pub fn rate_identifier(&self) -> RateIdentifier {
        match self {
            Self::Bearer { claims } => RateIdentifier::User(claims.sub),
            Self::ApiKey { key, .. } => RateIdentifier::ApiKey(key.id),
        }
    }

    /// The API key, when that was the credential surface
    pub fn api_key(&self) -> Option<&ApiKey> {
        match self {
            Self::Bearer { .. } => None,
            Self::ApiKey { key, .. } => Some(key),
        }
    }

    /// Short label for logs
    pub fn auth_method(&self) -> &'static str {
        match self {
            Self::Bearer { .. } => "bearer",
            Self::ApiKey { .. } => "api_key",
        }
    }
}
