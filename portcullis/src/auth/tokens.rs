//! Bearer token issuance and validation
//!
//! Access tokens are short-lived and carry everything the pipeline needs to
//! avoid extra lookups (role, tier) plus `token_version` for O(1) mass
//! revocation. Refresh tokens are long-lived, tracked in the shared cache by
//! nonce, and rotated on every use.

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::model::{Role, Tier, User};

/// Token type claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Claims carried by gateway tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user id
    pub sub: Uuid,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// Nonce, used for per-token revocation
    pub jti: String,

    /// Token type
    pub typ: TokenType,

    /// User's token_version at issue time
    pub token_version: i32,

    pub role: Role,

    pub tier: Tier,

    /// Issuer (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl Claims {
    /// Seconds of validity remaining (floored at zero)
    pub fn remaining_ttl(&self) -> Duration {
        let remaining = self.exp - Utc::now().timestamp();
        Duration::from_secs(remaining.max(0) as u64)
    }
}

/// The pair returned by signup, login, and refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// A freshly issued pair with its claims, for cache bookkeeping
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub pair: TokenPair,
    pub access: Claims,
    pub refresh: Claims,
}

/// Issues and validates gateway tokens
#[derive(Clone)]
pub struct TokenService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    algorithm: Algorithm,
    access_ttl: Duration,
    refresh_ttl: Duration,
    issuer: Option<String>,
}

impl TokenService {
    /// Build from configuration
    ///
    /// HS algorithms read the secret directly; RS/ES algorithms expect PEM
    /// key material in `token_secret`.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let algorithm = parse_algorithm(&config.algorithm)?;
        let secret = config.token_secret.as_bytes();

        let (encoding_key, decoding_key) = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => (
                EncodingKey::from_secret(secret),
                DecodingKey::from_secret(secret),
            ),
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => (
                EncodingKey::from_rsa_pem(secret).map_err(token_config_error)?,
                DecodingKey::from_rsa_pem(secret).map_err(token_config_error)?,
            ),
            Algorithm::ES256 | Algorithm::ES384 => (
                EncodingKey::from_ec_pem(secret).map_err(token_config_error)?,
                DecodingKey::from_ec_pem(secret).map_err(token_config_error)?,
            ),
            other => {
                return Err(Error::Config(Box::new(figment::Error::from(format!(
                    "unsupported token algorithm: {other:?}"
                )))))
            }
        };

        Ok(Self {
            encoding_key: Arc::new(encoding_key),
            decoding_key: Arc::new(decoding_key),
            algorithm,
            access_ttl: config.access_ttl(),
            refresh_ttl: config.refresh_ttl(),
            issuer: config.issuer.clone(),
        })
    }

    /// Issue a fresh access/refresh pair for a user
    pub fn issue_pair(&self, user: &User) -> Result<IssuedTokens> {
        let access = self.claims_for(user, TokenType::Access, self.access_ttl);
        let refresh = self.claims_for(user, TokenType::Refresh, self.refresh_ttl);

        let pair = TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl.as_secs(),
        };

        Ok(IssuedTokens {
            pair,
            access,
            refresh,
        })
    }

    fn claims_for(&self, user: &User, typ: TokenType, ttl: Duration) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            sub: user.id,
            iat: now,
            exp: now + ttl.as_secs() as i64,
            jti: Uuid::new_v4().to_string(),
            typ,
            token_version: user.token_version,
            role: user.role,
            tier: user.tier,
            iss: self.issuer.clone(),
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        let header = Header::new(self.algorithm);
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("token signing failed: {e}")))
    }

    /// Decode and verify a token's signature and expiry
    ///
    /// Expiry maps to [`Error::TokenExpired`]; every other decode failure
    /// collapses to [`Error::InvalidToken`].
    pub fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(Error::TokenExpired),
                _ => Err(Error::InvalidToken),
            },
        }
    }

    /// Decode a token that must be an access token
    pub fn decode_access(&self, token: &str) -> Result<Claims> {
        let claims = self.decode(token)?;
        if claims.typ != TokenType::Access {
            return Err(Error::InvalidToken);
        }
        Ok(claims)
    }

    /// Decode a token that must be a refresh token
    pub fn decode_refresh(&self, token: &str) -> Result<Claims> {
        let claims = self.decode(token)?;
        if claims.typ != TokenType::Refresh {
            return Err(Error::InvalidToken);
        }
        Ok(claims)
    }

    /// Refresh token lifetime
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }
}

fn parse_algorithm(alg: &str) -> Result<Algorithm> {
    match alg.to_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        other => Err(Error::Config(Box::new(figment::Error::from(format!(
            "unsupported token algorithm: {other}"
        ))))),
    }
}

fn token_config_error(e: jsonwebtoken::errors::Error) -> Error {
    Error::Config(Box::new(figment::Error::from(format!(
        "token key material is invalid: {e}"
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn service() -> TokenService {
        let config = AuthConfig {
            token_secret: "unit-test-secret-key".to_string(),
            algorithm: "HS256".to_string(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 604_800,
            issuer: Some("portcullis-test".to_string()),
            api_key_prefix: "pk_test".to_string(),
            api_key_cache_ttl_secs: 60,
            enforce_scopes: false,
        };
        TokenService::new(&config).unwrap()
    }

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            password_digest: String::new(),
            role: Role::User,
            tier: Tier::Pro,
            token_version: 3,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_issue_and_decode_round_trip() {
        let svc = service();
        let user = user();
        let issued = svc.issue_pair(&user).unwrap();

        let claims = svc.decode_access(&issued.pair.access_token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.typ, TokenType::Access);
        assert_eq!(claims.token_version, 3);
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.tier, Tier::Pro);
        assert_eq!(claims.jti, issued.access.jti);

        let claims = svc.decode_refresh(&issued.pair.refresh_token).unwrap();
        assert_eq!(claims.typ, TokenType::Refresh);
        assert_ne!(claims.jti, issued.access.jti);
    }

    #[test]
    fn test_refresh_token_rejected_as_access() {
        let svc = service();
        let issued = svc.issue_pair(&user()).unwrap();

        let err = svc.decode_access(&issued.pair.refresh_token).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));

        let err = svc.decode_refresh(&issued.pair.access_token).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[test]
    fn test_tampered_token_is_invalid() {
        let svc = service();
        let issued = svc.issue_pair(&user()).unwrap();

        let mut tampered = issued.pair.access_token.clone();
        tampered.pop();
        tampered.push('A');

        let err = svc.decode(&tampered).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let svc = service();
        let issued = svc.issue_pair(&user()).unwrap();

        let other = {
            let config = AuthConfig {
                token_secret: "a-different-secret".to_string(),
                algorithm: "HS256".to_string(),
                access_ttl_secs: 900,
                refresh_ttl_secs: 604_800,
                issuer: Some("portcullis-test".to_string()),
                api_key_prefix: "pk_test".to_string(),
                api_key_cache_ttl_secs: 60,
                enforce_scopes: false,
            };
            TokenService::new(&config).unwrap()
        };

        let err = other.decode(&issued.pair.access_token).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[test]
    fn test_expired_token_maps_to_token_expired() {
        let svc = service();
        let user = user();

        // Hand-build claims already past expiry
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            iat: now - 120,
            exp: now - 60,
            jti: Uuid::new_v4().to_string(),
            typ: TokenType::Access,
            token_version: user.token_version,
            role: user.role,
            tier: user.tier,
            iss: Some("portcullis-test".to_string()),
        };
        let token = svc.sign(&claims).unwrap();

        let err = svc.decode(&token).unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
    }

    #[test]
    fn test_remaining_ttl() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4(),
            iat: now,
            exp: now + 100,
            jti: "x".to_string(),
            typ: TokenType::Access,
            token_version: 1,
            role: Role::User,
            tier: Tier::Free,
            iss: None,
        };
        let ttl = claims.remaining_ttl().as_secs();
        assert!((98..=100).contains(&ttl));

        let expired = Claims { exp: now - 10, ..claims };
        assert_eq!(expired.remaining_ttl().as_secs(), 0);
    }
}
