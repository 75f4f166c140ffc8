// crates/server/src/auth.rs
//! Token verification.
//!
//! Issuing tokens is someone else's job; this crate only checks them. REST
//! routes read `Authorization: Bearer <token>`, realtime events carry the
//! token in their payload.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ApiError;
use crate::state::AppState;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing token")]
    Missing,

    #[error("Invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// HS256 verifier over a shared secret.
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Sign a token for `user_id`, valid for `ttl`.
    pub fn issue(
        &self,
        user_id: &str,
        username: &str,
        ttl: chrono::Duration,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(Principal {
            user_id: data.claims.user_id,
            username: data.claims.username,
        })
    }
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Extractor for routes that require a valid bearer token.
pub struct AuthUser(pub Principal);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized(AuthError::Missing.to_string()))?;
        state
            .verifier
            .verify(token)
            .map(AuthUser)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_issue_then_verify() {
        let verifier = JwtVerifier::new("test-secret");
        let token = verifier
            .issue("42", "alice", chrono::Duration::hours(1))
            .unwrap();
        let principal = verifier.verify(&token).unwrap();
        assert_eq!(principal.user_id, "42");
        assert_eq!(principal.username, "alice");
    }

    #[test]
    fn test_rejects_wrong_secret_and_expired() {
        let issuer = JwtVerifier::new("secret-a");
        let token = issuer.issue("1", "bob", chrono::Duration::hours(1)).unwrap();
        assert!(JwtVerifier::new("secret-b").verify(&token).is_err());

        let expired = issuer
            .issue("1", "bob", chrono::Duration::hours(-2))
            .unwrap();
        assert!(matches!(issuer.verify(&expired), Err(AuthError::Invalid(_))));
        assert!(matches!(issuer.verify(""), Err(AuthError::Missing)));
        assert!(issuer.verify("not.a.jwt").is_err());
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
