//! Bearer token authentication
//!
//! Tokens are issued by the account service; this backend only verifies them.
//! `sub` carries the numeric user id.

use crate::error::{AppError, AppErrorKind, AuthenticationError};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const MIN_JWT_SECRET_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum JwtKeyError {
    #[error("JWT_SECRET must be at least {required} bytes, got {actual}")]
    TooShort { actual: usize, required: usize },
    #[error("failed to sign token: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: Arc<EncodingKey>,
    decoding: Arc<DecodingKey>,
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtKeys").finish_non_exhaustive()
    }
}

impl JwtKeys {
    pub fn from_secret(secret: impl AsRef<[u8]>) -> Result<Self, JwtKeyError> {
        let bytes = secret.as_ref();
        if bytes.len() < MIN_JWT_SECRET_LENGTH {
            return Err(JwtKeyError::TooShort {
                actual: bytes.len(),
                required: MIN_JWT_SECRET_LENGTH,
            });
        }
        Ok(Self {
            encoding: Arc::new(EncodingKey::from_secret(bytes)),
            decoding: Arc::new(DecodingKey::from_secret(bytes)),
        })
    }

    /// Signs a token for `user_id` valid for `ttl_secs`.
    pub fn issue(&self, user_id: i64, ttl_secs: i64) -> Result<String, JwtKeyError> {
        let exp = (Utc::now().timestamp() + ttl_secs).max(0) as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| JwtKeyError::Signing(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::unauthorized(e.to_string()))
    }
}

/// Authenticated caller, extracted from `Authorization: Bearer <jwt>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
}

impl<S> FromRequestParts<S> for AuthUser
where
    JwtKeys: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::new(AppErrorKind::Authentication(AuthenticationError::MissingToken)))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("expected bearer scheme"))?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify(token)?;
        let user_id = claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::unauthorized("subject is not a user id"))?;

        Ok(AuthUser { user_id })
    }
}
