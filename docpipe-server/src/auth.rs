//! Caller identification.
//!
//! Users present a bearer token issued elsewhere; it is only verified here to learn who is
//! calling. Workers present the shared secret in the [`WORKER_SECRET_HEADER`].
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use docpipe::{
    ingress::WORKER_SECRET_HEADER,
    job::UserId,
    store::Scope,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, state::AppState};

const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "id")]
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
}

/// Verifies user tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::default();
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, ApiError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| {
                tracing::debug!(?error, "Rejected bearer token");
                ApiError::Unauthorized("Invalid or expired token".to_owned())
            })?
            .claims;
        if claims.sub.trim().is_empty() {
            return Err(ApiError::Unauthorized("Token has no subject".to_owned()));
        }
        Ok(AuthUser {
            id: UserId::from(claims.sub),
            is_admin: claims.role.as_deref() == Some(ADMIN_ROLE),
            email: claims.email,
        })
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.validation.iss)
            .finish()
    }
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
    pub is_admin: bool,
    pub email: Option<String>,
}

impl AuthUser {
    /// Jobs this user may see. Admins see every job.
    pub fn scope(&self) -> Scope {
        if self.is_admin {
            Scope::Any
        } else {
            Scope::Owner(self.id.clone())
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_owned()))?;
        state.jwt.verify(token)
    }
}

/// A request made by a worker holding the shared secret.
#[derive(Debug, Clone, Copy)]
pub struct WorkerAuth;

#[async_trait]
impl FromRequestParts<AppState> for WorkerAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(WORKER_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        state
            .worker_secret
            .verify(presented)
            .inspect_err(|error| tracing::warn!(%error, "Rejected worker request"))?;
        Ok(Self)
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
