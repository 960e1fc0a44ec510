//! Bearer token extraction.
//!
//! When `AUTH_SECRET` is set every request must carry it as a bearer token.
//! Without it the server runs open, for local development.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// Presented the shared secret
    Token,
    /// No secret configured
    Anonymous,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.auth_secret.as_deref() else {
            return Ok(AuthUser::Anonymous);
        };

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .map(str::trim);

        match token {
            Some(token) if token == secret => Ok(AuthUser::Token),
            Some(_) => {
                tracing::warn!(path = %parts.uri.path(), "rejected bearer token");
                Err(AppError::Unauthorized)
            }
            None => Err(AppError::Unauthorized),
        }
    }
}
