//! Bearer token extraction.
//!
//! When `AUTH_TOKEN` is configured every request must carry exactly that
//! token; otherwise requests are accepted anonymously.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    Token,
    Anonymous,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let Some(expected) = state.config.auth_token.as_deref() else {
            return Ok(AuthUser::Anonymous);
        };

        match auth_header {
            Some(header) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ");
                if token == expected {
                    Ok(AuthUser::Token)
                } else {
                    Err(AppError::Unauthorized("invalid bearer token"))
                }
            }
            Some(_) => Err(AppError::Unauthorized("invalid authorization header format")),
            None => Err(AppError::Unauthorized("missing authorization header")),
        }
    }
}
