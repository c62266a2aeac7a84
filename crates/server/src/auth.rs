//! Request authentication.
//!
//! Two auth modes via `MUNDI_AUTH_MODE`: `edit` maps every request to the
//! single demo user (self-hosted single-tenant deployments); `view_only`
//! requires a bearer token carrying the user id. Ownership checks downstream
//! use the resolved user id either way.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use errors::ErrorMetadata;
use uuid::{
    uuid,
    Uuid,
};

use crate::http_error::HttpResponseError;

pub const DEMO_USER_ID: Uuid = uuid!("00000000-0000-0000-0000-000000000001");

pub fn auth_mode() -> String {
    std::env::var("MUNDI_AUTH_MODE").unwrap_or_else(|_| "edit".to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct UserContext {
    pub user_id: Uuid,
}

impl UserContext {
    pub fn from_token(token: Option<&str>) -> anyhow::Result<Self> {
        if auth_mode() == "edit" {
            return Ok(Self {
                user_id: DEMO_USER_ID,
            });
        }
        let token = token.ok_or_else(|| {
            ErrorMetadata::unauthenticated("MissingToken", "Authentication required")
        })?;
        let user_id = token.parse().map_err(|_| {
            ErrorMetadata::unauthenticated("InvalidToken", "Authentication required")
        })?;
        Ok(Self { user_id })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for UserContext {
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        Ok(Self::from_token(bearer)?)
    }
}
