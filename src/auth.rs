//! Caller identity forwarded by the upstream authentication layer.
//!
//! The gateway in front of this service authenticates the session and sets
//! `x-auth-user-id` and `x-auth-role`. Handlers extract an [`AuthContext`]
//! and pass it explicitly into every service operation.

use crate::error::{AppError, AppResult};
use crate::middleware::error::get_request_id_from_headers;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-auth-user-id";
pub const ROLE_HEADER: &str = "x-auth-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthContext {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::User,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> AppResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden("admin role required"))
        }
    }

    /// Client-supplied user ids must match the authenticated identity
    pub fn ensure_self(&self, claimed: Uuid) -> AppResult<()> {
        if self.user_id == claimed {
            Ok(())
        } else {
            Err(AppError::unauthorized(
                "user id does not match the authenticated identity",
            ))
        }
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = get_request_id_from_headers(&parts.headers);
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing authenticated identity"))
            .and_then(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|_| AppError::unauthorized("invalid authenticated identity"))
            })
            .map_err(|e| e.maybe_request_id(request_id.clone()))?;

        let role = match header(ROLE_HEADER) {
            None => Role::User,
            Some(raw) => Role::parse(raw).ok_or_else(|| {
                AppError::unauthorized("invalid role").maybe_request_id(request_id.clone())
            })?,
        };

        Ok(AuthContext { user_id, role })
    }
}
