//! Profile registration and lookup.

use crate::auth::AuthContext;
use crate::database::error::DatabaseErrorKind;
use crate::database::user_repository::{NewUser, User, UserStore};
use crate::error::{AppError, AppResult, DomainError, ValidationError};
use crate::logging::mask_phone_number;
use crate::payments::utils::{normalize_phone, PhoneFormat};
use crate::services::active_user;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const REFERRAL_CODE_LEN: usize = 8;
const REFERRAL_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Code of the user who invited this one
    #[serde(default)]
    pub referral_code: Option<String>,
}

pub struct UserService {
    users: Arc<dyn UserStore>,
}

impl UserService {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    /// Creates the profile row for an identity the auth layer already knows
    pub async fn register(&self, ctx: &AuthContext, request: RegisterRequest) -> AppResult<User> {
        let phone_number = match request.phone_number.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(normalize_phone(raw, PhoneFormat::Plain254)?),
            _ => None,
        };

        let referred_by = match request.referral_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                let referrer = self
                    .users
                    .find_by_referral_code(&code.to_uppercase())
                    .await?
                    .ok_or_else(|| {
                        AppError::validation(ValidationError::InvalidField {
                            field: "referral_code".to_string(),
                            reason: "no user has this referral code".to_string(),
                        })
                    })?;
                Some(referrer.id)
            }
            _ => None,
        };

        let display_name = request
            .display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        for attempt in 1..=REFERRAL_CODE_ATTEMPTS {
            let new = NewUser {
                id: ctx.user_id,
                display_name: display_name.clone(),
                phone_number: phone_number.clone(),
                referral_code: generate_referral_code(),
                referred_by,
            };

            match self.users.insert_user(new).await {
                Ok(user) => {
                    info!(
                        user_id = %user.id,
                        phone = %user.phone_number.as_deref().map(mask_phone_number).unwrap_or_default(),
                        referred = user.referred_by.is_some(),
                        "user registered"
                    );
                    return Ok(user);
                }
                Err(err) => match &err.kind {
                    DatabaseErrorKind::UniqueViolation { constraint }
                        if constraint.contains("referral_code") =>
                    {
                        warn!(attempt, "referral code collision, regenerating");
                    }
                    DatabaseErrorKind::UniqueViolation { .. } => {
                        return Err(AppError::domain(DomainError::UserAlreadyExists {
                            user_id: ctx.user_id.to_string(),
                        }));
                    }
                    _ => return Err(err.into()),
                },
            }
        }

        Err(AppError::validation(ValidationError::InvalidField {
            field: "referral_code".to_string(),
            reason: "could not allocate a unique referral code".to_string(),
        }))
    }

    pub async fn profile(&self, ctx: &AuthContext) -> AppResult<User> {
        active_user(self.users.as_ref(), ctx.user_id).await
    }
}

fn generate_referral_code() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(REFERRAL_CODE_LEN)
        .collect::<String>()
        .to_uppercase()
}
