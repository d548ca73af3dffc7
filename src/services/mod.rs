//! Business operations. Each takes an explicit [`crate::auth::AuthContext`]
//! and, where limits or gateways matter, the current settings snapshot.

pub mod admin;
pub mod payment_service;
pub mod reconciler;
pub mod rewards;
pub mod settings;
pub mod tasks;
pub mod users;

use crate::database::user_repository::{User, UserStore};
use crate::error::{AppError, AppResult, DomainError, ValidationError};
use bigdecimal::BigDecimal;
use uuid::Uuid;

pub use admin::AdminService;
pub use payment_service::PaymentService;
pub use reconciler::{ReconcileOutcome, WebhookProcessor, WebhookProcessorError};
pub use rewards::RewardService;
pub use settings::{SettingsService, SettingsSnapshot};
pub use tasks::TaskService;
pub use users::UserService;

/// Loads the caller's profile and refuses banned accounts
pub(crate) async fn active_user(users: &dyn UserStore, user_id: Uuid) -> AppResult<User> {
    let user = users.find_user(user_id).await?.ok_or_else(|| {
        AppError::domain(DomainError::UserNotFound {
            user_id: user_id.to_string(),
        })
    })?;
    if user.is_banned {
        return Err(AppError::forbidden("account is suspended"));
    }
    Ok(user)
}

pub(crate) fn ensure_amount_in_range(
    amount: &BigDecimal,
    min: &BigDecimal,
    max: Option<&BigDecimal>,
) -> AppResult<()> {
    if *amount <= BigDecimal::from(0) {
        return Err(AppError::validation(ValidationError::InvalidAmount {
            amount: amount.to_string(),
            reason: "amount must be greater than zero".to_string(),
        }));
    }
    ensure_cents(amount)?;
    let below = amount < min;
    let above = max.is_some_and(|max| amount > max);
    if below || above {
        return Err(AppError::validation(ValidationError::OutOfRange {
            field: "amount".to_string(),
            min: Some(min.to_string()),
            max: max.map(|m| m.to_string()),
        }));
    }
    Ok(())
}

/// Money columns are `NUMERIC(18, 2)`; finer amounts would be rounded on write
pub(crate) fn ensure_cents(amount: &BigDecimal) -> AppResult<()> {
    if amount.with_scale(2) != *amount {
        return Err(AppError::validation(ValidationError::InvalidAmount {
            amount: amount.to_string(),
            reason: "amount must have at most 2 decimal places".to_string(),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_range_checks() {
        let min = BigDecimal::from(100);
        let max = BigDecimal::from(1000);
        assert!(ensure_amount_in_range(&BigDecimal::from(100), &min, Some(&max)).is_ok());
        assert!(ensure_amount_in_range(&BigDecimal::from(0), &min, None).is_err());
        assert!(ensure_amount_in_range(&BigDecimal::from(99), &min, None).is_err());
        assert!(ensure_amount_in_range(&BigDecimal::from(1001), &min, Some(&max)).is_err());
        assert!(ensure_amount_in_range(&BigDecimal::from(5000), &min, None).is_ok());
    }

    #[test]
    fn sub_cent_amounts_are_refused() {
        let min = BigDecimal::from(10);
        let cents: BigDecimal = "150.25".parse().unwrap();
        let padded: BigDecimal = "150.2500".parse().unwrap();
        let fine: BigDecimal = "150.255".parse().unwrap();
        assert!(ensure_amount_in_range(&cents, &min, None).is_ok());
        assert!(ensure_amount_in_range(&padded, &min, None).is_ok());

        let err = ensure_amount_in_range(&fine, &min, None).unwrap_err();
        assert_eq!(err.error_code(), crate::error::ErrorCode::ValidationError);
    }
}
