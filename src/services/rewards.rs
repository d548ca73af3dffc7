//! Daily check-in bonus and activation package purchases.

use crate::auth::AuthContext;
use crate::database::package_repository::{
    ActivationPackage, PackagePurchase, PackageStore, PurchaseOutcome,
};
use crate::database::transaction_repository::Transaction;
use crate::database::user_repository::{CheckinOutcome, UserStore};
use crate::error::{AppError, AppResult, DomainError};
use crate::services::active_user;
use crate::services::settings::SettingsSnapshot;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinResult {
    pub bonus: BigDecimal,
    pub wallet_balance: BigDecimal,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResult {
    pub package: ActivationPackage,
    pub wallet_balance: BigDecimal,
    pub package_expiry_date: DateTime<Utc>,
    pub transaction: Transaction,
    pub referral_bonus_paid: bool,
}

pub struct RewardService {
    users: Arc<dyn UserStore>,
    packages: Arc<dyn PackageStore>,
}

impl RewardService {
    pub fn new(users: Arc<dyn UserStore>, packages: Arc<dyn PackageStore>) -> Self {
        Self { users, packages }
    }

    pub async fn checkin(
        &self,
        ctx: &AuthContext,
        snapshot: &SettingsSnapshot,
    ) -> AppResult<CheckinResult> {
        let user = active_user(self.users.as_ref(), ctx.user_id).await?;
        let bonus = snapshot.app.checkin_bonus.clone();
        let today = Utc::now().date_naive();

        match self
            .users
            .claim_checkin_bonus(user.id, today, bonus.clone())
            .await?
        {
            CheckinOutcome::Granted {
                wallet_balance,
                transaction,
            } => {
                crate::log_transaction!(
                    event = "checkin_bonus",
                    transaction_id = transaction.id,
                    user_id = user.id,
                    amount = bonus,
                );
                Ok(CheckinResult {
                    bonus,
                    wallet_balance,
                    transaction,
                })
            }
            CheckinOutcome::AlreadyCheckedIn => {
                Err(AppError::domain(DomainError::DailyLimitReached {
                    activity: "checkin".to_string(),
                }))
            }
            CheckinOutcome::UserNotFound => Err(user_not_found(user.id)),
        }
    }

    pub async fn list_packages(&self) -> AppResult<Vec<ActivationPackage>> {
        Ok(self.packages.list_active_packages().await?)
    }

    /// Debits the price from the wallet and activates the package. The first
    /// activation pays the referrer the configured bonus.
    pub async fn purchase_package(
        &self,
        ctx: &AuthContext,
        snapshot: &SettingsSnapshot,
        package_id: Uuid,
    ) -> AppResult<PurchaseResult> {
        let user = active_user(self.users.as_ref(), ctx.user_id).await?;
        let package = self
            .packages
            .find_package(package_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                AppError::domain(DomainError::PackageNotFound {
                    package_id: package_id.to_string(),
                })
            })?;

        let purchase = PackagePurchase {
            user_id: user.id,
            package_id: package.id,
            price: package.price.clone(),
            expires_at: Utc::now() + Duration::days(i64::from(package.duration_days)),
            referral_bonus: snapshot.app.referral_bonus.clone(),
            description: format!("Activation: {}", package.name),
        };

        match self.packages.purchase_package(purchase).await? {
            PurchaseOutcome::Purchased {
                wallet_balance,
                package_expiry_date,
                transaction,
                referral_paid_to,
            } => {
                crate::log_transaction!(
                    event = "package_purchased",
                    transaction_id = transaction.id,
                    user_id = user.id,
                    package_id = package.id,
                    amount = package.price,
                );
                if let Some(referrer) = referral_paid_to {
                    info!(
                        user_id = %user.id,
                        referrer_id = %referrer,
                        bonus = %snapshot.app.referral_bonus,
                        "referral bonus paid"
                    );
                }
                Ok(PurchaseResult {
                    package,
                    wallet_balance,
                    package_expiry_date,
                    transaction,
                    referral_bonus_paid: referral_paid_to.is_some(),
                })
            }
            PurchaseOutcome::InsufficientBalance { available } => {
                Err(AppError::domain(DomainError::InsufficientBalance {
                    available: available.to_string(),
                    required: package.price.to_string(),
                }))
            }
            PurchaseOutcome::UserNotFound => Err(user_not_found(user.id)),
        }
    }
}

fn user_not_found(user_id: Uuid) -> AppError {
    AppError::domain(DomainError::UserNotFound {
        user_id: user_id.to_string(),
    })
}
