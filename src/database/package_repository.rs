use crate::database::error::DatabaseError;
use crate::database::transaction_repository::{
    insert_ledger_entry, NewTransaction, Transaction, TransactionType,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ActivationPackage {
    pub id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub benefits: Json<Vec<String>>,
    pub duration_days: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPackage {
    pub name: String,
    pub price: BigDecimal,
    #[serde(default)]
    pub benefits: Vec<String>,
    pub duration_days: i32,
}

impl NewPackage {
    pub fn into_package(self) -> ActivationPackage {
        ActivationPackage {
            id: Uuid::new_v4(),
            name: self.name,
            price: self.price,
            benefits: Json(self.benefits),
            duration_days: self.duration_days,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Everything a purchase writes, computed by the caller from the package and
/// the settings snapshot
#[derive(Debug, Clone)]
pub struct PackagePurchase {
    pub user_id: Uuid,
    pub package_id: Uuid,
    pub price: BigDecimal,
    pub expires_at: DateTime<Utc>,
    pub referral_bonus: BigDecimal,
    pub description: String,
}

#[derive(Debug, Clone)]
pub enum PurchaseOutcome {
    Purchased {
        wallet_balance: BigDecimal,
        package_expiry_date: DateTime<Utc>,
        transaction: Transaction,
        /// Referrer credited by this purchase, if any
        referral_paid_to: Option<Uuid>,
    },
    InsufficientBalance {
        available: BigDecimal,
    },
    UserNotFound,
}

#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn find_package(&self, id: Uuid) -> Result<Option<ActivationPackage>, DatabaseError>;

    async fn list_active_packages(&self) -> Result<Vec<ActivationPackage>, DatabaseError>;

    async fn insert_package(&self, new: NewPackage) -> Result<ActivationPackage, DatabaseError>;

    /// Debits the price, activates the package and pays the referrer on the
    /// buyer's first activation, in one transaction
    async fn purchase_package(
        &self,
        purchase: PackagePurchase,
    ) -> Result<PurchaseOutcome, DatabaseError>;
}

const PACKAGE_COLUMNS: &str = "id, name, price, benefits, duration_days, is_active, created_at";

pub struct PackageRepository {
    pool: PgPool,
}

impl PackageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PackageStore for PackageRepository {
    async fn find_package(&self, id: Uuid) -> Result<Option<ActivationPackage>, DatabaseError> {
        sqlx::query_as::<_, ActivationPackage>(&format!(
            "SELECT {} FROM activation_packages WHERE id = $1",
            PACKAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_active_packages(&self) -> Result<Vec<ActivationPackage>, DatabaseError> {
        sqlx::query_as::<_, ActivationPackage>(&format!(
            "SELECT {} FROM activation_packages WHERE is_active ORDER BY price ASC",
            PACKAGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_package(&self, new: NewPackage) -> Result<ActivationPackage, DatabaseError> {
        let package = new.into_package();
        sqlx::query_as::<_, ActivationPackage>(&format!(
            "INSERT INTO activation_packages (id, name, price, benefits, duration_days, is_active)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            PACKAGE_COLUMNS
        ))
        .bind(package.id)
        .bind(&package.name)
        .bind(&package.price)
        .bind(&package.benefits)
        .bind(package.duration_days)
        .bind(package.is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn purchase_package(
        &self,
        purchase: PackagePurchase,
    ) -> Result<PurchaseOutcome, DatabaseError> {
        let mut db_tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let buyer: Option<(bool, Option<Uuid>, BigDecimal)> = sqlx::query_as(
            "SELECT is_activated, referred_by, wallet_balance FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(purchase.user_id)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some((was_activated, referred_by, available)) = buyer else {
            db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(PurchaseOutcome::UserNotFound);
        };

        let debited: Option<(BigDecimal,)> = sqlx::query_as(
            "UPDATE users
             SET wallet_balance = wallet_balance - $2,
                 is_activated = TRUE,
                 active_package_id = $3,
                 package_expiry_date = $4,
                 updated_at = NOW()
             WHERE id = $1 AND wallet_balance - $2 >= 0
             RETURNING wallet_balance",
        )
        .bind(purchase.user_id)
        .bind(&purchase.price)
        .bind(purchase.package_id)
        .bind(purchase.expires_at)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some((wallet_balance,)) = debited else {
            db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(PurchaseOutcome::InsufficientBalance { available });
        };

        let mut entry = NewTransaction::completed(
            purchase.user_id,
            TransactionType::Activation,
            purchase.price,
            purchase.description,
        );
        entry.payment_method = Some("wallet".to_string());
        entry.payment_details = serde_json::json!({ "package_id": purchase.package_id });
        let transaction = insert_ledger_entry(&mut *db_tx, entry).await?;

        let mut referral_paid_to = None;
        let bonus_due = purchase.referral_bonus > BigDecimal::from(0);
        if let (false, true, Some(referrer)) = (was_activated, bonus_due, referred_by) {
            let credited: Option<(Uuid,)> = sqlx::query_as(
                "UPDATE users
                 SET wallet_balance = wallet_balance + $2,
                     total_earnings = total_earnings + $2,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING id",
            )
            .bind(referrer)
            .bind(&purchase.referral_bonus)
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            if credited.is_some() {
                let mut reward = NewTransaction::completed(
                    referrer,
                    TransactionType::Referral,
                    purchase.referral_bonus,
                    "Referral bonus",
                );
                reward.payment_details = serde_json::json!({ "referred_user_id": purchase.user_id });
                insert_ledger_entry(&mut *db_tx, reward).await?;
                referral_paid_to = Some(referrer);
            }
        }

        db_tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(PurchaseOutcome::Purchased {
            wallet_balance,
            package_expiry_date: purchase.expires_at,
            transaction,
            referral_paid_to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_packages_are_active_and_keep_benefit_order() {
        let package = NewPackage {
            name: "Gold".to_string(),
            price: BigDecimal::from(500),
            benefits: vec!["Music tasks".to_string(), "Trivia".to_string()],
            duration_days: 30,
        }
        .into_package();

        assert!(package.is_active);
        let json = serde_json::to_value(&package).unwrap();
        assert_eq!(json["benefits"], serde_json::json!(["Music tasks", "Trivia"]));
    }
}
