use crate::database::error::DatabaseError;
use crate::database::transaction_repository::{
    insert_ledger_entry, NewTransaction, Transaction, TransactionType,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// User profile and wallet. `id` equals the upstream authenticated identity.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub phone_number: Option<String>,
    pub wallet_balance: BigDecimal,
    pub deposited_balance: BigDecimal,
    pub total_earnings: BigDecimal,
    pub is_activated: bool,
    pub is_banned: bool,
    pub active_package_id: Option<Uuid>,
    pub package_expiry_date: Option<DateTime<Utc>>,
    pub last_checkin: Option<NaiveDate>,
    pub last_trivia_task_date: Option<NaiveDate>,
    pub last_music_task_date: Option<NaiveDate>,
    pub referral_code: String,
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Package validity is evaluated at read time
    pub fn package_is_active(&self, now: DateTime<Utc>) -> bool {
        self.active_package_id.is_some()
            && self.package_expiry_date.map(|expiry| expiry > now).unwrap_or(false)
    }

    pub fn has_active_package(&self, package_id: Uuid, now: DateTime<Utc>) -> bool {
        self.active_package_id == Some(package_id) && self.package_is_active(now)
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub phone_number: Option<String>,
    pub referral_code: String,
    pub referred_by: Option<Uuid>,
}

impl NewUser {
    pub fn into_user(self) -> User {
        let now = Utc::now();
        let zero = BigDecimal::from(0);
        User {
            id: self.id,
            display_name: self.display_name,
            phone_number: self.phone_number,
            wallet_balance: zero.clone(),
            deposited_balance: zero.clone(),
            total_earnings: zero,
            is_activated: false,
            is_banned: false,
            active_package_id: None,
            package_expiry_date: None,
            last_checkin: None,
            last_trivia_task_date: None,
            last_music_task_date: None,
            referral_code: self.referral_code,
            referred_by: self.referred_by,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CheckinOutcome {
    Granted {
        wallet_balance: BigDecimal,
        transaction: Transaction,
    },
    AlreadyCheckedIn,
    UserNotFound,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserCounts {
    pub total_users: i64,
    pub activated_users: i64,
    pub banned_users: i64,
    pub total_wallet_balance: BigDecimal,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError>;

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<User>, DatabaseError>;

    async fn insert_user(&self, new: NewUser) -> Result<User, DatabaseError>;

    async fn set_banned(&self, id: Uuid, banned: bool) -> Result<Option<User>, DatabaseError>;

    /// Credits the bonus and records a `bonus` entry at most once per `today`
    async fn claim_checkin_bonus(
        &self,
        user_id: Uuid,
        today: NaiveDate,
        bonus: BigDecimal,
    ) -> Result<CheckinOutcome, DatabaseError>;

    async fn count_users(&self) -> Result<UserCounts, DatabaseError>;
}

pub(crate) const USER_COLUMNS: &str = "id, display_name, phone_number, wallet_balance, \
     deposited_balance, total_earnings, is_activated, is_banned, active_package_id, \
     package_expiry_date, last_checkin, last_trivia_task_date, last_music_task_date, \
     referral_code, referred_by, created_at, updated_at";

pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for UserRepository {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError> {
        sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<User>, DatabaseError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE referral_code = $1",
            USER_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_user(&self, new: NewUser) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (id, display_name, phone_number, referral_code, referred_by)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(new.id)
        .bind(new.display_name)
        .bind(new.phone_number)
        .bind(new.referral_code)
        .bind(new.referred_by)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn set_banned(&self, id: Uuid, banned: bool) -> Result<Option<User>, DatabaseError> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET is_banned = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            USER_COLUMNS
        ))
        .bind(id)
        .bind(banned)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn claim_checkin_bonus(
        &self,
        user_id: Uuid,
        today: NaiveDate,
        bonus: BigDecimal,
    ) -> Result<CheckinOutcome, DatabaseError> {
        let mut db_tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let balance: Option<(BigDecimal,)> = sqlx::query_as(
            "UPDATE users
             SET wallet_balance = wallet_balance + $3,
                 total_earnings = total_earnings + $3,
                 last_checkin = $2,
                 updated_at = NOW()
             WHERE id = $1 AND (last_checkin IS NULL OR last_checkin < $2)
             RETURNING wallet_balance",
        )
        .bind(user_id)
        .bind(today)
        .bind(&bonus)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some((wallet_balance,)) = balance else {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut *db_tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(match exists {
                Some(_) => CheckinOutcome::AlreadyCheckedIn,
                None => CheckinOutcome::UserNotFound,
            });
        };

        let entry = NewTransaction::completed(
            user_id,
            TransactionType::Bonus,
            bonus,
            "Daily check-in bonus",
        );
        let transaction = insert_ledger_entry(&mut *db_tx, entry).await?;

        db_tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(CheckinOutcome::Granted {
            wallet_balance,
            transaction,
        })
    }

    async fn count_users(&self) -> Result<UserCounts, DatabaseError> {
        sqlx::query_as::<_, UserCounts>(
            "SELECT
                COUNT(*) AS total_users,
                COUNT(*) FILTER (WHERE is_activated) AS activated_users,
                COUNT(*) FILTER (WHERE is_banned) AS banned_users,
                COALESCE(SUM(wallet_balance), 0) AS total_wallet_balance
             FROM users",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
