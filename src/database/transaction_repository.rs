use crate::database::error::DatabaseError;
use crate::payments::types::CorrelationKey;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdraw,
    Earning,
    Bonus,
    Activation,
    Referral,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdraw => "withdraw",
            TransactionType::Earning => "earning",
            TransactionType::Bonus => "bonus",
            TransactionType::Activation => "activation",
            TransactionType::Referral => "referral",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(TransactionType::Deposit),
            "withdraw" => Some(TransactionType::Withdraw),
            "earning" => Some(TransactionType::Earning),
            "bonus" => Some(TransactionType::Bonus),
            "activation" => Some(TransactionType::Activation),
            "referral" => Some(TransactionType::Referral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "rejected" => Some(TransactionStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: BigDecimal,
    pub status: TransactionStatus,
    pub payment_method: Option<String>,
    pub description: Option<String>,
    pub payment_reference: Option<String>,
    pub checkout_request_id: Option<String>,
    pub payment_details: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: BigDecimal,
    pub status: TransactionStatus,
    pub payment_method: Option<String>,
    pub description: Option<String>,
    pub payment_details: JsonValue,
}

impl NewTransaction {
    /// Entries written by reward flows are settled immediately
    pub fn completed(
        user_id: Uuid,
        transaction_type: TransactionType,
        amount: BigDecimal,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            transaction_type,
            amount,
            status: TransactionStatus::Completed,
            payment_method: None,
            description: Some(description.into()),
            payment_details: JsonValue::Object(Default::default()),
        }
    }

    /// Assigns the id up front so it can be sent to a gateway as a reference
    pub fn into_transaction(self) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            transaction_type: self.transaction_type,
            amount: self.amount,
            status: self.status,
            payment_method: self.payment_method,
            description: self.description,
            payment_reference: None,
            checkout_request_id: None,
            payment_details: self.payment_details,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Gateway identifiers merged into a pending entry after initiation
#[derive(Debug, Clone, Default)]
pub struct GatewayReference {
    pub checkout_request_id: Option<String>,
    pub payment_reference: Option<String>,
    pub details: JsonValue,
}

/// Balance change applied together with a resolution
#[derive(Debug, Clone)]
pub struct BalanceEffect {
    pub user_id: Uuid,
    pub wallet_delta: BigDecimal,
    pub deposited_delta: BigDecimal,
    pub earnings_delta: BigDecimal,
}

impl BalanceEffect {
    pub fn credit_deposit(user_id: Uuid, amount: &BigDecimal) -> Self {
        Self {
            user_id,
            wallet_delta: amount.clone(),
            deposited_delta: amount.clone(),
            earnings_delta: BigDecimal::from(0),
        }
    }

    pub fn debit_withdrawal(user_id: Uuid, amount: &BigDecimal) -> Self {
        Self {
            user_id,
            wallet_delta: -amount.clone(),
            deposited_delta: BigDecimal::from(0),
            earnings_delta: BigDecimal::from(0),
        }
    }
}

/// Durable webhook idempotency key, unique per `(provider, event_key)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub provider: String,
    pub event_key: String,
}

/// Moves a pending entry to a terminal status. Every part is applied in one
/// database transaction or not at all.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub details: JsonValue,
    pub balance_effect: Option<BalanceEffect>,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Applied {
        transaction: Transaction,
        /// Wallet balance after the effect, when one was applied
        wallet_balance: Option<BigDecimal>,
    },
    AlreadyResolved {
        status: TransactionStatus,
    },
    DuplicateDelivery,
    InsufficientBalance {
        available: BigDecimal,
    },
    NotFound,
    UserNotFound,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LedgerSummary {
    pub pending_deposits: i64,
    pub pending_withdrawals: i64,
    pub completed_deposits: BigDecimal,
    pub completed_withdrawals: BigDecimal,
    pub total_earnings_paid: BigDecimal,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_transaction(&self, new: NewTransaction) -> Result<Transaction, DatabaseError>;

    async fn find_transaction(&self, id: Uuid) -> Result<Option<Transaction>, DatabaseError>;

    /// Most recent entry matching a gateway correlation key
    async fn find_by_correlation(
        &self,
        key: &CorrelationKey,
    ) -> Result<Option<Transaction>, DatabaseError>;

    async fn attach_gateway_reference(
        &self,
        id: Uuid,
        reference: GatewayReference,
    ) -> Result<Option<Transaction>, DatabaseError>;

    async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome, DatabaseError>;

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    async fn list_pending(
        &self,
        transaction_type: Option<TransactionType>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    async fn ledger_summary(&self) -> Result<LedgerSummary, DatabaseError>;
}

const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, status, payment_method, description, \
     payment_reference, checkout_request_id, payment_details, created_at, updated_at";

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    #[sqlx(rename = "type")]
    transaction_type: String,
    amount: BigDecimal,
    status: String,
    payment_method: Option<String>,
    description: Option<String>,
    payment_reference: Option<String>,
    checkout_request_id: Option<String>,
    payment_details: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            user_id: row.user_id,
            transaction_type: TransactionType::parse(&row.transaction_type).ok_or_else(|| {
                DatabaseError::decode(format!("unknown transaction type {}", row.transaction_type))
            })?,
            amount: row.amount,
            status: TransactionStatus::parse(&row.status).ok_or_else(|| {
                DatabaseError::decode(format!("unknown transaction status {}", row.status))
            })?,
            payment_method: row.payment_method,
            description: row.description,
            payment_reference: row.payment_reference,
            checkout_request_id: row.checkout_request_id,
            payment_details: row.payment_details,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `jsonb || NULL` yields NULL, so absent details merge as an empty object
fn details_patch(details: &JsonValue) -> JsonValue {
    match details {
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => other.clone(),
    }
}

/// In-process equivalent of `payment_details || patch`
pub(crate) fn merge_details(target: &mut JsonValue, patch: &JsonValue) {
    match (target, patch) {
        (JsonValue::Object(existing), JsonValue::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        }
        (target, JsonValue::Object(incoming)) => {
            *target = JsonValue::Object(incoming.clone());
        }
        _ => {}
    }
}

fn rows_into(rows: Vec<TransactionRow>) -> Result<Vec<Transaction>, DatabaseError> {
    rows.into_iter().map(Transaction::try_from).collect()
}

/// Writes a ledger entry on an existing connection or open transaction
pub(crate) async fn insert_ledger_entry(
    conn: &mut PgConnection,
    new: NewTransaction,
) -> Result<Transaction, DatabaseError> {
    let tx = new.into_transaction();
    sqlx::query(
        "INSERT INTO transactions
         (id, user_id, type, amount, status, payment_method, description, payment_details,
          created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
    )
    .bind(tx.id)
    .bind(tx.user_id)
    .bind(tx.transaction_type.as_str())
    .bind(&tx.amount)
    .bind(tx.status.as_str())
    .bind(&tx.payment_method)
    .bind(&tx.description)
    .bind(details_patch(&tx.payment_details))
    .bind(tx.created_at)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    Ok(tx)
}

/// Postgres-backed ledger
pub struct TransactionRepository {
    pool: PgPool,
}

impl TransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for TransactionRepository {
    async fn insert_transaction(&self, new: NewTransaction) -> Result<Transaction, DatabaseError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        insert_ledger_entry(&mut *conn, new).await
    }

    async fn find_transaction(&self, id: Uuid) -> Result<Option<Transaction>, DatabaseError> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Transaction::try_from)
        .transpose()
    }

    async fn find_by_correlation(
        &self,
        key: &CorrelationKey,
    ) -> Result<Option<Transaction>, DatabaseError> {
        let (column, value) = match key {
            CorrelationKey::TransactionId(id) => return self.find_transaction(*id).await,
            CorrelationKey::CheckoutRequestId(value) => ("checkout_request_id", value),
            CorrelationKey::PaymentReference(value) => ("payment_reference", value),
        };

        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE {} = $1 ORDER BY created_at DESC LIMIT 1",
            TRANSACTION_COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Transaction::try_from)
        .transpose()
    }

    async fn attach_gateway_reference(
        &self,
        id: Uuid,
        reference: GatewayReference,
    ) -> Result<Option<Transaction>, DatabaseError> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "UPDATE transactions
             SET checkout_request_id = COALESCE($2, checkout_request_id),
                 payment_reference = COALESCE($3, payment_reference),
                 payment_details = payment_details || $4,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(reference.checkout_request_id)
        .bind(reference.payment_reference)
        .bind(details_patch(&reference.details))
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Transaction::try_from)
        .transpose()
    }

    async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome, DatabaseError> {
        let mut db_tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let current = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(resolution.transaction_id)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(current) = current else {
            db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(ResolveOutcome::NotFound);
        };
        let current = Transaction::try_from(current)?;

        if let Some(key) = &resolution.idempotency_key {
            let claimed = sqlx::query(
                "INSERT INTO processed_callbacks (provider, event_key, transaction_id)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (provider, event_key) DO NOTHING",
            )
            .bind(&key.provider)
            .bind(&key.event_key)
            .bind(resolution.transaction_id)
            .execute(&mut *db_tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .rows_affected();

            if claimed == 0 {
                db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(ResolveOutcome::DuplicateDelivery);
            }
        }

        if current.status.is_terminal() {
            db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(ResolveOutcome::AlreadyResolved {
                status: current.status,
            });
        }

        let updated = sqlx::query_as::<_, TransactionRow>(&format!(
            "UPDATE transactions
             SET status = $2, payment_details = payment_details || $3, updated_at = NOW()
             WHERE id = $1 AND status = 'pending'
             RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(resolution.transaction_id)
        .bind(resolution.status.as_str())
        .bind(details_patch(&resolution.details))
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(updated) = updated else {
            db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(ResolveOutcome::AlreadyResolved {
                status: current.status,
            });
        };

        let mut wallet_balance = None;
        if let Some(effect) = &resolution.balance_effect {
            let balance: Option<(BigDecimal,)> = sqlx::query_as(
                "UPDATE users
                 SET wallet_balance = wallet_balance + $2,
                     deposited_balance = deposited_balance + $3,
                     total_earnings = total_earnings + $4,
                     updated_at = NOW()
                 WHERE id = $1 AND wallet_balance + $2 >= 0
                 RETURNING wallet_balance",
            )
            .bind(effect.user_id)
            .bind(&effect.wallet_delta)
            .bind(&effect.deposited_delta)
            .bind(&effect.earnings_delta)
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            match balance {
                Some((balance,)) => wallet_balance = Some(balance),
                None => {
                    let available: Option<(BigDecimal,)> =
                        sqlx::query_as("SELECT wallet_balance FROM users WHERE id = $1")
                            .bind(effect.user_id)
                            .fetch_optional(&mut *db_tx)
                            .await
                            .map_err(DatabaseError::from_sqlx)?;
                    db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                    return Ok(match available {
                        Some((available,)) => ResolveOutcome::InsufficientBalance { available },
                        None => ResolveOutcome::UserNotFound,
                    });
                }
            }
        }

        db_tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(ResolveOutcome::Applied {
            transaction: updated.try_into()?,
            wallet_balance,
        })
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows_into(rows)
    }

    async fn list_pending(
        &self,
        transaction_type: Option<TransactionType>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions
             WHERE status = 'pending' AND ($1::TEXT IS NULL OR type = $1)
             ORDER BY created_at ASC
             LIMIT $2",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_type.map(|t| t.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows_into(rows)
    }

    async fn ledger_summary(&self) -> Result<LedgerSummary, DatabaseError> {
        sqlx::query_as::<_, LedgerSummary>(
            "SELECT
                COUNT(*) FILTER (WHERE type = 'deposit' AND status = 'pending') AS pending_deposits,
                COUNT(*) FILTER (WHERE type = 'withdraw' AND status = 'pending') AS pending_withdrawals,
                COALESCE(SUM(amount) FILTER (WHERE type = 'deposit' AND status = 'completed'), 0)
                    AS completed_deposits,
                COALESCE(SUM(amount) FILTER (WHERE type = 'withdraw' AND status = 'completed'), 0)
                    AS completed_withdrawals,
                COALESCE(SUM(amount) FILTER (WHERE type = 'earning' AND status = 'completed'), 0)
                    AS total_earnings_paid
             FROM transactions",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::error::DatabaseErrorKind;

    fn row(transaction_type: &str, status: &str) -> TransactionRow {
        TransactionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            transaction_type: transaction_type.to_string(),
            amount: BigDecimal::from(100),
            status: status.to_string(),
            payment_method: Some("mpesa".to_string()),
            description: None,
            payment_reference: None,
            checkout_request_id: Some("ws_CO_1".to_string()),
            payment_details: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn row_conversion_parses_enums() {
        let tx = Transaction::try_from(row("deposit", "pending")).unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Deposit);
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[test]
    fn row_conversion_rejects_unknown_values() {
        let err = Transaction::try_from(row("transfer", "pending")).unwrap_err();
        assert!(matches!(err.kind, DatabaseErrorKind::Decode { .. }));
        assert!(Transaction::try_from(row("deposit", "failed")).is_err());
    }

    #[test]
    fn details_merge_overwrites_top_level_keys() {
        let mut details = serde_json::json!({"provider": "mpesa", "note": "queued"});
        merge_details(&mut details, &serde_json::json!({"note": "settled", "receipt": "R1"}));
        assert_eq!(
            details,
            serde_json::json!({"provider": "mpesa", "note": "settled", "receipt": "R1"})
        );
        merge_details(&mut details, &JsonValue::Null);
        assert_eq!(details["receipt"], "R1");
    }

    #[test]
    fn status_terminality() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Rejected.is_terminal());
    }

    #[test]
    fn balance_effects_have_expected_signs() {
        let user = Uuid::new_v4();
        let amount = BigDecimal::from(500);
        let credit = BalanceEffect::credit_deposit(user, &amount);
        assert_eq!(credit.wallet_delta, amount);
        assert_eq!(credit.deposited_delta, amount);

        let debit = BalanceEffect::debit_withdrawal(user, &amount);
        assert_eq!(debit.wallet_delta, BigDecimal::from(-500));
        assert_eq!(debit.deposited_delta, BigDecimal::from(0));
    }

    #[test]
    fn transaction_serializes_type_field() {
        let tx = NewTransaction::completed(
            Uuid::new_v4(),
            TransactionType::Earning,
            BigDecimal::from(30),
            "Trivia reward",
        )
        .into_transaction();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "earning");
        assert_eq!(json["status"], "completed");
    }
}
