//! Admin approval workflow and back-office operations.
//!
//! Approvals re-check the caller-supplied owner and amount against the stored
//! entry, then resolve it and apply the balance effect in one store call.

use crate::auth::AuthContext;
use crate::database::package_repository::{ActivationPackage, NewPackage, PackageStore};
use crate::database::settings_repository::SettingEntry;
use crate::database::task_repository::{
    MusicTask, NewMusicTask, NewTriviaQuestion, TaskCounts, TaskKind, TaskStore, TriviaQuestion,
};
use crate::database::transaction_repository::{
    BalanceEffect, LedgerStore, LedgerSummary, Resolution, ResolveOutcome, Transaction,
    TransactionStatus, TransactionType,
};
use crate::database::user_repository::{User, UserCounts, UserStore};
use crate::error::{AppError, AppResult, DomainError, ValidationError};
use crate::services::ensure_cents;
use crate::services::settings::SettingsService;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const DEFAULT_PENDING_LIMIT: i64 = 100;

/// Owner and amount the reviewer saw when approving
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub user_id: Uuid,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RejectionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResult {
    pub transaction: Transaction,
    pub wallet_balance: Option<BigDecimal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminDashboard {
    pub users: UserCounts,
    pub ledger: LedgerSummary,
    pub tasks: TaskCounts,
    pub generated_at: DateTime<Utc>,
}

pub struct AdminService {
    ledger: Arc<dyn LedgerStore>,
    users: Arc<dyn UserStore>,
    tasks: Arc<dyn TaskStore>,
    packages: Arc<dyn PackageStore>,
    settings: Arc<SettingsService>,
}

impl AdminService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        users: Arc<dyn UserStore>,
        tasks: Arc<dyn TaskStore>,
        packages: Arc<dyn PackageStore>,
        settings: Arc<SettingsService>,
    ) -> Self {
        Self {
            ledger,
            users,
            tasks,
            packages,
            settings,
        }
    }

    pub async fn approve_deposit(
        &self,
        ctx: &AuthContext,
        transaction_id: Uuid,
        request: ApprovalRequest,
    ) -> AppResult<ReviewResult> {
        ctx.require_admin()?;
        let tx = self
            .reviewable(transaction_id, TransactionType::Deposit, Some(&request))
            .await?;
        let effect = BalanceEffect::credit_deposit(tx.user_id, &tx.amount);
        self.settle(ctx, tx, TransactionStatus::Completed, Some(effect), None)
            .await
    }

    pub async fn reject_deposit(
        &self,
        ctx: &AuthContext,
        transaction_id: Uuid,
        request: RejectionRequest,
    ) -> AppResult<ReviewResult> {
        ctx.require_admin()?;
        let tx = self
            .reviewable(transaction_id, TransactionType::Deposit, None)
            .await?;
        self.settle(ctx, tx, TransactionStatus::Rejected, None, request.reason)
            .await
    }

    /// Debits the wallet under the `balance - amount >= 0` guard. A failed
    /// guard leaves the entry pending.
    pub async fn approve_withdrawal(
        &self,
        ctx: &AuthContext,
        transaction_id: Uuid,
        request: ApprovalRequest,
    ) -> AppResult<ReviewResult> {
        ctx.require_admin()?;
        let tx = self
            .reviewable(transaction_id, TransactionType::Withdraw, Some(&request))
            .await?;
        let effect = BalanceEffect::debit_withdrawal(tx.user_id, &tx.amount);
        self.settle(ctx, tx, TransactionStatus::Completed, Some(effect), None)
            .await
    }

    pub async fn reject_withdrawal(
        &self,
        ctx: &AuthContext,
        transaction_id: Uuid,
        request: RejectionRequest,
    ) -> AppResult<ReviewResult> {
        ctx.require_admin()?;
        let tx = self
            .reviewable(transaction_id, TransactionType::Withdraw, None)
            .await?;
        self.settle(ctx, tx, TransactionStatus::Rejected, None, request.reason)
            .await
    }

    async fn reviewable(
        &self,
        transaction_id: Uuid,
        expected_type: TransactionType,
        approval: Option<&ApprovalRequest>,
    ) -> AppResult<Transaction> {
        let tx = self
            .ledger
            .find_transaction(transaction_id)
            .await?
            .ok_or_else(|| not_found(transaction_id))?;

        if tx.transaction_type != expected_type {
            return Err(mismatch(
                "type",
                expected_type.as_str(),
                tx.transaction_type.as_str(),
            ));
        }
        if tx.status.is_terminal() {
            return Err(already_resolved(tx.id, tx.status));
        }
        if let Some(approval) = approval {
            if approval.user_id != tx.user_id {
                return Err(mismatch(
                    "user_id",
                    &tx.user_id.to_string(),
                    &approval.user_id.to_string(),
                ));
            }
            if approval.amount != tx.amount {
                return Err(mismatch(
                    "amount",
                    &tx.amount.to_string(),
                    &approval.amount.to_string(),
                ));
            }
        }
        Ok(tx)
    }

    async fn settle(
        &self,
        ctx: &AuthContext,
        tx: Transaction,
        status: TransactionStatus,
        balance_effect: Option<BalanceEffect>,
        reason: Option<String>,
    ) -> AppResult<ReviewResult> {
        let resolution = Resolution {
            transaction_id: tx.id,
            status,
            details: json!({
                "reviewed_by": ctx.user_id,
                "reviewed_at": Utc::now().to_rfc3339(),
                "review_reason": reason,
            }),
            balance_effect,
            idempotency_key: None,
        };

        match self.ledger.resolve(resolution).await? {
            ResolveOutcome::Applied {
                transaction,
                wallet_balance,
            } => {
                crate::log_transaction!(
                    event = "admin_review",
                    transaction_id = transaction.id,
                    admin_id = ctx.user_id,
                    transaction_type = transaction.transaction_type.as_str(),
                    status = transaction.status.as_str(),
                    amount = transaction.amount,
                );
                Ok(ReviewResult {
                    transaction,
                    wallet_balance,
                })
            }
            ResolveOutcome::AlreadyResolved { status } => Err(already_resolved(tx.id, status)),
            ResolveOutcome::InsufficientBalance { available } => {
                Err(AppError::domain(DomainError::InsufficientBalance {
                    available: available.to_string(),
                    required: tx.amount.to_string(),
                }))
            }
            ResolveOutcome::UserNotFound => Err(AppError::domain(DomainError::UserNotFound {
                user_id: tx.user_id.to_string(),
            })),
            ResolveOutcome::NotFound | ResolveOutcome::DuplicateDelivery => Err(not_found(tx.id)),
        }
    }

    pub async fn list_pending(
        &self,
        ctx: &AuthContext,
        transaction_type: Option<TransactionType>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Transaction>> {
        ctx.require_admin()?;
        let limit = limit.unwrap_or(DEFAULT_PENDING_LIMIT).clamp(1, 500);
        Ok(self.ledger.list_pending(transaction_type, limit).await?)
    }

    pub async fn set_banned(
        &self,
        ctx: &AuthContext,
        user_id: Uuid,
        banned: bool,
    ) -> AppResult<User> {
        ctx.require_admin()?;
        let user = self.users.set_banned(user_id, banned).await?.ok_or_else(|| {
            AppError::domain(DomainError::UserNotFound {
                user_id: user_id.to_string(),
            })
        })?;
        info!(admin_id = %ctx.user_id, user_id = %user_id, banned, "user ban flag updated");
        Ok(user)
    }

    pub async fn update_setting(
        &self,
        ctx: &AuthContext,
        key: &str,
        value: JsonValue,
    ) -> AppResult<SettingEntry> {
        ctx.require_admin()?;
        let (entry, _) = self.settings.update(key, value).await?;
        info!(admin_id = %ctx.user_id, key = %key, "settings written");
        Ok(entry)
    }

    pub async fn reload_settings(&self, ctx: &AuthContext) -> AppResult<DateTime<Utc>> {
        ctx.require_admin()?;
        let snapshot = self.settings.reload().await?;
        Ok(snapshot.loaded_at)
    }

    pub async fn create_music_task(
        &self,
        ctx: &AuthContext,
        new: NewMusicTask,
    ) -> AppResult<MusicTask> {
        ctx.require_admin()?;
        require_text("title", &new.title)?;
        require_text("audio_url", &new.audio_url)?;
        require_positive_reward(&new.reward)?;
        if new.duration_seconds <= 0 {
            return Err(AppError::validation(ValidationError::OutOfRange {
                field: "duration_seconds".to_string(),
                min: Some("1".to_string()),
                max: None,
            }));
        }
        Ok(self.tasks.insert_music_task(new).await?)
    }

    pub async fn create_trivia_question(
        &self,
        ctx: &AuthContext,
        new: NewTriviaQuestion,
    ) -> AppResult<TriviaQuestion> {
        ctx.require_admin()?;
        require_text("question", &new.question)?;
        require_positive_reward(&new.reward)?;
        if new.options.len() < 2 {
            return Err(AppError::validation(ValidationError::InvalidField {
                field: "options".to_string(),
                reason: "at least two options are required".to_string(),
            }));
        }
        let answer = new.correct_answer.trim();
        if !new
            .options
            .iter()
            .any(|option| option.trim().eq_ignore_ascii_case(answer))
        {
            return Err(AppError::validation(ValidationError::InvalidField {
                field: "correct_answer".to_string(),
                reason: "must be one of the options".to_string(),
            }));
        }
        Ok(self.tasks.insert_trivia_question(new).await?)
    }

    pub async fn create_package(
        &self,
        ctx: &AuthContext,
        new: NewPackage,
    ) -> AppResult<ActivationPackage> {
        ctx.require_admin()?;
        require_text("name", &new.name)?;
        if new.price <= BigDecimal::from(0) {
            return Err(AppError::validation(ValidationError::InvalidAmount {
                amount: new.price.to_string(),
                reason: "price must be greater than zero".to_string(),
            }));
        }
        ensure_cents(&new.price)?;
        if new.duration_days <= 0 {
            return Err(AppError::validation(ValidationError::OutOfRange {
                field: "duration_days".to_string(),
                min: Some("1".to_string()),
                max: None,
            }));
        }
        Ok(self.packages.insert_package(new).await?)
    }

    pub async fn set_content_active(
        &self,
        ctx: &AuthContext,
        kind: TaskKind,
        id: Uuid,
        active: bool,
    ) -> AppResult<()> {
        ctx.require_admin()?;
        if !self.tasks.set_task_active(kind, id, active).await? {
            return Err(AppError::domain(DomainError::TaskNotFound {
                task_id: id.to_string(),
            }));
        }
        info!(admin_id = %ctx.user_id, kind = kind.as_str(), task_id = %id, active, "content toggled");
        Ok(())
    }

    /// Aggregates are independent reads, so they are issued together
    pub async fn dashboard(&self, ctx: &AuthContext) -> AppResult<AdminDashboard> {
        ctx.require_admin()?;
        let today = Utc::now().date_naive();
        let (users, ledger, tasks) = futures::try_join!(
            self.users.count_users(),
            self.ledger.ledger_summary(),
            self.tasks.count_active_tasks(today),
        )?;
        Ok(AdminDashboard {
            users,
            ledger,
            tasks,
            generated_at: Utc::now(),
        })
    }
}

fn not_found(transaction_id: Uuid) -> AppError {
    AppError::domain(DomainError::TransactionNotFound {
        transaction_id: transaction_id.to_string(),
    })
}

fn already_resolved(transaction_id: Uuid, status: TransactionStatus) -> AppError {
    AppError::domain(DomainError::TransactionAlreadyResolved {
        transaction_id: transaction_id.to_string(),
        status: status.to_string(),
    })
}

fn mismatch(field: &str, expected: &str, actual: &str) -> AppError {
    AppError::validation(ValidationError::Mismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}

fn require_text(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::validation(ValidationError::MissingField {
            field: field.to_string(),
        }));
    }
    Ok(())
}

fn require_positive_reward(reward: &BigDecimal) -> AppResult<()> {
    if *reward <= BigDecimal::from(0) {
        return Err(AppError::validation(ValidationError::InvalidAmount {
            amount: reward.to_string(),
            reason: "reward must be greater than zero".to_string(),
        }));
    }
    ensure_cents(reward)
}
