//! In-process store used by tests and `SKIP_EXTERNALS=true` mode.
//!
//! Each operation holds the single lock for its whole duration, which gives
//! the same all-or-nothing behaviour as the Postgres transactions.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::package_repository::{
    ActivationPackage, NewPackage, PackagePurchase, PackageStore, PurchaseOutcome,
};
use crate::database::settings_repository::{SettingEntry, SettingsStore};
use crate::database::task_repository::{
    MusicTask, NewMusicTask, NewTriviaQuestion, RewardClaim, RewardOutcome, TaskCounts, TaskKind,
    TaskStore, TriviaQuestion,
};
use crate::database::transaction_repository::{
    merge_details, GatewayReference, IdempotencyKey, LedgerStore, LedgerSummary, NewTransaction,
    Resolution, ResolveOutcome, Transaction, TransactionStatus, TransactionType,
};
use crate::database::user_repository::{CheckinOutcome, NewUser, User, UserCounts, UserStore};
use crate::payments::types::CorrelationKey;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    /// Insertion order doubles as creation order
    transactions: Vec<Transaction>,
    processed_callbacks: HashSet<IdempotencyKey>,
    music_tasks: HashMap<Uuid, MusicTask>,
    music_completions: HashSet<(Uuid, Uuid, NaiveDate)>,
    trivia_questions: HashMap<Uuid, TriviaQuestion>,
    packages: HashMap<Uuid, ActivationPackage>,
    settings: BTreeMap<String, SettingEntry>,
}

impl Inner {
    fn transaction_mut(&mut self, id: Uuid) -> Option<&mut Transaction> {
        self.transactions.iter_mut().find(|tx| tx.id == id)
    }

    fn append(&mut self, new: NewTransaction) -> Result<Transaction, DatabaseError> {
        if !self.users.contains_key(&new.user_id) {
            return Err(DatabaseError::new(DatabaseErrorKind::ForeignKeyViolation {
                constraint: "transactions_user_id_fkey".to_string(),
            }));
        }
        positive_amount(&new.amount)?;
        let tx = new.into_transaction();
        self.transactions.push(tx.clone());
        Ok(tx)
    }
}

/// Mirrors `CHECK (amount > 0)` on the transactions table
fn positive_amount(amount: &BigDecimal) -> Result<(), DatabaseError> {
    if *amount > BigDecimal::from(0) {
        Ok(())
    } else {
        Err(DatabaseError::new(DatabaseErrorKind::CheckViolation {
            constraint: "transactions_amount_check".to_string(),
        }))
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.inner.get_mut().users.insert(user.id, user);
        self
    }

    pub fn with_package(mut self, package: ActivationPackage) -> Self {
        self.inner.get_mut().packages.insert(package.id, package);
        self
    }

    pub fn with_music_task(mut self, task: MusicTask) -> Self {
        self.inner.get_mut().music_tasks.insert(task.id, task);
        self
    }

    pub fn with_trivia_question(mut self, question: TriviaQuestion) -> Self {
        self.inner
            .get_mut()
            .trivia_questions
            .insert(question.id, question);
        self
    }

    pub fn with_setting(mut self, key: &str, value: JsonValue) -> Self {
        let entry = SettingEntry {
            key: key.to_string(),
            value,
            updated_at: Utc::now(),
        };
        self.inner.get_mut().settings.insert(key.to_string(), entry);
        self
    }

    /// Every ledger entry in creation order
    pub async fn all_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().await.transactions.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn insert_transaction(&self, new: NewTransaction) -> Result<Transaction, DatabaseError> {
        self.inner.lock().await.append(new)
    }

    async fn find_transaction(&self, id: Uuid) -> Result<Option<Transaction>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.transactions.iter().find(|tx| tx.id == id).cloned())
    }

    async fn find_by_correlation(
        &self,
        key: &CorrelationKey,
    ) -> Result<Option<Transaction>, DatabaseError> {
        let inner = self.inner.lock().await;
        let found = inner.transactions.iter().rev().find(|tx| match key {
            CorrelationKey::TransactionId(id) => tx.id == *id,
            CorrelationKey::CheckoutRequestId(value) => {
                tx.checkout_request_id.as_deref() == Some(value.as_str())
            }
            CorrelationKey::PaymentReference(value) => {
                tx.payment_reference.as_deref() == Some(value.as_str())
            }
        });
        Ok(found.cloned())
    }

    async fn attach_gateway_reference(
        &self,
        id: Uuid,
        reference: GatewayReference,
    ) -> Result<Option<Transaction>, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let Some(tx) = inner.transaction_mut(id) else {
            return Ok(None);
        };
        if reference.checkout_request_id.is_some() {
            tx.checkout_request_id = reference.checkout_request_id;
        }
        if reference.payment_reference.is_some() {
            tx.payment_reference = reference.payment_reference;
        }
        merge_details(&mut tx.payment_details, &reference.details);
        tx.updated_at = Utc::now();
        Ok(Some(tx.clone()))
    }

    async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome, DatabaseError> {
        let mut inner = self.inner.lock().await;

        let Some(current) = inner
            .transactions
            .iter()
            .find(|tx| tx.id == resolution.transaction_id)
            .cloned()
        else {
            return Ok(ResolveOutcome::NotFound);
        };

        if let Some(key) = &resolution.idempotency_key {
            if inner.processed_callbacks.contains(key) {
                return Ok(ResolveOutcome::DuplicateDelivery);
            }
        }

        if current.status.is_terminal() {
            return Ok(ResolveOutcome::AlreadyResolved {
                status: current.status,
            });
        }

        // check the balance guard before touching anything
        let mut wallet_balance = None;
        if let Some(effect) = &resolution.balance_effect {
            let Some(user) = inner.users.get(&effect.user_id) else {
                return Ok(ResolveOutcome::UserNotFound);
            };
            let next = &user.wallet_balance + &effect.wallet_delta;
            if next < BigDecimal::from(0) {
                return Ok(ResolveOutcome::InsufficientBalance {
                    available: user.wallet_balance.clone(),
                });
            }
            wallet_balance = Some(next);
        }

        if let Some(effect) = &resolution.balance_effect {
            if let Some(user) = inner.users.get_mut(&effect.user_id) {
                user.wallet_balance += &effect.wallet_delta;
                user.deposited_balance += &effect.deposited_delta;
                user.total_earnings += &effect.earnings_delta;
                user.updated_at = Utc::now();
            }
        }

        if let Some(key) = resolution.idempotency_key {
            inner.processed_callbacks.insert(key);
        }

        let Some(tx) = inner.transaction_mut(resolution.transaction_id) else {
            return Ok(ResolveOutcome::NotFound);
        };
        tx.status = resolution.status;
        merge_details(&mut tx.payment_details, &resolution.details);
        tx.updated_at = Utc::now();

        Ok(ResolveOutcome::Applied {
            transaction: tx.clone(),
            wallet_balance,
        })
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_pending(
        &self,
        transaction_type: Option<TransactionType>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|tx| tx.status == TransactionStatus::Pending)
            .filter(|tx| transaction_type.map_or(true, |t| tx.transaction_type == t))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn ledger_summary(&self) -> Result<LedgerSummary, DatabaseError> {
        let inner = self.inner.lock().await;
        let zero = BigDecimal::from(0);
        let mut summary = LedgerSummary {
            pending_deposits: 0,
            pending_withdrawals: 0,
            completed_deposits: zero.clone(),
            completed_withdrawals: zero.clone(),
            total_earnings_paid: zero,
        };
        for tx in &inner.transactions {
            match (tx.transaction_type, tx.status) {
                (TransactionType::Deposit, TransactionStatus::Pending) => {
                    summary.pending_deposits += 1
                }
                (TransactionType::Withdraw, TransactionStatus::Pending) => {
                    summary.pending_withdrawals += 1
                }
                (TransactionType::Deposit, TransactionStatus::Completed) => {
                    summary.completed_deposits += &tx.amount
                }
                (TransactionType::Withdraw, TransactionStatus::Completed) => {
                    summary.completed_withdrawals += &tx.amount
                }
                (TransactionType::Earning, TransactionStatus::Completed) => {
                    summary.total_earnings_paid += &tx.amount
                }
                _ => {}
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<User>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| user.referral_code == code)
            .cloned())
    }

    async fn insert_user(&self, new: NewUser) -> Result<User, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner.users.contains_key(&new.id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "users_pkey".to_string(),
            }));
        }
        if inner
            .users
            .values()
            .any(|user| user.referral_code == new.referral_code)
        {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "users_referral_code_key".to_string(),
            }));
        }
        let user = new.into_user();
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_banned(&self, id: Uuid, banned: bool) -> Result<Option<User>, DatabaseError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.users.get_mut(&id).map(|user| {
            user.is_banned = banned;
            user.updated_at = Utc::now();
            user.clone()
        }))
    }

    async fn claim_checkin_bonus(
        &self,
        user_id: Uuid,
        today: NaiveDate,
        bonus: BigDecimal,
    ) -> Result<CheckinOutcome, DatabaseError> {
        positive_amount(&bonus)?;
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(&user_id) else {
            return Ok(CheckinOutcome::UserNotFound);
        };
        if user.last_checkin.is_some_and(|last| last >= today) {
            return Ok(CheckinOutcome::AlreadyCheckedIn);
        }
        user.wallet_balance += &bonus;
        user.total_earnings += &bonus;
        user.last_checkin = Some(today);
        user.updated_at = Utc::now();
        let wallet_balance = user.wallet_balance.clone();

        let transaction = inner.append(NewTransaction::completed(
            user_id,
            TransactionType::Bonus,
            bonus,
            "Daily check-in bonus",
        ))?;

        Ok(CheckinOutcome::Granted {
            wallet_balance,
            transaction,
        })
    }

    async fn count_users(&self) -> Result<UserCounts, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(UserCounts {
            total_users: inner.users.len() as i64,
            activated_users: inner.users.values().filter(|u| u.is_activated).count() as i64,
            banned_users: inner.users.values().filter(|u| u.is_banned).count() as i64,
            total_wallet_balance: inner
                .users
                .values()
                .fold(BigDecimal::from(0), |acc, u| acc + &u.wallet_balance),
        })
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn find_music_task(&self, id: Uuid) -> Result<Option<MusicTask>, DatabaseError> {
        Ok(self.inner.lock().await.music_tasks.get(&id).cloned())
    }

    async fn find_trivia_question(
        &self,
        id: Uuid,
    ) -> Result<Option<TriviaQuestion>, DatabaseError> {
        Ok(self.inner.lock().await.trivia_questions.get(&id).cloned())
    }

    async fn list_active_music_tasks(&self) -> Result<Vec<MusicTask>, DatabaseError> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<MusicTask> = inner
            .music_tasks
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn list_active_trivia_questions(&self) -> Result<Vec<TriviaQuestion>, DatabaseError> {
        let inner = self.inner.lock().await;
        let mut questions: Vec<TriviaQuestion> = inner
            .trivia_questions
            .values()
            .filter(|q| q.is_active)
            .cloned()
            .collect();
        questions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(questions)
    }

    async fn insert_music_task(&self, new: NewMusicTask) -> Result<MusicTask, DatabaseError> {
        let task = new.into_task();
        self.inner
            .lock()
            .await
            .music_tasks
            .insert(task.id, task.clone());
        Ok(task)
    }

    async fn insert_trivia_question(
        &self,
        new: NewTriviaQuestion,
    ) -> Result<TriviaQuestion, DatabaseError> {
        let question = new.into_question();
        self.inner
            .lock()
            .await
            .trivia_questions
            .insert(question.id, question.clone());
        Ok(question)
    }

    async fn set_task_active(
        &self,
        kind: TaskKind,
        id: Uuid,
        active: bool,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let flag = match kind {
            TaskKind::Music => inner.music_tasks.get_mut(&id).map(|t| &mut t.is_active),
            TaskKind::Trivia => inner.trivia_questions.get_mut(&id).map(|q| &mut q.is_active),
        };
        Ok(match flag {
            Some(flag) => {
                *flag = active;
                true
            }
            None => false,
        })
    }

    async fn claim_task_reward(&self, claim: RewardClaim) -> Result<RewardOutcome, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get(&claim.user_id) else {
            return Ok(RewardOutcome::UserNotFound);
        };

        let completion = (claim.user_id, claim.task_id, claim.today);
        let gated = match claim.kind {
            TaskKind::Trivia => user
                .last_trivia_task_date
                .is_some_and(|last| last >= claim.today),
            TaskKind::Music => inner.music_completions.contains(&completion),
        };
        if gated {
            return Ok(RewardOutcome::AlreadyClaimed);
        }

        if claim.kind == TaskKind::Music {
            inner.music_completions.insert(completion);
        }

        let wallet_balance = match inner.users.get_mut(&claim.user_id) {
            Some(user) => {
                user.wallet_balance += &claim.reward;
                user.total_earnings += &claim.reward;
                match claim.kind {
                    TaskKind::Music => user.last_music_task_date = Some(claim.today),
                    TaskKind::Trivia => user.last_trivia_task_date = Some(claim.today),
                }
                user.updated_at = Utc::now();
                user.wallet_balance.clone()
            }
            None => return Ok(RewardOutcome::UserNotFound),
        };

        let transaction = inner.append(NewTransaction::completed(
            claim.user_id,
            TransactionType::Earning,
            claim.reward,
            claim.description,
        ))?;

        Ok(RewardOutcome::Granted {
            wallet_balance,
            transaction,
        })
    }

    async fn count_active_tasks(&self, today: NaiveDate) -> Result<TaskCounts, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(TaskCounts {
            active_music_tasks: inner.music_tasks.values().filter(|t| t.is_active).count() as i64,
            active_trivia_questions: inner
                .trivia_questions
                .values()
                .filter(|q| q.is_active)
                .count() as i64,
            music_completions_today: inner
                .music_completions
                .iter()
                .filter(|(_, _, day)| *day == today)
                .count() as i64,
        })
    }
}

#[async_trait]
impl PackageStore for InMemoryStore {
    async fn find_package(&self, id: Uuid) -> Result<Option<ActivationPackage>, DatabaseError> {
        Ok(self.inner.lock().await.packages.get(&id).cloned())
    }

    async fn list_active_packages(&self) -> Result<Vec<ActivationPackage>, DatabaseError> {
        let inner = self.inner.lock().await;
        let mut packages: Vec<ActivationPackage> = inner
            .packages
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        packages.sort_by(|a, b| a.price.cmp(&b.price));
        Ok(packages)
    }

    async fn insert_package(&self, new: NewPackage) -> Result<ActivationPackage, DatabaseError> {
        let package = new.into_package();
        self.inner
            .lock()
            .await
            .packages
            .insert(package.id, package.clone());
        Ok(package)
    }

    async fn purchase_package(
        &self,
        purchase: PackagePurchase,
    ) -> Result<PurchaseOutcome, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let Some(buyer) = inner.users.get_mut(&purchase.user_id) else {
            return Ok(PurchaseOutcome::UserNotFound);
        };
        if buyer.wallet_balance < purchase.price {
            return Ok(PurchaseOutcome::InsufficientBalance {
                available: buyer.wallet_balance.clone(),
            });
        }

        let was_activated = buyer.is_activated;
        let referred_by = buyer.referred_by;
        buyer.wallet_balance -= &purchase.price;
        buyer.is_activated = true;
        buyer.active_package_id = Some(purchase.package_id);
        buyer.package_expiry_date = Some(purchase.expires_at);
        buyer.updated_at = Utc::now();
        let wallet_balance = buyer.wallet_balance.clone();

        let mut entry = NewTransaction::completed(
            purchase.user_id,
            TransactionType::Activation,
            purchase.price,
            purchase.description,
        );
        entry.payment_method = Some("wallet".to_string());
        entry.payment_details = serde_json::json!({ "package_id": purchase.package_id });
        let transaction = inner.append(entry)?;

        let mut referral_paid_to = None;
        let bonus_due = purchase.referral_bonus > BigDecimal::from(0);
        if let (false, true, Some(referrer_id)) = (was_activated, bonus_due, referred_by) {
            if let Some(referrer) = inner.users.get_mut(&referrer_id) {
                referrer.wallet_balance += &purchase.referral_bonus;
                referrer.total_earnings += &purchase.referral_bonus;
                referrer.updated_at = Utc::now();

                let mut reward = NewTransaction::completed(
                    referrer_id,
                    TransactionType::Referral,
                    purchase.referral_bonus,
                    "Referral bonus",
                );
                reward.payment_details =
                    serde_json::json!({ "referred_user_id": purchase.user_id });
                inner.append(reward)?;
                referral_paid_to = Some(referrer_id);
            }
        }

        Ok(PurchaseOutcome::Purchased {
            wallet_balance,
            package_expiry_date: purchase.expires_at,
            transaction,
            referral_paid_to,
        })
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn load_all(&self) -> Result<Vec<SettingEntry>, DatabaseError> {
        Ok(self.inner.lock().await.settings.values().cloned().collect())
    }

    async fn upsert(&self, key: &str, value: JsonValue) -> Result<SettingEntry, DatabaseError> {
        let entry = SettingEntry {
            key: key.to_string(),
            value,
            updated_at: Utc::now(),
        };
        self.inner
            .lock()
            .await
            .settings
            .insert(key.to_string(), entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::transaction_repository::BalanceEffect;

    fn user(balance: i64) -> User {
        let mut user = NewUser {
            id: Uuid::new_v4(),
            display_name: None,
            phone_number: Some("254712345678".to_string()),
            referral_code: Uuid::new_v4().simple().to_string()[..8].to_uppercase(),
            referred_by: None,
        }
        .into_user();
        user.wallet_balance = BigDecimal::from(balance);
        user
    }

    fn pending(user_id: Uuid, kind: TransactionType, amount: i64) -> NewTransaction {
        NewTransaction {
            user_id,
            transaction_type: kind,
            amount: BigDecimal::from(amount),
            status: TransactionStatus::Pending,
            payment_method: Some("bank".to_string()),
            description: None,
            payment_details: serde_json::json!({}),
        }
    }

    fn resolution(tx: &Transaction, effect: Option<BalanceEffect>) -> Resolution {
        Resolution {
            transaction_id: tx.id,
            status: TransactionStatus::Completed,
            details: serde_json::json!({"approved_by": "admin"}),
            balance_effect: effect,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn withdrawal_debit_never_goes_negative() {
        let owner = user(300);
        let store = InMemoryStore::new().with_user(owner.clone());
        let tx = store
            .insert_transaction(pending(owner.id, TransactionType::Withdraw, 500))
            .await
            .unwrap();

        let effect = BalanceEffect::debit_withdrawal(owner.id, &tx.amount);
        let outcome = store.resolve(resolution(&tx, Some(effect))).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::InsufficientBalance { .. }));

        // nothing was applied
        let stored = store.find_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
        let owner = store.find_user(owner.id).await.unwrap().unwrap();
        assert_eq!(owner.wallet_balance, BigDecimal::from(300));
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected_before_terminal_check() {
        let owner = user(0);
        let store = InMemoryStore::new().with_user(owner.clone());
        let tx = store
            .insert_transaction(pending(owner.id, TransactionType::Deposit, 100))
            .await
            .unwrap();

        let key = IdempotencyKey {
            provider: "mpesa".to_string(),
            event_key: "ws_CO_1".to_string(),
        };
        let mut first = resolution(&tx, Some(BalanceEffect::credit_deposit(owner.id, &tx.amount)));
        first.idempotency_key = Some(key.clone());
        let mut second = first.clone();
        second.idempotency_key = Some(key);

        assert!(matches!(
            store.resolve(first).await.unwrap(),
            ResolveOutcome::Applied { .. }
        ));
        assert!(matches!(
            store.resolve(second).await.unwrap(),
            ResolveOutcome::DuplicateDelivery
        ));
        let owner = store.find_user(owner.id).await.unwrap().unwrap();
        assert_eq!(owner.wallet_balance, BigDecimal::from(100));
        assert_eq!(owner.deposited_balance, BigDecimal::from(100));
    }

    #[tokio::test]
    async fn checkin_is_once_per_day() {
        let owner = user(0);
        let store = InMemoryStore::new().with_user(owner.clone());
        let today = Utc::now().date_naive();

        let first = store
            .claim_checkin_bonus(owner.id, today, BigDecimal::from(5))
            .await
            .unwrap();
        assert!(matches!(first, CheckinOutcome::Granted { .. }));
        let again = store
            .claim_checkin_bonus(owner.id, today, BigDecimal::from(5))
            .await
            .unwrap();
        assert!(matches!(again, CheckinOutcome::AlreadyCheckedIn));
        assert_eq!(store.all_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn zero_checkin_bonus_violates_amount_check() {
        let owner = user(0);
        let store = InMemoryStore::new().with_user(owner.clone());

        let err = store
            .claim_checkin_bonus(owner.id, Utc::now().date_naive(), BigDecimal::from(0))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, DatabaseErrorKind::CheckViolation { .. }));

        let owner = store.find_user(owner.id).await.unwrap().unwrap();
        assert!(owner.last_checkin.is_none());
        assert_eq!(owner.wallet_balance, BigDecimal::from(0));
        assert!(store.all_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn referral_bonus_is_paid_on_first_activation_only() {
        let referrer = user(0);
        let mut buyer = user(1000);
        buyer.referred_by = Some(referrer.id);
        let store = InMemoryStore::new()
            .with_user(referrer.clone())
            .with_user(buyer.clone());

        let purchase = || PackagePurchase {
            user_id: buyer.id,
            package_id: Uuid::new_v4(),
            price: BigDecimal::from(300),
            expires_at: Utc::now() + chrono::Duration::days(30),
            referral_bonus: BigDecimal::from(50),
            description: "Silver package".to_string(),
        };

        let first = store.purchase_package(purchase()).await.unwrap();
        assert!(matches!(
            first,
            PurchaseOutcome::Purchased { referral_paid_to: Some(id), .. } if id == referrer.id
        ));
        let second = store.purchase_package(purchase()).await.unwrap();
        assert!(matches!(
            second,
            PurchaseOutcome::Purchased {
                referral_paid_to: None,
                ..
            }
        ));

        let referrer = store.find_user(referrer.id).await.unwrap().unwrap();
        assert_eq!(referrer.wallet_balance, BigDecimal::from(50));
        let buyer = store.find_user(buyer.id).await.unwrap().unwrap();
        assert_eq!(buyer.wallet_balance, BigDecimal::from(400));
    }

    #[tokio::test]
    async fn correlation_lookup_prefers_latest_entry() {
        let owner = user(0);
        let store = InMemoryStore::new().with_user(owner.clone());
        let older = store
            .insert_transaction(pending(owner.id, TransactionType::Deposit, 100))
            .await
            .unwrap();
        let newer = store
            .insert_transaction(pending(owner.id, TransactionType::Deposit, 200))
            .await
            .unwrap();
        for id in [older.id, newer.id] {
            store
                .attach_gateway_reference(
                    id,
                    GatewayReference {
                        checkout_request_id: Some("ws_CO_same".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let found = store
            .find_by_correlation(&CorrelationKey::CheckoutRequestId("ws_CO_same".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);
    }
}
