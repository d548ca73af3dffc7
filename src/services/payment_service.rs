//! Deposit initiation, withdrawal requests and ledger history.
//!
//! A deposit is written as a `pending` ledger entry before the gateway is
//! called. The gateway outcome only ever annotates or rejects that entry;
//! wallet credit happens later in the reconciler or the admin workflow.

use crate::auth::AuthContext;
use crate::database::transaction_repository::{
    GatewayReference, LedgerStore, NewTransaction, Resolution, ResolveOutcome, Transaction,
    TransactionStatus, TransactionType,
};
use crate::database::user_repository::UserStore;
use crate::error::{AppError, AppResult, DomainError, ValidationError};
use crate::logging::mask_phone_number;
use crate::payments::error::PaymentError;
use crate::payments::factory::PaymentProviderFactory;
use crate::payments::types::{PaymentRequest, PaymentState, ProviderName};
use crate::payments::utils::{normalize_phone, PhoneFormat};
use crate::services::settings::SettingsSnapshot;
use crate::services::{active_user, ensure_amount_in_range};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    #[serde(default)]
    pub phone_number: Option<String>,
    /// `mpesa`, `payhero`, `lipana` or `bank`
    pub provider: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositResponse {
    pub transaction: Transaction,
    pub state: PaymentState,
    pub checkout_request_id: Option<String>,
    pub customer_message: Option<String>,
    pub instructions: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub method: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Bank account or other payout destination
    #[serde(default)]
    pub account_details: Option<JsonValue>,
}

pub struct PaymentService {
    ledger: Arc<dyn LedgerStore>,
    users: Arc<dyn UserStore>,
    factory: Arc<PaymentProviderFactory>,
}

impl PaymentService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        users: Arc<dyn UserStore>,
        factory: Arc<PaymentProviderFactory>,
    ) -> Self {
        Self {
            ledger,
            users,
            factory,
        }
    }

    pub async fn initiate_deposit(
        &self,
        ctx: &AuthContext,
        snapshot: &SettingsSnapshot,
        request: DepositRequest,
    ) -> AppResult<DepositResponse> {
        ctx.ensure_self(request.user_id)?;
        let user = active_user(self.users.as_ref(), ctx.user_id).await?;

        let provider_name: ProviderName = request.provider.parse()?;
        ensure_amount_in_range(&request.amount, &snapshot.app.min_deposit, None)?;

        let provider = self.factory.payment_provider(provider_name, snapshot)?;
        provider.validate_amount(&request.amount)?;

        let phone_number = if provider_name.is_mobile_money() {
            let raw = request
                .phone_number
                .clone()
                .or_else(|| user.phone_number.clone())
                .ok_or_else(|| {
                    AppError::validation(ValidationError::MissingField {
                        field: "phone_number".to_string(),
                    })
                })?;
            Some(provider.normalize_phone(&raw)?)
        } else {
            None
        };

        let pending = NewTransaction {
            user_id: user.id,
            transaction_type: TransactionType::Deposit,
            amount: request.amount.clone(),
            status: TransactionStatus::Pending,
            payment_method: Some(provider_name.as_str().to_string()),
            description: Some(format!("Deposit via {}", provider_name)),
            payment_details: json!({
                "provider": provider_name.as_str(),
                "phone_number": phone_number,
            }),
        };
        let transaction = self.ledger.insert_transaction(pending).await?;

        crate::log_transaction!(
            event = "deposit_initiated",
            transaction_id = transaction.id,
            user_id = user.id,
            provider = provider_name.as_str(),
            amount = transaction.amount,
        );

        let gateway_request = PaymentRequest {
            transaction_id: transaction.id,
            amount: request.amount,
            phone_number: phone_number.clone(),
            description: "Earnify deposit".to_string(),
        };

        match provider.initiate_payment(gateway_request).await {
            Ok(response) => {
                info!(
                    transaction_id = %transaction.id,
                    provider = %provider_name,
                    phone = %phone_number.as_deref().map(mask_phone_number).unwrap_or_default(),
                    state = ?response.state,
                    "gateway accepted deposit"
                );
                let reference = GatewayReference {
                    checkout_request_id: response.checkout_request_id.clone(),
                    payment_reference: response.provider_reference.clone(),
                    details: json!({
                        "checkout_request_id": response.checkout_request_id,
                        "merchant_request_id": response.merchant_request_id,
                        "reference": response.provider_reference,
                        "customer_message": response.customer_message,
                        "gateway_response": response.provider_data,
                    }),
                };
                let transaction = self
                    .ledger
                    .attach_gateway_reference(transaction.id, reference)
                    .await?
                    .unwrap_or(transaction);

                Ok(DepositResponse {
                    transaction,
                    state: response.state,
                    checkout_request_id: response.checkout_request_id,
                    customer_message: response.customer_message,
                    instructions: response.instructions,
                })
            }
            Err(err) if err.is_indeterminate() => {
                warn!(
                    transaction_id = %transaction.id,
                    provider = %provider_name,
                    error = %err,
                    "gateway outcome unknown, leaving deposit pending"
                );
                let note = GatewayReference {
                    details: json!({
                        "gateway_error": err.to_string(),
                        "gateway_outcome": "unknown",
                    }),
                    ..Default::default()
                };
                self.ledger
                    .attach_gateway_reference(transaction.id, note)
                    .await?;
                Err(AppError::from(err)
                    .with_context(format!("transaction {} left pending", transaction.id)))
            }
            Err(err) => {
                self.reject_failed_push(&transaction, provider_name, &err)
                    .await?;
                Err(err.into())
            }
        }
    }

    async fn reject_failed_push(
        &self,
        transaction: &Transaction,
        provider: ProviderName,
        err: &PaymentError,
    ) -> AppResult<()> {
        warn!(
            transaction_id = %transaction.id,
            provider = %provider,
            error = %err,
            "gateway refused deposit, rejecting entry"
        );
        let resolution = Resolution {
            transaction_id: transaction.id,
            status: TransactionStatus::Rejected,
            details: json!({
                "failure_reason": err.to_string(),
                "rejected_by": "gateway",
            }),
            balance_effect: None,
            idempotency_key: None,
        };
        match self.ledger.resolve(resolution).await? {
            ResolveOutcome::Applied { .. } => {
                crate::log_transaction!(
                    event = "deposit_rejected",
                    transaction_id = transaction.id,
                    provider = provider.as_str(),
                );
            }
            other => {
                error!(
                    transaction_id = %transaction.id,
                    outcome = ?other,
                    "could not reject failed deposit"
                );
            }
        }
        Ok(())
    }

    /// Records a pending withdrawal. Funds leave the wallet only on approval.
    pub async fn request_withdrawal(
        &self,
        ctx: &AuthContext,
        snapshot: &SettingsSnapshot,
        request: WithdrawalRequest,
    ) -> AppResult<Transaction> {
        ctx.ensure_self(request.user_id)?;
        let user = active_user(self.users.as_ref(), ctx.user_id).await?;

        let method: ProviderName = request.method.parse()?;
        ensure_amount_in_range(
            &request.amount,
            &snapshot.app.min_withdrawal,
            snapshot.app.max_withdrawal.as_ref(),
        )?;

        if request.amount > user.wallet_balance {
            return Err(AppError::domain(DomainError::InsufficientBalance {
                available: user.wallet_balance.to_string(),
                required: request.amount.to_string(),
            }));
        }

        let destination = if method.is_mobile_money() {
            let raw = request
                .phone_number
                .or(user.phone_number)
                .ok_or_else(|| {
                    AppError::validation(ValidationError::MissingField {
                        field: "phone_number".to_string(),
                    })
                })?;
            json!({ "phone_number": normalize_phone(&raw, PhoneFormat::Plain254)? })
        } else {
            request.account_details.ok_or_else(|| {
                AppError::validation(ValidationError::MissingField {
                    field: "account_details".to_string(),
                })
            })?
        };

        let pending = NewTransaction {
            user_id: user.id,
            transaction_type: TransactionType::Withdraw,
            amount: request.amount,
            status: TransactionStatus::Pending,
            payment_method: Some(method.as_str().to_string()),
            description: Some(format!("Withdrawal via {}", method)),
            payment_details: json!({ "destination": destination }),
        };
        let transaction = self.ledger.insert_transaction(pending).await?;

        crate::log_transaction!(
            event = "withdrawal_requested",
            transaction_id = transaction.id,
            user_id = user.id,
            method = method.as_str(),
            amount = transaction.amount,
        );

        Ok(transaction)
    }

    /// The caller's own ledger, newest first
    pub async fn list_transactions(
        &self,
        ctx: &AuthContext,
        user_id: Option<Uuid>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Transaction>> {
        if let Some(user_id) = user_id {
            ctx.ensure_self(user_id)?;
        }
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.ledger.list_for_user(ctx.user_id, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaymentsConfig;
    use crate::database::memory::InMemoryStore;
    use crate::database::user_repository::{NewUser, User};
    use crate::error::ErrorCode;
    use crate::payments::error::PaymentResult;
    use crate::payments::provider::PaymentProvider;
    use crate::payments::types::{PaymentResponse, WebhookEvent, WebhookVerificationResult};

    fn user(balance: i64) -> User {
        let mut user = NewUser {
            id: Uuid::new_v4(),
            display_name: None,
            phone_number: Some("0712345678".to_string()),
            referral_code: "REF00001".to_string(),
            referred_by: None,
        }
        .into_user();
        user.wallet_balance = BigDecimal::from(balance);
        user
    }

    /// Gateway stand-in that records the ledger state it sees at dispatch
    struct RecordingGateway {
        store: Arc<InMemoryStore>,
        seen: tokio::sync::Mutex<Vec<Option<TransactionStatus>>>,
    }

    #[async_trait::async_trait]
    impl PaymentProvider for RecordingGateway {
        fn name(&self) -> ProviderName {
            ProviderName::Mpesa
        }

        fn normalize_phone(&self, raw: &str) -> PaymentResult<String> {
            normalize_phone(raw, PhoneFormat::Plain254)
        }

        async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
            let entry = self
                .store
                .find_transaction(request.transaction_id)
                .await
                .ok()
                .flatten();
            self.seen.lock().await.push(entry.map(|tx| tx.status));
            Err(PaymentError::TimeoutError { timeout_secs: 5 })
        }

        fn verify_webhook(
            &self,
            _payload: &[u8],
            _signature: Option<&str>,
        ) -> PaymentResult<WebhookVerificationResult> {
            Ok(WebhookVerificationResult::accepted())
        }

        fn parse_webhook_event(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
            Err(PaymentError::WebhookVerificationError {
                message: "test gateway does not parse callbacks".to_string(),
            })
        }
    }

    fn service(store: Arc<InMemoryStore>) -> PaymentService {
        let factory = PaymentProviderFactory::new(PaymentsConfig {
            request_timeout_secs: 5,
            ..Default::default()
        })
        .unwrap();
        PaymentService::new(store.clone(), store, Arc::new(factory))
    }

    #[tokio::test]
    async fn bank_deposit_stays_pending_with_instructions() {
        let owner = user(0);
        let store = Arc::new(InMemoryStore::new().with_user(owner.clone()));
        let mut snapshot = SettingsSnapshot::default();
        snapshot.payment_methods = json!({"bank": {"accountNumber": "0011223344"}});

        let response = service(store.clone())
            .initiate_deposit(
                &AuthContext::user(owner.id),
                &snapshot,
                DepositRequest {
                    user_id: owner.id,
                    amount: BigDecimal::from(1000),
                    phone_number: None,
                    provider: "bank".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(response.state, PaymentState::AwaitingManualReview);
        assert_eq!(response.transaction.status, TransactionStatus::Pending);
        assert_eq!(
            response.instructions,
            Some(json!({"accountNumber": "0011223344"}))
        );
        let stored = store.all_transactions().await;
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn deposit_for_another_user_is_unauthorized() {
        let owner = user(0);
        let store = Arc::new(InMemoryStore::new().with_user(owner.clone()));
        let err = service(store.clone())
            .initiate_deposit(
                &AuthContext::user(Uuid::new_v4()),
                &SettingsSnapshot::default(),
                DepositRequest {
                    user_id: owner.id,
                    amount: BigDecimal::from(100),
                    phone_number: None,
                    provider: "bank".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), ErrorCode::Unauthorized);
        assert!(store.all_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_gateway_writes_nothing() {
        let owner = user(0);
        let store = Arc::new(InMemoryStore::new().with_user(owner.clone()));
        let err = service(store.clone())
            .initiate_deposit(
                &AuthContext::user(owner.id),
                &SettingsSnapshot::default(),
                DepositRequest {
                    user_id: owner.id,
                    amount: BigDecimal::from(100),
                    phone_number: None,
                    provider: "mpesa".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), ErrorCode::GatewayNotConfigured);
        assert!(store.all_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn pending_entry_exists_before_gateway_dispatch() {
        let owner = user(0);
        let store = Arc::new(InMemoryStore::new().with_user(owner.clone()));
        let gateway = Arc::new(RecordingGateway {
            store: store.clone(),
            seen: tokio::sync::Mutex::new(Vec::new()),
        });
        let factory = PaymentProviderFactory::new(PaymentsConfig::default())
            .unwrap()
            .with_provider(gateway.clone());
        let service = PaymentService::new(store.clone(), store.clone(), Arc::new(factory));

        let err = service
            .initiate_deposit(
                &AuthContext::user(owner.id),
                &SettingsSnapshot::default(),
                DepositRequest {
                    user_id: owner.id,
                    amount: BigDecimal::from(100),
                    phone_number: Some("+254 712 345 678".to_string()),
                    provider: "mpesa".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(*gateway.seen.lock().await, vec![Some(TransactionStatus::Pending)]);
        assert_eq!(err.error_code(), ErrorCode::ExternalServiceTimeout);
        assert!(err.context.as_deref().unwrap().contains("left pending"));

        let stored = store.all_transactions().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, TransactionStatus::Pending);
        assert_eq!(stored[0].payment_details["gateway_outcome"], "unknown");
        assert_eq!(stored[0].payment_details["phone_number"], "254712345678");
    }

    #[tokio::test]
    async fn deposit_below_minimum_is_refused() {
        let owner = user(0);
        let store = Arc::new(InMemoryStore::new().with_user(owner.clone()));
        let err = service(store)
            .initiate_deposit(
                &AuthContext::user(owner.id),
                &SettingsSnapshot::default(),
                DepositRequest {
                    user_id: owner.id,
                    amount: BigDecimal::from(5),
                    phone_number: None,
                    provider: "bank".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn withdrawal_request_does_not_touch_the_wallet() {
        let owner = user(1000);
        let store = Arc::new(InMemoryStore::new().with_user(owner.clone()));
        let tx = service(store.clone())
            .request_withdrawal(
                &AuthContext::user(owner.id),
                &SettingsSnapshot::default(),
                WithdrawalRequest {
                    user_id: owner.id,
                    amount: BigDecimal::from(500),
                    method: "mpesa".to_string(),
                    phone_number: None,
                    account_details: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.payment_details["destination"]["phone_number"], "254712345678");
        let owner = store.find_user(owner.id).await.unwrap().unwrap();
        assert_eq!(owner.wallet_balance, BigDecimal::from(1000));
    }

    #[tokio::test]
    async fn withdrawal_above_balance_is_refused() {
        let owner = user(300);
        let store = Arc::new(InMemoryStore::new().with_user(owner.clone()));
        let err = service(store.clone())
            .request_withdrawal(
                &AuthContext::user(owner.id),
                &SettingsSnapshot::default(),
                WithdrawalRequest {
                    user_id: owner.id,
                    amount: BigDecimal::from(500),
                    method: "bank".to_string(),
                    phone_number: None,
                    account_details: Some(json!({"accountNumber": "1"})),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), ErrorCode::InsufficientBalance);
        assert!(store.all_transactions().await.is_empty());
    }
}
