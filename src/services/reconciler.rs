//! Callback/webhook reconciliation.
//!
//! Maps a provider notification onto exactly one pending deposit. The
//! resolution, the wallet credit and the `(provider, event_key)` idempotency
//! record are written in one store transaction, so a redelivered callback
//! changes nothing.

use crate::database::error::DatabaseError;
use crate::database::transaction_repository::{
    BalanceEffect, IdempotencyKey, LedgerStore, Resolution, ResolveOutcome, TransactionStatus,
    TransactionType,
};
use crate::payments::error::PaymentError;
use crate::payments::factory::PaymentProviderFactory;
use crate::payments::providers::lipana::parse_lipana_webhook;
use crate::payments::providers::mpesa::parse_mpesa_notification;
use crate::payments::providers::payhero::parse_payhero_callback;
use crate::payments::types::{CorrelationKey, ProviderName, WebhookEvent, WebhookOutcome};
use crate::services::settings::SettingsSnapshot;
use bigdecimal::BigDecimal;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Malformed notification: {0}")]
    Malformed(String),
    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("Processing error: {0}")]
    ProcessingError(String),
}

impl WebhookProcessorError {
    /// Only a failed signature check is reported back to the caller
    pub fn is_signature_failure(&self) -> bool {
        matches!(self, WebhookProcessorError::InvalidSignature(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Credited {
        transaction_id: Uuid,
        wallet_balance: Option<BigDecimal>,
    },
    Rejected {
        transaction_id: Uuid,
    },
    Duplicate,
    AlreadyResolved {
        transaction_id: Uuid,
        status: TransactionStatus,
    },
    /// No pending deposit matches; acknowledged without side effects
    Unmatched,
    Ignored {
        reason: String,
    },
}

pub struct WebhookProcessor {
    ledger: Arc<dyn LedgerStore>,
    factory: Arc<PaymentProviderFactory>,
}

impl WebhookProcessor {
    pub fn new(ledger: Arc<dyn LedgerStore>, factory: Arc<PaymentProviderFactory>) -> Self {
        Self { ledger, factory }
    }

    /// Verifies, parses and reconciles one raw notification body
    pub async fn process(
        &self,
        provider_name: ProviderName,
        snapshot: &SettingsSnapshot,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ReconcileOutcome, WebhookProcessorError> {
        let event = match self.factory.webhook_provider(provider_name, snapshot) {
            Ok(provider) => {
                let verification = provider
                    .verify_webhook(payload, signature)
                    .map_err(|e| WebhookProcessorError::ProcessingError(e.to_string()))?;
                if !verification.valid {
                    let reason = verification
                        .reason
                        .unwrap_or_else(|| "signature mismatch".to_string());
                    warn!(provider = %provider_name, reason = %reason, "webhook signature rejected");
                    return Err(WebhookProcessorError::InvalidSignature(reason));
                }
                provider.parse_webhook_event(payload)
            }
            Err(PaymentError::NotConfigured { .. }) => {
                // Signed webhooks cannot be trusted without a secret. Unsigned
                // gateways still settle after their credentials were removed.
                match provider_name {
                    ProviderName::Mpesa => parse_mpesa_notification(payload),
                    ProviderName::PayHero => parse_payhero_callback(payload),
                    ProviderName::Lipana | ProviderName::Bank => {
                        warn!(provider = %provider_name, "webhook received for unconfigured provider");
                        return Err(WebhookProcessorError::InvalidSignature(
                            "webhook secret is not configured".to_string(),
                        ));
                    }
                }
            }
            Err(e) => return Err(WebhookProcessorError::ProcessingError(e.to_string())),
        }
        .map_err(|e| WebhookProcessorError::Malformed(e.to_string()))?;

        self.reconcile(event).await
    }

    pub async fn reconcile(
        &self,
        event: WebhookEvent,
    ) -> Result<ReconcileOutcome, WebhookProcessorError> {
        let provider = event.provider;

        let status = match &event.outcome {
            WebhookOutcome::Ignored { reason } => {
                info!(provider = %provider, event_type = %event.event_type, reason = %reason, "webhook ignored");
                return Ok(ReconcileOutcome::Ignored {
                    reason: reason.clone(),
                });
            }
            WebhookOutcome::Succeeded => TransactionStatus::Completed,
            WebhookOutcome::Failed { .. } => TransactionStatus::Rejected,
        };

        let Some(correlation) = event.correlation.clone() else {
            warn!(provider = %provider, event_type = %event.event_type, "webhook carries no correlation key");
            return Ok(ReconcileOutcome::Unmatched);
        };

        let Some(transaction) = self.ledger.find_by_correlation(&correlation).await? else {
            warn!(provider = %provider, correlation = ?correlation, "no ledger entry matches webhook");
            return Ok(ReconcileOutcome::Unmatched);
        };

        if transaction.transaction_type != TransactionType::Deposit {
            warn!(
                provider = %provider,
                transaction_id = %transaction.id,
                "webhook matched a non-deposit entry"
            );
            return Ok(ReconcileOutcome::Unmatched);
        }

        // Bank deposits settle only through admin review
        let same_method = transaction.payment_method.as_deref() == Some(provider.as_str());
        if provider == ProviderName::Bank || !same_method {
            warn!(
                provider = %provider,
                transaction_id = %transaction.id,
                payment_method = ?transaction.payment_method,
                "webhook provider does not own the matched entry"
            );
            return Ok(ReconcileOutcome::Unmatched);
        }

        if let Some(amount) = &event.amount {
            if *amount != transaction.amount {
                warn!(
                    transaction_id = %transaction.id,
                    ledger_amount = %transaction.amount,
                    callback_amount = %amount,
                    "callback amount differs from ledger amount"
                );
            }
        }

        let mut details = event.settlement_details();
        let balance_effect = match &event.outcome {
            WebhookOutcome::Failed { reason } => {
                if let Some(map) = details.as_object_mut() {
                    map.insert("failure_reason".to_string(), reason.clone().into());
                }
                None
            }
            _ => Some(BalanceEffect::credit_deposit(
                transaction.user_id,
                &transaction.amount,
            )),
        };

        let resolution = Resolution {
            transaction_id: transaction.id,
            status,
            details,
            balance_effect,
            idempotency_key: Some(IdempotencyKey {
                provider: provider.as_str().to_string(),
                event_key: event_key(&event, &correlation),
            }),
        };

        let outcome = match self.ledger.resolve(resolution).await? {
            ResolveOutcome::Applied {
                transaction,
                wallet_balance,
            } => {
                crate::log_transaction!(
                    event = "deposit_reconciled",
                    transaction_id = transaction.id,
                    provider = provider.as_str(),
                    status = transaction.status.as_str(),
                    amount = transaction.amount,
                );
                match transaction.status {
                    TransactionStatus::Completed => ReconcileOutcome::Credited {
                        transaction_id: transaction.id,
                        wallet_balance,
                    },
                    _ => ReconcileOutcome::Rejected {
                        transaction_id: transaction.id,
                    },
                }
            }
            ResolveOutcome::DuplicateDelivery => {
                info!(provider = %provider, transaction_id = %transaction.id, "duplicate webhook delivery");
                ReconcileOutcome::Duplicate
            }
            ResolveOutcome::AlreadyResolved { status } => {
                info!(
                    provider = %provider,
                    transaction_id = %transaction.id,
                    status = %status,
                    "webhook for an already resolved entry"
                );
                ReconcileOutcome::AlreadyResolved {
                    transaction_id: transaction.id,
                    status,
                }
            }
            ResolveOutcome::NotFound => ReconcileOutcome::Unmatched,
            other => {
                error!(
                    provider = %provider,
                    transaction_id = %transaction.id,
                    outcome = ?other,
                    "webhook resolution failed"
                );
                return Err(WebhookProcessorError::ProcessingError(format!(
                    "resolution failed: {:?}",
                    other
                )));
            }
        };

        Ok(outcome)
    }
}

/// Provider event id, falling back to the correlation value plus outcome
fn event_key(event: &WebhookEvent, correlation: &CorrelationKey) -> String {
    if let Some(id) = event.event_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let value = match correlation {
        CorrelationKey::TransactionId(id) => id.to_string(),
        CorrelationKey::CheckoutRequestId(value) | CorrelationKey::PaymentReference(value) => {
            value.clone()
        }
    };
    format!("{}:{}", value, event.event_type)
}
