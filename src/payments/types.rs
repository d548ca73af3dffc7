use crate::payments::error::PaymentError;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Mpesa,
    PayHero,
    Lipana,
    Bank,
}

impl ProviderName {
    pub const ALL: [ProviderName; 4] = [
        ProviderName::Mpesa,
        ProviderName::PayHero,
        ProviderName::Lipana,
        ProviderName::Bank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Mpesa => "mpesa",
            ProviderName::PayHero => "payhero",
            ProviderName::Lipana => "lipana",
            ProviderName::Bank => "bank",
        }
    }

    /// Providers that settle through an asynchronous gateway callback
    pub fn is_mobile_money(&self) -> bool {
        !matches!(self, ProviderName::Bank)
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "mpesa" | "m-pesa" | "daraja" => Ok(ProviderName::Mpesa),
            "payhero" | "pay_hero" | "pay-hero" => Ok(ProviderName::PayHero),
            "lipana" => Ok(ProviderName::Lipana),
            "bank" | "bank_transfer" | "manual" => Ok(ProviderName::Bank),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// How an asynchronous notification points back at a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CorrelationKey {
    /// Our own transaction id, echoed back by the gateway
    TransactionId(Uuid),
    /// Daraja `CheckoutRequestID` returned by the STK push
    CheckoutRequestId(String),
    /// Provider-side transaction id stored as `payment_reference`
    PaymentReference(String),
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub transaction_id: Uuid,
    pub amount: BigDecimal,
    /// Already normalized for the provider
    pub phone_number: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Gateway accepted the push; settlement arrives by callback
    AwaitingCallback,
    /// No gateway call; an admin settles the entry
    AwaitingManualReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub state: PaymentState,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub provider_reference: Option<String>,
    pub customer_message: Option<String>,
    pub instructions: Option<JsonValue>,
    pub provider_data: Option<JsonValue>,
}

impl PaymentResponse {
    pub fn manual(instructions: Option<JsonValue>) -> Self {
        Self {
            state: PaymentState::AwaitingManualReview,
            checkout_request_id: None,
            merchant_request_id: None,
            provider_reference: None,
            customer_message: None,
            instructions,
            provider_data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl WebhookVerificationResult {
    pub fn accepted() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Succeeded,
    Failed { reason: String },
    /// Event acknowledged but carries nothing to reconcile
    Ignored { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider: ProviderName,
    pub event_type: String,
    /// Provider-unique id used as the durable idempotency key
    pub event_id: Option<String>,
    pub correlation: Option<CorrelationKey>,
    pub outcome: WebhookOutcome,
    pub amount: Option<BigDecimal>,
    pub receipt: Option<String>,
    pub phone_number: Option<String>,
    pub payload: JsonValue,
    pub received_at: String,
}

impl WebhookEvent {
    /// Provider metadata merged into `payment_details` on resolution
    pub fn settlement_details(&self) -> JsonValue {
        serde_json::json!({
            "provider": self.provider.as_str(),
            "event_type": self.event_type,
            "receipt": self.receipt,
            "callback_phone": self.phone_number,
            "callback_amount": self.amount,
            "callback_received_at": self.received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_name_parsing_accepts_aliases() {
        assert_eq!(ProviderName::from_str("M-Pesa").unwrap(), ProviderName::Mpesa);
        assert_eq!(ProviderName::from_str("payhero").unwrap(), ProviderName::PayHero);
        assert_eq!(ProviderName::from_str(" bank ").unwrap(), ProviderName::Bank);
        assert!(ProviderName::from_str("paypal").is_err());
    }

    #[test]
    fn correlation_key_serializes_tagged() {
        let key = CorrelationKey::CheckoutRequestId("ws_CO_1".to_string());
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["kind"], "checkout_request_id");
        assert_eq!(json["value"], "ws_CO_1");
    }

    #[test]
    fn only_bank_is_manual() {
        assert!(ProviderName::Mpesa.is_mobile_money());
        assert!(!ProviderName::Bank.is_mobile_money());
    }
}
