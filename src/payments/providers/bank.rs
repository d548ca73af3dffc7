use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    PaymentRequest, PaymentResponse, ProviderName, WebhookEvent, WebhookVerificationResult,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Manual bank transfer. No gateway is called; an admin settles the entry.
pub struct BankProvider {
    instructions: Option<JsonValue>,
}

impl BankProvider {
    pub fn new(instructions: Option<JsonValue>) -> Self {
        Self { instructions }
    }
}

#[async_trait]
impl PaymentProvider for BankProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Bank
    }

    fn normalize_phone(&self, raw: &str) -> PaymentResult<String> {
        Ok(raw.trim().to_string())
    }

    async fn initiate_payment(&self, _request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        Ok(PaymentResponse::manual(self.instructions.clone()))
    }

    fn verify_webhook(
        &self,
        _payload: &[u8],
        _signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        Ok(WebhookVerificationResult::rejected(
            "bank transfers have no webhook",
        ))
    }

    fn parse_webhook_event(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
        Err(PaymentError::ValidationError {
            message: "bank transfers are settled by an admin".to_string(),
            field: Some("provider".to_string()),
        })
    }
}
