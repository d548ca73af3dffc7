use crate::payments::error::PaymentResult;
use crate::payments::types::{
    PaymentRequest, PaymentResponse, ProviderName, WebhookEvent, WebhookVerificationResult,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Canonical phone form for this gateway. Manual rails accept anything.
    fn normalize_phone(&self, raw: &str) -> PaymentResult<String>;

    /// Gateway-specific amount rules, checked before a ledger entry exists
    fn validate_amount(&self, _amount: &BigDecimal) -> PaymentResult<()> {
        Ok(())
    }

    /// Pushes the collection request. Never touches the wallet.
    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse>;

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult>;

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}
