use super::non_empty;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    CorrelationKey, PaymentRequest, PaymentResponse, PaymentState, ProviderName, WebhookEvent,
    WebhookOutcome, WebhookVerificationResult,
};
use crate::payments::utils::{
    json_decimal, json_string, normalize_phone, verify_hmac_sha256_hex, PaymentHttpClient,
    PhoneFormat, RequestAuth,
};
use async_trait::async_trait;
use bigdecimal::ToPrimitive;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;

pub const DEFAULT_BASE_URL: &str = "https://api.lipana.dev";
pub const SIGNATURE_HEADER: &str = "x-lipana-signature";
const SUCCESS_EVENT: &str = "payment.success";

#[derive(Debug, Clone)]
pub struct LipanaConfig {
    pub api_key: String,
    /// Webhooks are refused while this is unset
    pub webhook_secret: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LipanaCredentials {
    #[serde(alias = "secretKey")]
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub base_url: Option<String>,
}

impl LipanaCredentials {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("LIPANA_API_KEY").ok(),
            webhook_secret: std::env::var("LIPANA_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("LIPANA_BASE_URL").ok(),
        }
    }

    pub fn resolve(&self) -> Option<LipanaConfig> {
        Some(LipanaConfig {
            api_key: non_empty(&self.api_key)?,
            webhook_secret: non_empty(&self.webhook_secret),
            base_url: non_empty(&self.base_url).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

pub struct LipanaProvider {
    config: LipanaConfig,
    http: PaymentHttpClient,
}

impl LipanaProvider {
    pub fn new(config: LipanaConfig, http: PaymentHttpClient) -> Self {
        Self { config, http }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl PaymentProvider for LipanaProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Lipana
    }

    fn normalize_phone(&self, raw: &str) -> PaymentResult<String> {
        normalize_phone(raw, PhoneFormat::Plus254)
    }

    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        let phone = request
            .phone_number
            .clone()
            .ok_or(PaymentError::ValidationError {
                message: "phone number is required for Lipana".to_string(),
                field: Some("phone_number".to_string()),
            })?;

        let amount = match request.amount.to_u64() {
            Some(whole) if request.amount.is_integer() => JsonValue::from(whole),
            _ => JsonValue::from(request.amount.to_f64().unwrap_or_default()),
        };
        let payload = serde_json::json!({
            "phone": phone,
            "amount": amount,
        });

        let response = self
            .http
            .send(
                reqwest::Method::POST,
                &self.endpoint("/v1/transactions/push-stk"),
                RequestAuth::None,
                Some(&payload),
                &[
                    ("x-api-key", self.config.api_key.as_str()),
                    ("Content-Type", "application/json"),
                ],
            )
            .await?;

        if !response.is_success() {
            return Err(PaymentError::GatewayRejected {
                provider: ProviderName::Lipana.to_string(),
                message: response.provider_message(),
                provider_code: Some(response.status.to_string()),
            });
        }

        let body: LipanaEnvelope = response.accepted_json("lipana")?;
        if body.success == Some(false) {
            return Err(PaymentError::GatewayRejected {
                provider: ProviderName::Lipana.to_string(),
                message: response.provider_message(),
                provider_code: None,
            });
        }
        let data = body.data.unwrap_or_default();
        let reference = data
            .transaction_id
            .as_ref()
            .and_then(json_string)
            .ok_or(PaymentError::UnreadableResponse {
                provider: ProviderName::Lipana.to_string(),
                message: "response is missing data.transactionId".to_string(),
            })?;

        info!(
            transaction_id = %request.transaction_id,
            reference = %reference,
            "lipana stk push sent"
        );

        Ok(PaymentResponse {
            state: PaymentState::AwaitingCallback,
            checkout_request_id: data.checkout_request_id,
            merchant_request_id: None,
            provider_reference: Some(reference),
            customer_message: body.message,
            instructions: None,
            provider_data: None,
        })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        let Some(secret) = self.config.webhook_secret.as_deref() else {
            return Ok(WebhookVerificationResult::rejected(
                "lipana webhook secret is not configured",
            ));
        };
        let Some(signature) = signature.filter(|s| !s.trim().is_empty()) else {
            return Ok(WebhookVerificationResult::rejected(format!(
                "missing {} header",
                SIGNATURE_HEADER
            )));
        };

        if verify_hmac_sha256_hex(payload, secret, signature) {
            Ok(WebhookVerificationResult::accepted())
        } else {
            Ok(WebhookVerificationResult::rejected("invalid lipana signature"))
        }
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        parse_lipana_webhook(payload)
    }
}

pub fn parse_lipana_webhook(payload: &[u8]) -> PaymentResult<WebhookEvent> {
    let parsed: JsonValue =
        serde_json::from_slice(payload).map_err(|e| PaymentError::ValidationError {
            message: format!("invalid webhook JSON: {}", e),
            field: Some("payload".to_string()),
        })?;
    let webhook: LipanaWebhook =
        serde_json::from_value(parsed.clone()).map_err(|e| PaymentError::ValidationError {
            message: format!("invalid webhook body: {}", e),
            field: Some("payload".to_string()),
        })?;

    let data = webhook.data.unwrap_or_default();
    let reference = data.transaction_id.as_ref().and_then(json_string);

    let (outcome, correlation) = if webhook.event != SUCCESS_EVENT {
        (
            WebhookOutcome::Ignored {
                reason: format!("event '{}' is not reconciled", webhook.event),
            },
            None,
        )
    } else {
        (
            WebhookOutcome::Succeeded,
            reference.clone().map(CorrelationKey::PaymentReference),
        )
    };

    Ok(WebhookEvent {
        provider: ProviderName::Lipana,
        event_type: webhook.event,
        event_id: reference.clone(),
        correlation,
        outcome,
        amount: data.amount.as_ref().and_then(json_decimal),
        receipt: data.receipt.or(reference),
        phone_number: data.phone.as_ref().and_then(json_string),
        payload: parsed,
        received_at: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
struct LipanaEnvelope {
    success: Option<bool>,
    message: Option<String>,
    data: Option<LipanaData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LipanaData {
    #[serde(alias = "transaction_id", alias = "id")]
    transaction_id: Option<JsonValue>,
    #[serde(alias = "checkout_request_id", alias = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    amount: Option<JsonValue>,
    #[serde(alias = "phoneNumber")]
    phone: Option<JsonValue>,
    #[serde(alias = "mpesaReceiptNumber", alias = "mpesa_receipt")]
    receipt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LipanaWebhook {
    event: String,
    data: Option<LipanaData>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use std::time::Duration;

    fn provider(secret: Option<&str>) -> LipanaProvider {
        LipanaProvider::new(
            LipanaConfig {
                api_key: "lip_test".to_string(),
                webhook_secret: secret.map(str::to_string),
                base_url: DEFAULT_BASE_URL.to_string(),
            },
            PaymentHttpClient::new(Duration::from_secs(5)).expect("http client"),
        )
    }

    fn sign(payload: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_must_match_secret() {
        let payload = br#"{"event":"payment.success","data":{"transactionId":"TXN_1"}}"#;
        let provider = provider(Some("whsec"));

        assert!(provider
            .verify_webhook(payload, Some(&sign(payload, "whsec")))
            .unwrap()
            .valid);
        assert!(!provider
            .verify_webhook(payload, Some(&sign(payload, "other")))
            .unwrap()
            .valid);
        assert!(!provider.verify_webhook(payload, None).unwrap().valid);
    }

    #[test]
    fn missing_secret_rejects_every_webhook() {
        let payload = br#"{"event":"payment.success"}"#;
        let result = provider(None)
            .verify_webhook(payload, Some(&sign(payload, "anything")))
            .unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn only_success_events_are_reconciled() {
        let success = parse_lipana_webhook(
            br#"{"event":"payment.success","data":{"transactionId":"TXN_9","amount":150,"phone":"+254712345678"}}"#,
        )
        .unwrap();
        assert_eq!(success.outcome, WebhookOutcome::Succeeded);
        assert_eq!(
            success.correlation,
            Some(CorrelationKey::PaymentReference("TXN_9".to_string()))
        );

        let failed = parse_lipana_webhook(
            br#"{"event":"payment.failed","data":{"transactionId":"TXN_9"}}"#,
        )
        .unwrap();
        assert!(matches!(failed.outcome, WebhookOutcome::Ignored { .. }));
        assert!(failed.correlation.is_none());
    }

    #[test]
    fn resolve_needs_api_key_only() {
        let creds = LipanaCredentials {
            api_key: Some("lip_live".to_string()),
            webhook_secret: None,
            base_url: None,
        };
        let config = creds.resolve().unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(LipanaCredentials::default().resolve().is_none());
    }
}
