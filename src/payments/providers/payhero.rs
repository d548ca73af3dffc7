use super::non_empty;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    CorrelationKey, PaymentRequest, PaymentResponse, PaymentState, ProviderName, WebhookEvent,
    WebhookOutcome, WebhookVerificationResult,
};
use crate::payments::utils::{
    json_decimal, json_string, normalize_phone, PaymentHttpClient, PhoneFormat, RequestAuth,
};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "https://backend.payhero.co.ke";

#[derive(Debug, Clone)]
pub struct PayHeroConfig {
    /// Sent verbatim in the `Authorization` header
    pub api_key: String,
    pub channel_id: String,
    pub base_url: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayHeroCredentials {
    #[serde(alias = "authToken", alias = "basicAuthToken")]
    pub api_key: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub channel_id: Option<String>,
    pub base_url: Option<String>,
    pub callback_url: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_string))
}

impl PayHeroCredentials {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("PAYHERO_API_KEY").ok(),
            channel_id: std::env::var("PAYHERO_CHANNEL_ID").ok(),
            base_url: std::env::var("PAYHERO_BASE_URL").ok(),
            callback_url: std::env::var("PAYHERO_CALLBACK_URL").ok(),
        }
    }

    pub fn resolve(&self, default_callback_url: Option<&str>) -> Option<PayHeroConfig> {
        let callback_url =
            non_empty(&self.callback_url).or_else(|| default_callback_url.map(str::to_string))?;

        Some(PayHeroConfig {
            api_key: non_empty(&self.api_key)?,
            channel_id: non_empty(&self.channel_id)?,
            base_url: non_empty(&self.base_url).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            callback_url,
        })
    }
}

pub struct PayHeroProvider {
    config: PayHeroConfig,
    http: PaymentHttpClient,
}

impl PayHeroProvider {
    pub fn new(config: PayHeroConfig, http: PaymentHttpClient) -> Self {
        Self { config, http }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl PaymentProvider for PayHeroProvider {
    fn name(&self) -> ProviderName {
        ProviderName::PayHero
    }

    fn normalize_phone(&self, raw: &str) -> PaymentResult<String> {
        normalize_phone(raw, PhoneFormat::Plain254)
    }

    fn validate_amount(&self, amount: &BigDecimal) -> PaymentResult<()> {
        if !amount.is_integer() {
            return Err(PaymentError::ValidationError {
                message: "PayHero amounts must be whole shillings".to_string(),
                field: Some("amount".to_string()),
            });
        }
        Ok(())
    }

    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        let phone = request
            .phone_number
            .clone()
            .ok_or(PaymentError::ValidationError {
                message: "phone number is required for PayHero".to_string(),
                field: Some("phone_number".to_string()),
            })?;
        let amount = request
            .amount
            .to_u64()
            .ok_or(PaymentError::ValidationError {
                message: "amount is out of range".to_string(),
                field: Some("amount".to_string()),
            })?;
        let channel_id = self
            .config
            .channel_id
            .parse::<i64>()
            .map(JsonValue::from)
            .unwrap_or_else(|_| JsonValue::String(self.config.channel_id.clone()));

        let payload = serde_json::json!({
            "amount": amount,
            "phone_number": phone,
            "channel_id": channel_id,
            "provider": "m-pesa",
            "external_reference": request.transaction_id.to_string(),
            "callback_url": self.config.callback_url,
        });

        let response = self
            .http
            .send(
                reqwest::Method::POST,
                &self.endpoint("/api/v2/payments"),
                RequestAuth::None,
                Some(&payload),
                &[
                    ("Authorization", self.config.api_key.as_str()),
                    ("Content-Type", "application/json"),
                ],
            )
            .await?;

        if !response.is_success() {
            return Err(PaymentError::GatewayRejected {
                provider: ProviderName::PayHero.to_string(),
                message: response.provider_message(),
                provider_code: Some(response.status.to_string()),
            });
        }

        let data: PayHeroPaymentResponse = response.accepted_json("payhero")?;
        if data.success == Some(false) {
            return Err(PaymentError::GatewayRejected {
                provider: ProviderName::PayHero.to_string(),
                message: response.provider_message(),
                provider_code: data.status,
            });
        }

        info!(
            transaction_id = %request.transaction_id,
            reference = ?data.reference,
            "payhero stk push queued"
        );

        Ok(PaymentResponse {
            state: PaymentState::AwaitingCallback,
            checkout_request_id: data.checkout_request_id,
            merchant_request_id: None,
            provider_reference: data.reference,
            customer_message: Some("Check your phone to complete the payment".to_string()),
            instructions: None,
            provider_data: None,
        })
    }

    fn verify_webhook(
        &self,
        _payload: &[u8],
        _signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        Ok(WebhookVerificationResult::accepted())
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        parse_payhero_callback(payload)
    }
}

/// Accepts the flat callback shape as well as PayHero's nested `response` object
pub fn parse_payhero_callback(payload: &[u8]) -> PaymentResult<WebhookEvent> {
    let parsed: JsonValue =
        serde_json::from_slice(payload).map_err(|e| PaymentError::ValidationError {
            message: format!("invalid callback JSON: {}", e),
            field: Some("payload".to_string()),
        })?;

    let callback: PayHeroCallback = match parsed.get("response") {
        Some(nested @ JsonValue::Object(_)) => serde_json::from_value(nested.clone()),
        _ => serde_json::from_value(parsed.clone()),
    }
    .map_err(|e| PaymentError::ValidationError {
        message: format!("invalid callback body: {}", e),
        field: Some("payload".to_string()),
    })?;

    let external_reference = callback.external_reference.as_ref().and_then(json_string);
    let checkout_request_id = callback.checkout_request_id.clone();
    let correlation = external_reference
        .as_deref()
        .and_then(|r| Uuid::parse_str(r).ok())
        .map(CorrelationKey::TransactionId)
        .or_else(|| {
            checkout_request_id
                .clone()
                .map(CorrelationKey::CheckoutRequestId)
        });

    let status = callback
        .status
        .as_ref()
        .and_then(json_string)
        .map(|s| s.to_lowercase());
    let result_code = callback.result_code.as_ref().and_then(json_string);
    let reason = callback
        .result_desc
        .clone()
        .or_else(|| status.clone())
        .unwrap_or_else(|| "payment failed".to_string());

    let outcome = match (status.as_deref(), result_code.as_deref()) {
        (Some("success" | "successful" | "completed"), _) | (None, Some("0")) => {
            WebhookOutcome::Succeeded
        }
        (Some("failed" | "cancelled" | "canceled" | "rejected"), _) => {
            WebhookOutcome::Failed { reason }
        }
        (None, Some(_)) => WebhookOutcome::Failed { reason },
        (Some(other), _) => WebhookOutcome::Ignored {
            reason: format!("non-final status '{}'", other),
        },
        (None, None) => WebhookOutcome::Ignored {
            reason: "callback carries no status".to_string(),
        },
    };

    let event_id = callback
        .mpesa_reference
        .clone()
        .or_else(|| checkout_request_id.clone())
        .or_else(|| external_reference.clone());

    Ok(WebhookEvent {
        provider: ProviderName::PayHero,
        event_type: "payment_callback".to_string(),
        event_id,
        correlation,
        outcome,
        amount: callback.amount.as_ref().and_then(json_decimal),
        receipt: callback.mpesa_reference,
        phone_number: callback.phone_number.as_ref().and_then(json_string),
        payload: parsed,
        received_at: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
struct PayHeroPaymentResponse {
    success: Option<bool>,
    status: Option<String>,
    reference: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayHeroCallback {
    #[serde(alias = "ExternalReference")]
    external_reference: Option<JsonValue>,
    #[serde(alias = "Status")]
    status: Option<JsonValue>,
    #[serde(alias = "ResultCode")]
    result_code: Option<JsonValue>,
    #[serde(alias = "ResultDesc")]
    result_desc: Option<String>,
    #[serde(alias = "Amount")]
    amount: Option<JsonValue>,
    #[serde(alias = "Phone")]
    phone_number: Option<JsonValue>,
    #[serde(alias = "MpesaReceiptNumber")]
    mpesa_reference: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn resolve_defaults_base_url_and_needs_channel() {
        let creds = PayHeroCredentials {
            api_key: Some("Basic abc".to_string()),
            channel_id: Some("911".to_string()),
            base_url: None,
            callback_url: None,
        };
        let config = creds
            .resolve(Some("https://api.earnify.app/api/payments/callback"))
            .unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);

        let incomplete = PayHeroCredentials {
            channel_id: None,
            ..creds
        };
        assert!(incomplete.resolve(Some("https://cb")).is_none());
    }

    #[test]
    fn stored_channel_id_may_be_numeric() {
        let creds: PayHeroCredentials = serde_json::from_value(serde_json::json!({
            "apiKey": "Basic abc",
            "channelId": 911,
            "callbackUrl": "https://cb"
        }))
        .unwrap();
        assert_eq!(creds.channel_id.as_deref(), Some("911"));
    }

    #[test]
    fn flat_success_callback_correlates_by_external_reference() {
        let tx = Uuid::new_v4();
        let payload = serde_json::json!({
            "external_reference": tx.to_string(),
            "status": "SUCCESS",
            "amount": 500,
            "phone_number": "254712345678",
            "mpesa_reference": "SGR7XYZ123"
        });
        let event = parse_payhero_callback(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.correlation, Some(CorrelationKey::TransactionId(tx)));
        assert_eq!(event.outcome, WebhookOutcome::Succeeded);
        assert_eq!(event.event_id.as_deref(), Some("SGR7XYZ123"));
        assert_eq!(event.amount, BigDecimal::from_str("500").ok());
    }

    #[test]
    fn nested_failed_callback_carries_reason() {
        let tx = Uuid::new_v4();
        let payload = serde_json::json!({
            "forward_url": "",
            "status": true,
            "response": {
                "Amount": 10,
                "CheckoutRequestID": "ws_CO_14012024103543427709099876",
                "ExternalReference": tx.to_string(),
                "MerchantRequestID": "3202-70921557-1",
                "Phone": "+254709099876",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user.",
                "Status": "Failed"
            }
        });
        let event = parse_payhero_callback(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.correlation, Some(CorrelationKey::TransactionId(tx)));
        assert_eq!(
            event.outcome,
            WebhookOutcome::Failed {
                reason: "Request cancelled by user.".to_string()
            }
        );
    }

    #[test]
    fn queued_status_is_ignored() {
        let payload = serde_json::json!({"external_reference": "abc", "status": "QUEUED"});
        let event = parse_payhero_callback(payload.to_string().as_bytes()).unwrap();
        assert!(matches!(event.outcome, WebhookOutcome::Ignored { .. }));
        assert!(event.correlation.is_none());
    }
}
