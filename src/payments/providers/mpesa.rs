use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    CorrelationKey, PaymentRequest, PaymentResponse, PaymentState, ProviderName, WebhookEvent,
    WebhookOutcome, WebhookVerificationResult,
};
use crate::payments::utils::{
    json_decimal, json_string, mpesa_timestamp, normalize_phone, stk_password, PaymentHttpClient,
    PhoneFormat, RequestAuth,
};
use super::non_empty;
use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
}

impl MpesaEnvironment {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "production" | "live" | "prod" => MpesaEnvironment::Production,
            _ => MpesaEnvironment::Sandbox,
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => "https://sandbox.safaricom.co.ke",
            MpesaEnvironment::Production => "https://api.safaricom.co.ke",
        }
    }
}

/// A complete Daraja credential set
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub environment: MpesaEnvironment,
    pub callback_url: String,
    pub base_url: Option<String>,
}

/// Daraja credentials as stored in `mpesaConfig` or the environment.
/// Partial sets are kept as-is and only become usable through [`Self::resolve`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MpesaCredentials {
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    #[serde(alias = "shortCode", alias = "businessShortCode")]
    pub shortcode: Option<String>,
    pub passkey: Option<String>,
    pub environment: Option<String>,
    pub callback_url: Option<String>,
    pub base_url: Option<String>,
}

impl MpesaCredentials {
    pub fn from_env() -> Self {
        Self {
            consumer_key: std::env::var("MPESA_CONSUMER_KEY").ok(),
            consumer_secret: std::env::var("MPESA_CONSUMER_SECRET").ok(),
            shortcode: std::env::var("MPESA_SHORTCODE").ok(),
            passkey: std::env::var("MPESA_PASSKEY").ok(),
            environment: std::env::var("MPESA_ENVIRONMENT").ok(),
            callback_url: std::env::var("MPESA_CALLBACK_URL").ok(),
            base_url: std::env::var("MPESA_BASE_URL").ok(),
        }
    }

    /// Returns a config only when every required field is present
    pub fn resolve(&self, default_callback_url: Option<&str>) -> Option<MpesaConfig> {
        let callback_url =
            non_empty(&self.callback_url).or_else(|| default_callback_url.map(str::to_string))?;

        Some(MpesaConfig {
            consumer_key: non_empty(&self.consumer_key)?,
            consumer_secret: non_empty(&self.consumer_secret)?,
            shortcode: non_empty(&self.shortcode)?,
            passkey: non_empty(&self.passkey)?,
            environment: self
                .environment
                .as_deref()
                .map(MpesaEnvironment::parse)
                .unwrap_or(MpesaEnvironment::Sandbox),
            callback_url,
            base_url: non_empty(&self.base_url),
        })
    }
}

pub struct MpesaProvider {
    config: MpesaConfig,
    http: PaymentHttpClient,
}

impl MpesaProvider {
    pub fn new(config: MpesaConfig, http: PaymentHttpClient) -> Self {
        Self { config, http }
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or_else(|| self.config.environment.base_url());
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> PaymentResult<String> {
        let response = self
            .http
            .send(
                reqwest::Method::GET,
                &self.endpoint("/oauth/v1/generate?grant_type=client_credentials"),
                RequestAuth::Basic {
                    username: &self.config.consumer_key,
                    password: &self.config.consumer_secret,
                },
                None,
                &[],
            )
            .await?;

        if !response.is_success() {
            warn!(status = response.status, "mpesa oauth token request rejected");
            return Err(PaymentError::AuthenticationFailed {
                provider: ProviderName::Mpesa.to_string(),
                status: Some(response.status),
                message: response.provider_message(),
            });
        }

        let token: DarajaToken = response.json("mpesa")?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Mpesa
    }

    fn normalize_phone(&self, raw: &str) -> PaymentResult<String> {
        normalize_phone(raw, PhoneFormat::Plain254)
    }

    fn validate_amount(&self, amount: &BigDecimal) -> PaymentResult<()> {
        if !amount.is_integer() {
            return Err(PaymentError::ValidationError {
                message: "M-Pesa amounts must be whole shillings".to_string(),
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
                message: "phone number is required for M-Pesa".to_string(),
                field: Some("phone_number".to_string()),
            })?;
        self.validate_amount(&request.amount)?;
        let amount = request
            .amount
            .to_u64()
            .ok_or(PaymentError::ValidationError {
                message: "amount is out of range".to_string(),
                field: Some("amount".to_string()),
            })?;

        let token = self.access_token().await?;
        let timestamp = mpesa_timestamp(chrono::Utc::now());
        let password = stk_password(&self.config.shortcode, &self.config.passkey, &timestamp);
        let account_reference = request.transaction_id.simple().to_string()[..12].to_uppercase();
        let description: String = request.description.chars().take(13).collect();

        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": account_reference,
            "TransactionDesc": description,
        });

        let response = self
            .http
            .send(
                reqwest::Method::POST,
                &self.endpoint("/mpesa/stkpush/v1/processrequest"),
                RequestAuth::Bearer(&token),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        if !response.is_success() {
            let body: Option<DarajaError> = serde_json::from_str(&response.body).ok();
            return Err(PaymentError::GatewayRejected {
                provider: ProviderName::Mpesa.to_string(),
                message: response.provider_message(),
                provider_code: body
                    .and_then(|b| b.error_code)
                    .or_else(|| Some(response.status.to_string())),
            });
        }

        let data: StkPushResponse = response.accepted_json("mpesa")?;
        if data.response_code.as_deref() != Some("0") {
            return Err(PaymentError::GatewayRejected {
                provider: ProviderName::Mpesa.to_string(),
                message: data
                    .response_description
                    .or(data.error_message)
                    .unwrap_or_else(|| "STK push was not accepted".to_string()),
                provider_code: data.response_code.or(data.error_code),
            });
        }

        info!(
            transaction_id = %request.transaction_id,
            checkout_request_id = ?data.checkout_request_id,
            "mpesa stk push accepted"
        );

        Ok(PaymentResponse {
            state: PaymentState::AwaitingCallback,
            checkout_request_id: data.checkout_request_id,
            merchant_request_id: data.merchant_request_id,
            provider_reference: None,
            customer_message: data.customer_message,
            instructions: None,
            provider_data: None,
        })
    }

    fn verify_webhook(
        &self,
        _payload: &[u8],
        _signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        // Daraja does not sign callbacks
        Ok(WebhookVerificationResult::accepted())
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        parse_mpesa_notification(payload)
    }
}

/// Parses either an STK push callback or a C2B confirmation
pub fn parse_mpesa_notification(payload: &[u8]) -> PaymentResult<WebhookEvent> {
    let parsed: JsonValue =
        serde_json::from_slice(payload).map_err(|e| PaymentError::ValidationError {
            message: format!("invalid M-Pesa callback JSON: {}", e),
            field: Some("payload".to_string()),
        })?;

    if parsed.get("Body").is_some() {
        parse_stk_callback(parsed)
    } else if parsed.get("TransID").is_some() {
        parse_c2b_confirmation(parsed)
    } else {
        Err(PaymentError::ValidationError {
            message: "unrecognized M-Pesa callback shape".to_string(),
            field: Some("payload".to_string()),
        })
    }
}

fn parse_stk_callback(parsed: JsonValue) -> PaymentResult<WebhookEvent> {
    let envelope: StkCallbackEnvelope =
        serde_json::from_value(parsed.clone()).map_err(|e| PaymentError::ValidationError {
            message: format!("invalid STK callback: {}", e),
            field: Some("payload".to_string()),
        })?;
    let callback = envelope.body.stk_callback;

    let amount = metadata_item(&callback, "Amount").and_then(json_decimal);
    let receipt = metadata_item(&callback, "MpesaReceiptNumber").and_then(json_string);
    let phone_number = metadata_item(&callback, "PhoneNumber").and_then(json_string);

    let outcome = if callback.result_code == 0 {
        WebhookOutcome::Succeeded
    } else {
        WebhookOutcome::Failed {
            reason: callback
                .result_desc
                .clone()
                .unwrap_or_else(|| format!("ResultCode {}", callback.result_code)),
        }
    };

    Ok(WebhookEvent {
        provider: ProviderName::Mpesa,
        event_type: "stk_callback".to_string(),
        event_id: Some(callback.checkout_request_id.clone()),
        correlation: Some(CorrelationKey::CheckoutRequestId(
            callback.checkout_request_id,
        )),
        outcome,
        amount,
        receipt,
        phone_number,
        payload: parsed,
        received_at: chrono::Utc::now().to_rfc3339(),
    })
}

fn metadata_item<'a>(callback: &'a StkCallback, name: &str) -> Option<&'a JsonValue> {
    callback
        .callback_metadata
        .as_ref()?
        .items
        .iter()
        .find(|i| i.name == name)?
        .value
        .as_ref()
}

fn parse_c2b_confirmation(parsed: JsonValue) -> PaymentResult<WebhookEvent> {
    let confirmation: C2bConfirmation =
        serde_json::from_value(parsed.clone()).map_err(|e| PaymentError::ValidationError {
            message: format!("invalid C2B confirmation: {}", e),
            field: Some("payload".to_string()),
        })?;

    let correlation = confirmation
        .bill_ref_number
        .as_deref()
        .and_then(embedded_transaction_id)
        .map(CorrelationKey::TransactionId);

    Ok(WebhookEvent {
        provider: ProviderName::Mpesa,
        event_type: "c2b_confirmation".to_string(),
        event_id: Some(confirmation.trans_id.clone()),
        correlation,
        outcome: WebhookOutcome::Succeeded,
        amount: confirmation.trans_amount.as_ref().and_then(json_decimal),
        receipt: Some(confirmation.trans_id),
        phone_number: confirmation.msisdn.as_ref().and_then(json_string),
        payload: parsed,
        received_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Finds a transaction UUID inside a free-text paybill account number
fn embedded_transaction_id(bill_ref: &str) -> Option<Uuid> {
    static UUID_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = UUID_RE
        .get_or_init(|| {
            Regex::new(
                r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
            )
            .ok()
        })
        .as_ref()?;
    re.find(bill_ref)
        .and_then(|m| Uuid::parse_str(m.as_str()).ok())
}

#[derive(Debug, Deserialize)]
struct DarajaToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct DarajaError {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: i64,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata")]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
struct CallbackItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct C2bConfirmation {
    #[serde(rename = "TransID")]
    trans_id: String,
    #[serde(rename = "TransAmount")]
    trans_amount: Option<JsonValue>,
    #[serde(rename = "BillRefNumber")]
    bill_ref_number: Option<String>,
    #[serde(rename = "MSISDN")]
    msisdn: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn credentials() -> MpesaCredentials {
        MpesaCredentials {
            consumer_key: Some("key".to_string()),
            consumer_secret: Some("secret".to_string()),
            shortcode: Some("174379".to_string()),
            passkey: Some("passkey".to_string()),
            environment: Some("sandbox".to_string()),
            callback_url: None,
            base_url: None,
        }
    }

    #[test]
    fn resolve_requires_every_field() {
        let creds = credentials();
        assert!(creds.resolve(None).is_none());

        let config = creds
            .resolve(Some("https://api.earnify.app/api/mpesa/callback"))
            .expect("complete set");
        assert_eq!(config.environment, MpesaEnvironment::Sandbox);
        assert_eq!(config.callback_url, "https://api.earnify.app/api/mpesa/callback");

        let partial = MpesaCredentials {
            passkey: Some("  ".to_string()),
            ..credentials()
        };
        assert!(partial.resolve(Some("https://x")).is_none());
    }

    #[test]
    fn stored_settings_use_camel_case() {
        let creds: MpesaCredentials = serde_json::from_value(serde_json::json!({
            "consumerKey": "k",
            "consumerSecret": "s",
            "shortCode": "600000",
            "passkey": "p",
            "environment": "production",
            "callbackUrl": "https://cb"
        }))
        .unwrap();
        let config = creds.resolve(None).unwrap();
        assert_eq!(config.shortcode, "600000");
        assert_eq!(config.environment, MpesaEnvironment::Production);
    }

    #[test]
    fn successful_stk_callback_extracts_metadata() {
        let payload = serde_json::json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {"Item": [
                    {"Name": "Amount", "Value": 100.00},
                    {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                    {"Name": "TransactionDate", "Value": 20191219102115u64},
                    {"Name": "PhoneNumber", "Value": 254708374149u64}
                ]}
            }}
        });
        let event = parse_mpesa_notification(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.outcome, WebhookOutcome::Succeeded);
        assert_eq!(
            event.correlation,
            Some(CorrelationKey::CheckoutRequestId(
                "ws_CO_191220191020363925".to_string()
            ))
        );
        assert_eq!(event.receipt.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(event.phone_number.as_deref(), Some("254708374149"));
        assert_eq!(event.amount, BigDecimal::from_str("100").ok());
    }

    #[test]
    fn cancelled_stk_callback_is_failure() {
        let payload = serde_json::json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "1",
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }}
        });
        let event = parse_mpesa_notification(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            event.outcome,
            WebhookOutcome::Failed {
                reason: "Request cancelled by user".to_string()
            }
        );
        assert!(event.amount.is_none());
    }

    #[test]
    fn c2b_confirmation_finds_embedded_transaction_id() {
        let tx = Uuid::new_v4();
        let payload = serde_json::json!({
            "TransactionType": "Pay Bill",
            "TransID": "RKTQDM7W6S",
            "TransAmount": "250.00",
            "BusinessShortCode": "600638",
            "BillRefNumber": format!("EARN {}", tx),
            "MSISDN": "254708374149"
        });
        let event = parse_mpesa_notification(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.correlation, Some(CorrelationKey::TransactionId(tx)));
        assert_eq!(event.event_id.as_deref(), Some("RKTQDM7W6S"));
        assert_eq!(event.amount, BigDecimal::from_str("250.00").ok());
    }

    #[test]
    fn unknown_shape_is_rejected() {
        assert!(parse_mpesa_notification(br#"{"hello":"world"}"#).is_err());
        assert!(parse_mpesa_notification(b"not json").is_err());
    }
}
