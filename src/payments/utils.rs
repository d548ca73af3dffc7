use crate::payments::error::{PaymentError, PaymentResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// How an outbound gateway request authenticates
#[derive(Debug, Clone, Copy)]
pub enum RequestAuth<'a> {
    None,
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
}

/// Raw gateway reply. Non-2xx statuses are returned, not raised, so each
/// adapter can surface the provider's own wording.
#[derive(Debug, Clone)]
pub struct ProviderHttpResponse {
    pub status: u16,
    pub body: String,
}

impl ProviderHttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self, provider: &str) -> PaymentResult<T> {
        serde_json::from_str::<T>(&self.body).map_err(|e| PaymentError::ProviderError {
            provider: provider.to_string(),
            message: format!("invalid provider JSON response: {}", e),
            provider_code: Some(self.status.to_string()),
            retryable: false,
        })
    }

    /// Reads the 2xx reply to a request that already reached the gateway.
    /// A body that does not parse leaves the outcome unknown.
    pub fn accepted_json<T: DeserializeOwned>(&self, provider: &str) -> PaymentResult<T> {
        serde_json::from_str::<T>(&self.body).map_err(|e| PaymentError::UnreadableResponse {
            provider: provider.to_string(),
            message: format!("unreadable response to accepted request: {}", e),
        })
    }

    /// Best human-readable message in the body, falling back to the raw text
    pub fn provider_message(&self) -> String {
        let parsed: Option<JsonValue> = serde_json::from_str(&self.body).ok();
        let from_json = parsed.as_ref().and_then(|value| {
            ["errorMessage", "error_message", "message", "ResponseDescription", "error"]
                .iter()
                .find_map(|key| match value.get(*key) {
                    Some(JsonValue::String(text)) if !text.trim().is_empty() => {
                        Some(text.clone())
                    }
                    Some(JsonValue::Object(inner)) => inner
                        .get("message")
                        .and_then(|m| m.as_str())
                        .map(|m| m.to_string()),
                    _ => None,
                })
        });

        match from_json {
            Some(message) => message,
            None if self.body.trim().is_empty() => format!("HTTP {}", self.status),
            None => self.body.trim().to_string(),
        }
    }
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self { client, timeout })
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Sends exactly one request. Payment pushes are never replayed, a second
    /// attempt could prompt the payer twice.
    pub async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: RequestAuth<'_>,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<ProviderHttpResponse> {
        let mut request = self.client.request(method, url).timeout(self.timeout);

        request = match auth {
            RequestAuth::None => request,
            RequestAuth::Bearer(token) => request.bearer_auth(token),
            RequestAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        };
        for (k, v) in additional_headers {
            request = request.header(*k, *v);
        }
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            warn!(status = %status, url = %url, "provider returned a transient error");
        }
        let body = match response.text().await {
            Ok(text) => text,
            Err(e) if e.is_timeout() => {
                return Err(PaymentError::TimeoutError {
                    timeout_secs: self.timeout.as_secs(),
                })
            }
            Err(_) => String::new(),
        };

        Ok(ProviderHttpResponse {
            status: status.as_u16(),
            body,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> PaymentError {
        if err.is_timeout() {
            PaymentError::TimeoutError {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            PaymentError::NetworkError {
                message: format!("provider request failed: {}", err),
            }
        }
    }
}

pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());
    secure_eq(
        computed.as_bytes(),
        signature.trim().to_ascii_lowercase().as_bytes(),
    )
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Reads a money value that gateways send either as a JSON number or a string
pub fn json_decimal(value: &JsonValue) -> Option<BigDecimal> {
    match value {
        JsonValue::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        JsonValue::String(s) => BigDecimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Reads an identifier that may arrive as a string or a bare number
pub fn json_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Canonical MSISDN shape a gateway expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneFormat {
    /// `2547XXXXXXXX`, used by Daraja and PayHero
    Plain254,
    /// `+2547XXXXXXXX`, used by Lipana
    Plus254,
}

/// Normalizes a Kenyan mobile number.
///
/// Accepts `07..`/`01..`, `2547..`, `+2547..` and bare `7..`/`1..` forms with
/// spaces, dashes or parentheses in between.
///
/// ```
/// use earnify_backend::payments::utils::{normalize_phone, PhoneFormat};
///
/// assert_eq!(normalize_phone("0712 345-678", PhoneFormat::Plain254).unwrap(), "254712345678");
/// assert_eq!(normalize_phone("254712345678", PhoneFormat::Plus254).unwrap(), "+254712345678");
/// ```
pub fn normalize_phone(raw: &str, format: PhoneFormat) -> PaymentResult<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    let subscriber = if let Some(rest) = digits.strip_prefix("254") {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits
    };

    let valid = subscriber.len() == 9
        && subscriber.chars().all(|c| c.is_ascii_digit())
        && (subscriber.starts_with('7') || subscriber.starts_with('1'))
        && (!cleaned.starts_with('+') || digits.starts_with("254"));

    if !valid {
        return Err(PaymentError::ValidationError {
            message: format!("'{}' is not a valid Kenyan mobile number", raw.trim()),
            field: Some("phone_number".to_string()),
        });
    }

    Ok(match format {
        PhoneFormat::Plain254 => format!("254{}", subscriber),
        PhoneFormat::Plus254 => format!("+254{}", subscriber),
    })
}

/// Daraja timestamp `YYYYMMDDHHmmss` in East Africa Time (UTC+3)
pub fn mpesa_timestamp(now: DateTime<Utc>) -> String {
    (now + ChronoDuration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// STK push password: `base64(shortcode + passkey + timestamp)`
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}
