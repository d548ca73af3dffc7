use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Provider {provider} is not configured")]
    NotConfigured { provider: String },

    #[error("Authentication with {provider} failed: {message}")]
    AuthenticationFailed {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Rejected by {provider}: {message}")]
    GatewayRejected {
        provider: String,
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Provider request timed out after {timeout_secs}s")]
    TimeoutError { timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    /// 2xx reply to a push that could not be read; the push may be live
    #[error("Unreadable reply from {provider}: {message}")]
    UnreadableResponse { provider: String, message: String },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NotConfigured { .. } => false,
            PaymentError::AuthenticationFailed { .. } => false,
            PaymentError::GatewayRejected { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::TimeoutError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::UnreadableResponse { .. } => false,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    /// The request may have reached the gateway, so the outcome is unknown
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            PaymentError::NetworkError { .. }
                | PaymentError::TimeoutError { .. }
                | PaymentError::UnreadableResponse { .. }
        )
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::NotConfigured { .. } => 503,
            PaymentError::AuthenticationFailed { .. } => 502,
            PaymentError::GatewayRejected { .. } => 502,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::TimeoutError { .. } => 504,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::UnreadableResponse { .. } => 502,
            PaymentError::WebhookVerificationError { .. } => 401,
            PaymentError::ProviderError { .. } => 502,
        }
    }

    /// Text shown to the user, provider wording preserved for refusals
    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::NotConfigured { provider } => {
                format!("{} payments are not configured", provider)
            }
            PaymentError::AuthenticationFailed { message, .. } => message.clone(),
            PaymentError::GatewayRejected { message, .. } => message.clone(),
            PaymentError::NetworkError { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::TimeoutError { .. } => {
                "Payment provider did not respond in time".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::UnreadableResponse { .. } => {
                "Payment request sent but not yet confirmed".to_string()
            }
            PaymentError::WebhookVerificationError { .. } => {
                "Invalid webhook signature".to_string()
            }
            PaymentError::ProviderError { .. } => "Payment provider returned an error".to_string(),
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let is_retryable = err.is_retryable();
        let description = err.to_string();
        let kind = match err {
            PaymentError::ValidationError { message, field } => {
                let field = field.unwrap_or_else(|| "request".to_string());
                if field == "phone_number" {
                    AppErrorKind::Validation(ValidationError::InvalidPhoneNumber {
                        phone_number: String::new(),
                        reason: message,
                    })
                } else if field == "amount" {
                    AppErrorKind::Validation(ValidationError::InvalidAmount {
                        amount: String::new(),
                        reason: message,
                    })
                } else {
                    AppErrorKind::Validation(ValidationError::InvalidField {
                        field,
                        reason: message,
                    })
                }
            }
            PaymentError::NotConfigured { provider } => {
                AppErrorKind::External(ExternalError::GatewayNotConfigured { provider })
            }
            PaymentError::AuthenticationFailed {
                provider, message, ..
            }
            | PaymentError::GatewayRejected {
                provider, message, ..
            } => AppErrorKind::External(ExternalError::GatewayRejected { provider, message }),
            PaymentError::TimeoutError { timeout_secs } => {
                AppErrorKind::External(ExternalError::Timeout {
                    service: "payment provider".to_string(),
                    timeout_secs,
                })
            }
            PaymentError::WebhookVerificationError { message } => {
                return AppError::unauthorized(message);
            }
            PaymentError::ProviderError {
                provider, message, ..
            }
            | PaymentError::UnreadableResponse { provider, message } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider,
                    message,
                    is_retryable,
                })
            }
            PaymentError::NetworkError { .. } | PaymentError::RateLimitError { .. } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: "payments".to_string(),
                    message: description,
                    is_retryable,
                })
            }
        };

        AppError::new(kind)
    }
}
