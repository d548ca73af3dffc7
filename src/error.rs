//! Unified error handling for the Earnify backend
//!
//! Every fallible operation surfaces an [`AppError`] that knows its HTTP status,
//! a machine-readable [`ErrorCode`], a user-facing message and whether a retry
//! could succeed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Auth errors (401, 403)
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,

    // Domain errors (4xx)
    #[serde(rename = "INSUFFICIENT_BALANCE")]
    InsufficientBalance,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "USER_NOT_FOUND")]
    UserNotFound,
    #[serde(rename = "USER_ALREADY_EXISTS")]
    UserAlreadyExists,
    #[serde(rename = "TASK_NOT_FOUND")]
    TaskNotFound,
    #[serde(rename = "PACKAGE_NOT_FOUND")]
    PackageNotFound,
    #[serde(rename = "TRANSACTION_ALREADY_RESOLVED")]
    TransactionAlreadyResolved,
    #[serde(rename = "DAILY_LIMIT_REACHED")]
    DailyLimitReached,
    #[serde(rename = "TASK_NOT_AVAILABLE")]
    TaskNotAvailable,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "GATEWAY_NOT_CONFIGURED")]
    GatewayNotConfigured,
    #[serde(rename = "GATEWAY_REJECTED")]
    GatewayRejected,
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Authentication and authorization failures
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No usable identity was forwarded, or it does not own the resource
    Unauthorized { reason: String },
    /// Identity is known but not allowed to perform the operation
    Forbidden { reason: String },
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    InsufficientBalance { available: String, required: String },
    TransactionNotFound { transaction_id: String },
    UserNotFound { user_id: String },
    UserAlreadyExists { user_id: String },
    TaskNotFound { task_id: String },
    PackageNotFound { package_id: String },
    /// The ledger entry already reached a terminal status
    TransactionAlreadyResolved { transaction_id: String, status: String },
    /// A once-per-day reward was already claimed today
    DailyLimitReached { activity: String },
    /// Content exists but is inactive or gated behind another package
    TaskNotAvailable { task_id: String, reason: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

/// Payment gateway errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// No complete credential set exists for the gateway
    GatewayNotConfigured { provider: String },
    /// The gateway refused the request; its message is shown to the user
    GatewayRejected { provider: String, message: String },
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidAmount { amount: String, reason: String },
    InvalidPhoneNumber { phone_number: String, reason: String },
    InvalidField { field: String, reason: String },
    MissingField { field: String },
    OutOfRange {
        field: String,
        min: Option<String>,
        max: Option<String>,
    },
    /// Caller-supplied value disagrees with the stored record
    Mismatch { field: String, expected: String, actual: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Auth(AuthError),
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Auth(AuthError::Unauthorized {
            reason: reason.into(),
        }))
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Auth(AuthError::Forbidden {
            reason: reason.into(),
        }))
    }

    pub fn domain(err: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(err))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a request id when one was propagated on the request
    pub fn maybe_request_id(mut self, request_id: Option<String>) -> Self {
        if request_id.is_some() {
            self.request_id = request_id;
        }
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Auth(err) => match err {
                AuthError::Unauthorized { .. } => 401,
                AuthError::Forbidden { .. } => 403,
            },
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance { .. } => 422,
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::UserNotFound { .. } => 404,
                DomainError::UserAlreadyExists { .. } => 409,
                DomainError::TaskNotFound { .. } => 404,
                DomainError::PackageNotFound { .. } => 404,
                DomainError::TransactionAlreadyResolved { .. } => 409,
                DomainError::DailyLimitReached { .. } => 429,
                DomainError::TaskNotAvailable { .. } => 403,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayNotConfigured { .. } => 503,
                ExternalError::GatewayRejected { .. } => 502,
                ExternalError::PaymentProvider { .. } => 502,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Auth(err) => match err {
                AuthError::Unauthorized { .. } => ErrorCode::Unauthorized,
                AuthError::Forbidden { .. } => ErrorCode::Forbidden,
            },
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::UserNotFound { .. } => ErrorCode::UserNotFound,
                DomainError::UserAlreadyExists { .. } => ErrorCode::UserAlreadyExists,
                DomainError::TaskNotFound { .. } => ErrorCode::TaskNotFound,
                DomainError::PackageNotFound { .. } => ErrorCode::PackageNotFound,
                DomainError::TransactionAlreadyResolved { .. } => {
                    ErrorCode::TransactionAlreadyResolved
                }
                DomainError::DailyLimitReached { .. } => ErrorCode::DailyLimitReached,
                DomainError::TaskNotAvailable { .. } => ErrorCode::TaskNotAvailable,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayNotConfigured { .. } => ErrorCode::GatewayNotConfigured,
                ExternalError::GatewayRejected { .. } => ErrorCode::GatewayRejected,
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Auth(err) => match err {
                AuthError::Unauthorized { reason } => format!("Unauthorized: {}", reason),
                AuthError::Forbidden { reason } => format!("Forbidden: {}", reason),
            },
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance {
                    available,
                    required,
                } => format!(
                    "Insufficient balance. Available: {}, Required: {}",
                    available, required
                ),
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Transaction '{}' not found", transaction_id)
                }
                DomainError::UserNotFound { user_id } => {
                    format!("User '{}' not found", user_id)
                }
                DomainError::UserAlreadyExists { user_id } => {
                    format!("User '{}' is already registered", user_id)
                }
                DomainError::TaskNotFound { task_id } => format!("Task '{}' not found", task_id),
                DomainError::PackageNotFound { package_id } => {
                    format!("Package '{}' not found", package_id)
                }
                DomainError::TransactionAlreadyResolved {
                    transaction_id,
                    status,
                } => format!(
                    "Transaction '{}' has already been {}",
                    transaction_id, status
                ),
                DomainError::DailyLimitReached { activity } => format!(
                    "You have already completed today's {}. Come back tomorrow",
                    activity
                ),
                DomainError::TaskNotAvailable { task_id, reason } => {
                    format!("Task '{}' is not available: {}", task_id, reason)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayNotConfigured { provider } => format!(
                    "{} payments are not available right now. Please use another method",
                    provider
                ),
                ExternalError::GatewayRejected { message, .. } => message.clone(),
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } if amount.is_empty() => {
                    format!("Invalid amount: {}", reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidPhoneNumber {
                    phone_number,
                    reason,
                } if phone_number.is_empty() => format!("Invalid phone number: {}", reason),
                ValidationError::InvalidPhoneNumber {
                    phone_number,
                    reason,
                } => format!("Invalid phone number '{}': {}", phone_number, reason),
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::OutOfRange { field, min, max } => match (min, max) {
                    (Some(min), Some(max)) => {
                        format!("Field '{}' must be between {} and {}", field, min, max)
                    }
                    (Some(min), None) => format!("Field '{}' must be at least {}", field, min),
                    (None, Some(max)) => format!("Field '{}' must be at most {}", field, max),
                    (None, None) => format!("Field '{}' is out of acceptable range", field),
                },
                ValidationError::Mismatch {
                    field,
                    expected,
                    actual,
                } => format!(
                    "Field '{}' does not match the transaction (expected {}, got {})",
                    field, expected, actual
                ),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Auth(_) | AppErrorKind::Domain(_) | AppErrorKind::Validation(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayNotConfigured { .. } => false,
                ExternalError::GatewayRejected { .. } => false,
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::Timeout { .. } => true,
            },
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.user_message(), context),
            None => write!(f, "{}", self.user_message()),
        }
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, From<PaymentError> in payments/error.rs

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_balance_error() {
        let error = AppError::domain(DomainError::InsufficientBalance {
            available: "300".to_string(),
            required: "500".to_string(),
        });

        assert_eq!(error.status_code(), 422);
        assert_eq!(error.error_code(), ErrorCode::InsufficientBalance);
        assert!(error.user_message().contains("Insufficient balance"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_gateway_rejected_surfaces_provider_text() {
        let error = AppError::new(AppErrorKind::External(ExternalError::GatewayRejected {
            provider: "mpesa".to_string(),
            message: "Bad Request - Invalid PhoneNumber".to_string(),
        }));

        assert_eq!(error.status_code(), 502);
        assert_eq!(error.error_code(), ErrorCode::GatewayRejected);
        assert_eq!(error.user_message(), "Bad Request - Invalid PhoneNumber");
    }

    #[test]
    fn test_auth_errors() {
        assert_eq!(AppError::unauthorized("missing identity").status_code(), 401);
        assert_eq!(AppError::forbidden("admin only").status_code(), 403);
        assert_eq!(
            AppError::forbidden("admin only").error_code(),
            ErrorCode::Forbidden
        );
    }

    #[test]
    fn test_already_resolved_is_conflict() {
        let error = AppError::domain(DomainError::TransactionAlreadyResolved {
            transaction_id: "tx_1".to_string(),
            status: "completed".to_string(),
        });
        assert_eq!(error.status_code(), 409);
        assert!(error.user_message().contains("already been completed"));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let error = AppError::new(AppErrorKind::External(ExternalError::Timeout {
            service: "mpesa".to_string(),
            timeout_secs: 30,
        }));
        assert_eq!(error.status_code(), 504);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_maybe_request_id_keeps_existing() {
        let error = AppError::unauthorized("x")
            .with_request_id("req_1")
            .maybe_request_id(None);
        assert_eq!(error.request_id.as_deref(), Some("req_1"));
    }
}
