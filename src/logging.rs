//! Logging and tracing configuration
//!
//! JSON output in production, pretty output in development. Includes masking
//! helpers for phone numbers and credential-bearing payloads.

use regex::Regex;
use std::env;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment types for logging configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        Self::parse(
            &env::var("ENVIRONMENT")
                .or_else(|_| env::var("ENV"))
                .unwrap_or_else(|_| "development".to_string()),
        )
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    pub fn default_log_level(&self) -> Level {
        match self {
            Self::Development => Level::DEBUG,
            Self::Staging | Self::Production => Level::INFO,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
/// - `ENVIRONMENT` or `ENV`: "production", "staging" or "development"
/// - `RUST_LOG`: overrides the filter (e.g. "info", "earnify_backend=debug")
/// - `LOG_LEVEL`: default level when `RUST_LOG` is unset
/// - `LOG_FORMAT`: force "json" or "pretty"
pub fn init_tracing() {
    let environment = Environment::from_env();

    let use_json = env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or_else(|_| environment.is_production());

    let level = env::var("LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or_else(|| environment.default_log_level());
    let default_directives = format!(
        "{}={},tower_http=info,axum=info,sqlx=warn,hyper=warn,reqwest=warn",
        env!("CARGO_PKG_NAME").replace('-', "_"),
        level
    );
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let result = if use_json {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_level(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(pretty_layer).try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
        return;
    }

    tracing::info!(
        environment = ?environment,
        format = if use_json { "json" } else { "pretty" },
        "Tracing initialized"
    );
}

/// Mask a phone number for logging, keeping the country prefix and last 3 digits
///
/// ```
/// use earnify_backend::logging::mask_phone_number;
/// assert_eq!(mask_phone_number("254712345678"), "2547*****678");
/// ```
pub fn mask_phone_number(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() <= 7 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 7), tail)
}

fn sensitive_field_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?i)"(password|passkey|secret|consumer_?key|consumer_?secret|consumerKey|consumerSecret|api_?key|apiKey|access_token|token|authorization|webhook_?secret|webhookSecret)"\s*:\s*"[^"]*""#,
            )
            .ok()
        })
        .as_ref()
}

/// Redact credential values from a JSON-like string before it is logged
pub fn redact_sensitive_data(text: &str) -> String {
    match sensitive_field_pattern() {
        Some(re) => re.replace_all(text, r#""$1": "[REDACTED]""#).to_string(),
        None => "[REDACTED]".to_string(),
    }
}

/// Log a ledger event with consistent structure
///
/// ```no_run
/// use earnify_backend::log_transaction;
/// log_transaction!(
///     event = "deposit_initiated",
///     transaction_id = "5f6c...",
///     amount = "100",
/// );
/// ```
#[macro_export]
macro_rules! log_transaction {
    ($($key:tt = $value:expr),* $(,)?) => {
        tracing::info!(
            event_type = "transaction",
            $($key = tracing::field::debug(&$value)),*
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::parse("production"), Environment::Production);
        assert!(Environment::parse("PROD").is_production());
        assert_eq!(Environment::parse("stage"), Environment::Staging);
        assert_eq!(Environment::parse("anything"), Environment::Development);
    }

    #[test]
    fn test_default_log_levels() {
        assert_eq!(Environment::Development.default_log_level(), Level::DEBUG);
        assert_eq!(Environment::Production.default_log_level(), Level::INFO);
        assert_eq!(Environment::Staging.default_log_level(), Level::INFO);
    }

    #[test]
    fn test_mask_phone_number() {
        assert_eq!(mask_phone_number("254712345678"), "2547*****678");
        assert_eq!(mask_phone_number("+254712345678"), "+254******678");
        assert_eq!(mask_phone_number("0712"), "****");
    }

    #[test]
    fn test_redact_sensitive_data() {
        let data = r#"{"consumerSecret": "abc123", "passkey":"bfb279", "amount": 100}"#;
        let redacted = redact_sensitive_data(data);
        assert!(redacted.contains("[REDACTED]"));
        assert!(!redacted.contains("abc123"));
        assert!(!redacted.contains("bfb279"));
        assert!(redacted.contains("100"));
    }
}
