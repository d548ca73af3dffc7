//! Runtime business settings.
//!
//! Rows of `app_settings` are folded into an immutable [`SettingsSnapshot`].
//! Operations receive an `Arc` of the current snapshot; it is replaced only
//! by [`SettingsService::reload`], which also runs after every admin write.

use crate::database::error::DatabaseError;
use crate::database::settings_repository::{SettingEntry, SettingsStore};
use crate::error::{AppError, ValidationError};
use crate::payments::providers::lipana::LipanaCredentials;
use crate::payments::providers::mpesa::MpesaCredentials;
use crate::payments::providers::payhero::PayHeroCredentials;
use crate::payments::types::ProviderName;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    AppSettings,
    PaymentMethods,
    SocialProofSettings,
    MpesaConfig,
    LipanaConfig,
    PayheroConfig,
    PaymentMethodsEnabled,
}

impl SettingKey {
    pub const ALL: [SettingKey; 7] = [
        SettingKey::AppSettings,
        SettingKey::PaymentMethods,
        SettingKey::SocialProofSettings,
        SettingKey::MpesaConfig,
        SettingKey::LipanaConfig,
        SettingKey::PayheroConfig,
        SettingKey::PaymentMethodsEnabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::AppSettings => "appSettings",
            SettingKey::PaymentMethods => "paymentMethods",
            SettingKey::SocialProofSettings => "socialProofSettings",
            SettingKey::MpesaConfig => "mpesaConfig",
            SettingKey::LipanaConfig => "lipanaConfig",
            SettingKey::PayheroConfig => "payheroConfig",
            SettingKey::PaymentMethodsEnabled => "paymentMethodsEnabled",
        }
    }

    /// Keys holding gateway secrets
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            SettingKey::MpesaConfig | SettingKey::LipanaConfig | SettingKey::PayheroConfig
        )
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| SettingsError::UnknownKey(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Unknown settings key: {0}")]
    UnknownKey(String),
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Settings store error: {0}")]
    Store(#[from] DatabaseError),
}

impl From<SettingsError> for AppError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::UnknownKey(key) => {
                AppError::validation(ValidationError::InvalidField {
                    field: "key".to_string(),
                    reason: format!("unknown settings key '{}'", key),
                })
            }
            SettingsError::InvalidValue { key, message } => {
                AppError::validation(ValidationError::InvalidField {
                    field: key,
                    reason: message,
                })
            }
            SettingsError::Store(err) => err.into(),
        }
    }
}

/// `appSettings` value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub app_name: String,
    pub currency_symbol: String,
    pub min_deposit: BigDecimal,
    pub min_withdrawal: BigDecimal,
    pub max_withdrawal: Option<BigDecimal>,
    pub referral_bonus: BigDecimal,
    pub checkin_bonus: BigDecimal,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_name: "Earnify".to_string(),
            currency_symbol: "KSh".to_string(),
            min_deposit: BigDecimal::from(10),
            min_withdrawal: BigDecimal::from(100),
            max_withdrawal: None,
            referral_bonus: BigDecimal::from(50),
            checkin_bonus: BigDecimal::from(5),
        }
    }
}

impl AppSettings {
    fn check(&self) -> Result<(), String> {
        let zero = BigDecimal::from(0);
        for (name, value) in [
            ("minDeposit", &self.min_deposit),
            ("minWithdrawal", &self.min_withdrawal),
            ("referralBonus", &self.referral_bonus),
            ("checkinBonus", &self.checkin_bonus),
        ] {
            if *value < zero {
                return Err(format!("{} must not be negative", name));
            }
        }
        // A zero bonus would write an empty ledger entry
        if self.checkin_bonus <= zero {
            return Err("checkinBonus must be greater than zero".to_string());
        }
        if let Some(max) = &self.max_withdrawal {
            if *max < self.min_withdrawal {
                return Err("maxWithdrawal must not be below minWithdrawal".to_string());
            }
        }
        Ok(())
    }
}

/// `paymentMethodsEnabled` value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentMethodsEnabled {
    pub mpesa: bool,
    pub payhero: bool,
    pub lipana: bool,
    pub bank: bool,
}

impl Default for PaymentMethodsEnabled {
    fn default() -> Self {
        Self {
            mpesa: true,
            payhero: false,
            lipana: false,
            bank: true,
        }
    }
}

impl PaymentMethodsEnabled {
    pub fn is_enabled(&self, provider: ProviderName) -> bool {
        match provider {
            ProviderName::Mpesa => self.mpesa,
            ProviderName::PayHero => self.payhero,
            ProviderName::Lipana => self.lipana,
            ProviderName::Bank => self.bank,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub app: AppSettings,
    /// Per-method display instructions, e.g. `{"bank": {...}, "mpesa": {...}}`
    pub payment_methods: JsonValue,
    pub social_proof: JsonValue,
    pub payment_methods_enabled: PaymentMethodsEnabled,
    pub mpesa: MpesaCredentials,
    pub payhero: PayHeroCredentials,
    pub lipana: LipanaCredentials,
    pub loaded_at: DateTime<Utc>,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            app: AppSettings::default(),
            payment_methods: JsonValue::Object(Default::default()),
            social_proof: JsonValue::Object(Default::default()),
            payment_methods_enabled: PaymentMethodsEnabled::default(),
            mpesa: MpesaCredentials::default(),
            payhero: PayHeroCredentials::default(),
            lipana: LipanaCredentials::default(),
            loaded_at: Utc::now(),
        }
    }
}

/// Fields a signed-out client may read
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSettings {
    pub app_name: String,
    pub currency_symbol: String,
    pub min_deposit: BigDecimal,
    pub min_withdrawal: BigDecimal,
    pub max_withdrawal: Option<BigDecimal>,
    pub referral_bonus: BigDecimal,
    pub checkin_bonus: BigDecimal,
    pub enabled_payment_methods: Vec<ProviderName>,
    pub payment_methods: JsonValue,
    pub social_proof: JsonValue,
}

fn decode<T: DeserializeOwned>(key: SettingKey, value: &JsonValue) -> Result<T, SettingsError> {
    serde_json::from_value(value.clone()).map_err(|e| SettingsError::InvalidValue {
        key: key.as_str().to_string(),
        message: e.to_string(),
    })
}

impl SettingsSnapshot {
    /// Builds a snapshot from stored rows. A malformed row is logged and
    /// its defaults are kept, so one bad key never blocks startup.
    pub fn from_entries(entries: &[SettingEntry]) -> Self {
        let mut snapshot = SettingsSnapshot::default();
        for entry in entries {
            let Ok(key) = entry.key.parse::<SettingKey>() else {
                debug!(key = %entry.key, "ignoring unknown settings key");
                continue;
            };
            if let Err(e) = snapshot.apply(key, &entry.value) {
                warn!(key = %entry.key, error = %e, "malformed settings value, keeping defaults");
            }
        }
        snapshot
    }

    fn apply(&mut self, key: SettingKey, value: &JsonValue) -> Result<(), SettingsError> {
        match key {
            SettingKey::AppSettings => {
                let app: AppSettings = decode(key, value)?;
                app.check().map_err(|message| SettingsError::InvalidValue {
                    key: key.as_str().to_string(),
                    message,
                })?;
                self.app = app;
            }
            SettingKey::PaymentMethods => self.payment_methods = value.clone(),
            SettingKey::SocialProofSettings => self.social_proof = value.clone(),
            SettingKey::MpesaConfig => self.mpesa = decode(key, value)?,
            SettingKey::LipanaConfig => self.lipana = decode(key, value)?,
            SettingKey::PayheroConfig => self.payhero = decode(key, value)?,
            SettingKey::PaymentMethodsEnabled => self.payment_methods_enabled = decode(key, value)?,
        }
        Ok(())
    }

    /// Strict check used before an admin write is stored
    pub fn validate_entry(key: SettingKey, value: &JsonValue) -> Result<(), SettingsError> {
        let invalid = |message: String| SettingsError::InvalidValue {
            key: key.as_str().to_string(),
            message,
        };
        match key {
            SettingKey::AppSettings => {
                let app: AppSettings = decode(key, value)?;
                app.check().map_err(invalid)
            }
            SettingKey::PaymentMethods | SettingKey::SocialProofSettings => {
                if value.is_object() {
                    Ok(())
                } else {
                    Err(invalid("expected a JSON object".to_string()))
                }
            }
            SettingKey::MpesaConfig => decode::<MpesaCredentials>(key, value).map(|_| ()),
            SettingKey::LipanaConfig => decode::<LipanaCredentials>(key, value).map(|_| ()),
            SettingKey::PayheroConfig => decode::<PayHeroCredentials>(key, value).map(|_| ()),
            SettingKey::PaymentMethodsEnabled => {
                decode::<PaymentMethodsEnabled>(key, value).map(|_| ())
            }
        }
    }

    /// Bank transfer instructions shown when a bank deposit is created
    pub fn bank_instructions(&self) -> Option<JsonValue> {
        self.payment_methods
            .get("bank")
            .filter(|value| !value.is_null())
            .cloned()
    }

    pub fn public_view(&self) -> PublicSettings {
        PublicSettings {
            app_name: self.app.app_name.clone(),
            currency_symbol: self.app.currency_symbol.clone(),
            min_deposit: self.app.min_deposit.clone(),
            min_withdrawal: self.app.min_withdrawal.clone(),
            max_withdrawal: self.app.max_withdrawal.clone(),
            referral_bonus: self.app.referral_bonus.clone(),
            checkin_bonus: self.app.checkin_bonus.clone(),
            enabled_payment_methods: ProviderName::ALL
                .into_iter()
                .filter(|name| self.payment_methods_enabled.is_enabled(*name))
                .collect(),
            payment_methods: self.payment_methods.clone(),
            social_proof: self.social_proof.clone(),
        }
    }
}

pub struct SettingsService {
    store: Arc<dyn SettingsStore>,
    current: RwLock<Arc<SettingsSnapshot>>,
}

impl SettingsService {
    pub async fn load(store: Arc<dyn SettingsStore>) -> Result<Self, SettingsError> {
        let entries = store.load_all().await?;
        let snapshot = SettingsSnapshot::from_entries(&entries);
        info!(keys = entries.len(), "settings snapshot loaded");
        Ok(Self {
            store,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub async fn snapshot(&self) -> Arc<SettingsSnapshot> {
        self.current.read().await.clone()
    }

    pub async fn reload(&self) -> Result<Arc<SettingsSnapshot>, SettingsError> {
        let entries = self.store.load_all().await?;
        let snapshot = Arc::new(SettingsSnapshot::from_entries(&entries));
        *self.current.write().await = snapshot.clone();
        info!(keys = entries.len(), "settings snapshot reloaded");
        Ok(snapshot)
    }

    /// Validates and stores one key, then swaps in a fresh snapshot
    pub async fn update(
        &self,
        key: &str,
        value: JsonValue,
    ) -> Result<(SettingEntry, Arc<SettingsSnapshot>), SettingsError> {
        let key: SettingKey = key.parse()?;
        SettingsSnapshot::validate_entry(key, &value)?;
        let mut entry = self.store.upsert(key.as_str(), value).await?;
        if key.is_credential() {
            entry.value = JsonValue::String("[REDACTED]".to_string());
        }
        info!(key = key.as_str(), "settings key updated");
        let snapshot = self.reload().await?;
        Ok((entry, snapshot))
    }
}
