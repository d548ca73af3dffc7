use crate::config::PaymentsConfig;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{
    bank::BankProvider, lipana::LipanaProvider, mpesa::MpesaProvider, payhero::PayHeroProvider,
};
use crate::payments::types::ProviderName;
use crate::payments::utils::PaymentHttpClient;
use crate::services::settings::SettingsSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const MPESA_CALLBACK_PATH: &str = "/api/mpesa/callback";
pub const PAYMENTS_CALLBACK_PATH: &str = "/api/payments/callback";

/// Where a resolved credential set came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialSource {
    Settings,
    Environment,
}

/// Builds gateway adapters per call from the current settings snapshot.
///
/// A complete credential set stored in `app_settings` wins over a complete
/// set from the environment. Sets are never merged field by field.
pub struct PaymentProviderFactory {
    config: PaymentsConfig,
    http: PaymentHttpClient,
    overrides: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
}

impl PaymentProviderFactory {
    pub fn new(config: PaymentsConfig) -> PaymentResult<Self> {
        let http =
            PaymentHttpClient::new(Duration::from_secs(config.request_timeout_secs.max(1)))?;
        Ok(Self {
            config,
            http,
            overrides: HashMap::new(),
        })
    }

    /// Replaces the adapter built for `provider.name()`
    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.overrides.insert(provider.name(), provider);
        self
    }

    /// Adapter for a user-initiated payment; refuses disabled methods
    pub fn payment_provider(
        &self,
        name: ProviderName,
        snapshot: &SettingsSnapshot,
    ) -> PaymentResult<Arc<dyn PaymentProvider>> {
        if !snapshot.payment_methods_enabled.is_enabled(name) {
            return Err(PaymentError::ValidationError {
                message: format!("{} payments are currently disabled", name),
                field: Some("provider".to_string()),
            });
        }
        self.build(name, snapshot)
    }

    /// Adapter for an inbound notification. Callbacks for a method that was
    /// disabled after the push still have to settle.
    pub fn webhook_provider(
        &self,
        name: ProviderName,
        snapshot: &SettingsSnapshot,
    ) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.build(name, snapshot)
    }

    pub fn enabled_providers(&self, snapshot: &SettingsSnapshot) -> Vec<ProviderName> {
        ProviderName::ALL
            .into_iter()
            .filter(|name| snapshot.payment_methods_enabled.is_enabled(*name))
            .collect()
    }

    fn callback_url(&self, path: &str) -> Option<String> {
        self.config
            .callback_base_url
            .as_ref()
            .map(|base| format!("{}{}", base, path))
    }

    fn build(
        &self,
        name: ProviderName,
        snapshot: &SettingsSnapshot,
    ) -> PaymentResult<Arc<dyn PaymentProvider>> {
        if let Some(provider) = self.overrides.get(&name) {
            return Ok(provider.clone());
        }

        let not_configured = || PaymentError::NotConfigured {
            provider: name.to_string(),
        };

        let provider: Arc<dyn PaymentProvider> = match name {
            ProviderName::Mpesa => {
                let callback = self.callback_url(MPESA_CALLBACK_PATH);
                let (config, source) = pick(
                    snapshot.mpesa.resolve(callback.as_deref()),
                    self.config.mpesa.resolve(callback.as_deref()),
                )
                .ok_or_else(not_configured)?;
                debug!(provider = %name, source = ?source, "resolved gateway credentials");
                Arc::new(MpesaProvider::new(config, self.http.clone()))
            }
            ProviderName::PayHero => {
                let callback = self.callback_url(PAYMENTS_CALLBACK_PATH);
                let (config, source) = pick(
                    snapshot.payhero.resolve(callback.as_deref()),
                    self.config.payhero.resolve(callback.as_deref()),
                )
                .ok_or_else(not_configured)?;
                debug!(provider = %name, source = ?source, "resolved gateway credentials");
                Arc::new(PayHeroProvider::new(config, self.http.clone()))
            }
            ProviderName::Lipana => {
                let (config, source) =
                    pick(snapshot.lipana.resolve(), self.config.lipana.resolve())
                        .ok_or_else(not_configured)?;
                debug!(provider = %name, source = ?source, "resolved gateway credentials");
                Arc::new(LipanaProvider::new(config, self.http.clone()))
            }
            ProviderName::Bank => Arc::new(BankProvider::new(snapshot.bank_instructions())),
        };

        Ok(provider)
    }
}

fn pick<T>(stored: Option<T>, env: Option<T>) -> Option<(T, CredentialSource)> {
    stored
        .map(|c| (c, CredentialSource::Settings))
        .or_else(|| env.map(|c| (c, CredentialSource::Environment)))
}
