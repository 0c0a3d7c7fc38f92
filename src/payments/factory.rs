use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{
    RobokassaConfig, RobokassaProvider, UnitpayConfig, UnitpayProvider,
};
use crate::payments::types::ProviderName;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PaymentFactoryConfig {
    pub default_provider: ProviderName,
    pub enabled_providers: Vec<ProviderName>,
    pub robokassa: Option<RobokassaConfig>,
    pub unitpay: Option<UnitpayConfig>,
}

impl PaymentFactoryConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let default_provider =
            std::env::var("DEFAULT_PAYMENT_PROVIDER").unwrap_or_else(|_| "robokassa".to_string());
        let default_provider = ProviderName::from_str(&default_provider)?;

        let enabled_raw =
            std::env::var("ENABLED_PAYMENT_PROVIDERS").unwrap_or_else(|_| "robokassa".to_string());
        let enabled_providers = parse_provider_list(&enabled_raw)?;

        let robokassa = if enabled_providers.contains(&ProviderName::Robokassa) {
            Some(RobokassaConfig::from_env()?)
        } else {
            None
        };
        let unitpay = if enabled_providers.contains(&ProviderName::Unitpay) {
            Some(UnitpayConfig::from_env()?)
        } else {
            None
        };

        let config = Self {
            default_provider,
            enabled_providers,
            robokassa,
            unitpay,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if !self.enabled_providers.contains(&self.default_provider) {
            return Err(PaymentError::ValidationError {
                message: "default provider must be enabled".to_string(),
                field: Some("DEFAULT_PAYMENT_PROVIDER".to_string()),
            });
        }

        for provider in &self.enabled_providers {
            let configured = match provider {
                ProviderName::Robokassa => self.robokassa.is_some(),
                ProviderName::Unitpay => self.unitpay.is_some(),
            };
            if !configured {
                return Err(PaymentError::ValidationError {
                    message: format!("provider {} is enabled but not configured", provider),
                    field: Some("ENABLED_PAYMENT_PROVIDERS".to_string()),
                });
            }
        }
        Ok(())
    }
}

fn parse_provider_list(raw: &str) -> PaymentResult<Vec<ProviderName>> {
    let mut providers = Vec::new();
    for part in raw.split(',') {
        let value = part.trim();
        if value.is_empty() {
            continue;
        }
        let provider = ProviderName::from_str(value)?;
        if !providers.contains(&provider) {
            providers.push(provider);
        }
    }
    Ok(providers)
}

/// Registry of ready-to-use drivers, built once at startup.
pub struct PaymentProviderFactory {
    default_provider: ProviderName,
    providers: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
}

impl PaymentProviderFactory {
    pub fn from_env() -> PaymentResult<Self> {
        Self::from_config(PaymentFactoryConfig::from_env()?)
    }

    pub fn from_config(config: PaymentFactoryConfig) -> PaymentResult<Self> {
        config.validate()?;

        let mut providers: Vec<Arc<dyn PaymentProvider>> = Vec::new();
        for name in &config.enabled_providers {
            match name {
                ProviderName::Robokassa => {
                    if let Some(cfg) = config.robokassa.clone() {
                        providers.push(Arc::new(RobokassaProvider::new(cfg)?));
                    }
                }
                ProviderName::Unitpay => {
                    if let Some(cfg) = config.unitpay.clone() {
                        providers.push(Arc::new(UnitpayProvider::new(cfg)?));
                    }
                }
            }
        }

        let factory = Self::with_providers(config.default_provider, providers)?;
        info!(
            default_provider = %factory.default_provider,
            providers = ?factory.list_available_providers(),
            "payment providers initialized"
        );
        Ok(factory)
    }

    /// Builds a registry from already constructed drivers.
    pub fn with_providers(
        default_provider: ProviderName,
        providers: Vec<Arc<dyn PaymentProvider>>,
    ) -> PaymentResult<Self> {
        let providers: HashMap<ProviderName, Arc<dyn PaymentProvider>> =
            providers.into_iter().map(|p| (p.name(), p)).collect();
        if !providers.contains_key(&default_provider) {
            return Err(PaymentError::ValidationError {
                message: format!("default provider {} is not registered", default_provider),
                field: Some("DEFAULT_PAYMENT_PROVIDER".to_string()),
            });
        }
        Ok(Self {
            default_provider,
            providers,
        })
    }

    pub fn get_provider(&self, provider: ProviderName) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&provider)
            .cloned()
            .ok_or_else(|| PaymentError::ValidationError {
                message: format!("provider {} is disabled", provider),
                field: Some("provider".to_string()),
            })
    }

    pub fn get_default_provider(&self) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.get_provider(self.default_provider)
    }

    /// Explicit provider name if given, otherwise the default one.
    pub fn resolve(&self, name: Option<&str>) -> PaymentResult<Arc<dyn PaymentProvider>> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => self.get_provider(ProviderName::from_str(name)?),
            None => self.get_default_provider(),
        }
    }

    pub fn default_provider(&self) -> ProviderName {
        self.default_provider
    }

    pub fn list_available_providers(&self) -> Vec<ProviderName> {
        let mut names: Vec<ProviderName> = self.providers.keys().copied().collect();
        names.sort();
        names
    }
}
