//! Configuration for merchant-billing-service.

use crate::models::PlanTerms;
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_env_parsed, is_production};
use service_core::error::AppError;

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub plan_defaults: PlanDefaultsConfig,
    pub discount_service: DiscountServiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Fallback trial/grace lengths used when no plan row matches a merchant.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanDefaultsConfig {
    pub trial_days: i64,
    pub grace_period_days: i64,
}

impl PlanDefaultsConfig {
    pub fn terms(&self) -> PlanTerms {
        PlanTerms {
            trial_days: self.trial_days,
            grace_period_days: self.grace_period_days,
        }
    }
}

impl Default for PlanDefaultsConfig {
    fn default() -> Self {
        let terms = PlanTerms::default();
        Self {
            trial_days: terms.trial_days,
            grace_period_days: terms.grace_period_days,
        }
    }
}

/// External discount-computation collaborator used by public voucher checks.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscountServiceConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl BillingConfig {
    /// Load configuration from the environment (and `.env` when present).
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = is_production();

        let config = BillingConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("merchant-billing-service"), false)?,
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: std::env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", "10", false)?,
                min_connections: get_env_parsed("DATABASE_MIN_CONNECTIONS", "1", false)?,
            },
            plan_defaults: PlanDefaultsConfig {
                trial_days: get_env_parsed("BILLING_DEFAULT_TRIAL_DAYS", "30", false)?,
                grace_period_days: get_env_parsed("BILLING_DEFAULT_GRACE_PERIOD_DAYS", "3", false)?,
            },
            discount_service: DiscountServiceConfig {
                url: get_env("DISCOUNT_SERVICE_URL", Some("http://localhost:3010"), is_prod)?,
                timeout_secs: get_env_parsed("DISCOUNT_SERVICE_TIMEOUT_SECS", "5", false)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.plan_defaults.trial_days < 0 || self.plan_defaults.grace_period_days < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Trial and grace period lengths must not be negative"
            )));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS exceeds DATABASE_MAX_CONNECTIONS"
            )));
        }
        Ok(())
    }
}
