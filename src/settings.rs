//! Runtime configuration.
//!
//! Sources, later overriding earlier:
//! 1. built-in defaults
//! 2. the TOML file passed with `--config`, if any
//! 3. environment variables prefixed with `ACH_AUTOPAY__`, nested with `__`
//!    (for example `ACH_AUTOPAY__PROCESSOR__MERCHANT_ID`)

use crate::error::{AutopayError, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::fmt;
use std::path::Path;

pub const ENV_PREFIX: &str = "ACH_AUTOPAY";

pub const DEFAULT_ENDPOINT: &str = "https://www.speedchex.com/datalinks/transact.aspx";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Master switch. Every job and every linking call is a no-op while off.
    pub enabled: bool,
    pub binding_mode: BindingMode,
    pub processor: ProcessorSettings,
    pub schedule: ScheduleSettings,
    pub policy: PolicySettings,
    pub notifications: NotificationSettings,
}

/// How authorizations relate to loans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// One authorization per loan.
    SingleLoan,
    /// Several accounts per customer, one of them the default.
    #[default]
    MultiAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Json,
    Delimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCheckStrategy {
    #[default]
    ByDate,
    PerTransaction,
}

/// A credential that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    pub environment: Environment,
    pub endpoint: String,
    pub response_format: ResponseFormat,
    pub merchant_id: String,
    pub merchant_gate_id: String,
    pub merchant_gate_key: Secret,
    pub provider_id: Option<String>,
    pub provider_gate_id: Option<String>,
    pub provider_gate_key: Option<Secret>,
    pub timeout_secs: u64,
    pub use_express_verify: bool,
    pub default_check_type: String,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            environment: Environment::Sandbox,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            response_format: ResponseFormat::Json,
            merchant_id: String::new(),
            merchant_gate_id: String::new(),
            merchant_gate_key: Secret::default(),
            provider_id: None,
            provider_gate_id: None,
            provider_gate_key: None,
            timeout_secs: 30,
            use_express_verify: true,
            default_check_type: "Personal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Days before the due date at which the upcoming notice goes out and the
    /// transaction is created.
    pub advance_notification_days: u32,
    /// Days before the due date at which the debit is submitted.
    pub initiation_lead_days: u32,
    /// Local time after which the initiation sweep does nothing for the day.
    pub cutoff_time: Option<NaiveTime>,
    pub max_retries: u32,
    pub retry_delay_days: u32,
    /// Estimated business days from submission to settlement.
    pub settlement_days: u32,
    pub status_check: StatusCheckStrategy,
    /// Previous days covered by a by-date status check, besides today.
    pub status_lookback_days: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            advance_notification_days: 5,
            initiation_lead_days: 2,
            cutoff_time: None,
            max_retries: 2,
            retry_delay_days: 3,
            settlement_days: 5,
            status_check: StatusCheckStrategy::ByDate,
            status_lookback_days: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub default_sec_code: String,
    pub allow_unknown_verification: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            default_sec_code: "WEB".to_string(),
            allow_unknown_verification: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub upcoming: bool,
    pub success: bool,
    pub failure: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            upcoming: true,
            success: true,
            failure: true,
        }
    }
}

impl Settings {
    /// Loads settings from an optional TOML file and the environment, then
    /// validates them.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        use config::{Config, Environment as EnvSource, File, FileFormat};

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let settings: Settings = builder
            .add_source(
                EnvSource::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            let processor = &self.processor;
            if processor.merchant_id.trim().is_empty() {
                return Err(config_error("Merchant ID is required when ACH is enabled"));
            }
            if processor.merchant_gate_id.trim().is_empty() {
                return Err(config_error("Merchant Gate ID is required when ACH is enabled"));
            }
            if processor.merchant_gate_key.is_empty() {
                return Err(config_error("Merchant Gate Key is required when ACH is enabled"));
            }
        }

        let schedule = &self.schedule;
        if schedule.initiation_lead_days < 1 {
            return Err(config_error("Initiation lead days must be at least 1"));
        }
        if schedule.advance_notification_days < schedule.initiation_lead_days {
            return Err(config_error(
                "Advance notification days must be at least the initiation lead days",
            ));
        }
        if schedule.retry_delay_days < 1 {
            return Err(config_error("Retry delay must be at least 1 day"));
        }
        if self.processor.timeout_secs == 0 {
            return Err(config_error("Processor timeout must be at least 1 second"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> AutopayError {
    AutopayError::ConfigError(message.to_string())
}
