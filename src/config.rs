use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

use crate::liquidation::policy::LiquidationOrdering;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL. Without it the engine runs on in-memory stores.
    pub postgres_url: Option<String>,
    pub ledger: LedgerConfig,
    pub spend: SpendConfig,
    pub liquidation: LiquidationConfig,
    pub command: CommandConfig,
    pub execution: ExecutionConfig,
    pub reconciliation: ReconciliationConfig,
    pub webhook: WebhookConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "spendguard.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            postgres_url: None,
            ledger: LedgerConfig::default(),
            spend: SpendConfig::default(),
            liquidation: LiquidationConfig::default(),
            command: CommandConfig::default(),
            execution: ExecutionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            webhook: WebhookConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// How cash becomes spendable: bank settlement or on-chain confirmation.
///
/// Only changes naming in the spend-power response; the invariants are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementModel {
    Fiat,
    Stablecoin,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub currency: String,
    pub settlement_model: SettlementModel,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            settlement_model: SettlementModel::Fiat,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SpendConfig {
    /// Minimum safety cushion
    pub safety_buffer_floor_cents: i64,
    /// Safety cushion as basis points of settled cash (the larger of the two wins)
    pub safety_buffer_bps: i64,
    /// Inputs younger than this are "fresh"
    pub fresh_max_age_secs: i64,
    /// Inputs younger than this (but not fresh) are "stale"; older is "degraded"
    pub stale_max_age_secs: i64,
    pub stale_buffer_bps: i64,
    pub degraded_buffer_bps: i64,
    pub receipts_preview: usize,
    pub price_timeout_ms: u64,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            safety_buffer_floor_cents: 500,
            safety_buffer_bps: 0,
            fresh_max_age_secs: 300,
            stale_max_age_secs: 3600,
            stale_buffer_bps: 200,
            degraded_buffer_bps: 1000,
            receipts_preview: 5,
            price_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LiquidationConfig {
    pub batch_size: usize,
    pub max_attempts: i32,
    /// A PROCESSING claim older than this may be taken over
    pub claim_ttl_secs: i64,
    pub ordering: LiquidationOrdering,
    pub venue_timeout_ms: u64,
    pub venue_retry_attempts: usize,
    pub venue_retry_backoff_ms: u64,
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 3,
            claim_ttl_secs: 300,
            ordering: LiquidationOrdering::MostLiquidFirst,
            venue_timeout_ms: 5_000,
            venue_retry_attempts: 3,
            venue_retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CommandConfig {
    pub fee_bps: i64,
    pub flat_fee_cents: i64,
    /// How long a duplicate confirm waits for an in-flight first execution
    pub confirm_wait_ms: u64,
    pub reserve_ttl_hours: i64,
    pub venue_timeout_ms: u64,
    pub venue_retry_attempts: usize,
    pub venue_retry_backoff_ms: u64,
    /// A PENDING intent untouched this long may be taken over and re-run
    pub intent_claim_ttl_secs: i64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            fee_bps: 0,
            flat_fee_cents: 0,
            confirm_wait_ms: 5_000,
            reserve_ttl_hours: 24 * 30,
            venue_timeout_ms: 5_000,
            venue_retry_attempts: 3,
            venue_retry_backoff_ms: 200,
            intent_claim_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub quote_ttl_secs: i64,
    pub fee_bps: i64,
    /// Quotes whose total reaches this amount require a step-up token
    pub step_up_threshold_cents: i64,
    pub step_up_secret: String,
    pub max_receipts_page: usize,
    pub venue_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: 60,
            fee_bps: 0,
            step_up_threshold_cents: 100_000,
            step_up_secret: String::new(),
            max_receipts_page: 100,
            venue_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub lookback_days: i64,
    /// Slack on both sides of the window start. A key either side places
    /// inside the window is compared using both sides' padded fetch.
    pub window_pad_hours: i64,
    /// Internal entry sources the external provider is expected to report
    pub sources: Vec<String>,
    pub provider_timeout_ms: u64,
    pub retry_attempts: usize,
    pub retry_backoff_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            window_pad_hours: 24,
            sources: vec!["provider".to_string()],
            provider_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance_secs: i64,
    /// Sign the raw body only (no timestamp prefix)
    pub legacy_mode: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            tolerance_secs: 300,
            legacy_mode: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub liquidation_lock_ttl_secs: i64,
    pub reconciliation_lock_ttl_secs: i64,
    pub holds_lock_ttl_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            liquidation_lock_ttl_secs: 120,
            reconciliation_lock_ttl_secs: 900,
            holds_lock_ttl_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml("log_level: debug\n").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.ledger.currency, "USD");
        assert_eq!(config.webhook.tolerance_secs, 300);
        assert_eq!(config.execution.max_receipts_page, 100);
        assert!(config.postgres_url.is_none());
    }

    #[test]
    fn test_config_deserialize() {
        let yaml = r#"
postgres_url: "postgres://localhost/spendguard"
ledger:
  currency: "USDC"
  settlement_model: stablecoin
spend:
  safety_buffer_floor_cents: 1000
  degraded_buffer_bps: 500
liquidation:
  batch_size: 10
  ordering: oldest_first
reconciliation:
  lookback_days: 7
  sources: ["bank", "card"]
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.ledger.settlement_model, SettlementModel::Stablecoin);
        assert_eq!(config.spend.safety_buffer_floor_cents, 1000);
        assert_eq!(config.spend.fresh_max_age_secs, 300);
        assert_eq!(config.liquidation.ordering, LiquidationOrdering::OldestFirst);
        assert_eq!(config.liquidation.max_attempts, 3);
        assert_eq!(config.reconciliation.sources, vec!["bank", "card"]);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::load("does-not-exist"),
            Err(ConfigError::Io { .. })
        ));
    }
}
