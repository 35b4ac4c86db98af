use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::db::PoolConfig;
use crate::sentinel::SentinelConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// PostgreSQL URL for cursor, outbox, locks and the address registry.
    /// Without it the service runs on in-memory stores.
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub postgres_pool: PoolConfig,
    pub sentinel: SentinelConfig,
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config: {}", config_path))
    }

    /// Parse, apply environment overrides and validate
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: AppConfig =
            serde_yaml::from_str(content).context("Failed to parse config yaml")?;
        config.apply_env_overrides();
        config.sentinel.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL")
            && !url.is_empty()
        {
            self.postgres_url = Some(url);
        }
        if let Ok(key) = std::env::var("NOTIFY_API_KEY")
            && !key.is_empty()
        {
            self.sentinel.notify.api_key = key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: &str = r#"
log_level: "info"
log_dir: "./logs"
log_file: "sentinel.log"
use_json: false
rotation: "daily"
enable_tracing: true
sentinel:
  service:
    poll_interval_ms: 5000
    reconcile_interval_secs: 600
  chain:
    rpc_url: "http://127.0.0.1:8545"
    coin_symbol: "ETH"
  scanning:
    batch_size: 10
  min_transfer_threshold: "0.01"
  notify:
    base_url: "http://ledger:5000/api/v1"
  drain:
    fee_deposit_account: "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"
"#;

    #[test]
    fn test_app_config_parses_and_validates() {
        let config = AppConfig::from_yaml(DEV).unwrap();
        assert_eq!(config.rotation, "daily");
        assert_eq!(config.sentinel.scanning.batch_size, 10);
        assert_eq!(
            config.sentinel.drain.fee_deposit_account,
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
        assert!(config.sentinel.tokens.is_empty());
    }

    #[test]
    fn test_invalid_fee_account_rejected() {
        let broken = DEV.replace("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed", "0x1234");
        assert!(AppConfig::from_yaml(&broken).is_err());
    }

    #[test]
    fn test_repo_dev_config_loads() {
        let content = fs::read_to_string("config/dev.yaml").unwrap();
        let config: AppConfig = serde_yaml::from_str(&content).unwrap();
        assert_eq!(config.sentinel.chain.coin_symbol, "ETH");
        assert!(config.sentinel.tokens.contains_key("USDT"));
    }
}
