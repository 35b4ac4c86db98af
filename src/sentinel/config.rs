use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::chain::to_checksum_address;
use super::error::SentinelError;

/// Main Sentinel service configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SentinelConfig {
    pub service: ServiceConfig,
    pub chain: ChainConfig,
    pub scanning: ScanningConfig,
    /// Native coin balance that authorizes a drain
    pub min_transfer_threshold: Decimal,
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenConfig>,
    pub notify: NotifyConfig,
    pub drain: DrainConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub poll_interval_ms: u64,
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_notify_concurrency")]
    pub notify_concurrency: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
    pub coin_symbol: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScanningConfig {
    pub batch_size: u64,
    #[serde(default = "default_confirmation_lag")]
    pub confirmation_lag: u64,
    #[serde(default = "default_recency_window")]
    pub drain_recency_window: u64,
    /// First block to scan when no cursor is stored
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Refuse to bootstrap a missing cursor from the node head
    #[serde(default)]
    pub cursor_locked: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenConfig {
    pub contract_address: String,
    /// Read from the contract when absent
    #[serde(default)]
    pub decimals: Option<u32>,
    pub min_transfer_threshold: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotifyConfig {
    /// e.g. `http://ledger:5000/api/v1`
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_transport_backoff")]
    pub transport_backoff_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DrainConfig {
    pub fee_deposit_account: String,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_notify_concurrency() -> usize {
    4
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_confirmation_lag() -> u64 {
    2
}

fn default_recency_window() -> u64 {
    40
}

fn default_auth_header() -> String {
    "X-Shkeeper-Backend-Key".to_string()
}

fn default_retry_backoff() -> u64 {
    5_000
}

fn default_transport_backoff() -> u64 {
    10_000
}

fn default_lock_ttl() -> u64 {
    600
}

impl SentinelConfig {
    /// Normalize addresses to checksum form and reject settings the
    /// scanner cannot run with.
    pub fn validate(&mut self) -> Result<(), SentinelError> {
        if self.scanning.batch_size == 0 {
            return Err(SentinelError::Config(
                "scanning.batch_size must be positive".to_string(),
            ));
        }

        self.drain.fee_deposit_account = to_checksum_address(&self.drain.fee_deposit_account)
            .map_err(|e| SentinelError::Config(format!("drain.fee_deposit_account: {}", e)))?;

        for (symbol, token) in self.tokens.iter_mut() {
            if symbol == &self.chain.coin_symbol {
                return Err(SentinelError::Config(format!(
                    "token {} collides with the coin symbol",
                    symbol
                )));
            }
            token.contract_address = to_checksum_address(&token.contract_address)
                .map_err(|e| SentinelError::Config(format!("tokens.{}: {}", symbol, e)))?;
            if let Some(decimals) = token.decimals
                && decimals > 28
            {
                return Err(SentinelError::Config(format!(
                    "tokens.{}: decimals {} out of range",
                    symbol, decimals
                )));
            }
        }

        Ok(())
    }

    /// Threshold for `symbol`, `None` when the symbol is not configured
    pub fn threshold(&self, symbol: &str) -> Option<Decimal> {
        if symbol == self.chain.coin_symbol {
            return Some(self.min_transfer_threshold);
        }
        self.tokens.get(symbol).map(|t| t.min_transfer_threshold)
    }
}
