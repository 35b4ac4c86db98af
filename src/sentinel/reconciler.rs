//! Balance Reconciler
//!
//! Periodically re-reads every tracked balance from the chain, refreshes the
//! registry's cached balance and requests drains for balances at or above
//! the configured threshold.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::amount::{scale_amount, wei_to_native};
use super::assets::{Asset, AssetRegistry};
use super::chain::{BlockTag, ChainClient, to_checksum_address};
use super::config::SentinelConfig;
use super::error::SentinelError;
use super::registry::AddressRegistry;
use super::scheduler::{Job, JobScheduler};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub addresses: usize,
    pub drains_requested: usize,
    pub failures: usize,
}

pub struct BalanceReconciler {
    chain: Arc<dyn ChainClient>,
    registry: Arc<dyn AddressRegistry>,
    assets: Arc<AssetRegistry>,
    scheduler: Arc<dyn JobScheduler>,
    native_threshold: Decimal,
    token_thresholds: BTreeMap<String, Decimal>,
}

impl BalanceReconciler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        registry: Arc<dyn AddressRegistry>,
        assets: Arc<AssetRegistry>,
        scheduler: Arc<dyn JobScheduler>,
        config: &SentinelConfig,
    ) -> Self {
        Self {
            chain,
            registry,
            assets,
            scheduler,
            native_threshold: config.min_transfer_threshold,
            token_thresholds: config
                .tokens
                .iter()
                .map(|(symbol, token)| (symbol.clone(), token.min_transfer_threshold))
                .collect(),
        }
    }

    pub async fn refresh(&self) -> Result<ReconcileReport, SentinelError> {
        let tracked = self.registry.all_tracked().await?;

        // checksummed address -> (symbol -> address as stored by the registry)
        let mut addresses: BTreeMap<String, HashMap<String, String>> = BTreeMap::new();
        for entry in tracked {
            match to_checksum_address(&entry.address) {
                Ok(checksummed) => {
                    addresses
                        .entry(checksummed)
                        .or_default()
                        .insert(entry.symbol, entry.address);
                }
                Err(e) => warn!("Skipping malformed registry address: {}", e),
            }
        }

        let mut report = ReconcileReport {
            addresses: addresses.len(),
            ..Default::default()
        };

        for (address, rows) in &addresses {
            match self.refresh_address(address, rows).await {
                Ok(requested) => report.drains_requested += requested,
                Err(e) => {
                    warn!("Balance refresh for {} failed: {}", address, e);
                    report.failures += 1;
                }
            }
        }

        info!(
            "Reconciled {} addresses: {} drains requested, {} failures",
            report.addresses, report.drains_requested, report.failures
        );
        Ok(report)
    }

    /// Returns the number of drains requested for `address`
    async fn refresh_address(
        &self,
        address: &str,
        rows: &HashMap<String, String>,
    ) -> Result<usize, SentinelError> {
        let coin = self.assets.coin_symbol();
        let native_raw = self.chain.get_balance(address, BlockTag::Latest).await?;
        let native = wei_to_native(&native_raw)?;
        self.update_cache(address, rows, coin, native).await?;

        let mut requested = 0;
        for (symbol, threshold) in &self.token_thresholds {
            let Asset::Token { contract, decimals } =
                self.assets.resolve(symbol, self.chain.as_ref()).await?
            else {
                continue;
            };
            let raw = self.chain.token_balance(&contract, address).await?;
            let balance = scale_amount(&raw, decimals)?;
            self.update_cache(address, rows, symbol, balance).await?;

            if crosses(balance, *threshold) {
                self.request_drain(symbol, address).await?;
                requested += 1;
            }
        }

        // Native only when no token sweep is pending; token drains spend gas
        if requested == 0 && crosses(native, self.native_threshold) {
            self.request_drain(coin, address).await?;
            requested += 1;
        }

        Ok(requested)
    }

    async fn update_cache(
        &self,
        address: &str,
        rows: &HashMap<String, String>,
        symbol: &str,
        balance: Decimal,
    ) -> Result<(), SentinelError> {
        let stored = rows.get(symbol).map(String::as_str).unwrap_or(address);
        self.registry
            .update_cached_balance(stored, symbol, balance)
            .await?;
        Ok(())
    }

    async fn request_drain(&self, symbol: &str, address: &str) -> Result<(), SentinelError> {
        debug!("Requesting drain {} {}", symbol, address);
        self.scheduler
            .enqueue(Job::Drain {
                symbol: symbol.to_string(),
                address: address.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Balance at or above a threshold, and non-zero
fn crosses(balance: Decimal, threshold: Decimal) -> bool {
    balance > Decimal::ZERO && balance >= threshold
}
