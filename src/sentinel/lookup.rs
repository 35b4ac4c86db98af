//! On-demand classification of a single transaction.
//!
//! Runs the same classification the block scanner runs, scoped to one
//! transaction, so both paths agree on what a transaction means for the
//! tracked set.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use super::assets::{Asset, AssetRegistry};
use super::chain::ChainClient;
use super::classifier::{
    ClassifiedEvent, classify_native, classify_transfer, detect_internal, resolve_internal,
};
use super::error::SentinelError;
use super::registry::{AddressRegistry, TrackedSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LookupOutcome {
    Related { events: Vec<ClassifiedEvent> },
    /// Tracked addresses occur in the call input but attribution was
    /// dropped (ambiguous, directly transferred, or no balance increase)
    Unattributed { matched: Vec<String> },
    NotRelated,
}

pub struct TransactionLookup {
    chain: Arc<dyn ChainClient>,
    registry: Arc<dyn AddressRegistry>,
    assets: Arc<AssetRegistry>,
}

impl TransactionLookup {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        registry: Arc<dyn AddressRegistry>,
        assets: Arc<AssetRegistry>,
    ) -> Self {
        Self {
            chain,
            registry,
            assets,
        }
    }

    pub async fn lookup(&self, symbol: &str, tx_hash: &str) -> Result<LookupOutcome, SentinelError> {
        let asset = match self.assets.resolve(symbol, self.chain.as_ref()).await {
            Ok(asset) => asset,
            Err(e) => {
                error!("Lookup of {} rejected: {}", tx_hash, e);
                return Err(e);
            }
        };

        let tracked = TrackedSet::new(&self.registry.all_tracked().await?)?;
        let head = self.chain.head_block_number().await?;

        match asset {
            Asset::Native => self.lookup_native(symbol, tx_hash, &tracked, head).await,
            Asset::Token { contract, decimals } => {
                let logs = self.chain.transaction_transfers(&contract, tx_hash).await?;
                let mut events = Vec::new();
                for log in &logs {
                    if let Some(event) = classify_transfer(log, &tracked, head, symbol, decimals) {
                        events.push(event);
                    }
                }

                if events.is_empty() {
                    Ok(LookupOutcome::NotRelated)
                } else {
                    Ok(LookupOutcome::Related { events })
                }
            }
        }
    }

    async fn lookup_native(
        &self,
        symbol: &str,
        tx_hash: &str,
        tracked: &TrackedSet,
        head: u64,
    ) -> Result<LookupOutcome, SentinelError> {
        let tx = self.chain.get_transaction(tx_hash).await?;
        if let Some(event) = classify_native(&tx, tracked, head, symbol) {
            return Ok(LookupOutcome::Related {
                events: vec![event],
            });
        }

        debug!(
            "{} has no direct transfer, checking block {}",
            tx_hash, tx.block_number
        );
        let block = self.chain.get_block(tx.block_number, true).await?;
        let scan = detect_internal(&block, tracked, &self.assets.token_contracts());

        // the node's spelling of the hash, not the caller's
        let matches = scan.matches_for(&tx.hash);
        let events = resolve_internal(self.chain.as_ref(), &matches, head, symbol).await?;
        if !events.is_empty() {
            return Ok(LookupOutcome::Related { events });
        }

        let matched = scan.matched_in(&tx.hash);
        if matched.is_empty() {
            Ok(LookupOutcome::NotRelated)
        } else {
            Ok(LookupOutcome::Unattributed { matched })
        }
    }
}
