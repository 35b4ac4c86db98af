//! Symbol resolution: the native coin or one of the configured tokens.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use super::amount::NATIVE_DECIMALS;
use super::chain::ChainClient;
use super::config::{SentinelConfig, TokenConfig};
use super::error::SentinelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asset {
    Native,
    Token { contract: String, decimals: u32 },
}

impl Asset {
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Native => NATIVE_DECIMALS,
            Asset::Token { decimals, .. } => *decimals,
        }
    }
}

pub struct AssetRegistry {
    coin_symbol: String,
    tokens: BTreeMap<String, TokenConfig>,
    /// Decimals read from contracts, per symbol
    decimals_cache: DashMap<String, u32>,
}

impl AssetRegistry {
    pub fn new(config: &SentinelConfig) -> Self {
        Self {
            coin_symbol: config.chain.coin_symbol.clone(),
            tokens: config.tokens.clone(),
            decimals_cache: DashMap::new(),
        }
    }

    pub fn coin_symbol(&self) -> &str {
        &self.coin_symbol
    }

    pub fn token_symbols(&self) -> impl Iterator<Item = &String> {
        self.tokens.keys()
    }

    pub fn token_contracts(&self) -> HashSet<String> {
        self.tokens
            .values()
            .map(|t| t.contract_address.clone())
            .collect()
    }

    pub fn is_known(&self, symbol: &str) -> bool {
        symbol == self.coin_symbol || self.tokens.contains_key(symbol)
    }

    /// Resolve `symbol`; token decimals missing from config are read once
    /// from the contract.
    pub async fn resolve(
        &self,
        symbol: &str,
        chain: &dyn ChainClient,
    ) -> Result<Asset, SentinelError> {
        if symbol == self.coin_symbol {
            return Ok(Asset::Native);
        }

        let token = self
            .tokens
            .get(symbol)
            .ok_or_else(|| SentinelError::UnknownSymbol(symbol.to_string()))?;

        let decimals = match token.decimals {
            Some(decimals) => decimals,
            None => match self.decimals_cache.get(symbol) {
                Some(cached) => *cached,
                None => {
                    let decimals = chain.token_decimals(&token.contract_address).await?;
                    info!("{} decimals read from contract: {}", symbol, decimals);
                    self.decimals_cache.insert(symbol.to_string(), decimals);
                    decimals
                }
            },
        };

        Ok(Asset::Token {
            contract: token.contract_address.clone(),
            decimals,
        })
    }
}
