//! Address Registry
//!
//! The registry owns the managed addresses; the sentinel only reads them
//! (and refreshes the cached balance column).

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::debug;

use super::chain::to_checksum_address;
use super::error::{SentinelError, StoreError};
use super::matcher::AddressMatcher;
use crate::db::SafeRow;

/// A managed address labeled with the pool (currency symbol) it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedAddress {
    /// Checksummed
    pub address: String,
    pub symbol: String,
}

#[async_trait]
pub trait AddressRegistry: Send + Sync {
    /// Native and token pools unioned
    async fn all_tracked(&self) -> Result<Vec<TrackedAddress>, StoreError>;

    async fn update_cached_balance(
        &self,
        address: &str,
        symbol: &str,
        amount: Decimal,
    ) -> Result<(), StoreError>;
}

/// Snapshot of the tracked set used for one classification pass
pub struct TrackedSet {
    addresses: HashSet<String>,
    matcher: AddressMatcher,
}

impl TrackedSet {
    pub fn new(entries: &[TrackedAddress]) -> Result<Self, SentinelError> {
        let addresses: HashSet<String> = entries
            .iter()
            .map(|entry| to_checksum_address(&entry.address))
            .collect::<Result<_, _>>()?;
        let matcher = AddressMatcher::new(&addresses)?;

        Ok(Self { addresses, matcher })
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    pub fn contains_opt(&self, address: Option<&str>) -> bool {
        address.is_some_and(|a| self.contains(a))
    }

    pub fn matcher(&self) -> &AddressMatcher {
        &self.matcher
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.addresses.iter()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Registry backed by the `accounts` table of the control plane
pub struct PgAddressRegistry {
    pool: PgPool,
}

impl PgAddressRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AddressRegistry for PgAddressRegistry {
    async fn all_tracked(&self) -> Result<Vec<TrackedAddress>, StoreError> {
        let rows = sqlx::query("SELECT address, crypto FROM accounts")
            .fetch_all(&self.pool)
            .await?;

        let tracked: Vec<TrackedAddress> = rows
            .iter()
            .filter_map(|row| {
                let address: String = row.try_get_log("address")?;
                let symbol: String = row.try_get_log("crypto")?;
                Some(TrackedAddress { address, symbol })
            })
            .collect();

        debug!("Loaded {} tracked addresses", tracked.len());
        Ok(tracked)
    }

    async fn update_cached_balance(
        &self,
        address: &str,
        symbol: &str,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET amount = $1 WHERE address = $2 AND crypto = $3")
            .bind(amount)
            .bind(address)
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory registry for tests and database-less runs
#[derive(Default)]
pub struct MemoryRegistry {
    /// (address, symbol) -> cached balance
    accounts: DashMap<(String, String), Decimal>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: &str, symbol: &str) {
        self.accounts
            .insert((address.to_string(), symbol.to_string()), Decimal::ZERO);
    }

    pub fn cached_balance(&self, address: &str, symbol: &str) -> Option<Decimal> {
        self.accounts
            .get(&(address.to_string(), symbol.to_string()))
            .map(|entry| *entry)
    }
}

#[async_trait]
impl AddressRegistry for MemoryRegistry {
    async fn all_tracked(&self) -> Result<Vec<TrackedAddress>, StoreError> {
        Ok(self
            .accounts
            .iter()
            .map(|entry| TrackedAddress {
                address: entry.key().0.clone(),
                symbol: entry.key().1.clone(),
            })
            .collect())
    }

    async fn update_cached_balance(
        &self,
        address: &str,
        symbol: &str,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        if let Some(mut entry) = self
            .accounts
            .get_mut(&(address.to_string(), symbol.to_string()))
        {
            *entry = amount;
        }
        Ok(())
    }
}
