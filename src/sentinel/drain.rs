//! Drain Orchestrator
//!
//! Sweeps a deposit address into the fee-deposit account. At most one drain
//! runs per `(symbol, address)`; a request arriving while one is in flight
//! is dropped.

use async_trait::async_trait;
use num_bigint::BigUint;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::amount::{display_amount, try_scale_amount};
use super::assets::{Asset, AssetRegistry};
use super::chain::{BlockTag, ChainClient, to_checksum_address};
use super::error::{DrainError, StoreError};
use super::store::{LockStore, LockToken};

/// Transfer handed to the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainTransfer {
    pub symbol: String,
    /// Token contract, `None` for the native coin
    pub contract: Option<String>,
    pub from: String,
    pub to: String,
    pub raw_amount: BigUint,
    /// `None` when the raw amount does not fit a `Decimal`
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Executed { transfer: DrainTransfer, txid: String },
    /// Another drain for the pair is in flight
    Skipped,
    /// Nothing to move
    Empty,
}

/// Signs and broadcasts drain transfers. Gas reservation for native drains
/// is the executor's policy.
#[async_trait]
pub trait DrainExecutor: Send + Sync {
    /// Returns the broadcast transaction id
    async fn execute(&self, transfer: &DrainTransfer) -> Result<String, DrainError>;
}

/// Logs the transfer it would make
pub struct DryRunExecutor;

#[async_trait]
impl DrainExecutor for DryRunExecutor {
    async fn execute(&self, transfer: &DrainTransfer) -> Result<String, DrainError> {
        info!(
            "[dry-run] would move {} {} ({} raw) from {} to {}",
            display_amount(transfer.amount),
            transfer.symbol,
            transfer.raw_amount,
            transfer.from,
            transfer.to
        );
        Ok(format!("dry-run:{}:{}", transfer.symbol, transfer.from))
    }
}

/// Records transfers; optionally slow or failing
#[derive(Default)]
pub struct RecordingExecutor {
    delay: Duration,
    fail: AtomicBool,
    count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    executed: Mutex<Vec<DrainTransfer>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Most transfers ever executing at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn executed(&self) -> Vec<DrainTransfer> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl DrainExecutor for RecordingExecutor {
    async fn execute(&self, transfer: &DrainTransfer) -> Result<String, DrainError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(DrainError::Executor("broadcast rejected".to_string()));
        }

        let n = self.count.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().await.push(transfer.clone());
        Ok(format!("0xdrain{:04}", n))
    }
}

pub fn drain_lock_key(symbol: &str, address: &str) -> String {
    format!("drain:{}:{}", symbol, address)
}

/// Holds a drain lock and keeps its lease alive; releases it when dropped
pub struct DrainLockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    token: LockToken,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl DrainLockGuard {
    /// `None` if the lock is already held
    pub async fn acquire(store: Arc<dyn LockStore>, key: String) -> Result<Option<Self>, StoreError> {
        let Some(token) = store.try_acquire(&key).await? else {
            return Ok(None);
        };
        let renewal = spawn_renewal(store.clone(), key.clone(), token);
        Ok(Some(Self {
            store,
            key,
            token,
            renewal: Some(renewal),
            released: false,
        }))
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        self.store.release(&self.key, self.token).await
    }
}

impl Drop for DrainLockGuard {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        if self.released {
            return;
        }

        // Unwinding or cancelled future: release in the background
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release(&key, token).await {
                        warn!("Failed to release lock {}: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("Lock {} dropped outside a runtime, left to expire", key),
        }
    }
}

/// Renew the lease three times per TTL until aborted or lost
fn spawn_renewal(store: Arc<dyn LockStore>, key: String, token: LockToken) -> JoinHandle<()> {
    let every = (store.lock_ttl() / 3).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.renew(&key, token).await {
                Ok(true) => debug!("Renewed lock {}", key),
                Ok(false) => {
                    warn!("Lock {} was taken over, drain no longer exclusive", key);
                    return;
                }
                Err(e) => warn!("Failed to renew lock {}: {}", key, e),
            }
        }
    })
}

pub struct DrainOrchestrator {
    chain: Arc<dyn ChainClient>,
    assets: Arc<AssetRegistry>,
    locks: Arc<dyn LockStore>,
    executor: Arc<dyn DrainExecutor>,
    fee_deposit_account: String,
}

impl DrainOrchestrator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        assets: Arc<AssetRegistry>,
        locks: Arc<dyn LockStore>,
        executor: Arc<dyn DrainExecutor>,
        fee_deposit_account: String,
    ) -> Self {
        Self {
            chain,
            assets,
            locks,
            executor,
            fee_deposit_account,
        }
    }

    pub async fn drain(&self, symbol: &str, address: &str) -> Result<DrainOutcome, DrainError> {
        if !self.assets.is_known(symbol) {
            error!("Drain requested for unsupported symbol {}", symbol);
            return Err(DrainError::UnsupportedSymbol(symbol.to_string()));
        }
        let address = to_checksum_address(address)?;

        let key = drain_lock_key(symbol, &address);
        let Some(guard) = DrainLockGuard::acquire(self.locks.clone(), key).await? else {
            info!("Drain {} {} already in flight, skipping", symbol, address);
            return Ok(DrainOutcome::Skipped);
        };

        let result = self.drain_locked(symbol, &address).await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release drain lock {} {}: {}", symbol, address, e);
        }

        match &result {
            Ok(DrainOutcome::Executed { transfer, txid }) => info!(
                "Drained {} {} from {} in {}",
                display_amount(transfer.amount),
                symbol,
                address,
                txid
            ),
            Ok(_) => {}
            Err(e) => error!("Drain {} {} failed: {}", symbol, address, e),
        }
        result
    }

    async fn drain_locked(&self, symbol: &str, address: &str) -> Result<DrainOutcome, DrainError> {
        let asset = self.assets.resolve(symbol, self.chain.as_ref()).await?;

        let (raw_amount, contract) = match &asset {
            Asset::Native => (
                self.chain.get_balance(address, BlockTag::Latest).await?,
                None,
            ),
            Asset::Token { contract, .. } => (
                self.chain.token_balance(contract, address).await?,
                Some(contract.clone()),
            ),
        };

        if raw_amount == BigUint::default() {
            info!("{} {} has nothing to drain", symbol, address);
            return Ok(DrainOutcome::Empty);
        }

        let transfer = DrainTransfer {
            symbol: symbol.to_string(),
            contract,
            from: address.to_string(),
            to: self.fee_deposit_account.clone(),
            amount: try_scale_amount(&raw_amount, asset.decimals()),
            raw_amount,
        };
        info!(
            "Draining {} {} from {} to {}",
            display_amount(transfer.amount),
            symbol,
            transfer.from,
            transfer.to
        );

        let txid = self.executor.execute(&transfer).await?;
        Ok(DrainOutcome::Executed { transfer, txid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::mock::{MockChain, sample_config};
    use crate::sentinel::store::MemoryStore;

    const ALICE: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    struct Fixture {
        chain: Arc<MockChain>,
        store: Arc<MemoryStore>,
        executor: Arc<RecordingExecutor>,
        orchestrator: DrainOrchestrator,
    }

    fn fixture(executor: RecordingExecutor) -> Fixture {
        let config = sample_config();
        let chain = Arc::new(MockChain::new());
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(executor);
        let orchestrator = DrainOrchestrator::new(
            chain.clone(),
            Arc::new(AssetRegistry::new(&config)),
            store.clone(),
            executor.clone(),
            config.drain.fee_deposit_account.clone(),
        );
        Fixture {
            chain,
            store,
            executor,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_native_drain_moves_full_balance_to_fee_account() {
        let f = fixture(RecordingExecutor::new());
        f.chain
            .set_balance(ALICE, BigUint::from(1_500_000_000_000_000_000u64));

        let outcome = f.orchestrator.drain("ETH", ALICE).await.unwrap();
        let DrainOutcome::Executed { transfer, .. } = outcome else {
            panic!("expected executed drain, got {:?}", outcome);
        };
        assert_eq!(transfer.amount, Some(Decimal::new(15, 1)));
        assert_eq!(transfer.to, sample_config().drain.fee_deposit_account);
        assert_eq!(transfer.contract, None);
        assert!(!f.store.is_locked(&drain_lock_key("ETH", ALICE)));
    }

    #[tokio::test]
    async fn test_token_drain_scales_with_token_decimals() {
        let f = fixture(RecordingExecutor::new());
        let contract = sample_config().tokens["USDT"].contract_address.clone();
        f.chain
            .set_token_balance(&contract, ALICE, BigUint::from(7_250_000u64));

        let outcome = f
            .orchestrator
            .drain("USDT", &ALICE.to_lowercase())
            .await
            .unwrap();
        assert!(matches!(outcome, DrainOutcome::Executed { .. }));

        let executed = f.executor.executed().await;
        assert_eq!(executed[0].amount, Some(Decimal::new(725, 2)));
        assert_eq!(executed[0].contract.as_deref(), Some(contract.as_str()));
        assert_eq!(executed[0].from, ALICE);
    }

    #[tokio::test]
    async fn test_concurrent_drains_execute_once() {
        let f = fixture(RecordingExecutor::with_delay(Duration::from_millis(50)));
        f.chain.set_balance(ALICE, BigUint::from(10u64).pow(18));

        let (first, second) = tokio::join!(
            f.orchestrator.drain("ETH", ALICE),
            f.orchestrator.drain("ETH", ALICE)
        );
        let outcomes = [first.unwrap(), second.unwrap()];

        assert_eq!(f.executor.count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, DrainOutcome::Skipped))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_token_balance_beyond_decimal_range_still_drains() {
        let f = fixture(RecordingExecutor::new());
        let contract = sample_config().tokens["USDT"].contract_address.clone();
        let huge = BigUint::from(10u64).pow(40);
        f.chain.set_token_balance(&contract, ALICE, huge.clone());

        let outcome = f.orchestrator.drain("USDT", ALICE).await.unwrap();
        let DrainOutcome::Executed { transfer, .. } = outcome else {
            panic!("expected executed drain, got {:?}", outcome);
        };
        assert_eq!(transfer.raw_amount, huge);
        assert_eq!(transfer.amount, None);
    }

    #[tokio::test]
    async fn test_slow_drain_outlives_lock_ttl_without_overlap() {
        let chain = Arc::new(MockChain::new());
        chain.set_balance(ALICE, BigUint::from(10u64).pow(18));
        let config = sample_config();
        let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(100)));
        let orchestrator = Arc::new(DrainOrchestrator::new(
            chain,
            Arc::new(AssetRegistry::new(&config)),
            Arc::new(MemoryStore::with_lock_ttl(Duration::from_millis(30))),
            executor.clone(),
            config.drain.fee_deposit_account.clone(),
        ));

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.drain("ETH", ALICE).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = orchestrator.drain("ETH", ALICE).await.unwrap();
        assert_eq!(second, DrainOutcome::Skipped);

        assert!(matches!(
            first.await.unwrap().unwrap(),
            DrainOutcome::Executed { .. }
        ));
        let third = orchestrator.drain("ETH", ALICE).await.unwrap();
        assert!(matches!(third, DrainOutcome::Executed { .. }));

        assert_eq!(executor.count(), 2);
        assert_eq!(executor.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_zero_balance_is_empty() {
        let f = fixture(RecordingExecutor::new());
        let outcome = f.orchestrator.drain("ETH", ALICE).await.unwrap();
        assert_eq!(outcome, DrainOutcome::Empty);
        assert_eq!(f.executor.count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_symbol_is_rejected() {
        let f = fixture(RecordingExecutor::new());
        let err = f.orchestrator.drain("DOGE", ALICE).await.unwrap_err();
        assert!(matches!(err, DrainError::UnsupportedSymbol(_)));
    }

    #[tokio::test]
    async fn test_lock_released_after_executor_failure() {
        let f = fixture(RecordingExecutor::new());
        f.chain.set_balance(ALICE, BigUint::from(1u8));
        f.executor.set_failing(true);

        assert!(f.orchestrator.drain("ETH", ALICE).await.is_err());
        assert!(!f.store.is_locked(&drain_lock_key("ETH", ALICE)));

        f.executor.set_failing(false);
        assert!(matches!(
            f.orchestrator.drain("ETH", ALICE).await.unwrap(),
            DrainOutcome::Executed { .. }
        ));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lock() {
        let store = Arc::new(MemoryStore::new());
        let key = drain_lock_key("ETH", ALICE);

        let guard = DrainLockGuard::acquire(store.clone(), key.clone())
            .await
            .unwrap()
            .unwrap();
        assert!(store.is_locked(&key));
        drop(guard);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.is_locked(&key));
    }
}
