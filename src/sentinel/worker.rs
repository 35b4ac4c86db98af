//! Block Scanner - Main scanning loop
//!
//! Walks the chain behind a fixed confirmation lag in whole batches,
//! classifies native and token activity for the tracked set, durably
//! enqueues notifications and requests drains, then advances the cursor.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::amount::display_amount;
use super::assets::{Asset, AssetRegistry};
use super::chain::{Block, ChainClient, fetch_block_range};
use super::classifier::{
    Category, ClassifiedEvent, classify_native, classify_transfer, detect_internal,
    resolve_internal,
};
use super::config::ScanningConfig;
use super::error::{ChainError, SentinelError};
use super::registry::{AddressRegistry, TrackedSet};
use super::scheduler::{Job, JobScheduler};
use super::shutdown::ShutdownSignal;
use super::store::{CursorStore, OutboxStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStatus {
    pub last_block: Option<u64>,
    pub last_block_timestamp: Option<u64>,
    pub head: u64,
}

/// What one scan cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The registry is empty
    WaitingForAddresses,
    /// Fewer than one whole batch is behind the confirmation lag
    Idle { cursor: u64, head: u64 },
    Scanned { batches: u64, cursor: u64 },
}

/// Per-batch bookkeeping shared by the native and token passes
#[derive(Default)]
struct BatchState {
    /// (symbol, tx hash) already enqueued in this batch
    notified: HashSet<(String, String)>,
    /// (symbol, address) already sent to the drain queue in this batch
    drains: HashSet<(String, String)>,
    events: usize,
}

pub struct BlockScanner {
    chain: Arc<dyn ChainClient>,
    registry: Arc<dyn AddressRegistry>,
    assets: Arc<AssetRegistry>,
    cursor: Arc<dyn CursorStore>,
    outbox: Arc<dyn OutboxStore>,
    scheduler: Arc<dyn JobScheduler>,
    scanning: ScanningConfig,
    poll_interval: Duration,
    shutdown: Arc<ShutdownSignal>,
}

impl BlockScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        registry: Arc<dyn AddressRegistry>,
        assets: Arc<AssetRegistry>,
        cursor: Arc<dyn CursorStore>,
        outbox: Arc<dyn OutboxStore>,
        scheduler: Arc<dyn JobScheduler>,
        scanning: ScanningConfig,
        poll_interval: Duration,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            chain,
            registry,
            assets,
            cursor,
            outbox,
            scheduler,
            scanning,
            poll_interval,
            shutdown,
        }
    }

    /// Run the main scanning loop until shutdown
    pub async fn run(&self) {
        info!(
            "Block scanner starting: batch {}, lag {}, poll interval {:?}",
            self.scanning.batch_size, self.scanning.confirmation_lag, self.poll_interval
        );

        while !self.shutdown.is_shutdown_requested() {
            match self.scan_once().await {
                Ok(CycleOutcome::Scanned { batches, cursor }) => {
                    debug!("Cycle done: {} batches, cursor {}", batches, cursor)
                }
                Ok(_) => {}
                Err(SentinelError::Invariant(msg)) => {
                    error!("Invariant violation, scan cycle stopped: {}", msg)
                }
                Err(e) if e.is_config() => error!("Scanner configuration error: {}", e),
                Err(e) => warn!("Scan cycle failed, will retry: {}", e),
            }

            if !self.shutdown.sleep(self.poll_interval).await {
                break;
            }
        }

        info!("Block scanner stopped");
    }

    /// Run one cycle: fetch head, scan every whole batch behind the lag
    pub async fn scan_once(&self) -> Result<CycleOutcome, SentinelError> {
        let entries = self.registry.all_tracked().await?;
        if entries.is_empty() {
            info!("No tracked addresses yet, waiting");
            return Ok(CycleOutcome::WaitingForAddresses);
        }

        let head = self.chain.head_block_number().await?;
        let mut cursor = self.load_or_bootstrap_cursor(head).await?;

        if cursor > head {
            return Err(SentinelError::Invariant(format!(
                "cursor {} is ahead of chain head {}",
                cursor, head
            )));
        }

        let safe_head = head.saturating_sub(self.scanning.confirmation_lag);
        let batch_size = self.scanning.batch_size;
        let batches = safe_head.saturating_sub(cursor) / batch_size;
        if batches == 0 {
            debug!(
                "Waiting for blocks: cursor {}, head {}, lag {}",
                cursor, head, self.scanning.confirmation_lag
            );
            return Ok(CycleOutcome::Idle { cursor, head });
        }

        let tracked = TrackedSet::new(&entries)?;
        let token_contracts = self.assets.token_contracts();

        let mut done = 0;
        for _ in 0..batches {
            if self.shutdown.is_shutdown_requested() {
                break;
            }

            let start = cursor + 1;
            let end = cursor + batch_size;
            let started = Instant::now();

            let events = self
                .process_batch(start, end, head, &tracked, &token_contracts)
                .await?;
            self.cursor.save_cursor(end).await?;
            cursor = end;
            done += 1;

            info!(
                "Scanned blocks {}-{}: {} events in {:?}",
                start,
                end,
                events,
                started.elapsed()
            );
        }

        Ok(CycleOutcome::Scanned {
            batches: done,
            cursor,
        })
    }

    async fn load_or_bootstrap_cursor(&self, head: u64) -> Result<u64, SentinelError> {
        if let Some(cursor) = self.cursor.load_cursor().await? {
            return Ok(cursor);
        }

        // the cursor is the last block scanned, so start_block itself is included
        let initial = match self.scanning.start_block {
            Some(start) => start.saturating_sub(1),
            None if self.scanning.cursor_locked => {
                return Err(SentinelError::Config(
                    "no stored cursor and cursor_locked forbids starting from head".to_string(),
                ));
            }
            None => head,
        };

        info!("No stored cursor, starting after block {}", initial);
        self.cursor.save_cursor(initial).await?;
        Ok(initial)
    }

    /// Classify `[start, end]`; returns the number of distinct events enqueued
    async fn process_batch(
        &self,
        start: u64,
        end: u64,
        head: u64,
        tracked: &TrackedSet,
        token_contracts: &HashSet<String>,
    ) -> Result<usize, SentinelError> {
        let blocks = fetch_block_range(self.chain.as_ref(), start, end)
            .await
            .map_err(|e| match e {
                ChainError::BatchLength { expected, actual } => SentinelError::Invariant(format!(
                    "block batch {}-{} returned {} of {} blocks",
                    start, end, actual, expected
                )),
                other => SentinelError::Chain(other),
            })?;

        let mut state = BatchState::default();
        let coin = self.assets.coin_symbol().to_string();

        for block in &blocks {
            self.native_pass(block, head, &coin, tracked, token_contracts, &mut state)
                .await?;
        }

        for symbol in self.assets.token_symbols() {
            let Asset::Token { contract, decimals } =
                self.assets.resolve(symbol, self.chain.as_ref()).await?
            else {
                continue;
            };

            let logs = self.chain.transfer_logs(&contract, start, end).await?;
            for log in &logs {
                if let Some(event) = classify_transfer(log, tracked, head, symbol, decimals) {
                    self.record(event, log.block_number, head, &mut state).await?;
                }
            }
        }

        Ok(state.events)
    }

    async fn native_pass(
        &self,
        block: &Block,
        head: u64,
        coin: &str,
        tracked: &TrackedSet,
        token_contracts: &HashSet<String>,
        state: &mut BatchState,
    ) -> Result<(), SentinelError> {
        for tx in &block.transactions {
            if let Some(event) = classify_native(tx, tracked, head, coin) {
                self.record(event, block.number, head, state).await?;
            }
        }

        let scan = detect_internal(block, tracked, token_contracts);
        if scan.matches.is_empty() {
            return Ok(());
        }

        for event in resolve_internal(self.chain.as_ref(), &scan.matches, head, coin).await? {
            self.record(event, block.number, head, state).await?;
        }
        Ok(())
    }

    /// Enqueue the notification and, for fresh deposits, a drain
    async fn record(
        &self,
        event: ClassifiedEvent,
        block_number: u64,
        head: u64,
        state: &mut BatchState,
    ) -> Result<(), SentinelError> {
        if state
            .notified
            .insert((event.symbol.clone(), event.tx_hash.clone()))
        {
            info!(
                "new transaction {} {} {:?} {} {} ({} confirmations)",
                event.symbol,
                event.tx_hash,
                event.category,
                event.address,
                display_amount(event.amount),
                event.confirmations
            );
            self.outbox.enqueue(&event.symbol, &event.tx_hash).await?;
            state.events += 1;
        }

        let recent = head.saturating_sub(block_number) < self.scanning.drain_recency_window;
        if event.category == Category::Receive
            && recent
            && state
                .drains
                .insert((event.symbol.clone(), event.address.clone()))
        {
            debug!("Requesting drain {} {}", event.symbol, event.address);
            self.scheduler
                .enqueue(Job::Drain {
                    symbol: event.symbol,
                    address: event.address,
                })
                .await?;
        }
        Ok(())
    }

    /// Cursor, its block timestamp and the node head
    pub async fn status(&self) -> Result<ScanStatus, SentinelError> {
        let head = self.chain.head_block_number().await?;
        let last_block = self.cursor.load_cursor().await?;

        let last_block_timestamp = match last_block {
            Some(number) if number <= head => {
                Some(self.chain.get_block(number, false).await?.timestamp)
            }
            _ => None,
        };

        Ok(ScanStatus {
            last_block,
            last_block_timestamp,
            head,
        })
    }
}
