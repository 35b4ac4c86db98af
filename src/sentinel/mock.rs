//! In-memory collaborators for tests and offline runs.

use async_trait::async_trait;
use dashmap::DashMap;
use num_bigint::BigUint;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::chain::{
    Block, BlockTag, ChainClient, ChainTransaction, RpcRequest, RpcResponse, TransferLog,
};
use super::config::SentinelConfig;
use super::error::{ChainError, NotifyError};
use super::notifier::NotifyTransport;

/// Mock EVM chain with call counters
#[derive(Default)]
pub struct MockChain {
    head: AtomicU64,
    blocks: DashMap<u64, Block>,
    transactions: DashMap<String, ChainTransaction>,
    pending: DashMap<String, ()>,
    /// (address, block) -> balance
    historical_balances: DashMap<(String, u64), BigUint>,
    latest_balances: DashMap<String, BigUint>,
    /// (contract, address) -> raw balance
    token_balances: DashMap<(String, String), BigUint>,
    decimals: DashMap<String, u32>,
    logs: DashMap<String, Vec<TransferLog>>,
    /// (contract, from, to) of every `transfer_logs` call
    log_queries: Mutex<Vec<(String, u64, u64)>>,
    /// Drop the last response of every block batch
    short_batches: AtomicBool,
    batch_calls: AtomicUsize,
    decimals_calls: AtomicUsize,
    /// Block number -> times fetched
    fetched: DashMap<u64, usize>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Empty blocks for every number in `[start, end]` not already present
    pub fn fill_blocks(&self, start: u64, end: u64) {
        for number in start..=end {
            self.blocks.entry(number).or_insert_with(|| Block {
                number,
                hash: format!("0x{:064x}", number),
                timestamp: 1_700_000_000 + number * 12,
                transactions: Vec::new(),
            });
        }
    }

    pub fn add_transaction(&self, tx: ChainTransaction) {
        self.fill_blocks(tx.block_number, tx.block_number);
        if let Some(mut block) = self.blocks.get_mut(&tx.block_number) {
            block.transactions.push(tx.clone());
        }
        // nodes match transaction hashes case-insensitively
        self.transactions.insert(tx.hash.to_lowercase(), tx);
    }

    pub fn add_pending_transaction(&self, hash: &str) {
        self.pending.insert(hash.to_lowercase(), ());
    }

    pub fn set_balance_at(&self, address: &str, block: u64, balance: BigUint) {
        self.historical_balances
            .insert((address.to_string(), block), balance);
    }

    pub fn set_balance(&self, address: &str, balance: BigUint) {
        self.latest_balances.insert(address.to_string(), balance);
    }

    pub fn set_token_balance(&self, contract: &str, address: &str, balance: BigUint) {
        self.token_balances
            .insert((contract.to_string(), address.to_string()), balance);
    }

    pub fn set_token_decimals(&self, contract: &str, decimals: u32) {
        self.decimals.insert(contract.to_string(), decimals);
    }

    pub fn add_transfer_log(&self, contract: &str, log: TransferLog) {
        self.fill_blocks(log.block_number, log.block_number);
        self.logs.entry(contract.to_string()).or_default().push(log);
    }

    pub fn set_short_batches(&self, enabled: bool) {
        self.short_batches.store(enabled, Ordering::SeqCst);
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn decimals_calls(&self) -> usize {
        self.decimals_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self, number: u64) -> usize {
        self.fetched.get(&number).map(|c| *c).unwrap_or(0)
    }

    pub fn max_fetched_block(&self) -> Option<u64> {
        self.fetched.iter().map(|e| *e.key()).max()
    }

    pub async fn log_queries(&self) -> Vec<(String, u64, u64)> {
        self.log_queries.lock().await.clone()
    }

    fn block(&self, number: u64, include_txs: bool) -> Result<Block, ChainError> {
        let mut block = self
            .blocks
            .get(&number)
            .map(|b| b.value().clone())
            .ok_or_else(|| ChainError::NotFound(format!("block {}", number)))?;
        if !include_txs {
            block.transactions.clear();
        }
        *self.fetched.entry(number).or_insert(0) += 1;
        Ok(block)
    }

    fn balance(&self, address: &str, tag: BlockTag) -> BigUint {
        match tag {
            BlockTag::Latest => self.latest_balances.get(address).map(|b| b.value().clone()),
            BlockTag::Number(n) => self
                .historical_balances
                .get(&(address.to_string(), n))
                .map(|b| b.value().clone()),
        }
        .unwrap_or_default()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn head_block_number(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_block(&self, number: u64, include_txs: bool) -> Result<Block, ChainError> {
        self.block(number, include_txs)
    }

    async fn get_transaction(&self, hash: &str) -> Result<ChainTransaction, ChainError> {
        let key = hash.to_lowercase();
        if self.pending.contains_key(&key) {
            return Err(ChainError::Pending(hash.to_string()));
        }
        self.transactions
            .get(&key)
            .map(|tx| tx.value().clone())
            .ok_or_else(|| ChainError::NotFound(hash.to_string()))
    }

    async fn get_balance(&self, address: &str, tag: BlockTag) -> Result<BigUint, ChainError> {
        Ok(self.balance(address, tag))
    }

    async fn batch_execute(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<RpcResponse>, ChainError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);

        let mut responses = Vec::with_capacity(requests.len());
        let mut has_blocks = false;
        for request in requests {
            match request {
                RpcRequest::GetBlock {
                    number,
                    include_txs,
                } => {
                    has_blocks = true;
                    responses.push(RpcResponse::Block(self.block(number, include_txs)?));
                }
                RpcRequest::GetBalance { address, tag } => {
                    responses.push(RpcResponse::Balance(self.balance(&address, tag)));
                }
            }
        }

        if has_blocks && self.short_batches.load(Ordering::SeqCst) {
            responses.pop();
        }
        Ok(responses)
    }

    async fn transfer_logs(
        &self,
        contract: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        self.log_queries
            .lock()
            .await
            .push((contract.to_string(), from_block, to_block));
        Ok(self
            .logs
            .get(contract)
            .map(|logs| {
                logs.iter()
                    .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transaction_transfers(
        &self,
        contract: &str,
        tx_hash: &str,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let logs: Vec<TransferLog> = self
            .logs
            .get(contract)
            .map(|logs| {
                logs.iter()
                    .filter(|l| l.tx_hash.eq_ignore_ascii_case(tx_hash))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if logs.is_empty() && !self.transactions.contains_key(&tx_hash.to_lowercase()) {
            return Err(ChainError::NotFound(tx_hash.to_string()));
        }
        Ok(logs)
    }

    async fn token_balance(&self, contract: &str, address: &str) -> Result<BigUint, ChainError> {
        Ok(self
            .token_balances
            .get(&(contract.to_string(), address.to_string()))
            .map(|b| b.value().clone())
            .unwrap_or_default())
    }

    async fn token_decimals(&self, contract: &str) -> Result<u32, ChainError> {
        self.decimals_calls.fetch_add(1, Ordering::SeqCst);
        self.decimals
            .get(contract)
            .map(|d| *d)
            .ok_or_else(|| ChainError::NotFound(format!("decimals of {}", contract)))
    }
}

/// One scripted notification reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Json(Value),
    TransportError(String),
}

/// Notification transport replaying scripted replies, then `success`
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<(String, Option<Value>)>>,
    call_count: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub async fn calls(&self) -> Vec<(String, Option<Value>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl NotifyTransport for ScriptedTransport {
    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value, NotifyError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .await
            .push((path.to_string(), body.cloned()));

        match self.replies.lock().await.pop_front() {
            Some(ScriptedReply::Json(value)) => Ok(value),
            Some(ScriptedReply::TransportError(message)) => Err(NotifyError::Transport(message)),
            None => Ok(json!({ "status": "success" })),
        }
    }
}

/// Plain value transfer (empty input)
pub fn native_tx(
    hash: &str,
    from: &str,
    to: Option<&str>,
    value: BigUint,
    block_number: u64,
) -> ChainTransaction {
    ChainTransaction {
        hash: hash.to_string(),
        from: from.to_string(),
        to: to.map(str::to_string),
        value,
        input: Vec::new(),
        block_number,
    }
}

/// ABI-style call input: a selector followed by one padded word per address
pub fn call_input(addresses: &[&str]) -> Vec<u8> {
    let mut input = vec![0x12, 0x34, 0x56, 0x78];
    for address in addresses {
        input.extend_from_slice(&[0u8; 12]);
        input.extend(hex::decode(address.trim_start_matches("0x")).unwrap_or_default());
    }
    input
}

/// Validated configuration: ETH plus USDT (6 decimals), millisecond backoffs
pub fn sample_config() -> SentinelConfig {
    const SAMPLE: &str = r#"
service:
  poll_interval_ms: 10
  reconcile_interval_secs: 600
  worker_concurrency: 4
  notify_concurrency: 2
chain:
  rpc_url: "http://127.0.0.1:8545"
  coin_symbol: "ETH"
scanning:
  batch_size: 5
  confirmation_lag: 0
  start_block: 100
min_transfer_threshold: "1"
tokens:
  USDT:
    contract_address: "0xdac17f958d2ee523a2206206994597c13d831ec7"
    decimals: 6
    min_transfer_threshold: "5"
notify:
  base_url: "http://ledger.test/api/v1"
  api_key: "secret"
  retry_backoff_ms: 10
  transport_backoff_ms: 10
drain:
  fee_deposit_account: "0x27b1fdb04752bbc536007a920d24acb045561c26"
"#;

    let mut config: SentinelConfig = match serde_yaml::from_str(SAMPLE) {
        Ok(config) => config,
        Err(e) => panic!("sample config does not parse: {}", e),
    };
    if let Err(e) = config.validate() {
        panic!("sample config is invalid: {}", e);
    }
    config
}
