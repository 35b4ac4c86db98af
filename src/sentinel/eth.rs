//! EVM JSON-RPC client
//!
//! Implements [`ChainClient`] against a Geth/Anvil-compatible node over
//! HTTP. Batched requests go out as one JSON-RPC array.

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use super::amount::{parse_big_quantity, parse_quantity, to_quantity};
use super::chain::{
    Block, BlockTag, ChainClient, ChainTransaction, RpcRequest, RpcResponse, TransferLog,
    address_fragment, to_checksum_address,
};
use super::config::ChainConfig;
use super::error::ChainError;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// `balanceOf(address)` selector
const BALANCE_OF_SELECTOR: &str = "0x70a08231";

/// `decimals()` selector
const DECIMALS_SELECTOR: &str = "0x313ce567";

/// Client for an EVM node reachable over JSON-RPC
pub struct EthRpcClient {
    client: reqwest::Client,
    url: String,
}

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
    #[serde(default)]
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// ETH block structure from RPC
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthBlock {
    number: String,
    hash: String,
    timestamp: String,
    #[serde(default)]
    transactions: Vec<Value>,
}

/// ETH transaction structure from RPC
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthTransaction {
    hash: String,
    from: String,
    to: Option<String>,
    value: String,
    #[serde(default)]
    input: String,
    /// `None` while pending
    block_number: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: String,
    transaction_hash: String,
    log_index: String,
}

#[derive(Deserialize, Debug)]
struct EthReceipt {
    logs: Vec<EthLog>,
}

impl EthRpcClient {
    /// Create a new client for `config.rpc_url`
    pub fn new(config: &ChainConfig) -> Result<Self, ChainError> {
        info!("Initializing EVM RPC client at {}", config.rpc_url);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChainError::RpcConnection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.rpc_url.clone(),
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, body: &B) -> Result<R, ChainError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChainError::RpcConnection(format!("HTTP request failed: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| ChainError::RpcConnection(format!("Failed to parse response: {}", e)))
    }

    /// Make a JSON-RPC call whose result may legitimately be `null`
    async fn rpc_call_optional<T, R>(
        &self,
        method: &'static str,
        params: T,
    ) -> Result<Option<R>, ChainError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let rpc_response: JsonRpcResponse<R> = self.post(&request).await?;
        if let Some(error) = rpc_response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(rpc_response.result)
    }

    /// Make a JSON-RPC call
    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<R, ChainError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.rpc_call_optional(method, params)
            .await?
            .ok_or_else(|| ChainError::Parse(format!("No result in {} response", method)))
    }

    async fn call_contract(&self, contract: &str, data: String) -> Result<String, ChainError> {
        self.rpc_call("eth_call", (json!({ "to": contract, "data": data }), "latest"))
            .await
    }
}

fn block_tag(tag: BlockTag) -> String {
    match tag {
        BlockTag::Latest => "latest".to_string(),
        BlockTag::Number(n) => to_quantity(n),
    }
}

fn request_body(request: &RpcRequest, id: u64) -> JsonRpcRequest<Value> {
    match request {
        RpcRequest::GetBlock {
            number,
            include_txs,
        } => JsonRpcRequest {
            jsonrpc: "2.0",
            method: "eth_getBlockByNumber",
            params: json!([to_quantity(*number), include_txs]),
            id,
        },
        RpcRequest::GetBalance { address, tag } => JsonRpcRequest {
            jsonrpc: "2.0",
            method: "eth_getBalance",
            params: json!([address, block_tag(*tag)]),
            id,
        },
    }
}

fn decode_input(input: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(input.trim_start_matches("0x"))
        .map_err(|e| ChainError::Parse(format!("invalid input hex: {}", e)))
}

fn decode_transaction(tx: EthTransaction, fallback_block: Option<u64>) -> Result<ChainTransaction, ChainError> {
    let block_number = match (tx.block_number.as_deref(), fallback_block) {
        (Some(number), _) => parse_quantity(number)?,
        (None, Some(number)) => number,
        (None, None) => return Err(ChainError::Pending(tx.hash)),
    };

    Ok(ChainTransaction {
        from: to_checksum_address(&tx.from)?,
        to: tx.to.as_deref().map(to_checksum_address).transpose()?,
        value: parse_big_quantity(&tx.value)?,
        input: decode_input(&tx.input)?,
        block_number,
        hash: tx.hash,
    })
}

fn decode_block(block: EthBlock) -> Result<Block, ChainError> {
    let number = parse_quantity(&block.number)?;
    let mut transactions = Vec::with_capacity(block.transactions.len());
    for raw in block.transactions {
        // Hash-only bodies when fetched without transactions
        if raw.is_string() {
            continue;
        }
        let tx: EthTransaction = serde_json::from_value(raw)
            .map_err(|e| ChainError::Parse(format!("block {} transaction: {}", number, e)))?;
        transactions.push(decode_transaction(tx, Some(number))?);
    }

    Ok(Block {
        number,
        hash: block.hash,
        timestamp: parse_quantity(&block.timestamp)?,
        transactions,
    })
}

/// Address packed in the low 20 bytes of a 32-byte topic
fn topic_address(topic: &str) -> Result<String, ChainError> {
    let digits = topic.trim_start_matches("0x");
    if digits.len() < 40 {
        return Err(ChainError::Parse(format!("short address topic {}", topic)));
    }
    to_checksum_address(&digits[digits.len() - 40..])
}

fn is_transfer(log: &EthLog) -> bool {
    log.topics.len() == 3 && log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC)
}

fn decode_transfer_log(log: &EthLog) -> Result<TransferLog, ChainError> {
    Ok(TransferLog {
        tx_hash: log.transaction_hash.clone(),
        from: topic_address(&log.topics[1])?,
        to: topic_address(&log.topics[2])?,
        raw_amount: parse_big_quantity(&log.data)?,
        block_number: parse_quantity(&log.block_number)?,
        log_index: parse_quantity(&log.log_index)?,
    })
}

fn balance_of_calldata(address: &str) -> Result<String, ChainError> {
    Ok(format!(
        "{}{:0>64}",
        BALANCE_OF_SELECTOR,
        address_fragment(address)?
    ))
}

/// Pair batch responses back to their requests by id
fn order_batch(
    mut responses: Vec<JsonRpcResponse<Value>>,
) -> Result<Vec<Value>, ChainError> {
    responses.sort_by_key(|r| r.id);
    responses
        .into_iter()
        .map(|r| {
            if let Some(error) = r.error {
                return Err(ChainError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            r.result
                .ok_or_else(|| ChainError::NotFound(format!("batch item {}", r.id)))
        })
        .collect()
}

#[async_trait]
impl ChainClient for EthRpcClient {
    async fn head_block_number(&self) -> Result<u64, ChainError> {
        let result: String = self.rpc_call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    async fn get_block(&self, number: u64, include_txs: bool) -> Result<Block, ChainError> {
        let block: Option<EthBlock> = self
            .rpc_call_optional("eth_getBlockByNumber", (to_quantity(number), include_txs))
            .await?;
        decode_block(block.ok_or_else(|| ChainError::NotFound(format!("block {}", number)))?)
    }

    async fn get_transaction(&self, hash: &str) -> Result<ChainTransaction, ChainError> {
        let tx: Option<EthTransaction> = self
            .rpc_call_optional("eth_getTransactionByHash", [hash])
            .await?;
        decode_transaction(tx.ok_or_else(|| ChainError::NotFound(hash.to_string()))?, None)
    }

    async fn get_balance(&self, address: &str, tag: BlockTag) -> Result<BigUint, ChainError> {
        let result: String = self
            .rpc_call("eth_getBalance", (address, block_tag(tag)))
            .await?;
        parse_big_quantity(&result)
    }

    async fn batch_execute(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<RpcResponse>, ChainError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let bodies: Vec<JsonRpcRequest<Value>> = requests
            .iter()
            .enumerate()
            .map(|(i, request)| request_body(request, i as u64))
            .collect();

        let responses: Vec<JsonRpcResponse<Value>> = self.post(&bodies).await?;
        debug!("Batch of {} returned {} items", bodies.len(), responses.len());
        let results = order_batch(responses)?;

        requests
            .iter()
            .zip(results)
            .map(|(request, result)| match request {
                RpcRequest::GetBlock { .. } => {
                    let block: EthBlock = serde_json::from_value(result)
                        .map_err(|e| ChainError::Parse(format!("block: {}", e)))?;
                    Ok(RpcResponse::Block(decode_block(block)?))
                }
                RpcRequest::GetBalance { .. } => {
                    let balance = result
                        .as_str()
                        .ok_or_else(|| ChainError::Parse("balance is not a string".to_string()))?;
                    Ok(RpcResponse::Balance(parse_big_quantity(balance)?))
                }
            })
            .collect()
    }

    async fn transfer_logs(
        &self,
        contract: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let filter = json!({
            "address": contract,
            "fromBlock": to_quantity(from_block),
            "toBlock": to_quantity(to_block),
            "topics": [TRANSFER_TOPIC],
        });
        let logs: Vec<EthLog> = self.rpc_call("eth_getLogs", [filter]).await?;

        logs.iter()
            .filter(|log| is_transfer(log))
            .map(decode_transfer_log)
            .collect()
    }

    async fn transaction_transfers(
        &self,
        contract: &str,
        tx_hash: &str,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let receipt: Option<EthReceipt> = self
            .rpc_call_optional("eth_getTransactionReceipt", [tx_hash])
            .await?;
        let receipt = receipt.ok_or_else(|| ChainError::NotFound(tx_hash.to_string()))?;

        receipt
            .logs
            .iter()
            .filter(|log| log.address.eq_ignore_ascii_case(contract) && is_transfer(log))
            .map(decode_transfer_log)
            .collect()
    }

    async fn token_balance(&self, contract: &str, address: &str) -> Result<BigUint, ChainError> {
        let result = self
            .call_contract(contract, balance_of_calldata(address)?)
            .await?;
        parse_big_quantity(&result)
    }

    async fn token_decimals(&self, contract: &str) -> Result<u32, ChainError> {
        let result = self
            .call_contract(contract, DECIMALS_SELECTOR.to_string())
            .await?;
        let decimals = parse_quantity(&result)?;
        u32::try_from(decimals)
            .map_err(|_| ChainError::Parse(format!("decimals {} out of range", decimals)))
    }
}
