//! Chain Client contract
//!
//! The query surface the sentinel needs from an EVM node. One client
//! instance is built at process start and shared by the scanner, lookup,
//! drain orchestrator and reconciler.

use async_trait::async_trait;
use num_bigint::BigUint;
use sha3::{Digest, Keccak256};

use super::error::ChainError;

/// Transaction snapshot as returned by the node. Addresses are checksummed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract creation
    pub to: Option<String>,
    /// Value in wei
    pub value: BigUint,
    /// Raw call input
    pub input: Vec<u8>,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
    /// Empty unless fetched with full transaction bodies
    pub transactions: Vec<ChainTransaction>,
}

/// Decoded ERC20 `Transfer(address,address,uint256)` log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub raw_amount: BigUint,
    pub block_number: u64,
    pub log_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

/// One element of a batched round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    GetBlock { number: u64, include_txs: bool },
    GetBalance { address: String, tag: BlockTag },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponse {
    Block(Block),
    Balance(BigUint),
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn head_block_number(&self) -> Result<u64, ChainError>;

    async fn get_block(&self, number: u64, include_txs: bool) -> Result<Block, ChainError>;

    async fn get_transaction(&self, hash: &str) -> Result<ChainTransaction, ChainError>;

    async fn get_balance(&self, address: &str, tag: BlockTag) -> Result<BigUint, ChainError>;

    /// Execute requests in one round-trip. Responses keep request order.
    async fn batch_execute(&self, requests: Vec<RpcRequest>)
    -> Result<Vec<RpcResponse>, ChainError>;

    fn to_checksum_address(&self, address: &str) -> Result<String, ChainError> {
        to_checksum_address(address)
    }

    /// `Transfer` logs emitted by `contract` within `[from_block, to_block]`
    async fn transfer_logs(
        &self,
        contract: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError>;

    /// `Transfer` logs emitted by `contract` inside one transaction
    async fn transaction_transfers(
        &self,
        contract: &str,
        tx_hash: &str,
    ) -> Result<Vec<TransferLog>, ChainError>;

    async fn token_balance(&self, contract: &str, address: &str) -> Result<BigUint, ChainError>;

    async fn token_decimals(&self, contract: &str) -> Result<u32, ChainError>;
}

/// Fetch `[start, end]` with full bodies in a single batch.
///
/// The response must cover exactly the requested range.
pub async fn fetch_block_range(
    chain: &dyn ChainClient,
    start: u64,
    end: u64,
) -> Result<Vec<Block>, ChainError> {
    let requests: Vec<RpcRequest> = (start..=end)
        .map(|number| RpcRequest::GetBlock {
            number,
            include_txs: true,
        })
        .collect();
    let expected = requests.len();

    let responses = chain.batch_execute(requests).await?;
    if responses.len() != expected {
        return Err(ChainError::BatchLength {
            expected,
            actual: responses.len(),
        });
    }

    responses
        .into_iter()
        .map(|response| match response {
            RpcResponse::Block(block) => Ok(block),
            other => Err(ChainError::Parse(format!(
                "expected block, got {:?}",
                other
            ))),
        })
        .collect()
}

/// Fetch balances for `(address, block)` pairs in a single batch
pub async fn fetch_balances(
    chain: &dyn ChainClient,
    queries: &[(String, BlockTag)],
) -> Result<Vec<BigUint>, ChainError> {
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let requests = queries
        .iter()
        .map(|(address, tag)| RpcRequest::GetBalance {
            address: address.clone(),
            tag: *tag,
        })
        .collect();

    let responses = chain.batch_execute(requests).await?;
    if responses.len() != queries.len() {
        return Err(ChainError::BatchLength {
            expected: queries.len(),
            actual: responses.len(),
        });
    }

    responses
        .into_iter()
        .map(|response| match response {
            RpcResponse::Balance(balance) => Ok(balance),
            other => Err(ChainError::Parse(format!(
                "expected balance, got {:?}",
                other
            ))),
        })
        .collect()
}

/// Strip the `0x` prefix and validate a 20-byte hex address
fn address_hex(address: &str) -> Result<&str, ChainError> {
    let hex_part = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);

    if hex_part.len() != 40 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChainError::InvalidAddress(address.to_string()));
    }
    Ok(hex_part)
}

/// EIP-55 mixed-case checksum encoding
pub fn to_checksum_address(address: &str) -> Result<String, ChainError> {
    let lower = address_hex(address)?.to_ascii_lowercase();
    let hash = Keccak256::digest(lower.as_bytes());

    let mut checksummed = String::with_capacity(42);
    checksummed.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            checksummed.push(c.to_ascii_uppercase());
        } else {
            checksummed.push(c);
        }
    }

    Ok(checksummed)
}

/// Lower-case 40-char hex body of an address, as it appears inside ABI-encoded input
pub fn address_fragment(address: &str) -> Result<String, ChainError> {
    Ok(address_hex(address)?.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_eip55_vectors() {
        let vectors = [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
        ];

        for expected in vectors {
            assert_eq!(to_checksum_address(&expected.to_lowercase()).unwrap(), expected);
            assert_eq!(to_checksum_address(&expected.to_uppercase()).unwrap(), expected);
        }
    }

    #[test]
    fn test_checksum_rejects_malformed() {
        assert!(to_checksum_address("0x1234").is_err());
        assert!(to_checksum_address("0xzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn test_address_fragment() {
        assert_eq!(
            address_fragment("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap(),
            "5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"
        );
    }
}
