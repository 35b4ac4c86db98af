//! Transaction Classifier
//!
//! Turns native transactions and token transfer logs into events for the
//! tracked address set. The internal-call heuristic lives here too and is
//! shared by the block scanner and the single-transaction lookup.

use num_bigint::BigUint;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::amount::{NATIVE_DECIMALS, try_scale_amount};
use super::chain::{Block, BlockTag, ChainClient, ChainTransaction, TransferLog, fetch_balances};
use super::error::{ChainError, SentinelError};
use super::registry::TrackedSet;

/// Shortest input that can carry a function selector
pub const MIN_CALL_INPUT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Send,
    Receive,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedEvent {
    pub symbol: String,
    pub tx_hash: String,
    pub address: String,
    /// `None` when the raw amount does not fit a `Decimal`
    pub amount: Option<Decimal>,
    pub confirmations: u64,
    pub category: Category,
}

pub fn confirmations(head: u64, block_number: u64) -> u64 {
    head.saturating_sub(block_number)
}

/// Category and attributed address for a value movement between two endpoints
fn categorize(from: &str, to: Option<&str>, tracked: &TrackedSet) -> Option<(String, Category)> {
    let from_tracked = tracked.contains(from);
    let to_tracked = tracked.contains_opt(to);

    match (from_tracked, to_tracked, to) {
        (true, true, _) => Some((from.to_string(), Category::Internal)),
        (false, true, Some(to)) => Some((to.to_string(), Category::Receive)),
        (true, false, _) => Some((from.to_string(), Category::Send)),
        _ => None,
    }
}

/// Classify the top-level value transfer of a native transaction
pub fn classify_native(
    tx: &ChainTransaction,
    tracked: &TrackedSet,
    head: u64,
    symbol: &str,
) -> Option<ClassifiedEvent> {
    let (address, category) = categorize(&tx.from, tx.to.as_deref(), tracked)?;

    Some(ClassifiedEvent {
        symbol: symbol.to_string(),
        tx_hash: tx.hash.clone(),
        address,
        amount: try_scale_amount(&tx.value, NATIVE_DECIMALS),
        confirmations: confirmations(head, tx.block_number),
        category,
    })
}

/// Classify one decoded token `Transfer` log entry
pub fn classify_transfer(
    log: &TransferLog,
    tracked: &TrackedSet,
    head: u64,
    symbol: &str,
    decimals: u32,
) -> Option<ClassifiedEvent> {
    let (address, category) = categorize(&log.from, Some(&log.to), tracked)?;

    Some(ClassifiedEvent {
        symbol: symbol.to_string(),
        tx_hash: log.tx_hash.clone(),
        address,
        amount: try_scale_amount(&log.raw_amount, decimals),
        confirmations: confirmations(head, log.block_number),
        category,
    })
}

/// A transaction whose input mentions a tracked address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputHit {
    pub tx_hash: String,
    /// The transaction itself moves value to or from a tracked address
    pub direct: bool,
}

/// Unambiguous heuristic attribution of an address to a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMatch {
    pub address: String,
    pub tx_hash: String,
    pub block_number: u64,
}

/// Result of running the internal-call heuristic over one block
#[derive(Debug, Default)]
pub struct InternalScan {
    /// Tracked addresses visible in a direct transfer within the block
    pub direct: HashSet<String>,
    /// Every input match, per tracked address
    pub hits: BTreeMap<String, Vec<InputHit>>,
    /// Matches that survived the exclusion rules
    pub matches: Vec<InternalMatch>,
}

impl InternalScan {
    /// Tracked addresses whose fragment occurs in the input of `tx_hash`
    pub fn matched_in(&self, tx_hash: &str) -> Vec<String> {
        self.hits
            .iter()
            .filter(|(_, hits)| hits.iter().any(|hit| hit.tx_hash == tx_hash))
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn matches_for(&self, tx_hash: &str) -> Vec<InternalMatch> {
        self.matches
            .iter()
            .filter(|m| m.tx_hash == tx_hash)
            .cloned()
            .collect()
    }
}

/// Find tracked addresses that appear only inside call input within `block`.
///
/// An address is dropped when it is part of a direct transfer in the block
/// or when its fragment occurs in more than one transaction of the block.
/// Calls addressed to a configured token contract are token transfers and
/// belong to the token pass.
pub fn detect_internal(
    block: &Block,
    tracked: &TrackedSet,
    token_contracts: &HashSet<String>,
) -> InternalScan {
    let mut scan = InternalScan::default();
    if tracked.is_empty() {
        return scan;
    }

    let mut direct_txs: HashSet<&str> = HashSet::new();
    for tx in &block.transactions {
        let mut is_direct = false;
        if tracked.contains(&tx.from) {
            scan.direct.insert(tx.from.clone());
            is_direct = true;
        }
        if let Some(to) = tx.to.as_deref()
            && tracked.contains(to)
        {
            scan.direct.insert(to.to_string());
            is_direct = true;
        }
        if is_direct {
            direct_txs.insert(tx.hash.as_str());
        }
    }

    for tx in &block.transactions {
        if tx.input.len() < MIN_CALL_INPUT {
            continue;
        }
        if tx.to.as_ref().is_some_and(|to| token_contracts.contains(to)) {
            continue;
        }

        for address in tracked.matcher().matches(&tx.input) {
            scan.hits.entry(address).or_default().push(InputHit {
                tx_hash: tx.hash.clone(),
                direct: direct_txs.contains(tx.hash.as_str()),
            });
        }
    }

    for (address, hits) in &scan.hits {
        if scan.direct.contains(address) {
            debug!("{} excluded in block {}: direct transfer", address, block.number);
            continue;
        }
        if hits.len() != 1 {
            debug!(
                "{} excluded in block {}: matched in {} transactions",
                address,
                block.number,
                hits.len()
            );
            continue;
        }
        if hits[0].direct {
            continue;
        }

        scan.matches.push(InternalMatch {
            address: address.clone(),
            tx_hash: hits[0].tx_hash.clone(),
            block_number: block.number,
        });
    }

    scan
}

/// Price heuristic matches by the balance change across their block.
///
/// All balances are fetched in one batch; matches whose balance did not
/// grow produce no event.
pub async fn resolve_internal(
    chain: &dyn ChainClient,
    matches: &[InternalMatch],
    head: u64,
    symbol: &str,
) -> Result<Vec<ClassifiedEvent>, SentinelError> {
    let priced: Vec<&InternalMatch> = matches.iter().filter(|m| m.block_number > 0).collect();
    if priced.is_empty() {
        return Ok(Vec::new());
    }

    let queries: Vec<(String, BlockTag)> = priced
        .iter()
        .flat_map(|m| {
            [
                (m.address.clone(), BlockTag::Number(m.block_number - 1)),
                (m.address.clone(), BlockTag::Number(m.block_number)),
            ]
        })
        .collect();

    let balances = fetch_balances(chain, &queries).await.map_err(|e| match e {
        ChainError::BatchLength { expected, actual } => SentinelError::Invariant(format!(
            "balance batch returned {} of {} responses",
            actual, expected
        )),
        other => SentinelError::Chain(other),
    })?;

    let mut events = Vec::new();
    for (m, pair) in priced.iter().zip(balances.chunks_exact(2)) {
        let (before, after) = (&pair[0], &pair[1]);
        if after <= before {
            debug!(
                "{} in {}: no balance increase at block {}",
                m.address, m.tx_hash, m.block_number
            );
            continue;
        }

        let delta: BigUint = after - before;
        events.push(ClassifiedEvent {
            symbol: symbol.to_string(),
            tx_hash: m.tx_hash.clone(),
            address: m.address.clone(),
            amount: try_scale_amount(&delta, NATIVE_DECIMALS),
            confirmations: confirmations(head, m.block_number),
            category: Category::Receive,
        });
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::mock::{MockChain, call_input, native_tx};
    use crate::sentinel::registry::TrackedAddress;

    const ALICE: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    const BOB: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";
    const STRANGER: &str = "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB";
    const ROUTER: &str = "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb";

    fn tracked(addresses: &[&str]) -> TrackedSet {
        let entries: Vec<TrackedAddress> = addresses
            .iter()
            .map(|a| TrackedAddress {
                address: a.to_string(),
                symbol: "ETH".to_string(),
            })
            .collect();
        TrackedSet::new(&entries).unwrap()
    }

    fn wei(eth: u64) -> BigUint {
        BigUint::from(eth) * BigUint::from(10u64).pow(18)
    }

    #[test]
    fn test_both_endpoints_tracked_is_internal_once() {
        let set = tracked(&[ALICE, BOB]);
        let tx = native_tx("0x01", ALICE, Some(BOB), wei(1), 100);

        let event = classify_native(&tx, &set, 105, "ETH").unwrap();
        assert_eq!(event.category, Category::Internal);
        assert_eq!(event.address, ALICE);
        assert_eq!(event.amount, Some(Decimal::ONE));
        assert_eq!(event.confirmations, 5);
    }

    #[test]
    fn test_receive_send_and_unrelated() {
        let set = tracked(&[ALICE]);

        let incoming = native_tx("0x01", STRANGER, Some(ALICE), wei(2), 10);
        let event = classify_native(&incoming, &set, 10, "ETH").unwrap();
        assert_eq!(event.category, Category::Receive);
        assert_eq!(event.address, ALICE);
        assert_eq!(event.confirmations, 0);

        let outgoing = native_tx("0x02", ALICE, Some(STRANGER), wei(2), 10);
        let event = classify_native(&outgoing, &set, 10, "ETH").unwrap();
        assert_eq!(event.category, Category::Send);

        let creation = native_tx("0x03", ALICE, None, BigUint::default(), 10);
        let event = classify_native(&creation, &set, 10, "ETH").unwrap();
        assert_eq!(event.category, Category::Send);

        let unrelated = native_tx("0x04", STRANGER, Some(BOB), wei(2), 10);
        assert!(classify_native(&unrelated, &set, 10, "ETH").is_none());
    }

    #[test]
    fn test_transfer_amount_exact_for_any_decimals() {
        let set = tracked(&[ALICE]);
        for decimals in 0..=18u32 {
            let log = TransferLog {
                tx_hash: "0xaa".to_string(),
                from: STRANGER.to_string(),
                to: ALICE.to_string(),
                raw_amount: BigUint::from(10u64).pow(decimals),
                block_number: 7,
                log_index: 0,
            };
            let event = classify_transfer(&log, &set, 9, "USDT", decimals).unwrap();
            assert_eq!(event.amount, Some(Decimal::ONE));
            assert_eq!(event.category, Category::Receive);
        }
    }

    #[test]
    fn test_transfer_too_large_for_decimal_still_classified() {
        let set = tracked(&[ALICE]);
        let log = TransferLog {
            tx_hash: "0xbig".to_string(),
            from: STRANGER.to_string(),
            to: ALICE.to_string(),
            raw_amount: BigUint::from(10u64).pow(30),
            block_number: 7,
            log_index: 0,
        };

        let event = classify_transfer(&log, &set, 9, "USDT", 18).unwrap();
        assert_eq!(event.category, Category::Receive);
        assert_eq!(event.address, ALICE);
        assert_eq!(event.amount, None);
    }

    #[test]
    fn test_detect_internal_single_match() {
        let set = tracked(&[ALICE, BOB]);
        let block = Block {
            number: 50,
            hash: "0xb50".to_string(),
            timestamp: 0,
            transactions: vec![native_tx_with_input("0x01", STRANGER, ROUTER, &[ALICE], 50)],
        };

        let scan = detect_internal(&block, &set, &HashSet::new());
        assert_eq!(scan.matches.len(), 1);
        assert_eq!(scan.matches[0].address, ALICE);
        assert_eq!(scan.matches[0].tx_hash, "0x01");
        assert_eq!(scan.matched_in("0x01"), vec![ALICE.to_string()]);
    }

    #[test]
    fn test_detect_internal_drops_ambiguous_address() {
        let set = tracked(&[ALICE]);
        let block = Block {
            number: 50,
            hash: "0xb50".to_string(),
            timestamp: 0,
            transactions: vec![
                native_tx_with_input("0x01", STRANGER, ROUTER, &[ALICE], 50),
                native_tx_with_input("0x02", STRANGER, ROUTER, &[ALICE], 50),
            ],
        };

        let scan = detect_internal(&block, &set, &HashSet::new());
        assert!(scan.matches.is_empty());
        assert_eq!(scan.hits[ALICE].len(), 2);
    }

    #[test]
    fn test_detect_internal_drops_direct_transfer_address() {
        let set = tracked(&[ALICE]);
        let block = Block {
            number: 50,
            hash: "0xb50".to_string(),
            timestamp: 0,
            transactions: vec![
                native_tx("0x01", STRANGER, Some(ALICE), wei(1), 50),
                native_tx_with_input("0x02", STRANGER, ROUTER, &[ALICE], 50),
            ],
        };

        let scan = detect_internal(&block, &set, &HashSet::new());
        assert!(scan.direct.contains(ALICE));
        assert!(scan.matches.is_empty());
    }

    #[test]
    fn test_detect_internal_skips_token_contract_calls() {
        let set = tracked(&[ALICE]);
        let block = Block {
            number: 50,
            hash: "0xb50".to_string(),
            timestamp: 0,
            transactions: vec![native_tx_with_input("0x01", STRANGER, ROUTER, &[ALICE], 50)],
        };
        let contracts: HashSet<String> = [ROUTER.to_string()].into_iter().collect();

        let scan = detect_internal(&block, &set, &contracts);
        assert!(scan.hits.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_internal_uses_balance_delta() {
        let chain = MockChain::new();
        chain.set_balance_at(ALICE, 49, wei(1));
        chain.set_balance_at(ALICE, 50, wei(3));
        chain.set_balance_at(BOB, 49, wei(5));
        chain.set_balance_at(BOB, 50, wei(5));

        let matches = vec![
            InternalMatch {
                address: ALICE.to_string(),
                tx_hash: "0x01".to_string(),
                block_number: 50,
            },
            InternalMatch {
                address: BOB.to_string(),
                tx_hash: "0x02".to_string(),
                block_number: 50,
            },
        ];

        let events = resolve_internal(&chain, &matches, 60, "ETH").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].address, ALICE);
        assert_eq!(events[0].amount, Some(Decimal::from(2)));
        assert_eq!(events[0].category, Category::Receive);
        assert_eq!(events[0].confirmations, 10);
        assert_eq!(chain.batch_calls(), 1);
    }

    fn native_tx_with_input(
        hash: &str,
        from: &str,
        to: &str,
        mentioned: &[&str],
        block: u64,
    ) -> ChainTransaction {
        let mut tx = native_tx(hash, from, Some(to), BigUint::default(), block);
        tx.input = call_input(mentioned);
        tx
    }
}
