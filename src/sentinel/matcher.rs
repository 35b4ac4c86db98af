//! Multi-pattern search for tracked addresses inside call input.
//!
//! One Aho–Corasick automaton over every tracked address fragment, so the
//! cost of scanning an input is linear in the input length regardless of
//! how many addresses are tracked.

use aho_corasick::AhoCorasick;
use std::collections::BTreeSet;

use super::chain::address_fragment;
use super::error::SentinelError;

pub struct AddressMatcher {
    automaton: AhoCorasick,
    /// Checksummed address per pattern index
    addresses: Vec<String>,
}

impl AddressMatcher {
    /// Build from checksummed addresses
    pub fn new<'a, I>(addresses: I) -> Result<Self, SentinelError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut fragments = Vec::new();
        let mut owners = Vec::new();
        for address in addresses {
            fragments.push(address_fragment(address)?);
            owners.push(address.clone());
        }

        let automaton = AhoCorasick::new(&fragments)
            .map_err(|e| SentinelError::Config(format!("address automaton: {}", e)))?;

        Ok(Self {
            automaton,
            addresses: owners,
        })
    }

    /// Tracked addresses whose fragment occurs in the hex form of `input`
    pub fn matches(&self, input: &[u8]) -> BTreeSet<String> {
        if input.is_empty() || self.addresses.is_empty() {
            return BTreeSet::new();
        }

        let haystack = hex::encode(input);
        self.automaton
            .find_overlapping_iter(&haystack)
            .map(|m| self.addresses[m.pattern().as_usize()].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
