//! Argument filters and block ranges for event queries.
//!
//! An [`ArgFilter`] maps an argument name to a whitelist of acceptable values. A log matches
//! when every named argument holds one of its whitelisted values (OR within a field, AND across
//! fields).
//!
//! Fetchers carry a base filter fixed at construction time, for example the avatar a scheme is
//! scoped to. [`ArgFilter::merged_with_base`] combines it with the caller's filter; on a key
//! present in both, the base entry replaces the caller's entry. A caller can therefore narrow a
//! fetcher on other arguments but can never widen or redirect its scope.

use std::collections::BTreeMap;

use alloy::dyn_abi::DynSolValue;
use alloy::eips::BlockNumberOrTag;

use crate::ledger::EventArgs;

/// Whitelist filter over named event arguments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArgFilter(BTreeMap<String, Vec<DynSolValue>>);

impl ArgFilter {
    /// An empty filter, matching every log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `name` to equal `value`.
    pub fn equals(self, name: impl Into<String>, value: DynSolValue) -> Self {
        self.any_of(name, vec![value])
    }

    /// Requires `name` to equal one of `values`.
    pub fn any_of(mut self, name: impl Into<String>, values: Vec<DynSolValue>) -> Self {
        self.0.insert(name.into(), values);
        self
    }

    /// Returns true when no argument is constrained.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the whitelist for `name`.
    pub fn get(&self, name: &str) -> Option<&[DynSolValue]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Combines this caller filter with a fetcher's base filter. Base entries win.
    pub fn merged_with_base(&self, base: &ArgFilter) -> ArgFilter {
        let mut merged = self.0.clone();
        for (name, values) in &base.0 {
            merged.insert(name.clone(), values.clone());
        }
        ArgFilter(merged)
    }

    /// Checks whether `args` satisfy the filter.
    ///
    /// An argument the filter names but the log lacks never matches.
    pub fn matches(&self, args: &EventArgs) -> bool {
        self.0.iter().all(|(name, accepted)| {
            args.get(name)
                .is_some_and(|value| accepted.iter().any(|a| values_match(a, value)))
        })
    }
}

/// Compares two ABI values, ignoring the declared bit width of integers and fixed bytes.
fn values_match(a: &DynSolValue, b: &DynSolValue) -> bool {
    match (a, b) {
        (DynSolValue::Uint(x, _), DynSolValue::Uint(y, _)) => x == y,
        (DynSolValue::Int(x, _), DynSolValue::Int(y, _)) => x == y,
        (DynSolValue::FixedBytes(x, _), DynSolValue::FixedBytes(y, _)) => x == y,
        _ => a == b,
    }
}

/// Block range of a one-shot fetch.
///
/// | Field        | Default    |
/// |--------------|------------|
/// | `from_block` | `Earliest` |
/// | `to_block`   | `Latest`   |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchOptions {
    /// First block searched.
    pub from_block: BlockNumberOrTag,
    /// Last block searched.
    pub to_block: BlockNumberOrTag,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            from_block: BlockNumberOrTag::Earliest,
            to_block: BlockNumberOrTag::Latest,
        }
    }
}

impl FetchOptions {
    /// Searches from `block` up to the latest block.
    pub fn from_block(block: u64) -> Self {
        Self {
            from_block: BlockNumberOrTag::Number(block),
            ..Self::default()
        }
    }

    /// Restricts the upper bound to `block`.
    pub fn to_block(mut self, block: u64) -> Self {
        self.to_block = BlockNumberOrTag::Number(block);
        self
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, U256};

    use super::*;

    fn avatar(byte: u8) -> DynSolValue {
        DynSolValue::Address(Address::repeat_byte(byte))
    }

    #[test]
    fn whitelist_is_or_within_field_and_across_fields() {
        let filter = ArgFilter::new()
            .any_of("_avatar", vec![avatar(1), avatar(2)])
            .equals("_numOfChoices", DynSolValue::Uint(U256::from(2), 256));

        let args = EventArgs::new()
            .with("_avatar", avatar(2))
            .with("_numOfChoices", DynSolValue::Uint(U256::from(2), 256));
        assert!(filter.matches(&args));

        let wrong_avatar = args.clone().with("_avatar", avatar(3));
        assert!(!filter.matches(&wrong_avatar));

        let missing = EventArgs::new().with("_avatar", avatar(1));
        assert!(!filter.matches(&missing));
    }

    #[test]
    fn integer_width_does_not_affect_matching() {
        let filter = ArgFilter::new().equals("_vote", DynSolValue::Uint(U256::from(1), 256));
        let args = EventArgs::new().with("_vote", DynSolValue::Uint(U256::from(1), 8));
        assert!(filter.matches(&args));
    }

    #[test]
    fn base_filter_wins_on_shared_keys() {
        let caller = ArgFilter::new()
            .equals("_avatar", avatar(9))
            .equals("_voter", avatar(5));
        let base = ArgFilter::new().equals("_avatar", avatar(1));

        let merged = caller.merged_with_base(&base);
        assert_eq!(merged.get("_avatar"), Some(&[avatar(1)][..]));
        assert_eq!(merged.get("_voter"), Some(&[avatar(5)][..]));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(ArgFilter::new().matches(&EventArgs::new()));
    }
}
