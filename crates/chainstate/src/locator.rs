//! Block-locator construction.

use chimed_consensus::Hash256;

use crate::index::ChainIndex;

/// Heights sampled by a locator starting at `from`: dense for the first
/// eight entries, then exponentially backing off, always ending at genesis.
pub fn locator_indexes(mut from: i64) -> Vec<i64> {
    let mut indexes = Vec::new();
    let mut step = 1i64;

    while from > 0 {
        if indexes.len() >= 8 {
            step *= 2;
        }
        indexes.push(from);
        from = (from - step).max(0);
    }
    indexes.push(0);
    indexes
}

/// Locator hashes for the tip of `chain`.
pub fn locator(chain: &ChainIndex) -> Vec<Hash256> {
    locator_indexes(chain.height())
        .into_iter()
        .filter_map(|height| chain.ancestor(height).map(|entry| entry.hash))
        .collect()
}
