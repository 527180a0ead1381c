//! Header chain kept as an arena ordered by height.
//!
//! Every entry stores its accumulated chain work, so ancestor lookups and
//! work comparisons are direct index reads rather than pointer walks.

use std::collections::HashMap;

use chimed_consensus::constants::MTP_SPAN;
use chimed_consensus::Hash256;
use chimed_pow::difficulty::{block_proof, HeaderInfo};
use chimed_primitives::block::BlockHeader;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    UnknownParent,
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::UnknownParent => write!(f, "header does not connect to the tip"),
        }
    }
}

impl std::error::Error for IndexError {}

#[derive(Clone, Debug)]
pub struct IndexedHeader {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: i64,
    /// Total work of the chain up to and including this header.
    pub chain_work: U256,
}

pub struct ChainIndex {
    entries: Vec<IndexedHeader>,
    by_hash: HashMap<Hash256, usize>,
}

impl ChainIndex {
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let chain_work = block_proof(genesis.bits).unwrap_or_default();
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, 0);
        Self {
            entries: vec![IndexedHeader {
                header: genesis,
                hash,
                height: 0,
                chain_work,
            }],
            by_hash,
        }
    }

    /// Append a header extending the current tip.
    pub fn push(&mut self, header: BlockHeader) -> Result<(), IndexError> {
        let tip = self.tip();
        if header.prev_block != tip.hash {
            return Err(IndexError::UnknownParent);
        }

        let hash = header.hash();
        let chain_work = tip
            .chain_work
            .saturating_add(block_proof(header.bits).unwrap_or_default());
        let height = tip.height + 1;

        self.by_hash.insert(hash, self.entries.len());
        self.entries.push(IndexedHeader {
            header,
            hash,
            height,
            chain_work,
        });
        Ok(())
    }

    pub fn tip(&self) -> &IndexedHeader {
        self.entries.last().expect("chain index is never empty")
    }

    pub fn height(&self) -> i64 {
        self.tip().height
    }

    pub fn ancestor(&self, height: i64) -> Option<&IndexedHeader> {
        let idx = usize::try_from(height).ok()?;
        self.entries.get(idx)
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<&IndexedHeader> {
        self.by_hash.get(hash).map(|idx| &self.entries[*idx])
    }

    /// Median of the trailing (up to eleven) timestamps ending at `height`.
    pub fn median_time_past(&self, height: i64) -> Option<i64> {
        let idx = usize::try_from(height).ok()?;
        if idx >= self.entries.len() {
            return None;
        }
        let start = idx.saturating_sub(MTP_SPAN - 1);
        let mut times: Vec<i64> = self.entries[start..=idx]
            .iter()
            .map(|entry| i64::from(entry.header.time))
            .collect();
        times.sort_unstable();
        Some(times[times.len() / 2])
    }

    /// The trailing `count` headers (fewer if the chain is shorter) in
    /// ascending height order, in the shape the retarget rules consume.
    pub fn header_infos(&self, count: usize) -> Vec<HeaderInfo> {
        let start = self.entries.len().saturating_sub(count);
        self.entries[start..]
            .iter()
            .map(|entry| HeaderInfo {
                height: entry.height,
                time: i64::from(entry.header.time),
                bits: entry.header.bits,
            })
            .collect()
    }
}
