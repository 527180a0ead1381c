//! Two-phase headers-sync state machine, one instance per peer.

use std::collections::VecDeque;

use chimed_chainstate::{locator, ChainIndex};
use chimed_consensus::constants::MTP_SPAN;
use chimed_consensus::{ConsensusParams, Hash256};
use chimed_log::{log_debug, log_info};
use chimed_pow::difficulty::{
    block_proof, calculate_next_work_required_window, compact_to_u256,
    permitted_difficulty_transition, u256_to_compact,
};
use chimed_primitives::block::BlockHeader;
use primitive_types::U256;
use rand::{thread_rng, Rng};

use crate::bits::BitQueue;
use crate::hasher::SaltedHasher;
use crate::mtp::MtpTracker;

// The two constants below balance commitment memory against how many
// unvalidated headers we are willing to buffer during redownload.

/// Store one header commitment per this many blocks.
pub const HEADER_COMMITMENT_PERIOD: i64 = 600;

/// Only feed headers to validation once this many headers on top have been
/// received and validated against commitments. 12330/600 = ~20.6 commitments.
pub const REDOWNLOAD_BUFFER_SIZE: usize = 12_330;

pub type PeerId = i64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncState {
    /// Validate difficulty transitions, sample commitments, accumulate work.
    Presync,
    /// Re-receive the chain, check commitments, release headers in order.
    Redownload,
    /// Terminal; all buffers released.
    Final,
}

#[derive(Default)]
pub struct ProcessingResult {
    pub success: bool,
    pub request_more: bool,
    pub pow_validated_headers: Vec<BlockHeader>,
}

/// Header with the previous-block hash stripped; the hash is implied by the
/// buffer position and reattached on release.
#[derive(Clone)]
struct CompressedHeader {
    version: i32,
    merkle_root: Hash256,
    time: u32,
    bits: u32,
    nonce: u32,
}

impl CompressedHeader {
    fn from_header(header: &BlockHeader) -> Self {
        Self {
            version: header.version,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
        }
    }

    fn full_header(&self, prev_block: Hash256) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }
}

/// What the sync keeps of the local block the peer must extend.
struct ChainStartAnchor {
    hash: Hash256,
    height: i64,
    bits: u32,
    time: u32,
    chain_work: U256,
}

pub struct HeadersSyncState<'p> {
    id: PeerId,
    params: &'p ConsensusParams,
    state: SyncState,

    chain_start: ChainStartAnchor,
    /// Trailing (bits, time) pairs ending at the chain start, enough to
    /// rewarm the retarget window and the MTP tracker after a reset.
    seed_history: Vec<(u32, i64)>,
    chain_start_locator: Vec<Hash256>,
    minimum_required_work: U256,

    /// Offset inside each commitment period at which a bit is sampled.
    commit_offset: i64,
    hasher: SaltedHasher,
    /// Hard cap on stored commitments; no consensus-valid chain can be
    /// longer than this bound implies, so exceeding it fails the sync.
    max_commitments: u64,

    current_chain_work: U256,
    last_header_received: BlockHeader,
    current_height: i64,
    header_commitments: BitQueue,

    redownloaded_headers: VecDeque<CompressedHeader>,
    redownload_buffer_last_hash: Hash256,
    redownload_buffer_first_prev_hash: Hash256,
    redownload_buffer_last_height: i64,
    redownload_chain_work: U256,
    process_all_remaining_headers: bool,

    recent_bits: VecDeque<u32>,
    recent_mtp: VecDeque<i64>,
    mtp: MtpTracker,
}

impl<'p> HeadersSyncState<'p> {
    /// Start syncing one peer's chain on top of the tip of `chain`. `now` is
    /// the current unix time, consulted once to bound commitment storage.
    pub fn new(
        id: PeerId,
        params: &'p ConsensusParams,
        chain: &ChainIndex,
        minimum_required_work: U256,
        now: i64,
    ) -> Self {
        let tip = chain.tip();
        let needed = params.pow_averaging_window as usize + 1 + MTP_SPAN;
        let seed_history = chain
            .header_infos(needed)
            .iter()
            .map(|info| (info.bits, info.time))
            .collect();

        // Bound the peer's chain length by the fastest block rate the MTP
        // rule allows (6 blocks/second) over the time since the chain start.
        let chain_start_mtp = chain
            .median_time_past(tip.height)
            .unwrap_or(i64::from(tip.header.time));
        let span = (now - chain_start_mtp) + params.max_future_block_time;
        let max_commitments = (6 * span / HEADER_COMMITMENT_PERIOD).max(0) as u64;

        let mut rng = thread_rng();
        let mut sync = Self {
            id,
            params,
            state: SyncState::Presync,
            chain_start: ChainStartAnchor {
                hash: tip.hash,
                height: tip.height,
                bits: tip.header.bits,
                time: tip.header.time,
                chain_work: tip.chain_work,
            },
            seed_history,
            chain_start_locator: locator(chain),
            minimum_required_work,
            commit_offset: rng.gen_range(0..HEADER_COMMITMENT_PERIOD),
            hasher: SaltedHasher::new(&mut rng),
            max_commitments,
            current_chain_work: tip.chain_work,
            last_header_received: tip.header.clone(),
            current_height: tip.height,
            header_commitments: BitQueue::new(),
            redownloaded_headers: VecDeque::new(),
            redownload_buffer_last_hash: [0u8; 32],
            redownload_buffer_first_prev_hash: [0u8; 32],
            redownload_buffer_last_height: 0,
            redownload_chain_work: U256::zero(),
            process_all_remaining_headers: false,
            recent_bits: VecDeque::new(),
            recent_mtp: VecDeque::new(),
            mtp: MtpTracker::new(),
        };

        log_debug!(
            "initial headers sync started with peer={}: height={}, max_commitments={}",
            id,
            sync.current_height,
            sync.max_commitments
        );

        sync.reset_retarget_buffers_to_chain_start();
        sync
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Height of the last header processed in the current phase.
    pub fn current_height(&self) -> i64 {
        self.current_height
    }

    /// Work claimed by the peer's chain so far during PRESYNC.
    pub fn presync_work(&self) -> U256 {
        self.current_chain_work
    }

    /// Free all memory and mark this instance unusable. Required before a
    /// new sync so the salted hasher is never reused with another peer.
    pub fn finalize(&mut self) {
        if self.state == SyncState::Final {
            return;
        }
        self.header_commitments.clear();
        self.last_header_received = null_header();
        self.redownloaded_headers = VecDeque::new();
        self.redownload_buffer_last_hash = [0u8; 32];
        self.redownload_buffer_first_prev_hash = [0u8; 32];
        self.process_all_remaining_headers = false;
        self.current_height = 0;
        self.seed_history = Vec::new();
        self.chain_start_locator = Vec::new();
        self.recent_bits = VecDeque::new();
        self.recent_mtp = VecDeque::new();
        self.mtp.clear();

        self.state = SyncState::Final;
    }

    /// Process one `headers` message from the peer. `full_headers_message`
    /// says whether the message carried the protocol-maximum number of
    /// headers, i.e. whether the peer may have more to give.
    pub fn process_next_headers(
        &mut self,
        received_headers: &[BlockHeader],
        full_headers_message: bool,
    ) -> ProcessingResult {
        let mut ret = ProcessingResult::default();

        if received_headers.is_empty() {
            return ret;
        }
        if self.state == SyncState::Final {
            return ret;
        }

        if self.state == SyncState::Presync {
            ret.success = self.validate_and_store_headers_commitments(received_headers);
            if ret.success {
                if full_headers_message || self.state == SyncState::Redownload {
                    // A full message means the peer may have more to give us;
                    // after switching to REDOWNLOAD we must re-request from
                    // the chain start either way.
                    ret.request_more = true;
                } else {
                    // A short message in PRESYNC means the peer's chain ended
                    // below our work threshold; not a protocol violation.
                    log_debug!(
                        "initial headers sync aborted with peer={}: incomplete headers message at height={} (presync phase)",
                        self.id,
                        self.current_height
                    );
                }
            }
        } else if self.state == SyncState::Redownload {
            ret.success = true;
            for header in received_headers {
                if !self.validate_and_store_redownloaded_header(header) {
                    // The peer gave us an unexpected chain; give up on it.
                    ret.success = false;
                    break;
                }
            }
            if ret.success {
                ret.pow_validated_headers = self.pop_headers_ready_for_acceptance();

                if self.redownloaded_headers.is_empty() && self.process_all_remaining_headers {
                    log_info!(
                        "initial headers sync complete with peer={}: releasing all at height={} (redownload phase)",
                        self.id,
                        self.redownload_buffer_last_height
                    );
                } else if full_headers_message {
                    ret.request_more = true;
                } else {
                    // The peer served us a high-work chain once but now
                    // declines to serve it again. The headers processed so
                    // far are still good, so this is a success without a
                    // follow-up request.
                    log_debug!(
                        "initial headers sync aborted with peer={}: incomplete headers message at height={} (redownload phase)",
                        self.id,
                        self.redownload_buffer_last_height
                    );
                }
            }
        }

        if !(ret.success && ret.request_more) {
            self.finalize();
        }
        ret
    }

    /// Locator for the next `getheaders` request: the head of the current
    /// phase followed by the chain-start locator entries.
    pub fn next_request_locator(&self) -> Vec<Hash256> {
        let mut locator = Vec::with_capacity(1 + self.chain_start_locator.len());
        match self.state {
            SyncState::Presync => locator.push(self.last_header_received.hash()),
            SyncState::Redownload => locator.push(self.redownload_buffer_last_hash),
            SyncState::Final => return Vec::new(),
        }
        locator.extend_from_slice(&self.chain_start_locator);
        locator
    }

    fn validate_and_store_headers_commitments(&mut self, headers: &[BlockHeader]) -> bool {
        if self.state != SyncState::Presync {
            return false;
        }

        if headers[0].prev_block != self.last_header_received.hash() {
            // Possibly benign: the peer may have reorged away from the chain
            // it was serving. Give up and let the driver start a fresh sync.
            log_debug!(
                "initial headers sync aborted with peer={}: non-continuous headers at height={} (presync phase)",
                self.id,
                self.current_height
            );
            return false;
        }

        for header in headers {
            if !self.validate_and_process_single_header(header) {
                return false;
            }
        }

        if self.current_chain_work >= self.minimum_required_work {
            self.redownloaded_headers.clear();
            self.redownload_buffer_last_height = self.chain_start.height;
            self.redownload_buffer_first_prev_hash = self.chain_start.hash;
            self.redownload_buffer_last_hash = self.chain_start.hash;
            self.redownload_chain_work = self.chain_start.chain_work;
            // The redownload stream restarts at the chain start, so the
            // retarget window must as well.
            self.reset_retarget_buffers_to_chain_start();
            self.state = SyncState::Redownload;
            log_info!(
                "initial headers sync transition with peer={}: reached sufficient work at height={}, redownloading from height={}",
                self.id,
                self.current_height,
                self.redownload_buffer_last_height
            );
        }
        true
    }

    fn validate_and_process_single_header(&mut self, current: &BlockHeader) -> bool {
        let next_height = self.current_height + 1;

        if self.recent_bits.is_empty() {
            self.seed_retarget_buffers_from_last_header();
        }

        // An adversary with limited hashing power has the best chance of
        // producing a high-work chain by compressing its claimed work into
        // as few blocks as possible, so every difficulty transition is
        // checked before the header contributes any work.
        let permitted = self.check_window_aware_retarget(
            self.last_header_received.bits,
            current.bits,
            i64::from(current.time),
            i64::from(self.last_header_received.time),
            next_height,
        );
        if !permitted {
            log_debug!(
                "initial headers sync aborted with peer={}: invalid difficulty transition at height={} (presync phase)",
                self.id,
                next_height
            );
            return false;
        }

        if next_height % HEADER_COMMITMENT_PERIOD == self.commit_offset {
            self.header_commitments
                .push_back(self.hasher.commitment_bit(&current.hash()));
            if self.header_commitments.len() as u64 > self.max_commitments {
                // The chain may have grown since this sync began, so a retry
                // later could still succeed; this attempt is over.
                log_debug!(
                    "initial headers sync aborted with peer={}: exceeded max commitments at height={} (presync phase)",
                    self.id,
                    next_height
                );
                return false;
            }
        }

        self.current_chain_work = self
            .current_chain_work
            .saturating_add(block_proof(current.bits).unwrap_or_default());
        self.last_header_received = current.clone();
        self.current_height = next_height;

        let mtp = self.mtp.push(i64::from(current.time));
        self.push_retarget_sample(current.bits, mtp);

        true
    }

    fn validate_and_store_redownloaded_header(&mut self, header: &BlockHeader) -> bool {
        if self.state != SyncState::Redownload {
            return false;
        }
        let next_height = self.redownload_buffer_last_height + 1;

        if header.prev_block != self.redownload_buffer_last_hash {
            log_debug!(
                "initial headers sync aborted with peer={}: non-continuous headers at height={} (redownload phase)",
                self.id,
                next_height
            );
            return false;
        }

        let (previous_bits, previous_time) = match self.redownloaded_headers.back() {
            Some(last) => (last.bits, i64::from(last.time)),
            None => (self.chain_start.bits, i64::from(self.chain_start.time)),
        };

        let permitted = self.check_window_aware_retarget(
            previous_bits,
            header.bits,
            i64::from(header.time),
            previous_time,
            next_height,
        );
        if !permitted {
            log_debug!(
                "initial headers sync aborted with peer={}: invalid difficulty transition at height={} (redownload phase)",
                self.id,
                next_height
            );
            return false;
        }

        self.redownload_chain_work = self
            .redownload_chain_work
            .saturating_add(block_proof(header.bits).unwrap_or_default());
        if self.redownload_chain_work >= self.minimum_required_work {
            self.process_all_remaining_headers = true;
        }

        // Check the stored commitment for this height, unless the work
        // target has been reached: the peer may have extended its chain
        // between our two passes, and running out of commitments past the
        // target must not fail the sync.
        if !self.process_all_remaining_headers
            && next_height % HEADER_COMMITMENT_PERIOD == self.commit_offset
        {
            let Some(expected_commitment) = self.header_commitments.pop_front() else {
                log_debug!(
                    "initial headers sync aborted with peer={}: commitment overrun at height={} (redownload phase)",
                    self.id,
                    next_height
                );
                return false;
            };
            if self.hasher.commitment_bit(&header.hash()) != expected_commitment {
                log_debug!(
                    "initial headers sync aborted with peer={}: commitment mismatch at height={} (redownload phase)",
                    self.id,
                    next_height
                );
                return false;
            }
        }

        self.redownloaded_headers
            .push_back(CompressedHeader::from_header(header));
        self.redownload_buffer_last_height = next_height;
        self.redownload_buffer_last_hash = header.hash();

        let mtp = self.mtp.push(i64::from(header.time));
        self.push_retarget_sample(header.bits, mtp);

        true
    }

    fn pop_headers_ready_for_acceptance(&mut self) -> Vec<BlockHeader> {
        let mut ret = Vec::new();

        while self.redownloaded_headers.len() > REDOWNLOAD_BUFFER_SIZE
            || (!self.redownloaded_headers.is_empty() && self.process_all_remaining_headers)
        {
            let Some(compressed) = self.redownloaded_headers.pop_front() else {
                break;
            };
            let header = compressed.full_header(self.redownload_buffer_first_prev_hash);
            self.redownload_buffer_first_prev_hash = header.hash();
            ret.push(header);
        }
        ret
    }

    /// Per-block admissibility: is `prev_bits -> next_bits` an acceptable
    /// difficulty transition at `next_height` given the current window?
    fn check_window_aware_retarget(
        &self,
        prev_bits: u32,
        next_bits: u32,
        next_time: i64,
        prev_time: i64,
        next_height: i64,
    ) -> bool {
        let window = self.params.pow_averaging_window;
        if (self.recent_bits.len() as i64) < window || (self.recent_mtp.len() as i64) < window + 1
        {
            // Not warmed up yet.
            return true;
        }

        // Right after activation, tolerate the legacy rule so peers that
        // have not upgraded still interoperate.
        if next_height <= self.params.new_pow_diff_height + window {
            return true;
        }

        // Min-difficulty-after-long-gap rule, where enabled: the only
        // acceptable bits for such a block encode the pow limit itself.
        if let Some(min_height) = self.params.pow_allow_min_difficulty_after_height {
            if next_height - 1 >= min_height
                && next_time > prev_time + self.params.pow_target_spacing * 6
            {
                let pow_limit = U256::from_little_endian(&self.params.pow_limit);
                return next_bits == u256_to_compact(pow_limit);
            }
        }

        let mut total = U256::zero();
        for bits in &self.recent_bits {
            total = total.saturating_add(compact_to_u256(*bits).unwrap_or_default());
        }
        let avg = total / U256::from(window as u64);

        let (Some(mtp_first), Some(mtp_last)) = (
            self.recent_mtp.front().copied(),
            self.recent_mtp.back().copied(),
        ) else {
            return true;
        };

        let expected_bits =
            calculate_next_work_required_window(avg, mtp_last, mtp_first, self.params);
        let expected_target = compact_to_u256(expected_bits).unwrap_or_default();
        let Ok(observed_target) = compact_to_u256(next_bits) else {
            return false;
        };

        // Small absolute slack absorbs compact rounding and early-window
        // variance at activation boundaries.
        let slack = U256::from(4u64);
        let min_target = if expected_target > slack {
            expected_target - slack
        } else {
            U256::zero()
        };
        let max_target = expected_target.saturating_add(slack);

        if observed_target < min_target || observed_target > max_target {
            if permitted_difficulty_transition(self.params, next_height, prev_bits, next_bits) {
                // Inside the legacy envelope; accept without logging.
                return true;
            }

            log_debug!(
                "headers sync window check failed ({}) with peer={}: height={} observed={:08x} expected={:08x} mtp_last={} mtp_first={} prev_time={} next_time={}",
                if observed_target < min_target { "too hard" } else { "too easy" },
                self.id,
                next_height,
                next_bits,
                expected_bits,
                mtp_last,
                mtp_first,
                prev_time,
                next_time
            );
            return false;
        }
        true
    }

    fn seed_retarget_buffers_from_last_header(&mut self) {
        self.recent_bits.clear();
        self.recent_mtp.clear();
        self.mtp.clear();

        let bits = self.last_header_received.bits;
        let time = i64::from(self.last_header_received.time);
        let mtp = self.mtp.push(time);
        self.push_retarget_sample(bits, mtp);
    }

    fn reset_retarget_buffers_to_chain_start(&mut self) {
        self.recent_bits.clear();
        self.recent_mtp.clear();
        self.mtp.clear();

        for idx in 0..self.seed_history.len() {
            let (bits, time) = self.seed_history[idx];
            let mtp = self.mtp.push(time);
            self.push_retarget_sample(bits, mtp);
        }
    }

    fn push_retarget_sample(&mut self, bits: u32, mtp: i64) {
        self.recent_bits.push_back(bits);
        self.recent_mtp.push_back(mtp);

        let window = self.params.pow_averaging_window as usize;
        while self.recent_bits.len() > window {
            self.recent_bits.pop_front();
        }
        while self.recent_mtp.len() > window + 1 {
            self.recent_mtp.pop_front();
        }
    }
}

fn null_header() -> BlockHeader {
    BlockHeader {
        version: 0,
        prev_block: [0u8; 32],
        merkle_root: [0u8; 32],
        time: 0,
        bits: 0,
        nonce: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_header_round_trip() {
        let header = BlockHeader {
            version: 4,
            prev_block: [0x11u8; 32],
            merkle_root: [0x22u8; 32],
            time: 1_700_000_000,
            bits: 0x1b04_be6a,
            nonce: 99,
        };

        let compressed = CompressedHeader::from_header(&header);
        assert_eq!(compressed.full_header([0x11u8; 32]), header);

        let relinked = compressed.full_header([0x33u8; 32]);
        assert_eq!(relinked.prev_block, [0x33u8; 32]);
        assert_eq!(relinked.merkle_root, header.merkle_root);
    }
}
