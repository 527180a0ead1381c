//! Difficulty and compact target utilities.

use chimed_consensus::constants::MTP_SPAN;
use chimed_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    NonContiguous,
    InsufficientHistory,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::NonContiguous => {
                write!(f, "header list must be contiguous by height")
            }
            DifficultyError::InsufficientHistory => {
                write!(f, "not enough headers to cover the retarget interval")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The slice of per-header facts the retarget rules consume.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected number of hashes represented by a block at `bits`:
/// `floor(2^256 / (target + 1))`, computed without 257-bit intermediates.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Compute the work required for the block after the last entry of `chain`.
///
/// `chain` must be contiguous by height and end at the current tip. The
/// legacy interval rule governs up to and including `new_pow_diff_height`;
/// the averaging-window rule governs above it.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    if chain.is_empty() {
        return Ok(pow_limit_bits);
    }

    ensure_contiguous(chain)?;

    let last = chain[chain.len() - 1];
    if last.height <= params.new_pow_diff_height {
        next_work_required_legacy(chain, next_block_time, params)
    } else {
        next_work_required_window(chain, next_block_time, params)
    }
}

fn next_work_required_legacy(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let last = chain[chain.len() - 1];
    let next_height = last.height + 1;
    let interval = params.difficulty_adjustment_interval();

    if next_height % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            // Special difficulty rule for testnet: a block arriving more than
            // four spacings after the previous one may use the minimum.
            if let Some(next_time) = next_block_time {
                if next_time > last.time + params.pow_target_spacing * 4 {
                    return Ok(pow_limit_bits);
                }
            }
            // Otherwise return the last non-minimum difficulty in the interval.
            let mut idx = chain.len() - 1;
            while idx > 0
                && chain[idx].height % interval != 0
                && chain[idx].bits == pow_limit_bits
            {
                idx -= 1;
            }
            return Ok(chain[idx].bits);
        }
        return Ok(last.bits);
    }

    // Go back the full interval unless this is the first retarget after
    // genesis, so a majority miner cannot shift the retarget window.
    let blocks_to_go_back = if next_height != interval {
        interval
    } else {
        interval - 1
    };

    let first_height = last.height - blocks_to_go_back;
    let base_height = chain[0].height;
    if first_height < base_height {
        return Err(DifficultyError::InsufficientHistory);
    }
    let first = chain[(first_height - base_height) as usize];

    let actual_timespan = last.time - first.time;
    Ok(calculate_next_work_required_legacy(
        last.bits,
        next_height,
        actual_timespan,
        params,
    )?)
}

fn next_work_required_window(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let last = chain[chain.len() - 1];

    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    if let Some(min_height) = params.pow_allow_min_difficulty_after_height {
        if last.height >= min_height {
            if let Some(next_time) = next_block_time {
                if next_time > last.time + params.pow_target_spacing * 6 {
                    return Ok(pow_limit_bits);
                }
            }
        }
    }

    let window = params.pow_averaging_window as usize;
    if chain.len() <= window {
        return Ok(pow_limit_bits);
    }

    let start = chain.len() - window;
    let mut total = U256::zero();
    for header in &chain[start..] {
        total = total.saturating_add(compact_to_u256(header.bits)?);
    }
    let avg = total / U256::from(window as u64);

    let last_mtp = median_time_past(chain, chain.len() - 1);
    let first_mtp = median_time_past(chain, start - 1);

    Ok(calculate_next_work_required_window(
        avg, last_mtp, first_mtp, params,
    ))
}

/// Median of the trailing (up to eleven) timestamps ending at `idx`.
pub fn median_time_past(chain: &[HeaderInfo], idx: usize) -> i64 {
    let start = idx.saturating_sub(MTP_SPAN - 1);
    let mut times: Vec<i64> = chain[start..=idx].iter().map(|header| header.time).collect();
    times.sort_unstable();
    times[times.len() / 2]
}

/// Averaging-window retarget: damp the observed window timespan by a
/// quarter, clamp it to the permitted band, and scale the mean target.
pub fn calculate_next_work_required_window(
    avg_target: U256,
    last_mtp: i64,
    first_mtp: i64,
    params: &ConsensusParams,
) -> u32 {
    let averaging_window_timespan = params.averaging_window_timespan();
    let mut actual_timespan = last_mtp - first_mtp;

    actual_timespan = averaging_window_timespan + (actual_timespan - averaging_window_timespan) / 4;

    if actual_timespan < params.min_actual_timespan() {
        actual_timespan = params.min_actual_timespan();
    }
    if actual_timespan > params.max_actual_timespan() {
        actual_timespan = params.max_actual_timespan();
    }

    // Divide before multiplying; the truncation point is consensus.
    let mut next = avg_target;
    next /= U256::from(averaging_window_timespan as u64);
    let (scaled, _) = next.overflowing_mul(U256::from(actual_timespan as u64));
    next = scaled;

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }

    u256_to_compact(next)
}

/// Legacy per-interval retarget with height-tiered downward clamps.
pub fn calculate_next_work_required_legacy(
    last_bits: u32,
    next_height: i64,
    actual_timespan: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let retarget_timespan = params.pow_target_timespan;

    let min_timespan = if next_height > 10_000 {
        retarget_timespan / 4
    } else if next_height > 5_000 {
        retarget_timespan / 8
    } else {
        retarget_timespan / 16
    };
    let max_timespan = retarget_timespan * 4;

    let mut modulated_timespan = actual_timespan;
    if modulated_timespan < min_timespan {
        modulated_timespan = min_timespan;
    } else if modulated_timespan > max_timespan {
        modulated_timespan = max_timespan;
    }

    // Multiply before dividing here; the legacy rule truncates last.
    let mut next = compact_to_u256(last_bits)?;
    let (scaled, _) = next.overflowing_mul(U256::from(modulated_timespan as u64));
    next = scaled / U256::from(retarget_timespan as u64);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }

    Ok(u256_to_compact(next))
}

/// Legacy envelope: is `old_bits -> new_bits` a permitted transition at
/// `height`? On a retarget boundary the new target must fall inside the
/// quarter-to-quadruple band around the old one (each bound re-rounded
/// through its compact encoding); off-boundary the bits must not change.
pub fn permitted_difficulty_transition(
    params: &ConsensusParams,
    height: i64,
    old_bits: u32,
    new_bits: u32,
) -> bool {
    if params.pow_allow_min_difficulty_blocks {
        return true;
    }

    if height % params.difficulty_adjustment_interval() == 0 {
        let retarget_timespan = params.pow_target_timespan;
        let smallest_timespan = retarget_timespan / 4;
        let largest_timespan = retarget_timespan * 4;
        let pow_limit = U256::from_little_endian(&params.pow_limit);

        let Ok(observed_new_target) = compact_to_u256(new_bits) else {
            return false;
        };
        let Ok(old_target) = compact_to_u256(old_bits) else {
            return false;
        };

        let (scaled, _) = old_target.overflowing_mul(U256::from(largest_timespan as u64));
        let mut largest_target = scaled / U256::from(retarget_timespan as u64);
        if largest_target > pow_limit {
            largest_target = pow_limit;
        }
        let maximum_new_target =
            compact_to_u256(u256_to_compact(largest_target)).unwrap_or_default();
        if maximum_new_target < observed_new_target {
            return false;
        }

        let (scaled, _) = old_target.overflowing_mul(U256::from(smallest_timespan as u64));
        let mut smallest_target = scaled / U256::from(retarget_timespan as u64);
        if smallest_target > pow_limit {
            smallest_target = pow_limit;
        }
        let minimum_new_target =
            compact_to_u256(u256_to_compact(smallest_target)).unwrap_or_default();
        if minimum_new_target > observed_new_target {
            return false;
        }
    } else if old_bits != new_bits {
        return false;
    }

    true
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimed_consensus::{consensus_params, Network};

    fn make_chain(
        base_height: i64,
        count: usize,
        base_time: i64,
        spacing: i64,
        bits: u32,
    ) -> Vec<HeaderInfo> {
        (0..count)
            .map(|offset| HeaderInfo {
                height: base_height + offset as i64,
                time: base_time + (offset as i64) * spacing,
                bits,
            })
            .collect()
    }

    #[test]
    fn window_retarget_perfect_spacing() {
        let params = consensus_params(Network::Mainnet);
        let timespan = params.averaging_window_timespan();
        let avg = compact_to_u256(0x1b04be6a).expect("avg target");

        // Dividing the mean by the window timespan truncates, so a perfectly
        // spaced window lands one compact step below the input.
        let bits = calculate_next_work_required_window(avg, 2_000 + timespan, 2_000, &params);
        assert_eq!(bits, 0x1b04be69);
    }

    #[test]
    fn window_retarget_clamps_fast_window() {
        let params = consensus_params(Network::Mainnet);
        let avg = compact_to_u256(0x1b04be6a).expect("avg target");

        let bits = calculate_next_work_required_window(avg, 2_000, 2_000, &params);
        assert_eq!(bits, 0x1b03fb27);
    }

    #[test]
    fn window_retarget_clamps_slow_window() {
        let params = consensus_params(Network::Mainnet);
        let timespan = params.averaging_window_timespan();
        let avg = compact_to_u256(0x1b04be6a).expect("avg target");

        let bits = calculate_next_work_required_window(avg, 2_000 + 3 * timespan, 2_000, &params);
        assert_eq!(bits, 0x1b06428c);
    }

    #[test]
    fn window_retarget_clamps_to_pow_limit() {
        let params = consensus_params(Network::Mainnet);
        let timespan = params.averaging_window_timespan();
        let avg = U256::from_little_endian(&params.pow_limit);

        let bits = calculate_next_work_required_window(avg, 2_000 + 3 * timespan, 2_000, &params);
        assert_eq!(bits, 0x1e0fffff);
        assert_eq!(bits, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn legacy_retarget_vectors() {
        let params = consensus_params(Network::Mainnet);
        let timespan = params.pow_target_timespan;

        let bits = calculate_next_work_required_legacy(0x1b04be6a, 20_001, timespan, &params)
            .expect("legacy bits");
        assert_eq!(bits, 0x1b04be6a);

        let bits = calculate_next_work_required_legacy(0x1b04be6a, 20_001, 10, &params)
            .expect("legacy bits");
        assert_eq!(bits, 0x1b012f9a);

        let bits = calculate_next_work_required_legacy(0x1b04be6a, 20_001, timespan * 10, &params)
            .expect("legacy bits");
        assert_eq!(bits, 0x1b12f9a8);
    }

    #[test]
    fn legacy_retarget_height_tiers() {
        let params = consensus_params(Network::Mainnet);

        let bits = calculate_next_work_required_legacy(0x1b04be6a, 7_000, 10, &params)
            .expect("legacy bits");
        assert_eq!(bits, 0x1b0097cd);

        let bits = calculate_next_work_required_legacy(0x1b04be6a, 4_000, 10, &params)
            .expect("legacy bits");
        assert_eq!(bits, 0x1a4be6a0);
    }

    #[test]
    fn dispatch_legacy_boundary_retargets() {
        let params = consensus_params(Network::Mainnet);
        // 241 headers ending just below a retarget boundary; perfect spacing
        // makes the observed timespan equal the target timespan exactly.
        let chain = make_chain(9_359, 241, 1_000_000, params.pow_target_spacing, 0x1b04be6a);

        let bits = get_next_work_required(&chain, None, &params).expect("next work");
        assert_eq!(bits, 0x1b04be6a);
    }

    #[test]
    fn dispatch_legacy_boundary_needs_full_interval() {
        let params = consensus_params(Network::Mainnet);
        let chain = make_chain(9_590, 10, 1_000_000, params.pow_target_spacing, 0x1b04be6a);

        assert_eq!(
            get_next_work_required(&chain, None, &params),
            Err(DifficultyError::InsufficientHistory)
        );
    }

    #[test]
    fn legacy_min_difficulty_walkback() {
        let mut params = consensus_params(Network::Mainnet);
        params.pow_allow_min_difficulty_blocks = true;
        let limit_bits = target_to_compact(&params.pow_limit);

        let mut chain = make_chain(500, 10, 1_000_000, params.pow_target_spacing, 0x1b04be6a);
        for header in chain.iter_mut().skip(5) {
            header.bits = limit_bits;
        }
        let last_time = chain[9].time;

        // A block arriving long after the previous one may use the minimum.
        let gap_time = last_time + params.pow_target_spacing * 4 + 1;
        let bits = get_next_work_required(&chain, Some(gap_time), &params).expect("next work");
        assert_eq!(bits, limit_bits);

        // Otherwise the last real difficulty in the interval carries over,
        // skipping any min-difficulty blocks on top of it.
        let bits =
            get_next_work_required(&chain, Some(last_time + 1), &params).expect("next work");
        assert_eq!(bits, 0x1b04be6a);
    }

    #[test]
    fn permitted_transition_boundary_band() {
        let params = consensus_params(Network::Mainnet);
        let boundary = params.difficulty_adjustment_interval() * 1_000;

        assert!(permitted_difficulty_transition(
            &params, boundary, 0x1b04be6a, 0x1b12f9a8
        ));
        assert!(permitted_difficulty_transition(
            &params, boundary, 0x1b04be6a, 0x1b012f9a
        ));
        assert!(!permitted_difficulty_transition(
            &params, boundary, 0x1b04be6a, 0x1b12f9a9
        ));
        assert!(!permitted_difficulty_transition(
            &params, boundary, 0x1b04be6a, 0x1b012f99
        ));
    }

    #[test]
    fn permitted_transition_off_boundary() {
        let params = consensus_params(Network::Mainnet);
        let boundary = params.difficulty_adjustment_interval() * 1_000;

        assert!(permitted_difficulty_transition(
            &params,
            boundary + 1,
            0x1b04be6a,
            0x1b04be6a
        ));
        assert!(!permitted_difficulty_transition(
            &params,
            boundary + 1,
            0x1b04be6a,
            0x1b04be6b
        ));

        let params = consensus_params(Network::Regtest);
        assert!(permitted_difficulty_transition(
            &params,
            boundary + 1,
            0x1b04be6a,
            0x1207ffff
        ));
    }

    #[test]
    fn dispatch_selects_rule_by_height() {
        let mut params = consensus_params(Network::Mainnet);
        params.new_pow_diff_height = 1_000;
        let n = params.pow_averaging_window as usize;

        // Legacy era, off the retarget boundary: previous bits carry over.
        let chain = make_chain(900, 10, 1_000_000, params.pow_target_spacing, 0x1b04be6a);
        let bits = get_next_work_required(&chain, None, &params).expect("next work");
        assert_eq!(bits, 0x1b04be6a);

        // Window era with a warmed window: the averaging rule answers.
        let chain = make_chain(
            2_000,
            n + 1,
            1_000_000,
            params.pow_target_spacing,
            0x1b04be6a,
        );
        let expected = next_work_required_window(&chain, None, &params).expect("window bits");
        let bits = get_next_work_required(&chain, None, &params).expect("next work");
        assert_eq!(bits, expected);
        // 18 evenly spaced headers only span twelve MTP steps, so the damped
        // timespan lands at 945 of the 1020-second window.
        assert_eq!(bits, 0x1b04651e);
    }

    #[test]
    fn dispatch_no_retargeting_returns_last_bits() {
        let mut params = consensus_params(Network::Regtest);
        params.new_pow_diff_height = 0;
        let chain = make_chain(5_000, 20, 1_000_000, params.pow_target_spacing, 0x1b04be6a);

        let bits = get_next_work_required(&chain, None, &params).expect("next work");
        assert_eq!(bits, 0x1b04be6a);
    }

    #[test]
    fn dispatch_min_difficulty_gap_returns_pow_limit() {
        let params = consensus_params(Network::Testnet);
        let n = params.pow_averaging_window as usize;
        let chain = make_chain(
            2_000,
            n + 1,
            1_000_000,
            params.pow_target_spacing,
            0x1b04be6a,
        );
        let last = chain[chain.len() - 1];

        let gap_time = last.time + params.pow_target_spacing * 6 + 1;
        let bits = get_next_work_required(&chain, Some(gap_time), &params).expect("next work");
        assert_eq!(bits, target_to_compact(&params.pow_limit));

        let on_time = last.time + params.pow_target_spacing;
        let bits = get_next_work_required(&chain, Some(on_time), &params).expect("next work");
        assert_ne!(bits, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn dispatch_insufficient_window_returns_pow_limit() {
        let mut params = consensus_params(Network::Mainnet);
        params.new_pow_diff_height = 0;
        let chain = make_chain(2_000, 5, 1_000_000, params.pow_target_spacing, 0x1b04be6a);

        let bits = get_next_work_required(&chain, None, &params).expect("next work");
        assert_eq!(bits, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn dispatch_rejects_non_contiguous_chain() {
        let params = consensus_params(Network::Mainnet);
        let mut chain = make_chain(2_000, 20, 1_000_000, params.pow_target_spacing, 0x1b04be6a);
        chain[10].height += 1;

        assert_eq!(
            get_next_work_required(&chain, None, &params),
            Err(DifficultyError::NonContiguous)
        );
    }

    #[test]
    fn empty_chain_returns_pow_limit() {
        let params = consensus_params(Network::Mainnet);
        let bits = get_next_work_required(&[], None, &params).expect("next work");
        assert_eq!(bits, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn block_proof_vectors() {
        assert_eq!(
            block_proof(0x1d00ffff).expect("proof"),
            U256::from(0x1_0001_0001u64)
        );
        assert_eq!(block_proof(0x207fffff).expect("proof"), U256::from(2u64));
        assert_eq!(block_proof(0).expect("proof"), U256::zero());
    }

    #[test]
    fn median_time_past_floor_median() {
        let chain: Vec<HeaderInfo> = [5i64, 3, 8, 1, 9]
            .iter()
            .enumerate()
            .map(|(idx, time)| HeaderInfo {
                height: idx as i64,
                time: *time,
                bits: 0x1b04be6a,
            })
            .collect();

        assert_eq!(median_time_past(&chain, 0), 5);
        assert_eq!(median_time_past(&chain, 1), 5);
        assert_eq!(median_time_past(&chain, 2), 5);
        assert_eq!(median_time_past(&chain, 3), 5);
        assert_eq!(median_time_past(&chain, 4), 5);
    }
}
