//! Consensus parameter definitions.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    /// Largest permitted proof-of-work target, little-endian.
    pub pow_limit: Hash256,
    /// Number of prior blocks averaged by the window retarget.
    pub pow_averaging_window: i64,
    /// Maximum per-retarget difficulty drop, percent.
    pub pow_max_adjust_down: i64,
    /// Maximum per-retarget difficulty rise, percent.
    pub pow_max_adjust_up: i64,
    pub pow_target_spacing: i64,
    /// Retarget interval timespan used by the legacy rule.
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    /// Once the last block height reaches this, a block arriving more than
    /// six spacings late may use the pow-limit target.
    pub pow_allow_min_difficulty_after_height: Option<i64>,
    pub pow_no_retargeting: bool,
    /// Last height governed by the legacy retarget rule.
    pub new_pow_diff_height: i64,
    /// How far ahead of our clock a block timestamp may be, seconds.
    pub max_future_block_time: i64,
    pub minimum_chain_work: Hash256,
}

impl ConsensusParams {
    pub fn averaging_window_timespan(&self) -> i64 {
        self.pow_averaging_window * self.pow_target_spacing
    }

    pub fn min_actual_timespan(&self) -> i64 {
        (self.averaging_window_timespan() * (100 - self.pow_max_adjust_up)) / 100
    }

    pub fn max_actual_timespan(&self) -> i64 {
        (self.averaging_window_timespan() * (100 + self.pow_max_adjust_down)) / 100
    }

    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string has invalid length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }

    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        let byte = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
        *byte_out = byte;
    }
    bytes.reverse();

    Ok(bytes)
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        pow_averaging_window: 17,
        pow_max_adjust_down: 32,
        pow_max_adjust_up: 16,
        pow_target_spacing: 60,
        pow_target_timespan: 4 * 60 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_allow_min_difficulty_after_height: None,
        pow_no_retargeting: false,
        new_pow_diff_height: 144_000,
        max_future_block_time: 2 * 60 * 60,
        minimum_chain_work: hash256_from_hex(
            "0000000000000000000000000000000000000000000000000000000000100010",
        )
        .expect("mainnet minimum chain work"),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        pow_averaging_window: 17,
        pow_max_adjust_down: 32,
        pow_max_adjust_up: 16,
        pow_target_spacing: 60,
        pow_target_timespan: 4 * 60 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_allow_min_difficulty_after_height: Some(0),
        pow_no_retargeting: false,
        new_pow_diff_height: 20,
        max_future_block_time: 2 * 60 * 60,
        minimum_chain_work: [0u8; 32],
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        pow_averaging_window: 17,
        pow_max_adjust_down: 0,
        pow_max_adjust_up: 0,
        pow_target_spacing: 60,
        pow_target_timespan: 4 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_allow_min_difficulty_after_height: None,
        pow_no_retargeting: true,
        new_pow_diff_height: 0,
        max_future_block_time: 2 * 60 * 60,
        minimum_chain_work: [0u8; 32],
    }
}
