//! Consensus parameters and constants.

pub mod constants;
pub mod params;

pub use params::{consensus_params, hash256_from_hex, ConsensusParams, HexError, Network};

pub type Hash256 = [u8; 32];
