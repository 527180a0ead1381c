//! Streaming verification of a peer's header chain during initial sync.
//!
//! One [`HeadersSyncState`] serves one peer. It accepts the peer's headers
//! in two passes: a PRESYNC pass that validates difficulty transitions and
//! accumulates total work under a strict memory bound, and a REDOWNLOAD
//! pass that re-receives the same headers, checks them against randomly
//! sampled one-bit commitments, and releases them downstream in order.

pub mod bits;
pub mod hasher;
pub mod mtp;
pub mod state;

pub use bits::BitQueue;
pub use hasher::SaltedHasher;
pub use mtp::MtpTracker;
pub use state::{
    HeadersSyncState, PeerId, ProcessingResult, SyncState, HEADER_COMMITMENT_PERIOD,
    REDOWNLOAD_BUFFER_SIZE,
};
