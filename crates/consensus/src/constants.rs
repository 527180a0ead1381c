//! Consensus-wide constants shared across validation.

/// Number of trailing header timestamps that feed the median-time-past.
pub const MTP_SPAN: usize = 11;

/// Maximum number of headers carried by one `headers` message (network rule).
pub const MAX_HEADERS_RESULTS: usize = 2_000;
