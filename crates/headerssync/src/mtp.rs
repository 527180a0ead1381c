//! Streaming median-time-past tracker.

use std::collections::VecDeque;

use chimed_consensus::constants::MTP_SPAN;

/// Keeps the last (up to eleven) header timestamps and yields the running
/// median as each new one arrives.
#[derive(Default)]
pub struct MtpTracker {
    times: VecDeque<i64>,
}

impl MtpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `time` and return the median of the present samples. The new
    /// time enters the window before the median is taken, so a header's own
    /// timestamp participates in its MTP; consensus depends on this.
    pub fn push(&mut self, time: i64) -> i64 {
        self.times.push_back(time);
        if self.times.len() > MTP_SPAN {
            self.times.pop_front();
        }

        let mut sorted: Vec<i64> = self.times.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    pub fn clear(&mut self) {
        self.times = VecDeque::new();
    }
}
