//! Per-filter poll position.

use std::time::{Duration, Instant};

/// The position a poll-mode filter has observed up to.
///
/// Records the first block whose contents have not been returned, and the
/// [`Instant`] of the last successful poll. Both are advanced only after a
/// poll retrieved its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCursor {
    next_block: u64,
    last_poll: Instant,
}

impl core::fmt::Display for PollCursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "PollCursor {{ next_block: {}, ms_since_last_poll: {} }}",
            self.next_block,
            self.last_poll.elapsed().as_millis(),
        )
    }
}

impl PollCursor {
    /// Create a cursor for a filter registered while `latest` was the
    /// newest block.
    pub fn new(latest: u64) -> Self {
        Self { next_block: latest + 1, last_poll: Instant::now() }
    }

    /// First block not yet returned to the client.
    pub const fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Instant of the last successful poll, or of registration.
    pub const fn last_poll(&self) -> Instant {
        self.last_poll
    }

    /// Time since the last successful poll.
    pub fn time_since_last_poll(&self) -> Duration {
        self.last_poll.elapsed()
    }

    /// Mark the filter as having been polled up to block `latest`, with the
    /// poll having started at `started`.
    ///
    /// Never moves the cursor backwards.
    pub fn mark_polled(&mut self, latest: u64, started: Instant) {
        self.next_block = self.next_block.max(latest + 1);
        self.last_poll = self.last_poll.max(started);
    }
}
