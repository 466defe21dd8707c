//! Session counters and throughput accounting.

use std::sync::atomic::{AtomicU64, Ordering};

/// The session-wide monotonic counters. They are bumped in-thread by the
/// engine and read lock-free by status snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    ConnectAttempts,
    IncomingConnections,
    Disconnects,
    BannedPeers,
    NumPieceRequests,
    NumPieceRejects,
    IncomingPieces,
    OutgoingPieces,
    /// Payload bytes we received but had not asked for (or already had).
    RedundantBytes,
    /// Payload bytes of pieces that failed their hash check.
    FailedBytes,
    DownloadedPayloadBytes,
    UploadedPayloadBytes,
    DownloadedProtocolBytes,
    UploadedProtocolBytes,
    ChokeCycles,
    OptimisticUnchokes,
    SnubbedPeers,
    TimedOutRequests,
}

const NUM_COUNTERS: usize = 18;

/// Monotonic `u64` counters, indexed by [`Counter`]. Increments happen on
/// the engine's tasks; reads may happen from any thread without
/// synchronization beyond the atomics themselves.
pub struct Counters {
    values: [AtomicU64; NUM_COUNTERS],
}

impl Counters {
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// Accounts the throughput of a single channel (e.g. a peer's download) by
/// round: bytes are recorded as they happen and folded into a weighted
/// running average on the once-a-second tick.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputCounter {
    /// The bytes recorded in the current round.
    round: u64,
    /// The total bytes recorded over the counter's lifetime.
    total: u64,
    /// The running average, in bytes per second, weighted towards the last
    /// few seconds.
    avg: u64,
    /// The highest per-round value seen.
    peak: u64,
}

impl ThruputCounter {
    pub fn record(&mut self, bytes: u64) {
        self.round += bytes;
    }

    /// Closes the current round (called once a second) and folds it into
    /// the running average.
    pub fn tick(&mut self) {
        self.total += self.round;
        self.peak = self.peak.max(self.round);
        // weigh the past ~4 seconds; a sudden stall decays quickly without
        // zeroing the rate outright
        self.avg = (self.avg * 3 + self.round) / 4;
        self.round = 0;
    }

    /// The running average rate in bytes per second.
    pub fn avg(&self) -> u64 {
        self.avg
    }

    pub fn total(&self) -> u64 {
        self.total + self.round
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }
}
