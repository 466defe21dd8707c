//! Bookkeeping of the block request pipeline towards a single peer.
//!
//! Two ordered queues: the backlog of blocks reserved in the piece picker
//! but not yet sent (`request_queue`), and the blocks whose request message
//! has been queued or sent and whose data we are expecting
//! (`download_queue`). A block lives in at most one of the two at a time.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::BlockInfo;

/// The lower clamp on the adaptive request timeout.
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A block in the request pipeline.
#[derive(Clone, Debug)]
pub(crate) struct PendingBlock {
    pub block: BlockInfo,
    /// The number of bytes into the send buffer at which this block's
    /// request message sits. Decremented as the send buffer drains; `None`
    /// once the request has fully left the socket (or before the message is
    /// written at all).
    pub send_buffer_offset: Option<u32>,
    /// When the request message left the socket. The request timeout is
    /// measured from here.
    pub requested_at: Option<Instant>,
    /// The block is no longer reserved for us in the piece picker; other
    /// peers may pick it.
    pub not_wanted: bool,
    /// The request exceeded its timeout. The block was returned to the
    /// picker but a late response is still accepted.
    pub timed_out: bool,
    /// The block was already requested from another peer when this request
    /// was queued (endgame). At most one busy block is allowed in a peer's
    /// combined queues.
    pub busy: bool,
    /// The block is part of a time critical piece and was queued ahead of
    /// the regular backlog.
    pub time_critical: bool,
}

impl PendingBlock {
    fn new(block: BlockInfo) -> Self {
        Self {
            block,
            send_buffer_offset: None,
            requested_at: None,
            not_wanted: false,
            timed_out: false,
            busy: false,
            time_critical: false,
        }
    }

    /// Whether any of the request message's bytes are still queued in our
    /// send buffer.
    pub fn in_send_buffer(&self) -> bool {
        self.send_buffer_offset.is_some()
    }
}

/// What happened to a cancelled block.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CancelAction {
    /// The block was not queued with this peer.
    NotQueued,
    /// The block was still in the backlog; nothing was sent so there is
    /// nothing to cancel on the wire.
    RemovedFromBacklog,
    /// The request message had already left the socket; a cancel message
    /// should be emitted.
    EmitCancel,
    /// The request message is still sitting in our send buffer, so the
    /// remote will see the request shortly; no cancel is emitted for it.
    StillInSendBuffer,
}

/// How an incoming piece message relates to the download queue.
#[derive(Debug)]
pub(crate) enum IncomingMatch {
    /// The block matches the head of the download queue.
    Matched(PendingBlock),
    /// The block matches a deeper entry; the entries before it were moved
    /// back to the front of the backlog to be re-issued.
    MatchedOutOfOrder {
        matched: PendingBlock,
        reissued: usize,
    },
    /// We never asked for this block.
    NotRequested,
}

/// The two request pipeline queues of one peer, with the shared accounting
/// across them.
pub(crate) struct RequestQueues {
    /// Blocks reserved in the piece picker but not yet written to the wire.
    request_queue: VecDeque<PendingBlock>,
    /// Blocks whose request message has been queued or sent; the remote's
    /// data is expected for each.
    download_queue: VecDeque<PendingBlock>,
    /// The combined cap on the two queues.
    max_len: usize,
    /// Cached count of time critical entries in the backlog.
    queued_time_critical: usize,
    /// The sum of the block lengths in the download queue.
    outstanding_bytes: u64,
    /// Moving average of the request-to-response time, in milliseconds,
    /// driving the adaptive timeout.
    avg_rtt_ms: Option<u64>,
}

impl RequestQueues {
    pub fn new(max_len: usize) -> Self {
        Self {
            request_queue: VecDeque::new(),
            download_queue: VecDeque::new(),
            max_len,
            queued_time_critical: 0,
            outstanding_bytes: 0,
            avg_rtt_ms: None,
        }
    }

    pub fn len(&self) -> usize {
        self.request_queue.len() + self.download_queue.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_len
    }

    pub fn request_queue_len(&self) -> usize {
        self.request_queue.len()
    }

    pub fn download_queue_len(&self) -> usize {
        self.download_queue.len()
    }

    pub fn queued_time_critical(&self) -> usize {
        self.queued_time_critical
    }

    /// The number of bytes we expect the remote to send for our outstanding
    /// requests.
    pub fn outstanding_bytes(&self) -> u64 {
        debug_assert_eq!(
            self.outstanding_bytes,
            self.download_queue
                .iter()
                .map(|pb| u64::from(pb.block.len))
                .sum::<u64>()
        );
        self.outstanding_bytes
    }

    pub fn contains(&self, block: &BlockInfo) -> bool {
        self.request_queue.iter().any(|pb| pb.block == *block)
            || self.download_queue.iter().any(|pb| pb.block == *block)
    }

    pub fn has_busy(&self) -> bool {
        self.request_queue.iter().any(|pb| pb.busy)
            || self.download_queue.iter().any(|pb| pb.busy)
    }

    /// Queues a block in the backlog. Refused when the block is already
    /// queued, when the combined queues are at capacity, or when a busy
    /// block is requested while another busy block is still queued.
    pub fn add_request(
        &mut self,
        block: BlockInfo,
        busy: bool,
        time_critical: bool,
    ) -> bool {
        if self.is_full() || self.contains(&block) {
            return false;
        }
        if busy && self.has_busy() {
            return false;
        }
        let mut pb = PendingBlock::new(block);
        pb.busy = busy;
        pb.time_critical = time_critical;
        if time_critical {
            self.queued_time_critical += 1;
            self.request_queue.push_front(pb);
        } else {
            self.request_queue.push_back(pb);
        }
        true
    }

    /// Takes the next block off the backlog for writing its request message
    /// to the wire.
    pub fn pop_request(&mut self) -> Option<PendingBlock> {
        let pb = self.request_queue.pop_front()?;
        if pb.time_critical {
            self.queued_time_critical -= 1;
        }
        Some(pb)
    }

    /// Moves a block into the download queue once its request message has
    /// been written to the send buffer at `send_buffer_offset`.
    pub fn push_download(
        &mut self,
        mut pb: PendingBlock,
        send_buffer_offset: u32,
    ) {
        pb.send_buffer_offset = Some(send_buffer_offset);
        self.outstanding_bytes += u64::from(pb.block.len);
        self.download_queue.push_back(pb);
    }

    /// Adjusts the send buffer offsets after `popped` bytes have left the
    /// socket. Requests whose bytes have now fully left get their timeout
    /// clock started.
    pub fn on_bytes_flushed(&mut self, popped: usize, now: Instant) {
        for pb in self.download_queue.iter_mut() {
            if let Some(offset) = pb.send_buffer_offset {
                if u64::from(offset) < popped as u64 {
                    pb.send_buffer_offset = None;
                    pb.requested_at = Some(now);
                } else {
                    pb.send_buffer_offset = Some(offset - popped as u32);
                }
            }
        }
    }

    /// Matches an incoming block against the download queue. See
    /// [`IncomingMatch`].
    pub fn match_incoming(&mut self, block: &BlockInfo) -> IncomingMatch {
        let pos = match self
            .download_queue
            .iter()
            .position(|pb| pb.block == *block)
        {
            Some(pos) => pos,
            None => return IncomingMatch::NotRequested,
        };

        if pos == 0 {
            let pb = self.download_queue.pop_front().unwrap();
            self.outstanding_bytes -= u64::from(pb.block.len);
            return IncomingMatch::Matched(pb);
        }

        // the remote skipped over some of our requests: take the earlier
        // entries out and put them back at the front of the backlog, in
        // order, to be requested again
        let mut earlier: Vec<PendingBlock> =
            self.download_queue.drain(..pos).collect();
        let matched = self.download_queue.pop_front().unwrap();
        self.outstanding_bytes -= u64::from(matched.block.len);
        let reissued = earlier.len();
        for mut pb in earlier.drain(..).rev() {
            self.outstanding_bytes -= u64::from(pb.block.len);
            pb.send_buffer_offset = None;
            pb.requested_at = None;
            if pb.time_critical {
                self.queued_time_critical += 1;
            }
            self.request_queue.push_front(pb);
        }
        IncomingMatch::MatchedOutOfOrder { matched, reissued }
    }

    /// Cancels a single block. The caller acts on the returned
    /// [`CancelAction`].
    pub fn cancel(&mut self, block: &BlockInfo) -> CancelAction {
        if let Some(pos) = self
            .request_queue
            .iter()
            .position(|pb| pb.block == *block)
        {
            let pb = self.request_queue.remove(pos).unwrap();
            if pb.time_critical {
                self.queued_time_critical -= 1;
            }
            return CancelAction::RemovedFromBacklog;
        }
        if let Some(pos) = self
            .download_queue
            .iter()
            .position(|pb| pb.block == *block)
        {
            let pb = self.download_queue.remove(pos).unwrap();
            self.outstanding_bytes -= u64::from(pb.block.len);
            return if pb.in_send_buffer() {
                CancelAction::StillInSendBuffer
            } else {
                CancelAction::EmitCancel
            };
        }
        CancelAction::NotQueued
    }

    /// Empties only the backlog, returning its blocks. Used on a choke from
    /// a FAST peer, where outstanding requests stay queued until the remote
    /// rejects them explicitly.
    pub fn drain_request_queue(&mut self) -> Vec<PendingBlock> {
        self.queued_time_critical = 0;
        self.request_queue.drain(..).collect()
    }

    /// The moving average of the request-to-response time, if any response
    /// has been observed.
    pub fn avg_response_time_ms(&self) -> Option<u64> {
        self.avg_rtt_ms
    }

    /// Empties both queues, returning every block so the caller can give
    /// them back to the piece picker.
    pub fn drain_all(&mut self) -> Vec<PendingBlock> {
        self.queued_time_critical = 0;
        self.outstanding_bytes = 0;
        self.request_queue
            .drain(..)
            .chain(self.download_queue.drain(..))
            .collect()
    }

    /// Checks the head of the download queue against the adaptive timeout.
    /// On expiry the head is marked timed out (but kept, since a late
    /// response is still accepted) and its block is returned so the caller
    /// can give it back to the picker and snub the peer.
    pub fn timeout_head(
        &mut self,
        now: Instant,
        cap: Duration,
    ) -> Option<BlockInfo> {
        let timeout = self.request_timeout(cap);
        let head = self.download_queue.front_mut()?;
        let requested_at = head.requested_at?;
        if head.timed_out || now.duration_since(requested_at) < timeout {
            return None;
        }
        head.timed_out = true;
        head.not_wanted = true;
        Some(head.block)
    }

    /// Folds a request-to-response sample into the moving average.
    pub fn record_response_time(&mut self, rtt: Duration) {
        let ms = rtt.as_millis() as u64;
        self.avg_rtt_ms = Some(match self.avg_rtt_ms {
            // smooth over roughly the last few responses
            Some(avg) => (avg * 2 + ms) / 3,
            None => ms,
        });
    }

    /// The adaptive per-request timeout: three times the average response
    /// time, clamped between two seconds and `cap`.
    pub fn request_timeout(&self, cap: Duration) -> Duration {
        match self.avg_rtt_ms {
            Some(avg) => Duration::from_millis(avg * 3)
                .max(MIN_REQUEST_TIMEOUT)
                .min(cap),
            None => cap,
        }
    }

    pub fn download_queue(&self) -> impl Iterator<Item = &PendingBlock> {
        self.download_queue.iter()
    }

    pub fn request_queue(&self) -> impl Iterator<Item = &PendingBlock> {
        self.request_queue.iter()
    }
}
