//! The bandwidth manager: queues quota requests against the channels they
//! traverse and apportions bytes on every scheduler tick.

use std::{sync::Arc, time::Duration};

use super::{BandwidthSocket, ChannelId, ChannelKind, ChannelSet};

/// A request is subject to at most this many channels; excess channels are
/// silently truncated in insertion order.
pub const MAX_BANDWIDTH_CHANNELS: usize = 10;

/// The number of ticks a queued request survives before it is dispatched
/// with whatever it has been assigned. This ensures requests get responses
/// at very low rate limits, when the requested size would take a long time
/// to satisfy.
const DEFAULT_TTL: i32 = 20;

/// A tick after a long stall is capped so catch-up doesn't burst.
const MAX_TICK_MS: u64 = 3000;

/// A queued quota request.
struct Request {
    peer: Arc<dyn BandwidthSocket>,
    /// 1 is normal priority; weights the fair share linearly.
    priority: u32,
    /// The number of bytes assigned to this request so far.
    assigned: u32,
    /// Once `assigned` reaches this, the request is dispatched.
    request_size: u32,
    ttl: i32,
    /// The limiting channels this request traverses, in insertion order.
    channels: Vec<ChannelId>,
}

impl Request {
    /// Assigns bandwidth from the most limiting of the request's channels:
    /// the priority-weighted fair share, minimized across channels, bounded
    /// by what the request still needs. Every channel is charged for the
    /// assignment.
    fn assign_bandwidth(&mut self, channels: &mut ChannelSet) -> u32 {
        debug_assert!(self.assigned < self.request_size);
        let mut quota = i64::from(self.request_size - self.assigned);
        for id in &self.channels {
            let c = channels.get(*id);
            if c.limit() == 0 {
                continue;
            }
            debug_assert!(c.tmp > 0);
            quota = quota
                .min(c.distribute_quota * i64::from(self.priority) / c.tmp as i64);
        }
        debug_assert!(quota >= 0);
        let quota = quota as u32;
        self.assigned += quota;
        for id in &self.channels {
            channels.get_mut(*id).use_quota(quota);
        }
        debug_assert!(self.assigned <= self.request_size);
        quota
    }
}

/// Coordinates all outstanding quota requests of one direction. See the
/// module documentation.
pub struct BandwidthManager {
    /// The consumers that want bandwidth, in FIFO order.
    queue: Vec<Request>,
    /// The number of bytes all queued requests are still waiting for.
    queued_bytes: u64,
    /// The direction this manager serves; passed through to the consumers'
    /// grant callback.
    kind: ChannelKind,
    abort: bool,
}

impl BandwidthManager {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            queue: Vec::new(),
            queued_bytes: 0,
            kind,
            abort: false,
        }
    }

    /// Shuts the manager down: queued requests are dropped without
    /// callbacks and later requests are refused.
    pub fn close(&mut self) {
        self.abort = true;
        self.queue.clear();
        self.queued_bytes = 0;
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    /// Whether the consumer has a request in the queue.
    pub fn is_queued(&self, peer: &Arc<dyn BandwidthSocket>) -> bool {
        self.queue.iter().any(|r| Arc::ptr_eq(&r.peer, peer))
    }

    /// Asks for `bytes` of quota on behalf of `peer`, against the given
    /// channels. Returns the number of bytes granted immediately; 0 means
    /// the request was queued and the consumer will receive
    /// [`BandwidthSocket::assign_bandwidth`] later.
    ///
    /// Channels that can cover the request up front are charged and don't
    /// queue it; only channels that are actually limiting hold the request
    /// back.
    pub fn request_bandwidth(
        &mut self,
        channels: &mut ChannelSet,
        peer: Arc<dyn BandwidthSocket>,
        bytes: u32,
        priority: u32,
        channel_ids: &[ChannelId],
    ) -> u32 {
        if self.abort {
            return 0;
        }
        debug_assert!(bytes > 0);
        debug_assert!((1..=255).contains(&priority));
        // a consumer may have at most one outstanding request per direction
        debug_assert!(!self.is_queued(&peer));

        let ids =
            &channel_ids[..channel_ids.len().min(MAX_BANDWIDTH_CHANNELS)];
        let limiting: Vec<ChannelId> = ids
            .iter()
            .copied()
            .filter(|id| channels.get_mut(*id).need_queueing(bytes))
            .collect();
        if limiting.is_empty() {
            // the connection is not rate limited by any of its channels, or
            // it doesn't belong to any; satisfy the request immediately
            return bytes;
        }

        self.queued_bytes += u64::from(bytes);
        self.queue.push(Request {
            peer,
            priority,
            assigned: 0,
            request_size: bytes,
            ttl: DEFAULT_TTL,
            channels: limiting,
        });
        0
    }

    /// Runs one distribution pass with `dt` of elapsed real time: accrues
    /// quota on every channel referenced by a queued request, hands out
    /// priority-weighted fair shares in FIFO order, and dispatches every
    /// request that either became fully assigned or ran out of ttl with a
    /// nonzero assignment.
    pub fn update_quotas(&mut self, channels: &mut ChannelSet, dt: Duration) {
        if self.abort || self.queue.is_empty() {
            return;
        }

        let dt_ms = (dt.as_millis() as u64).min(MAX_TICK_MS);

        // drop requests whose consumer is disconnecting, returning the quota
        // they had been assigned to their channels; no callback fires
        let queued_bytes = &mut self.queued_bytes;
        self.queue.retain(|r| {
            if r.peer.is_disconnecting() {
                *queued_bytes -= u64::from(r.request_size - r.assigned);
                for id in &r.channels {
                    channels.get_mut(*id).return_quota(r.assigned);
                }
                false
            } else {
                true
            }
        });

        // sum the priorities of the requests traversing each channel into
        // the channel's scratch field, collecting each distinct channel once
        for r in &self.queue {
            for id in &r.channels {
                channels.get_mut(*id).tmp = 0;
            }
        }
        let mut distinct = Vec::new();
        for r in &self.queue {
            for id in &r.channels {
                let c = channels.get_mut(*id);
                if c.tmp == 0 {
                    distinct.push(*id);
                }
                c.tmp += u64::from(r.priority);
            }
        }
        for id in &distinct {
            channels.get_mut(*id).update_quota(dt_ms);
        }

        // assign in FIFO order and collect completed requests
        let mut completed = Vec::new();
        let mut i = 0;
        while i < self.queue.len() {
            let r = &mut self.queue[i];
            r.ttl -= 1;
            let mut dispatched = r.assign_bandwidth(channels);
            if r.assigned == r.request_size
                || (r.ttl <= 0 && r.assigned > 0)
            {
                // the unassigned remainder is no longer queued either
                dispatched += r.request_size - r.assigned;
                completed.push(self.queue.remove(i));
            } else {
                i += 1;
            }
            self.queued_bytes -= u64::from(dispatched);
        }

        // callbacks run after the pass so they observe a consistent queue
        for r in completed {
            r.peer.assign_bandwidth(self.kind, r.assigned);
        }
    }
}
