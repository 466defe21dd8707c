//! The hierarchical bandwidth scheduler.
//!
//! Rate limits are expressed as token-bucket [channels](BandwidthChannel):
//! one per session direction, one per peer class, one per torrent, one per
//! peer. A peer that wants to move bytes asks the [`BandwidthManager`] for
//! a quota, naming every channel its traffic traverses. The manager grants
//! immediately when no named channel is limiting, otherwise the request is
//! queued and served from the periodic quota tick with priority-weighted
//! fair shares. No channel's limit can be exceeded, because each assignment
//! is bounded by the most limiting channel of its request.

mod channel;
mod manager;

pub use {
    channel::BandwidthChannel,
    manager::{BandwidthManager, MAX_BANDWIDTH_CHANNELS},
};

/// The direction a bandwidth manager serves. Each session runs two managers,
/// one per direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Upload,
    Download,
}

/// A handle to a channel in a [`ChannelSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(usize);

/// The channel storage. All channels of a session live here so that the
/// manager can mutate any combination of them without aliasing.
pub struct ChannelSet {
    channels: Vec<BandwidthChannel>,
    free: Vec<usize>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn add(&mut self) -> ChannelId {
        if let Some(index) = self.free.pop() {
            self.channels[index] = BandwidthChannel::new();
            ChannelId(index)
        } else {
            self.channels.push(BandwidthChannel::new());
            ChannelId(self.channels.len() - 1)
        }
    }

    /// Returns a channel's slot to the set. The caller must make sure no
    /// queued bandwidth request references the channel anymore; the slot is
    /// reused by a later [`ChannelSet::add`].
    pub fn remove(&mut self, id: ChannelId) {
        debug_assert!(!self.free.contains(&id.0));
        self.channels[id.0] = BandwidthChannel::new();
        self.free.push(id.0);
    }

    pub fn get(&self, id: ChannelId) -> &BandwidthChannel {
        &self.channels[id.0]
    }

    pub fn get_mut(&mut self, id: ChannelId) -> &mut BandwidthChannel {
        &mut self.channels[id.0]
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::new()
    }
}

/// The consumer side of the bandwidth scheduler.
///
/// Implemented by peer connections (and anything else that moves rate
/// limited bytes). The manager holds consumers as `Arc<dyn BandwidthSocket>`
/// while their requests are queued.
pub trait BandwidthSocket: Send + Sync {
    /// Called when a queued request completes, with the number of bytes
    /// granted. Grants for a given consumer arrive in request order.
    fn assign_bandwidth(&self, kind: ChannelKind, amount: u32);

    /// A disconnecting consumer's queued requests are dropped, without
    /// a callback, on the next quota tick.
    fn is_disconnecting(&self) -> bool;
}
