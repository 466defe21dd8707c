//! Peer classes: named bundles of rate limits and policy flags applied to
//! subsets of peers.
//!
//! A peer's class set is computed when it attaches to the session, from an
//! address based filter and a socket-type based filter. The classes' up and
//! down channels are what the peer's bandwidth requests traverse, next to
//! the per-peer and per-torrent channels.

use std::net::IpAddr;

use crate::bandwidth::{ChannelId, ChannelKind, ChannelSet, MAX_BANDWIDTH_CHANNELS};

/// At most this many peer classes may exist in a session; class sets are
/// bitmasks of this width.
pub const MAX_PEER_CLASSES: usize = 32;

/// Identifies a peer class within the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerClassId(pub(crate) u8);

/// The set of classes a peer belongs to, as a bitmask of class ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerClassMask(u32);

impl PeerClassMask {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, id: PeerClassId) {
        debug_assert!((id.0 as usize) < MAX_PEER_CLASSES);
        self.0 |= 1 << id.0;
    }

    pub fn remove(&mut self, id: PeerClassId) {
        self.0 &= !(1 << id.0);
    }

    pub fn contains(&self, id: PeerClassId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The class ids in the mask, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = PeerClassId> + '_ {
        let bits = self.0;
        (0..MAX_PEER_CLASSES as u8)
            .filter(move |i| bits & (1 << i) != 0)
            .map(PeerClassId)
    }

    pub fn union(&self, other: PeerClassMask) -> PeerClassMask {
        PeerClassMask(self.0 | other.0)
    }

    pub fn difference(&self, other: PeerClassMask) -> PeerClassMask {
        PeerClassMask(self.0 & !other.0)
    }
}

/// A peer class: a pair of bandwidth channels plus admission policy knobs.
pub struct PeerClass {
    pub label: String,
    pub up: ChannelId,
    pub down: ChannelId,
    /// Peers in this class bypass the unchoke slot accounting (used for
    /// peers on the local network, for instance).
    pub ignore_unchoke_slots: bool,
    /// Percentage scaling of the session connection limit for peers in this
    /// class. 100 is the default (no scaling).
    pub connection_limit_factor: u32,
}

/// The session's peer classes, keyed by [`PeerClassId`].
pub struct PeerClasses {
    classes: Vec<PeerClass>,
}

impl PeerClasses {
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
        }
    }

    /// Creates a new class with its up/down channels and default policy.
    ///
    /// # Panics
    ///
    /// Panics if [`MAX_PEER_CLASSES`] classes already exist.
    pub fn new_class(
        &mut self,
        channels: &mut ChannelSet,
        label: impl Into<String>,
    ) -> PeerClassId {
        assert!(self.classes.len() < MAX_PEER_CLASSES);
        let class = PeerClass {
            label: label.into(),
            up: channels.add(),
            down: channels.add(),
            ignore_unchoke_slots: false,
            connection_limit_factor: 100,
        };
        self.classes.push(class);
        PeerClassId((self.classes.len() - 1) as u8)
    }

    pub fn get(&self, id: PeerClassId) -> &PeerClass {
        &self.classes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: PeerClassId) -> &mut PeerClass {
        &mut self.classes[id.0 as usize]
    }

    /// Projects a class set onto its bandwidth channels for one direction,
    /// in class-id order. The result is capped at the scheduler's per
    /// request channel limit; excess classes are dropped deterministically
    /// from the end.
    pub fn channels_for(
        &self,
        mask: PeerClassMask,
        kind: ChannelKind,
    ) -> Vec<ChannelId> {
        mask.iter()
            .map(|id| {
                let class = self.get(id);
                match kind {
                    ChannelKind::Upload => class.up,
                    ChannelKind::Download => class.down,
                }
            })
            .take(MAX_BANDWIDTH_CHANNELS)
            .collect()
    }

    /// The connection limit scaling for a peer in the given classes: the
    /// largest factor among them, 100 when the mask is empty.
    pub fn connection_limit_factor(&self, mask: PeerClassMask) -> u32 {
        mask.iter()
            .map(|id| self.get(id).connection_limit_factor)
            .max()
            .unwrap_or(100)
    }

    /// Whether any class in the mask exempts the peer from unchoke slot
    /// accounting.
    pub fn ignore_unchoke_slots(&self, mask: PeerClassMask) -> bool {
        mask.iter().any(|id| self.get(id).ignore_unchoke_slots)
    }
}

impl Default for PeerClasses {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps remote addresses to peer classes. Rules are evaluated in insertion
/// order; the first matching rule wins.
pub struct IpClassFilter {
    rules: Vec<(IpRange, PeerClassMask)>,
}

impl IpClassFilter {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, range: IpRange, mask: PeerClassMask) {
        self.rules.push((range, mask));
    }

    /// The classes the address maps to; empty when no rule matches.
    pub fn classes(&self, addr: &IpAddr) -> PeerClassMask {
        self.rules
            .iter()
            .find(|(range, _)| range.contains(addr))
            .map(|(_, mask)| *mask)
            .unwrap_or_default()
    }
}

impl Default for IpClassFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// A CIDR style address range.
#[derive(Clone, Copy, Debug)]
pub struct IpRange {
    pub base: IpAddr,
    pub prefix_len: u8,
}

impl IpRange {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.base, addr) {
            (IpAddr::V4(base), IpAddr::V4(addr)) => {
                let bits = u32::from(self.prefix_len.min(32));
                let mask = if bits == 0 {
                    0
                } else {
                    u32::MAX << (32 - bits)
                };
                u32::from(base) & mask == u32::from(*addr) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(addr)) => {
                let bits = u32::from(self.prefix_len.min(128));
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                u128::from(base) & mask == u128::from(*addr) & mask
            }
            _ => false,
        }
    }
}

/// The transport a peer is connected over. Only TCP is natively driven by
/// this crate; the rest arrive through the generic stream abstraction but
/// still participate in class mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Utp,
    SslTcp,
    SslUtp,
    I2p,
}

impl SocketKind {
    fn index(self) -> usize {
        match self {
            SocketKind::Tcp => 0,
            SocketKind::Utp => 1,
            SocketKind::SslTcp => 2,
            SocketKind::SslUtp => 3,
            SocketKind::I2p => 4,
        }
    }
}

const NUM_SOCKET_KINDS: usize = 5;

/// Adds or removes classes based on the peer's transport.
pub struct SocketTypeFilter {
    add: [PeerClassMask; NUM_SOCKET_KINDS],
    remove: [PeerClassMask; NUM_SOCKET_KINDS],
}

impl SocketTypeFilter {
    pub fn new() -> Self {
        Self {
            add: [PeerClassMask::empty(); NUM_SOCKET_KINDS],
            remove: [PeerClassMask::empty(); NUM_SOCKET_KINDS],
        }
    }

    pub fn add_class(&mut self, kind: SocketKind, id: PeerClassId) {
        self.add[kind.index()].insert(id);
    }

    pub fn remove_class(&mut self, kind: SocketKind, id: PeerClassId) {
        self.remove[kind.index()].insert(id);
    }

    pub fn apply(
        &self,
        kind: SocketKind,
        mask: PeerClassMask,
    ) -> PeerClassMask {
        mask.union(self.add[kind.index()])
            .difference(self.remove[kind.index()])
    }
}

impl Default for SocketTypeFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_mask_ops() {
        let mut mask = PeerClassMask::empty();
        assert!(mask.is_empty());
        mask.insert(PeerClassId(0));
        mask.insert(PeerClassId(3));
        assert!(mask.contains(PeerClassId(0)));
        assert!(!mask.contains(PeerClassId(1)));
        let ids: Vec<u8> = mask.iter().map(|id| id.0).collect();
        assert_eq!(ids, vec![0, 3]);
        mask.remove(PeerClassId(0));
        assert!(!mask.contains(PeerClassId(0)));
    }

    #[test]
    fn test_channels_projection_truncated() {
        let mut channels = ChannelSet::new();
        let mut classes = PeerClasses::new();
        let mut mask = PeerClassMask::empty();
        // more classes than a bandwidth request can carry channels
        for i in 0..12 {
            let id = classes.new_class(&mut channels, format!("c{}", i));
            mask.insert(id);
        }
        let up = classes.channels_for(mask, ChannelKind::Upload);
        assert_eq!(up.len(), MAX_BANDWIDTH_CHANNELS);
        // lowest class ids win
        assert_eq!(up[0], classes.get(PeerClassId(0)).up);
    }

    #[test]
    fn test_connection_limit_factor_takes_max() {
        let mut channels = ChannelSet::new();
        let mut classes = PeerClasses::new();
        let a = classes.new_class(&mut channels, "a");
        let b = classes.new_class(&mut channels, "b");
        classes.get_mut(b).connection_limit_factor = 150;

        let mut mask = PeerClassMask::empty();
        assert_eq!(classes.connection_limit_factor(mask), 100);
        mask.insert(a);
        mask.insert(b);
        assert_eq!(classes.connection_limit_factor(mask), 150);
    }

    #[test]
    fn test_ip_filter_first_match_wins() {
        let mut filter = IpClassFilter::new();
        let mut lan = PeerClassMask::empty();
        lan.insert(PeerClassId(1));
        let mut all = PeerClassMask::empty();
        all.insert(PeerClassId(0));
        filter.add_rule(
            IpRange {
                base: "192.168.0.0".parse().unwrap(),
                prefix_len: 16,
            },
            lan,
        );
        filter.add_rule(
            IpRange {
                base: "0.0.0.0".parse().unwrap(),
                prefix_len: 0,
            },
            all,
        );

        assert_eq!(filter.classes(&"192.168.1.2".parse().unwrap()), lan);
        assert_eq!(filter.classes(&"8.8.8.8".parse().unwrap()), all);
    }

    #[test]
    fn test_socket_type_filter() {
        let mut filter = SocketTypeFilter::new();
        let utp_class = PeerClassId(2);
        let tcp_only = PeerClassId(3);
        filter.add_class(SocketKind::Utp, utp_class);
        filter.remove_class(SocketKind::Utp, tcp_only);

        let mut mask = PeerClassMask::empty();
        mask.insert(tcp_only);

        let tcp = filter.apply(SocketKind::Tcp, mask);
        assert!(tcp.contains(tcp_only));
        assert!(!tcp.contains(utp_class));

        let utp = filter.apply(SocketKind::Utp, mask);
        assert!(utp.contains(utp_class));
        assert!(!utp.contains(tcp_only));
    }
}
