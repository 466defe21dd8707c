//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::{PeerId, BLOCK_LEN};

/// The default peerwire client id.
pub const PEERWIRE_CLIENT_ID: &PeerId = b"-pw0100-000000000000";

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub session: SessionConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults. It uses the
    /// default peerwire client id, [`PEERWIRE_CLIENT_ID`].
    pub fn new() -> Self {
        Self {
            engine: EngineConf {
                client_id: *PEERWIRE_CLIENT_ID,
            },
            session: SessionConf::default(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to other peers.
    pub client_id: PeerId,
}

/// The algorithm used to pick which interested peers get an unchoke slot
/// each choke cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChokingAlgorithm {
    /// The number of upload slots is the configured limit.
    FixedSlots,
    /// Start from the configured limit and grow the slot count while the
    /// upload link is not saturated.
    AutoExpand,
    /// The slot count is the number of peers uploading to us above a scaling
    /// rate threshold.
    RateBased,
    /// Unchoke greedily by estimated reciprocation rate until the upload
    /// budget is spent.
    BitTyrant,
}

/// How mixed TCP/uTP connections share the upload link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixedModeAlgorithm {
    /// uTP connections yield to TCP ones.
    PreferTcp,
    /// All connections are rate limited proportionally to their number.
    PeerProportional,
}

/// Session-wide settings. This is the recognized subset of the settings pack;
/// every field has a reasonable default.
#[derive(Clone, Debug)]
pub struct SessionConf {
    /// The global cap on the number of peer connections.
    pub connections_limit: usize,
    /// Incoming connections are accepted up to `connections_limit` plus this
    /// many, to give the session room to replace slower peers.
    pub connections_slack: usize,
    /// The number of upload slots (peers unchoked by us).
    pub unchoke_slots_limit: usize,
    /// The number of optimistic unchoke slots out of the upload slots.
    /// 0 means automatic: a fifth of the slots, at least one.
    pub num_optimistic_unchoke_slots: usize,
    /// Which choking algorithm drives the regular unchoke cycle.
    pub choking_algorithm: ChokingAlgorithm,

    /// The download rate cap in bytes per second applied to the session-global
    /// download channel. 0 means unlimited.
    pub download_rate_limit: u32,
    /// The upload rate cap in bytes per second applied to the session-global
    /// upload channel. 0 means unlimited.
    pub upload_rate_limit: u32,
    /// The upload rate cap for DHT traffic, in bytes per second.
    pub dht_upload_rate_limit: u32,

    /// The period of the bandwidth scheduler's quota tick.
    pub tick_interval: Duration,
    /// The period of the regular unchoke cycle.
    pub unchoke_interval: Duration,
    /// The period of the optimistic unchoke rotation.
    pub optimistic_unchoke_interval: Duration,

    /// The upper clamp on the adaptive per-request timeout.
    pub request_timeout: Duration,
    /// How long a whole piece may stay partially downloaded before its blocks
    /// are returned to the picker.
    pub piece_timeout: Duration,
    /// How long the remote may take to complete the handshake.
    pub handshake_timeout: Duration,
    /// How long the TCP connect may take.
    pub connect_timeout: Duration,
    /// Disconnect a peer when nothing is received from it for this long.
    pub inactivity_timeout: Duration,
    /// Send a keep-alive when nothing was sent for this long.
    pub keep_alive_interval: Duration,

    /// The cap on our combined outstanding request and request-backlog queues
    /// towards a single peer.
    pub max_out_request_queue: usize,
    /// The cap on the number of requests a remote peer may keep queued with
    /// us. Beyond it, FAST peers get a reject, others are dropped.
    pub max_allowed_in_request_queue: usize,

    /// When the send buffer drains below this, more payload is requested from
    /// disk so the socket never starves.
    pub send_buffer_low_watermark: usize,
    /// The cap on bytes queued in a peer's send buffer.
    pub send_buffer_watermark: usize,
    /// Percentage scaling of the watermark, applied to the adaptive estimate.
    pub send_buffer_watermark_factor: usize,

    /// The cap on the receive buffer: the largest frame we accept is a block
    /// plus the message envelope.
    pub max_receive_buffer_size: usize,

    /// The percentage of peers to turn over on the turnover cycle.
    pub peer_turnover: usize,
    /// Turnover only kicks in above this percentage of the connection limit.
    pub peer_turnover_cutoff: usize,

    /// Whether multiple connections from the same IP are admitted.
    pub allow_multiple_connections_per_ip: bool,
    /// Suppress client identification in the handshake and messages.
    pub anonymous_mode: bool,
    /// Drop connections not going through the configured proxy.
    pub force_proxy: bool,
    /// How TCP and uTP peers share the rate limits.
    pub mixed_mode_algorithm: MixedModeAlgorithm,

    /// The capacity of the alert queue; oldest alerts are dropped on
    /// overflow.
    pub alert_queue_size: usize,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            connections_limit: 200,
            connections_slack: 10,
            unchoke_slots_limit: 8,
            num_optimistic_unchoke_slots: 0,
            choking_algorithm: ChokingAlgorithm::FixedSlots,
            download_rate_limit: 0,
            upload_rate_limit: 0,
            dht_upload_rate_limit: 8000,
            tick_interval: Duration::from_millis(500),
            unchoke_interval: Duration::from_secs(15),
            optimistic_unchoke_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            piece_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(600),
            keep_alive_interval: Duration::from_secs(120),
            max_out_request_queue: 500,
            max_allowed_in_request_queue: 500,
            send_buffer_low_watermark: 10 * 1024,
            send_buffer_watermark: 500 * 1024,
            send_buffer_watermark_factor: 50,
            max_receive_buffer_size: BLOCK_LEN as usize + 1024,
            peer_turnover: 4,
            peer_turnover_cutoff: 90,
            allow_multiple_connections_per_ip: false,
            anonymous_mode: false,
            force_proxy: false,
            mixed_mode_algorithm: MixedModeAlgorithm::PreferTcp,
            alert_queue_size: 1000,
        }
    }
}

impl SessionConf {
    /// The largest message frame we accept from a peer: a block payload plus
    /// the 13 bytes of the piece message envelope.
    pub fn max_frame_len(&self) -> u32 {
        BLOCK_LEN + 13
    }

    /// The number of optimistic slots after resolving the automatic setting.
    pub fn resolved_optimistic_slots(&self) -> usize {
        if self.num_optimistic_unchoke_slots == 0 {
            (self.unchoke_slots_limit / 5).max(1)
        } else {
            self.num_optimistic_unchoke_slots
        }
    }
}
