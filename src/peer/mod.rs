//! The peer connection: drives the wire protocol with a single remote peer.
//!
//! Each peer session runs as its own task. The session performs the
//! handshake over a framed transport, then switches to the engine's own
//! buffers: incoming bytes go through the packet-aware receive buffer and
//! outgoing messages are emitted into the chained send buffer, from which
//! a single in-flight write drains them, gated by the bandwidth scheduler.
//! Commands from the rest of the engine (bandwidth grants, choke decisions,
//! endgame cancels) arrive on the session's command channel.

pub(crate) mod codec;
mod queue;

use std::{
    collections::VecDeque,
    convert::TryInto,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{self, timeout},
};
use tokio_util::codec::Framed;

use crate::{
    alert::Alert,
    bandwidth::{BandwidthSocket, ChannelId, ChannelKind},
    counter::{Counter, ThruputCounter},
    disk::{ReadResult, ReadResultReceiver, ReadResultSender},
    error::{Error, Operation, Result, TimeoutKind},
    picker::PickOptions,
    session::{SessionCommand, SessionContext},
    torrent::SharedStatus,
    Bitfield, BlockInfo, PeerId, PieceIndex,
};

use {
    codec::*,
    queue::{CancelAction, IncomingMatch, RequestQueues},
};

/// In super-seeding mode at most this many pieces are advertised to a peer
/// at a time.
const SUPERSEED_PIECES: usize = 2;

/// How many pieces we mark allowed-fast for a FAST peer after the
/// handshake.
const ALLOWED_FAST_SET_SIZE: usize = 4;

/// The starting request pipeline depth, before the bandwidth-delay product
/// estimate takes over.
const INITIAL_QUEUE_SIZE: usize = 4;

// indices into the per-direction state arrays
const UPLOAD: usize = 0;
const DOWNLOAD: usize = 1;

/// Per-direction channel state bits.
mod channel_state {
    /// A bandwidth request is queued in the scheduler.
    pub const BW_QUEUE: u8 = 1;
    /// Blocked on the disk collaborator.
    pub const DISK: u8 = 2;
}

/// The channel on which the session and other engine parts can send
/// a command to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
#[derive(Debug)]
pub(crate) enum Command {
    /// A queued bandwidth request completed with this grant.
    BandwidthGranted { kind: ChannelKind, amount: u32 },
    /// The choker took this peer's upload slot away.
    Choke,
    /// The choker granted this peer an upload slot.
    Unchoke,
    /// Another peer delivered this block first (endgame); cancel ours.
    CancelBlock(BlockInfo),
    /// We completed a piece; announce it to the remote.
    HaveGained(PieceIndex),
    /// The peer delivered a bad piece in the past (or redeemed itself).
    SetParole(bool),
    /// A NAT holepunch exchange is in progress; relax the timeouts.
    SetHolepunchMode(bool),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The session-facing half of a peer connection: its command channel plus
/// the lock-free status fields the session, the choker and the bandwidth
/// scheduler read.
pub(crate) struct PeerHandle {
    pub cmd: Sender,
    pub status: SharedPeerStatus,
}

/// Peer state shared outside the session task. All fields are atomics,
/// updated by the session task and read lock-free by the session.
#[derive(Default)]
pub(crate) struct SharedPeerStatus {
    pub disconnecting: AtomicBool,
    pub peer_interested: AtomicBool,
    pub am_interested: AtomicBool,
    /// The remote-to-us payload rate, bytes per second.
    pub download_rate: AtomicU64,
    /// The us-to-remote payload rate, bytes per second.
    pub upload_rate: AtomicU64,
    /// The estimated reciprocation rate for the BitTyrant choker.
    pub est_reciprocation_rate: AtomicU64,
}

impl BandwidthSocket for PeerHandle {
    fn assign_bandwidth(&self, kind: ChannelKind, amount: u32) {
        // the session may be gone already; the grant is then simply lost,
        // which the disconnect path accounted for
        let _ = self.cmd.send(Command::BandwidthGranted { kind, amount });
    }

    fn is_disconnecting(&self) -> bool {
        self.status.disconnecting.load(Ordering::Relaxed)
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state during which the BitTorrent handshake is exchanged.
    Handshaking,
    /// The window right after the handshake in which the one-time piece
    /// availability messages (bitfield, have-all, have-none) are legal. It
    /// ends with the first message of any kind.
    AvailabilityExchange,
    /// The normal, operational state of a peer session.
    Connected,
    /// Terminal: no new IO is initiated, outstanding callbacks no-op.
    Disconnecting,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces we have.
    is_peer_interested: bool,
    /// Set when the last blocks of the download are outstanding on other
    /// peers too; the pipeline shrinks to one duplicate request at a time.
    in_endgame: bool,
    /// The peer failed to respond within the request timeout; the pipeline
    /// is throttled to a single request until fresh data arrives.
    is_snubbed: bool,
    /// The peer contributed to a failed piece; it only gets whole-piece
    /// downloads until it delivers a verified piece.
    on_parole: bool,
    /// A NAT traversal exchange is in progress; inactivity is tolerated.
    in_holepunch_mode: bool,
    /// The request queue size, which is the number of block requests we
    /// keep outstanding to fully saturate the link. Recalculated from the
    /// bandwidth-delay product as responses arrive.
    desired_queue_size: usize,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            in_endgame: false,
            is_snubbed: false,
            on_parole: false,
            in_holepunch_mode: false,
            desired_queue_size: INITIAL_QUEUE_SIZE,
        }
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// The remote advertised the FAST extension (BEP 6).
    fast: bool,
    /// The remote advertised extended messaging (BEP 10).
    extended: bool,
    /// The remote advertised a DHT node.
    dht: bool,
    /// The remote's advertised request queue depth, from the extended
    /// handshake.
    reqq: Option<usize>,
}

/// A peer connection. See the module documentation.
pub(crate) struct PeerSession {
    /// Session-wide state and services.
    ctx: Arc<SessionContext>,
    /// Shared information of the torrent. Present from the start on
    /// outbound connections; set when an inbound handshake names a torrent
    /// we serve.
    torrent: Option<Arc<SharedStatus>>,
    /// Our own handle; the same one the session holds in its registry. It
    /// doubles as this session's bandwidth consumer identity.
    handle: Arc<PeerHandle>,
    /// The port on which the peer session receives commands.
    cmd_port: Option<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The peer id we expect from the handshake, if the peer database knows
    /// it (outbound connections only).
    expected_peer_id: Option<PeerId>,
    /// Session related information.
    status: Status,
    /// Information about the peer, set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// All pieces the peer has, sized once a torrent is attached.
    peer_pieces: Bitfield,

    recv_buffer: crate::recv_buffer::RecvBuffer,
    frame_stage: FrameStage,
    send_buffer: crate::send_buffer::SendBuffer,
    /// While positive, flushing is suppressed so that several messages
    /// coalesce into one socket write.
    cork_depth: u32,

    /// Our requests towards the remote.
    queues: RequestQueues,
    /// The remote's pending requests towards us, in arrival order.
    incoming_requests: VecDeque<BlockInfo>,
    /// Pieces the remote may request from us even while choked.
    allowed_fast_out: Vec<PieceIndex>,
    /// Pieces we may request from the remote even while choked.
    allowed_fast_in: Vec<PieceIndex>,
    /// Pieces the remote suggested we download from it.
    suggested_pieces: Vec<PieceIndex>,
    /// The pieces currently advertised to this peer in super-seeding mode.
    superseed_pieces: Vec<PieceIndex>,

    /// Unspent bandwidth grants, per direction.
    quota: [u32; 2],
    /// Channel state bits, per direction.
    channel_state: [u8; 2],
    /// The bandwidth channels this peer's traffic traverses.
    up_channels: Vec<ChannelId>,
    down_channels: Vec<ChannelId>,

    /// Reply channel handed to the disk collaborator for block reads.
    disk_read_chan: ReadResultSender,
    disk_read_port: Option<ReadResultReceiver>,
    /// Block reads dispatched to disk but not yet answered.
    disk_reads_in_flight: usize,

    /// Payload throughput accounting, ticked once a second.
    downloaded_payload: ThruputCounter,
    uploaded_payload: ThruputCounter,

    last_send: Instant,
    last_recv: Instant,
    connect_time: Instant,
    last_incoming_request: Option<Instant>,
    last_unchoke: Option<Instant>,
}

/// Which half of the length-prefixed envelope the receive buffer is
/// currently framing.
#[derive(Clone, Copy, Debug, PartialEq)]
enum FrameStage {
    /// Collecting the 4 byte length prefix.
    Len,
    /// Collecting the message body.
    Body,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address,
    /// for the given torrent.
    pub fn outbound(
        ctx: Arc<SessionContext>,
        torrent: Arc<SharedStatus>,
        addr: SocketAddr,
        up_channels: Vec<ChannelId>,
        down_channels: Vec<ChannelId>,
        expected_peer_id: Option<PeerId>,
    ) -> (Self, Arc<PeerHandle>) {
        Self::new(
            ctx,
            Some(torrent),
            addr,
            up_channels,
            down_channels,
            expected_peer_id,
        )
    }

    /// Creates a session for an accepted socket. The torrent is determined
    /// by the info hash in the remote's handshake.
    pub fn inbound(
        ctx: Arc<SessionContext>,
        addr: SocketAddr,
        up_channels: Vec<ChannelId>,
        down_channels: Vec<ChannelId>,
    ) -> (Self, Arc<PeerHandle>) {
        Self::new(ctx, None, addr, up_channels, down_channels, None)
    }

    fn new(
        ctx: Arc<SessionContext>,
        torrent: Option<Arc<SharedStatus>>,
        addr: SocketAddr,
        up_channels: Vec<ChannelId>,
        down_channels: Vec<ChannelId>,
        expected_peer_id: Option<PeerId>,
    ) -> (Self, Arc<PeerHandle>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle {
            cmd: cmd_chan,
            status: SharedPeerStatus::default(),
        });
        let (disk_read_chan, disk_read_port) = mpsc::unbounded_channel();
        let max_receive = ctx.conf.max_receive_buffer_size;
        let max_out_request_queue = ctx.conf.max_out_request_queue;
        let now = Instant::now();
        (
            Self {
                ctx,
                torrent,
                handle: Arc::clone(&handle),
                cmd_port: Some(cmd_port),
                addr,
                expected_peer_id,
                status: Status::default(),
                peer_info: None,
                peer_pieces: Bitfield::new(),
                recv_buffer: crate::recv_buffer::RecvBuffer::new(max_receive),
                frame_stage: FrameStage::Len,
                send_buffer: crate::send_buffer::SendBuffer::new(),
                cork_depth: 0,
                queues: RequestQueues::new(max_out_request_queue),
                incoming_requests: VecDeque::new(),
                allowed_fast_out: Vec::new(),
                allowed_fast_in: Vec::new(),
                suggested_pieces: Vec::new(),
                superseed_pieces: Vec::new(),
                quota: [0; 2],
                channel_state: [0; 2],
                up_channels,
                down_channels,
                disk_read_chan,
                disk_read_port: Some(disk_read_port),
                disk_reads_in_flight: 0,
                downloaded_payload: ThruputCounter::default(),
                uploaded_payload: ThruputCounter::default(),
                last_send: now,
                last_recv: now,
                connect_time: now,
                last_incoming_request: None,
                last_unchoke: None,
            },
            handle,
        )
    }

    /// Starts an outbound peer session: connects, handshakes, and runs the
    /// session until the connection is closed or an error occurs.
    pub async fn start(mut self) {
        log::info!("Starting peer {} session", self.addr);
        self.status.state = State::Connecting;
        self.connect_time = Instant::now();
        let connected = timeout(
            self.ctx.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await;
        let socket = match connected {
            Err(_) => {
                self.disconnect(
                    Error::Timeout(TimeoutKind::Connect),
                    Operation::Connect,
                )
                .await;
                return;
            }
            Ok(Err(e)) => {
                self.disconnect(Error::Io(e), Operation::Connect).await;
                return;
            }
            Ok(Ok(socket)) => socket,
        };
        log::info!("Connected to peer {}", self.addr);
        self.run(socket, true).await;
    }

    /// Runs a session on an accepted socket.
    pub async fn accept<S>(self, socket: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.run(socket, false).await;
    }

    /// Runs an already connected outbound session (we send the handshake
    /// first).
    pub async fn run_outbound<S>(self, socket: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.run(socket, true).await;
    }

    async fn run<S>(mut self, socket: S, outbound: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.establish_and_loop(socket, outbound).await {
            Ok(()) => {
                // graceful shutdown request from the session
                self.disconnect(
                    Error::SessionShuttingDown,
                    Operation::BittorrentProtocol,
                )
                .await;
            }
            Err((e, op)) => self.disconnect(e, op).await,
        }
    }

    async fn establish_and_loop<S>(
        &mut self,
        socket: S,
        outbound: bool,
    ) -> std::result::Result<(), (Error, Operation)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        if outbound {
            let torrent = self
                .torrent
                .clone()
                .expect("outbound session without torrent");
            log::info!("Sending handshake to peer {}", self.addr);
            socket
                .send(Handshake::new(torrent.info_hash, torrent.client_id))
                .await
                .map_err(|e| (e, Operation::Handshake))?;
        }

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake =
            match timeout(self.ctx.conf.handshake_timeout, socket.next())
                .await
            {
                Err(_) => {
                    return Err((
                        Error::Timeout(TimeoutKind::Handshake),
                        Operation::Handshake,
                    ))
                }
                Ok(None) => {
                    return Err((
                        Error::Io(std::io::ErrorKind::UnexpectedEof.into()),
                        Operation::Handshake,
                    ))
                }
                Ok(Some(handshake)) => {
                    handshake.map_err(|e| (e, Operation::Handshake))?
                }
            };
        log::info!("Received handshake from peer {}", self.addr);
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // codec should only return handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        if outbound {
            // verify that the advertised torrent info hash is the same as
            // ours
            let torrent = self.torrent.as_ref().unwrap();
            if peer_handshake.info_hash != torrent.info_hash {
                log::info!("Peer {} handshake invalid info hash", self.addr);
                return Err((
                    Error::ProtocolViolation("handshake info hash mismatch"),
                    Operation::Handshake,
                ));
            }
        } else {
            // an incoming connection attaches itself to the torrent the
            // remote names, if we serve it
            let torrent = self
                .ctx
                .torrents
                .read()
                .await
                .get(&peer_handshake.info_hash)
                .cloned();
            let torrent = match torrent {
                Some(torrent) => torrent,
                None => {
                    log::info!(
                        "Peer {} handshake names unknown torrent {}",
                        self.addr,
                        hex::encode(&peer_handshake.info_hash)
                    );
                    return Err((Error::NoSuchTorrent, Operation::Handshake));
                }
            };
            self.torrent = Some(Arc::clone(&torrent));
            log::info!("Sending handshake to peer {}", self.addr);
            socket
                .send(Handshake::new(torrent.info_hash, torrent.client_id))
                .await
                .map_err(|e| (e, Operation::Handshake))?;
        }

        if let Some(expected) = self.expected_peer_id {
            if expected != peer_handshake.peer_id {
                log::info!("Peer {} advertised unexpected id", self.addr);
                return Err((Error::PeerIdMismatch, Operation::Handshake));
            }
        }

        // set basic peer information
        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            fast: peer_handshake.supports_fast(),
            extended: peer_handshake.supports_extended(),
            dht: peer_handshake.supports_dht(),
            reqq: None,
        });

        let torrent = self.torrent();
        self.peer_pieces = {
            let mut pieces = Bitfield::new();
            pieces.resize(torrent.storage.piece_count, false);
            pieces
        };
        // the torrent's rate limits now apply to this peer's traffic
        self.up_channels.push(torrent.up_channel);
        self.down_channels.push(torrent.down_channel);
        // the session routes endgame cancels and choke decisions by torrent
        let _ = self.ctx.cmd.send(SessionCommand::PeerAttached {
            addr: self.addr,
            torrent_id: torrent.id,
        });

        self.ctx.alerts.post(Alert::PeerConnected {
            addr: self.addr,
            peer_id: peer_handshake.peer_id,
        });

        // now that we have the handshake, we need to switch to the message
        // framing (note that we need to keep the buffer from the handshake
        // codec as it may contain bytes of any message the peer may have
        // sent after the handshake)
        let parts = socket.into_parts();
        let leftover = parts.read_buf;
        let socket = parts.io;

        self.status.state = State::AvailabilityExchange;
        log::info!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );

        self.msg_loop(socket, &leftover).await
    }

    /// The main session loop: reads messages from the socket (as the
    /// download bandwidth allows), executes commands from the engine and
    /// runs the once-a-second maintenance tick.
    async fn msg_loop<S>(
        &mut self,
        socket: S,
        leftover: &[u8],
    ) -> std::result::Result<(), (Error, Operation)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut read_half, mut write_half) = tokio::io::split(socket);
        let mut cmd_port =
            self.cmd_port.take().expect("peer session started twice");
        let mut disk_port = self.disk_read_port.take().unwrap();

        // advertise our piece availability and extensions in one write
        self.cork();
        self.send_availability()
            .await
            .map_err(|e| (e, Operation::BittorrentProtocol))?;
        self.uncork();
        self.flush(&mut write_half)
            .await
            .map_err(|e| (e, Operation::SockWrite))?;

        // frame the first length prefix; bytes the remote sent right after
        // its handshake are carried over from the handshake codec
        self.recv_buffer
            .reset(4)
            .expect("length prefix exceeds receive buffer cap");
        self.frame_stage = FrameStage::Len;
        if !leftover.is_empty() {
            self.handle_incoming_bytes(leftover, &mut write_half)
                .await?;
        }

        let mut read_buf = vec![0u8; 17 * 1024];
        let mut tick = time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            if self.status.state == State::Disconnecting {
                return Ok(());
            }
            self.maybe_request_bandwidth(DOWNLOAD);
            self.maybe_request_bandwidth(UPLOAD);
            let read_limit = (self.quota[DOWNLOAD] as usize)
                .min(read_buf.len());

            tokio::select! {
                read = read_half.read(&mut read_buf[..read_limit]),
                    if read_limit > 0 =>
                {
                    let n = read.map_err(|e| {
                        (Error::Io(e), Operation::SockRead)
                    })?;
                    if n == 0 {
                        return Err((
                            Error::Io(
                                std::io::ErrorKind::UnexpectedEof.into(),
                            ),
                            Operation::SockRead,
                        ));
                    }
                    self.quota[DOWNLOAD] -= n as u32;
                    self.last_recv = Instant::now();
                    self.ctx.counters.add(
                        Counter::DownloadedProtocolBytes,
                        n as u64,
                    );
                    self.handle_incoming_bytes(&read_buf[..n], &mut write_half)
                        .await?;
                }
                cmd = cmd_port.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            return Ok(());
                        }
                        Some(cmd) => {
                            self.handle_cmd(cmd)
                                .await
                                .map_err(|e| {
                                    (e, Operation::BittorrentProtocol)
                                })?;
                            self.flush(&mut write_half).await.map_err(|e| {
                                (e, Operation::SockWrite)
                            })?;
                        }
                    }
                }
                read_result = disk_port.recv() => {
                    // we hold a sender ourselves, so the channel can't close
                    let read_result =
                        read_result.expect("disk read channel closed");
                    self.on_block_read(read_result)?;
                    self.flush(&mut write_half).await.map_err(|e| {
                        (e, Operation::SockWrite)
                    })?;
                }
                _ = tick.tick() => {
                    self.on_tick().await?;
                    self.flush(&mut write_half).await.map_err(|e| {
                        (e, Operation::SockWrite)
                    })?;
                }
            }
        }
    }

    /// Feeds received bytes through the receive buffer, handling every
    /// message that completes, and flushes whatever those handlers queued
    /// for sending.
    async fn handle_incoming_bytes<W>(
        &mut self,
        bytes: &[u8],
        write_half: &mut W,
    ) -> std::result::Result<(), (Error, Operation)>
    where
        W: AsyncWrite + Unpin,
    {
        let msgs = self
            .feed(bytes)
            .map_err(|e| (e, Operation::BittorrentProtocol))?;
        self.cork();
        for msg in msgs {
            if self.status.state == State::Disconnecting {
                break;
            }
            self.handle_msg(msg)
                .await
                .map_err(|e| (e, Operation::BittorrentProtocol))?;
        }
        self.uncork();
        self.flush(write_half)
            .await
            .map_err(|e| (e, Operation::SockWrite))
    }

    /// Runs received bytes through the length-prefix framing and parses
    /// every completed message frame.
    fn feed(&mut self, mut src: &[u8]) -> Result<Vec<Message>> {
        let mut msgs = Vec::new();
        while !src.is_empty() {
            let (consumed, complete) = self.recv_buffer.write(src);
            src = &src[consumed..];
            if !complete {
                break;
            }
            match self.frame_stage {
                FrameStage::Len => {
                    let len = u32::from_be_bytes(
                        self.recv_buffer.packet().try_into().unwrap(),
                    ) as usize;
                    self.recv_buffer.advance_packet();
                    if len == 0 {
                        // keep alive
                        log::debug!("Peer {} sent keep alive", self.addr);
                        self.recv_buffer.reset(4)?;
                        continue;
                    }
                    if len > self.ctx.conf.max_frame_len() as usize {
                        log::warn!(
                            "Peer {} sent oversized frame ({} bytes)",
                            self.addr,
                            len
                        );
                        return Err(Error::ProtocolViolation(
                            "message too large",
                        ));
                    }
                    self.recv_buffer.reset(len)?;
                    self.frame_stage = FrameStage::Body;
                }
                FrameStage::Body => {
                    let msg = Message::parse(self.recv_buffer.packet())?;
                    self.recv_buffer.advance_packet();
                    self.recv_buffer.reset(4)?;
                    self.frame_stage = FrameStage::Len;
                    match msg {
                        Some(msg) => msgs.push(msg),
                        // unknown message ids are ignored
                        None => log::debug!(
                            "Peer {} sent unknown message, ignoring",
                            self.addr
                        ),
                    }
                }
            }
        }
        Ok(msgs)
    }

    /// Advertises our piece availability (and the optional post-handshake
    /// messages) right after the handshake.
    async fn send_availability(&mut self) -> Result<()> {
        let torrent = self.torrent();
        let own_pieces = torrent.own_pieces.read().await.clone();
        let peer_fast = self.peer_fast();

        if torrent.is_superseeding() {
            // in super-seeding mode we hide our real piece set and hand out
            // pieces one peer at a time via synthetic have messages
            if peer_fast {
                Message::HaveNone.encode(&mut self.send_buffer);
            } else {
                let mut none = Bitfield::new();
                none.resize(torrent.storage.piece_count, false);
                Message::Bitfield(none).encode(&mut self.send_buffer);
            }
            self.advertise_superseed_pieces(&own_pieces);
        } else if own_pieces.not_any() {
            if peer_fast {
                Message::HaveNone.encode(&mut self.send_buffer);
            }
            // without FAST the bitfield is optional and an empty one is
            // not worth a frame
        } else if own_pieces.all() && peer_fast {
            Message::HaveAll.encode(&mut self.send_buffer);
        } else {
            Message::Bitfield(own_pieces.clone())
                .encode(&mut self.send_buffer);
        }

        // mark a few pieces the remote may download even while choked
        if peer_fast && !torrent.is_superseeding() {
            self.generate_allowed_fast(&own_pieces);
        }

        if self.peer_extended() {
            let mut handshake = ExtendedHandshake::default();
            if !self.ctx.conf.anonymous_mode {
                handshake.v =
                    Some(format!("peerwire {}", env!("CARGO_PKG_VERSION")));
            }
            handshake.reqq =
                Some(self.ctx.conf.max_allowed_in_request_queue as i64);
            Message::Extended {
                id: 0,
                payload: handshake.to_bencode().into(),
            }
            .encode(&mut self.send_buffer);
        }
        Ok(())
    }

    /// Computes and announces the peer's canonical allowed-fast set (BEP 6)
    /// restricted to pieces we can actually serve.
    fn generate_allowed_fast(&mut self, own_pieces: &Bitfield) {
        let torrent = self.torrent();
        let set = allowed_fast_set(
            ALLOWED_FAST_SET_SIZE,
            &self.addr.ip(),
            &torrent.info_hash,
            torrent.storage.piece_count,
        );
        for index in set {
            if !own_pieces.get(index).map(|b| *b).unwrap_or(false) {
                continue;
            }
            self.allowed_fast_out.push(index);
            Message::AllowedFast { piece_index: index }
                .encode(&mut self.send_buffer);
        }
    }

    /// Advertises up to [`SUPERSEED_PIECES`] pieces the peer doesn't have
    /// yet via synthetic have messages.
    fn advertise_superseed_pieces(&mut self, own_pieces: &Bitfield) {
        while self.superseed_pieces.len() < SUPERSEED_PIECES {
            let next = own_pieces.iter_ones().find(|i| {
                !self.superseed_pieces.contains(i)
                    && !self.peer_pieces.get(*i).map(|b| *b).unwrap_or(true)
            });
            match next {
                Some(index) => {
                    self.superseed_pieces.push(index);
                    Message::Have { piece_index: index }
                        .encode(&mut self.send_buffer);
                }
                None => break,
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::BandwidthGranted { kind, amount } => {
                let dir = match kind {
                    ChannelKind::Upload => UPLOAD,
                    ChannelKind::Download => DOWNLOAD,
                };
                log::trace!(
                    "Peer {} granted {} bytes of {:?} bandwidth",
                    self.addr,
                    amount,
                    kind
                );
                self.channel_state[dir] &= !channel_state::BW_QUEUE;
                self.quota[dir] = self.quota[dir].saturating_add(amount);
            }
            Command::Choke => self.choke_peer(),
            Command::Unchoke => {
                if self.status.is_peer_choked {
                    self.status.is_peer_choked = false;
                    self.last_unchoke = Some(Instant::now());
                    Message::Unchoke.encode(&mut self.send_buffer);
                }
            }
            Command::CancelBlock(block) => {
                // another peer got there first; drop our duplicate
                self.cancel_request(block, false).await?;
            }
            Command::HaveGained(piece_index) => {
                self.on_piece_gained(piece_index).await?;
            }
            Command::SetParole(on_parole) => {
                self.status.on_parole = on_parole;
            }
            Command::SetHolepunchMode(on) => {
                self.status.in_holepunch_mode = on;
            }
            Command::Shutdown => unreachable!("handled by the select loop"),
        }
        Ok(())
    }

    /// Takes the peer's upload slot away: sends choke and rejects (FAST) or
    /// drops its queued requests.
    fn choke_peer(&mut self) {
        if self.status.is_peer_choked {
            return;
        }
        self.status.is_peer_choked = true;
        Message::Choke.encode(&mut self.send_buffer);
        let peer_fast = self.peer_fast();
        for block in std::mem::take(&mut self.incoming_requests) {
            if peer_fast {
                Message::RejectRequest(block).encode(&mut self.send_buffer);
            }
        }
    }

    /// Announces a freshly completed piece and re-evaluates our interest.
    async fn on_piece_gained(&mut self, piece_index: PieceIndex) -> Result<()> {
        let superseeding = self
            .torrent
            .as_ref()
            .map(|t| t.is_superseeding())
            .unwrap_or_default();
        // in super-seeding mode piece announcements are driven by the
        // rotation, not by completion
        if !superseeding
            && !self.peer_pieces.get(piece_index).map(|b| *b).unwrap_or(true)
        {
            Message::Have { piece_index }.encode(&mut self.send_buffer);
        }
        self.update_interest().await
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            self.addr
        );

        // the one-time piece availability messages are only legal as the
        // very first message after the handshake
        if self.status.state == State::AvailabilityExchange {
            let handled = match &msg {
                Message::Bitfield(bitfield) => {
                    let bitfield = bitfield.clone();
                    self.handle_bitfield(bitfield).await?;
                    true
                }
                Message::HaveAll => {
                    self.require_fast()?;
                    let count = self.peer_pieces.len();
                    self.peer_pieces = {
                        let mut pieces = Bitfield::new();
                        pieces.resize(count, true);
                        pieces
                    };
                    self.update_interest().await?;
                    true
                }
                Message::HaveNone => {
                    self.require_fast()?;
                    // the default piece set is already empty
                    true
                }
                _ => false,
            };
            // enter the connected state; any availability message from here
            // on is a protocol violation
            self.status.state = State::Connected;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );
            if handled {
                return Ok(());
            }
        } else if matches!(
            msg,
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone
        ) {
            log::warn!(
                "Peer {} sent piece availability after handshake window",
                self.addr
            );
            return Err(Error::ProtocolViolation(
                "bitfield not after handshake",
            ));
        }

        match msg {
            Message::Bitfield(_)
            | Message::HaveAll
            | Message::HaveNone
            | Message::KeepAlive => unreachable!("handled above"),
            Message::Choke => self.on_choke().await?,
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline if we're interested
                    self.make_requests().await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    self.handle
                        .status
                        .peer_interested
                        .store(true, Ordering::Relaxed);
                    let _ =
                        self.ctx.cmd.send(SessionCommand::ScheduleRechoke);
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                    self.handle
                        .status
                        .peer_interested
                        .store(false, Ordering::Relaxed);
                    let _ =
                        self.ctx.cmd.send(SessionCommand::ScheduleRechoke);
                }
            }
            Message::Have { piece_index } => {
                self.on_have(piece_index).await?;
            }
            Message::Request(block) => self.on_request(block).await?,
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.on_block(block_info, data).await?;
                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests().await?;
            }
            Message::Cancel(block) => {
                if let Some(pos) =
                    self.incoming_requests.iter().position(|b| *b == block)
                {
                    self.incoming_requests.remove(pos);
                }
            }
            Message::RejectRequest(block) => self.on_reject(block).await?,
            Message::AllowedFast { piece_index } => {
                self.on_allowed_fast(piece_index).await?;
            }
            Message::Suggest { piece_index } => {
                self.validate_piece_index(piece_index)?;
                if !self.suggested_pieces.contains(&piece_index) {
                    self.suggested_pieces.push(piece_index);
                }
            }
            Message::DhtPort(port) => {
                if self.peer_info.as_ref().map(|i| i.dht).unwrap_or_default()
                {
                    self.ctx.alerts.post(Alert::DhtPort {
                        addr: self.addr,
                        port,
                    });
                }
            }
            Message::Extended { id, payload } => {
                if id == 0 {
                    let handshake =
                        ExtendedHandshake::from_bencode(&payload)?;
                    log::debug!(
                        "Peer {} extended handshake: {:?}",
                        self.addr,
                        handshake
                    );
                    if let Some(info) = &mut self.peer_info {
                        info.reqq =
                            handshake.reqq.filter(|r| *r > 0).map(|r| r as usize);
                    }
                } else if let Some(extensions) = &self.ctx.extensions {
                    let _ = extensions.send((self.addr, id, payload));
                }
            }
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, mut bitfield: Bitfield) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        let piece_count = self.torrent().storage.piece_count;
        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Therefore, we need to slice off
        // the last part of the bitfield.
        if bitfield.len() < piece_count {
            return Err(Error::ProtocolViolation("bitfield too short"));
        }
        bitfield.resize(piece_count, false);
        self.peer_pieces = bitfield;
        self.update_interest().await
    }

    async fn on_choke(&mut self) -> Result<()> {
        if self.status.is_choked {
            return Ok(());
        }
        log::info!("Peer {} choked us", self.addr);
        self.status.is_choked = true;

        // without FAST the remote won't serve (or reject) anything that was
        // outstanding, so everything goes back to the picker; with FAST the
        // in-flight requests stay until explicitly rejected
        let drained = if self.peer_fast() {
            self.queues.drain_request_queue()
        } else {
            self.queues.drain_all()
        };
        if !drained.is_empty() {
            let torrent = self.torrent();
            let mut picker = torrent.piece_picker.write().await;
            for pb in &drained {
                if !pb.not_wanted && !pb.busy {
                    picker.abort_download(pb.block);
                }
            }
        }
        Ok(())
    }

    async fn on_have(&mut self, piece_index: PieceIndex) -> Result<()> {
        self.validate_piece_index(piece_index)?;
        if self.peer_pieces.get(piece_index).map(|b| *b).unwrap_or(false) {
            return Ok(());
        }
        self.peer_pieces.set(piece_index, true);

        // in super-seeding mode a peer reporting one of its handed out
        // pieces earns the next one
        if let Some(pos) = self
            .superseed_pieces
            .iter()
            .position(|i| *i == piece_index)
        {
            self.superseed_pieces.remove(pos);
            let torrent = self.torrent();
            if torrent.is_superseeding() {
                let own_pieces = torrent.own_pieces.read().await.clone();
                self.advertise_superseed_pieces(&own_pieces);
            }
        }

        self.update_interest().await
    }

    /// Validates and admits a block request from the remote, or rejects it.
    async fn on_request(&mut self, block: BlockInfo) -> Result<()> {
        log::debug!("Peer {} requested block {}", self.addr, block);
        self.ctx.counters.inc(Counter::NumPieceRequests);
        let torrent = self.torrent();

        let have_piece = torrent
            .own_pieces
            .read()
            .await
            .get(block.piece_index)
            .map(|b| *b)
            .unwrap_or(false);
        if !torrent.storage.is_valid_block(&block) || !have_piece {
            log::warn!(
                "Peer {} requested invalid block {}",
                self.addr,
                block
            );
            self.reject_request(block);
            return Ok(());
        }
        if self.status.is_peer_choked
            && !self.allowed_fast_out.contains(&block.piece_index)
        {
            log::debug!(
                "Peer {} requested block {} while choked",
                self.addr,
                block
            );
            self.reject_request(block);
            return Ok(());
        }
        if self.incoming_requests.len()
            >= self.ctx.conf.max_allowed_in_request_queue
        {
            log::warn!("Peer {} request queue saturated", self.addr);
            self.reject_request(block);
            return Ok(());
        }
        if self.incoming_requests.contains(&block) {
            return Ok(());
        }

        self.incoming_requests.push_back(block);
        self.last_incoming_request = Some(Instant::now());
        // fetch the payload; the piece message goes out when the read
        // completes
        torrent.disk.read_block(
            torrent.id,
            block,
            self.disk_read_chan.clone(),
        )?;
        self.disk_reads_in_flight += 1;
        self.channel_state[UPLOAD] |= channel_state::DISK;
        Ok(())
    }

    fn reject_request(&mut self, block: BlockInfo) {
        self.ctx.counters.inc(Counter::NumPieceRejects);
        if self.peer_fast() {
            Message::RejectRequest(block).encode(&mut self.send_buffer);
        }
    }

    /// Verifies block validity, matches it against our outstanding
    /// requests, hands it to the disk collaborator and updates the pipeline
    /// statistics.
    async fn on_block(
        &mut self,
        block_info: BlockInfo,
        data: bytes::Bytes,
    ) -> Result<()> {
        log::info!(
            "Received block from peer {}: {}",
            self.addr,
            block_info
        );
        self.ctx.counters.inc(Counter::IncomingPieces);
        self.ctx
            .counters
            .add(Counter::DownloadedPayloadBytes, u64::from(block_info.len));
        self.downloaded_payload.record(u64::from(block_info.len));

        let matched = match self.queues.match_incoming(&block_info) {
            IncomingMatch::NotRequested => {
                log::warn!(
                    "Peer {} sent not requested block: {}",
                    self.addr,
                    block_info,
                );
                self.ctx.counters.add(
                    Counter::RedundantBytes,
                    u64::from(block_info.len),
                );
                return Ok(());
            }
            IncomingMatch::Matched(pb) => pb,
            IncomingMatch::MatchedOutOfOrder { matched, reissued } => {
                log::debug!(
                    "Peer {} answered out of order, re-issuing {} requests",
                    self.addr,
                    reissued
                );
                matched
            }
        };

        // fresh payload clears a snub
        if self.status.is_snubbed {
            log::info!("Peer {} no longer snubbed", self.addr);
            self.status.is_snubbed = false;
        }
        if let Some(requested_at) = matched.requested_at {
            self.queues
                .record_response_time(requested_at.elapsed());
            self.update_desired_queue_size();
        }

        let torrent = self.torrent();
        {
            let mut picker = torrent.piece_picker.write().await;
            if matched.timed_out && picker.is_downloaded(block_info) {
                // the block was re-assigned after timing out and someone
                // else delivered it first
                self.ctx.counters.add(
                    Counter::RedundantBytes,
                    u64::from(block_info.len),
                );
                return Ok(());
            }
            picker.received_block(block_info);
        }

        // the session attributes the block to us for the eventual hash
        // check; in endgame it also cancels the duplicates in flight on
        // the torrent's other peers
        let _ = self.ctx.cmd.send(SessionCommand::BlockReceived {
            torrent_id: torrent.id,
            block: block_info,
            from: self.addr,
            endgame: self.status.in_endgame || matched.busy,
        });

        // validate and save the block to disk by sending a write command to
        // the disk task
        torrent.disk.write_block(torrent.id, block_info, data)?;
        Ok(())
    }

    async fn on_reject(&mut self, block: BlockInfo) -> Result<()> {
        self.require_fast()?;
        log::debug!("Peer {} rejected request {}", self.addr, block);
        match self.queues.cancel(&block) {
            CancelAction::NotQueued => {
                // a spurious reject is tolerated
                log::debug!(
                    "Peer {} rejected block we never requested",
                    self.addr
                );
            }
            _ => {
                let torrent = self.torrent();
                torrent
                    .piece_picker
                    .write()
                    .await
                    .abort_download(block);
            }
        }
        Ok(())
    }

    async fn on_allowed_fast(&mut self, piece_index: PieceIndex) -> Result<()> {
        self.require_fast()?;
        self.validate_piece_index(piece_index)?;
        if !self.allowed_fast_in.contains(&piece_index) {
            self.allowed_fast_in.push(piece_index);
        }
        // an allowed-fast piece may be downloadable right away, even while
        // choked
        self.make_requests().await
    }

    /// Handles a completed disk read: emits the piece message with the
    /// cache block as its zero-copy payload, unless the request was
    /// cancelled in the meantime.
    fn on_block_read(
        &mut self,
        read: ReadResult,
    ) -> std::result::Result<(), (Error, Operation)> {
        debug_assert!(self.disk_reads_in_flight > 0);
        self.disk_reads_in_flight -= 1;
        if self.disk_reads_in_flight == 0 {
            self.channel_state[UPLOAD] &= !channel_state::DISK;
        }
        if self.status.state == State::Disconnecting {
            return Ok(());
        }

        let data = match read.result {
            Ok(data) => data,
            Err(e) => {
                return Err((Error::Disk(e), Operation::Allocate));
            }
        };
        let pos = self
            .incoming_requests
            .iter()
            .position(|b| *b == read.info);
        match pos {
            Some(pos) => {
                self.incoming_requests.remove(pos);
            }
            // cancelled while the read was in flight; drop the data (which
            // unpins the cache block)
            None => return Ok(()),
        }

        log::debug!(
            "Sending block {} to peer {}",
            read.info,
            self.addr
        );
        let len = data.len() as u32;
        debug_assert_eq!(len, read.info.len);
        codec::encode_piece_header(
            &mut self.send_buffer,
            read.info.piece_index,
            read.info.offset,
            len,
        );
        let used = data.len();
        self.send_buffer.append_owned(data, used);
        self.ctx.counters.inc(Counter::OutgoingPieces);
        self.ctx
            .counters
            .add(Counter::UploadedPayloadBytes, u64::from(len));
        self.uploaded_payload.record(u64::from(len));
        Ok(())
    }

    /// Recomputes whether the peer has pieces we lack, and announces
    /// interest transitions.
    async fn update_interest(&mut self) -> Result<()> {
        let torrent = self.torrent();
        let interested = {
            let own_pieces = torrent.own_pieces.read().await;
            self.peer_pieces
                .iter_ones()
                .any(|index| !own_pieces.get(index).map(|b| *b).unwrap_or(false))
        };
        if interested == self.status.is_interested {
            return Ok(());
        }
        self.status.is_interested = interested;
        self.handle
            .status
            .am_interested
            .store(interested, Ordering::Relaxed);
        if interested {
            log::info!("Interested in peer {}", self.addr);
            Message::Interested.encode(&mut self.send_buffer);
            self.make_requests().await?;
        } else {
            log::info!("No longer interested in peer {}", self.addr);
            Message::NotInterested.encode(&mut self.send_buffer);
        }
        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests: reserves blocks in the picker and drains the backlog into
    /// the wire while the outstanding queue has room.
    async fn make_requests(&mut self) -> Result<()> {
        if self.status.state != State::Connected
            || !self.status.is_interested
        {
            return Ok(());
        }
        let torrent = self.torrent();
        if torrent.is_paused() {
            return Ok(());
        }
        // while choked only allowed-fast pieces may be requested
        let restrict_to = if self.status.is_choked {
            if !self.peer_fast() || self.allowed_fast_in.is_empty() {
                return Ok(());
            }
            Some(self.allowed_fast_in.clone())
        } else {
            None
        };

        let target = self.target_request_queue_len();
        let want = target.saturating_sub(self.queues.len());
        if want > 0 {
            let opts = PickOptions {
                prefer_contiguous: false,
                endgame: false,
                whole_pieces: self.status.on_parole,
                restrict_to,
            };
            let peer_id =
                self.peer_info.as_ref().map(|i| i.peer_id).unwrap_or_default();
            let mut blocks = Vec::new();
            {
                let mut picker = torrent.piece_picker.write().await;
                // the remote knows best what it can serve quickly; try its
                // suggested pieces before the picker's general order
                if opts.restrict_to.is_none()
                    && !self.suggested_pieces.is_empty()
                {
                    let suggested_opts = PickOptions {
                        restrict_to: Some(self.suggested_pieces.clone()),
                        ..opts.clone()
                    };
                    picker.pick_blocks(
                        &self.peer_pieces,
                        &suggested_opts,
                        want,
                        &mut blocks,
                    );
                }
                picker.pick_blocks(
                    &self.peer_pieces,
                    &opts,
                    want - blocks.len(),
                    &mut blocks,
                );
                for block in &blocks {
                    picker.mark_downloading(*block, peer_id);
                }

                // nothing regular left to pick: if we still owe the remote
                // nothing and remain interested, the download is in its
                // endgame and duplicate requests are allowed
                if blocks.is_empty() && self.queues.len() == 0 {
                    if !self.status.in_endgame {
                        log::info!(
                            "Peer {} session entering endgame",
                            self.addr
                        );
                        self.status.in_endgame = true;
                    }
                    let endgame_opts = PickOptions {
                        endgame: true,
                        ..opts
                    };
                    let mut dup = Vec::new();
                    picker.pick_blocks(
                        &self.peer_pieces,
                        &endgame_opts,
                        1,
                        &mut dup,
                    );
                    drop(picker);
                    for block in dup {
                        self.queues.add_request(block, true, false);
                    }
                } else {
                    drop(picker);
                    for block in blocks {
                        if !self.queues.add_request(block, false, false) {
                            // couldn't queue after all; hand it back
                            torrent
                                .piece_picker
                                .write()
                                .await
                                .abort_download(block);
                        }
                    }
                }
            }
        }

        // drain the backlog into the wire
        while self.queues.download_queue_len() < target {
            let pb = match self.queues.pop_request() {
                Some(pb) => pb,
                None => break,
            };
            log::debug!(
                "Requesting block {} from peer {}",
                pb.block,
                self.addr
            );
            let offset = self.send_buffer.len() as u32;
            let block = pb.block;
            Message::Request(block).encode(&mut self.send_buffer);
            self.queues.push_download(pb, offset);
        }
        Ok(())
    }

    /// Cancels one of our requests towards the remote. With `force` the
    /// block is also handed back to the picker (otherwise the caller
    /// already accounted for it, e.g. an endgame duplicate that arrived
    /// from elsewhere).
    async fn cancel_request(
        &mut self,
        block: BlockInfo,
        force: bool,
    ) -> Result<()> {
        let action = self.queues.cancel(&block);
        log::debug!(
            "Cancelling block {} of peer {}: {:?}",
            block,
            self.addr,
            action
        );
        if let CancelAction::EmitCancel = action {
            Message::Cancel(block).encode(&mut self.send_buffer);
        }
        if force && !matches!(action, CancelAction::NotQueued) {
            let torrent = self.torrent();
            torrent.piece_picker.write().await.abort_download(block);
        }
        // the pipeline may have room again
        self.make_requests().await
    }

    /// The request pipeline depth we currently aim for.
    fn target_request_queue_len(&self) -> usize {
        if self.status.is_snubbed || self.status.in_endgame {
            return 1;
        }
        let mut target = self.status.desired_queue_size;
        if let Some(reqq) =
            self.peer_info.as_ref().and_then(|info| info.reqq)
        {
            target = target.min(reqq);
        }
        target.min(self.ctx.conf.max_out_request_queue).max(1)
    }

    /// Recalculates the optimal request queue length from the
    /// bandwidth-delay product, so the pipeline keeps one round trip's
    /// worth of requests outstanding.
    fn update_desired_queue_size(&mut self) {
        let rate = self.downloaded_payload.avg();
        let rtt_ms = match self.queues.avg_response_time_ms() {
            Some(ms) => ms.max(1),
            None => return,
        };
        let bdp_blocks =
            (rate * rtt_ms / 1000 / u64::from(crate::BLOCK_LEN)) as usize;
        self.status.desired_queue_size = bdp_blocks
            .max(INITIAL_QUEUE_SIZE)
            .min(self.ctx.conf.max_out_request_queue);
    }

    /// Queues a bandwidth request with the session's scheduler when the
    /// direction is out of quota (and there is something to move).
    fn maybe_request_bandwidth(&mut self, dir: usize) {
        if self.channel_state[dir] & channel_state::BW_QUEUE != 0 {
            return;
        }
        if self.torrent.is_none() {
            // not attached yet; the handshake is not rate limited
            return;
        }
        let (kind, bytes, channels) = match dir {
            UPLOAD => {
                if self.quota[UPLOAD] > 0 || self.send_buffer.is_empty() {
                    return;
                }
                let bytes = self
                    .send_buffer
                    .len()
                    .min(self.ctx.conf.send_buffer_watermark)
                    as u32;
                (ChannelKind::Upload, bytes, self.up_channels.clone())
            }
            _ => {
                if self.quota[DOWNLOAD] > 0 {
                    return;
                }
                let bytes = self.ctx.conf.max_receive_buffer_size as u32;
                (ChannelKind::Download, bytes, self.down_channels.clone())
            }
        };
        let sent = self.ctx.cmd.send(SessionCommand::RequestBandwidth {
            kind,
            bytes,
            priority: 1,
            socket: Arc::clone(&self.handle) as Arc<dyn BandwidthSocket>,
            channels,
        });
        if sent.is_ok() {
            self.channel_state[dir] |= channel_state::BW_QUEUE;
        }
    }

    /// Suppresses flushing until the matching [`PeerSession::uncork`], so
    /// that several messages coalesce into a single socket write.
    fn cork(&mut self) {
        self.cork_depth += 1;
    }

    fn uncork(&mut self) {
        debug_assert!(self.cork_depth > 0);
        self.cork_depth -= 1;
    }

    /// The write pipeline: drains the send buffer into the socket with
    /// a single in-flight write at a time, as far as the upload quota
    /// allows, and re-arms itself until the buffer is empty.
    async fn flush<W>(&mut self, write_half: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.cork_depth > 0 {
            return Ok(());
        }
        while !self.send_buffer.is_empty() {
            if self.quota[UPLOAD] == 0 {
                self.maybe_request_bandwidth(UPLOAD);
                return Ok(());
            }
            let limit =
                (self.quota[UPLOAD] as usize).min(self.send_buffer.len());
            let written = {
                let iovec = self.send_buffer.build_iovec(limit);
                write_half.write_vectored(&iovec).await?
            };
            if written == 0 {
                return Err(Error::Io(
                    std::io::ErrorKind::WriteZero.into(),
                ));
            }
            self.send_buffer.pop_front(written);
            self.quota[UPLOAD] -= written as u32;
            self.last_send = Instant::now();
            self.queues.on_bytes_flushed(written, self.last_send);
            self.ctx
                .counters
                .add(Counter::UploadedProtocolBytes, written as u64);
        }
        write_half.flush().await?;
        Ok(())
    }

    /// The once-a-second maintenance tick: rate accounting, keep alives and
    /// the timeout checks.
    async fn on_tick(
        &mut self,
    ) -> std::result::Result<(), (Error, Operation)> {
        let now = Instant::now();

        self.downloaded_payload.tick();
        self.uploaded_payload.tick();
        let shared = &self.handle.status;
        shared
            .download_rate
            .store(self.downloaded_payload.avg(), Ordering::Relaxed);
        shared
            .upload_rate
            .store(self.uploaded_payload.avg(), Ordering::Relaxed);
        // estimate reciprocation by what the peer has historically given us
        shared.est_reciprocation_rate.store(
            self.downloaded_payload.avg().max(1024),
            Ordering::Relaxed,
        );

        // the availability exchange window is covered by the same idle
        // accounting as the operational state
        if !matches!(
            self.status.state,
            State::Connected | State::AvailabilityExchange
        ) {
            return Ok(());
        }

        log::trace!(
            "Peer {} tick: down {} B/s up {} B/s, {} outstanding, \
             {} queued from remote (last at {:?}), last unchoked {:?}",
            self.addr,
            self.downloaded_payload.avg(),
            self.uploaded_payload.avg(),
            self.queues.download_queue_len(),
            self.incoming_requests.len(),
            self.last_incoming_request,
            self.last_unchoke,
        );

        // a holepunch exchange keeps an otherwise silent peer alive
        if !self.status.in_holepunch_mode
            && now.duration_since(self.last_recv)
                > self.ctx.conf.inactivity_timeout
        {
            return Err((
                Error::Timeout(TimeoutKind::Inactivity),
                Operation::SockRead,
            ));
        }

        if now.duration_since(self.last_send)
            >= self.ctx.conf.keep_alive_interval
        {
            log::debug!("Sending keep alive to peer {}", self.addr);
            Message::KeepAlive.encode(&mut self.send_buffer);
        }

        // check the head of the download queue against the adaptive
        // request timeout; an expired head snubs the peer
        if let Some(block) = self
            .queues
            .timeout_head(now, self.ctx.conf.request_timeout)
        {
            log::warn!(
                "Peer {} request {} timed out",
                self.addr,
                block
            );
            self.ctx.counters.inc(Counter::TimedOutRequests);
            if !self.status.is_snubbed {
                self.status.is_snubbed = true;
                self.ctx.counters.inc(Counter::SnubbedPeers);
                log::info!("Peer {} snubbed", self.addr);
            }
            let torrent = self.torrent();
            torrent.piece_picker.write().await.abort_download(block);
        }

        // top the pipeline back up (or start it, after a snub recovery)
        self.make_requests()
            .await
            .map_err(|e| (e, Operation::BittorrentProtocol))?;
        Ok(())
    }

    /// Closes the connection. Idempotent: only the first call runs the
    /// teardown; subsequent calls (and late callbacks) are no-ops.
    async fn disconnect(&mut self, error: Error, op: Operation) {
        if matches!(
            self.status.state,
            State::Disconnecting | State::Disconnected
        ) {
            return;
        }
        log::info!(
            "Disconnecting peer {} ({} during {}); connected for {:?}, \
             {} bytes down, {} bytes up",
            self.addr,
            error,
            op,
            self.connect_time.elapsed(),
            self.downloaded_payload.total(),
            self.uploaded_payload.total(),
        );
        self.status.state = State::Disconnecting;
        self.handle
            .status
            .disconnecting
            .store(true, Ordering::Relaxed);

        // hand every queued block back to the picker
        if let Some(torrent) = self.torrent.clone() {
            let drained = self.queues.drain_all();
            if !drained.is_empty() {
                let mut picker = torrent.piece_picker.write().await;
                for pb in drained {
                    if !pb.not_wanted && !pb.busy {
                        picker.abort_download(pb.block);
                    }
                }
            }
        }
        // unsent bytes (and their owned regions) are dropped
        self.send_buffer.clear();
        self.incoming_requests.clear();

        self.ctx.counters.inc(Counter::Disconnects);
        self.ctx.alerts.post(Alert::PeerDisconnected {
            addr: self.addr,
            error,
            op,
        });
        let _ = self
            .ctx
            .cmd
            .send(SessionCommand::PeerClosed { addr: self.addr });
    }

    /// The attached torrent. Callable from any state past the handshake,
    /// which implies attachment.
    fn torrent(&self) -> Arc<SharedStatus> {
        Arc::clone(self.torrent.as_ref().expect("torrent not attached"))
    }

    fn peer_fast(&self) -> bool {
        self.peer_info.as_ref().map(|i| i.fast).unwrap_or_default()
    }

    fn peer_extended(&self) -> bool {
        self.peer_info
            .as_ref()
            .map(|i| i.extended)
            .unwrap_or_default()
    }

    /// FAST extension messages from a peer that didn't advertise the
    /// extension are protocol violations.
    fn require_fast(&self) -> Result<()> {
        if self.peer_fast() {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(
                "fast message without fast extension",
            ))
        }
    }

    fn validate_piece_index(&self, index: PieceIndex) -> Result<()> {
        let count = self
            .torrent
            .as_ref()
            .map(|t| t.storage.piece_count)
            .unwrap_or_default();
        if index < count {
            Ok(())
        } else {
            Err(Error::ProtocolViolation("piece index out of range"))
        }
    }
}

/// The canonical allowed-fast set of BEP 6: a deterministic set of piece
/// indices derived from the peer's (masked) address and the torrent's info
/// hash, so both ends can compute the same set.
fn allowed_fast_set(
    k: usize,
    ip: &std::net::IpAddr,
    info_hash: &crate::Sha1Hash,
    piece_count: usize,
) -> Vec<PieceIndex> {
    use sha1::{Digest, Sha1};

    let mut set = Vec::new();
    if piece_count == 0 {
        return set;
    }
    let k = k.min(piece_count);

    // x = (ip & 0xffffff00) + info hash; IPv6 addresses are masked to their
    // /64 prefix in the same spirit
    let mut x = Vec::with_capacity(36);
    match ip {
        std::net::IpAddr::V4(addr) => {
            let masked = u32::from(*addr) & 0xffff_ff00;
            x.extend_from_slice(&masked.to_be_bytes());
        }
        std::net::IpAddr::V6(addr) => {
            let masked = u128::from(*addr) & !((1u128 << 64) - 1);
            x.extend_from_slice(&masked.to_be_bytes());
        }
    }
    x.extend_from_slice(info_hash);

    while set.len() < k {
        let digest = Sha1::digest(&x);
        for chunk in digest.chunks(4) {
            if set.len() == k {
                break;
            }
            let y = u32::from_be_bytes(chunk.try_into().unwrap()) as usize
                % piece_count;
            if !set.contains(&y) {
                set.push(y);
            }
        }
        x = digest.to_vec();
    }
    set
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream},
        sync::RwLock,
    };

    use super::*;
    use crate::{
        alert::AlertQueue,
        bandwidth::ChannelSet,
        conf::SessionConf,
        counter::Counters,
        disk::{CacheBlockRef, DiskCommand, DiskHandle},
        error::Severity,
        picker::testing::SequentialPicker,
        torrent::StorageInfo,
        Sha1Hash, BLOCK_LEN,
    };

    const INFO_HASH: Sha1Hash = [0xaa; 20];
    const REMOTE_ID: PeerId = *b"bbbbbbbbbbbbbbbbbbbb";
    const WAIT: Duration = Duration::from_secs(5);

    /// Everything the tests need to drive and observe one peer session.
    struct Harness {
        ctx: Arc<SessionContext>,
        torrent: Arc<SharedStatus>,
        /// Session commands other than bandwidth requests (which the
        /// harness grants immediately, standing in for the scheduler).
        session_cmds: mpsc::UnboundedReceiver<SessionCommand>,
        /// The disk engine's command port; tests play the disk.
        disk_port: crate::disk::CommandReceiver,
        alerts: Arc<AlertQueue>,
    }

    async fn setup(
        piece_count: usize,
        piece_len: u32,
        own_all: bool,
    ) -> Harness {
        let (cmd_chan, mut cmd_port) = mpsc::unbounded_channel();
        let (obs_chan, session_cmds) = mpsc::unbounded_channel();
        let alerts = Arc::new(AlertQueue::new(64));
        let ctx = Arc::new(SessionContext {
            conf: SessionConf::default(),
            counters: Counters::new(),
            alerts: Arc::clone(&alerts),
            cmd: cmd_chan,
            torrents: RwLock::new(std::collections::HashMap::new()),
            extensions: None,
        });

        // a minimal stand-in for the session task: grant every bandwidth
        // request in full and forward everything else for observation
        tokio::spawn(async move {
            while let Some(cmd) = cmd_port.recv().await {
                match cmd {
                    SessionCommand::RequestBandwidth {
                        kind,
                        bytes,
                        socket,
                        ..
                    } => socket.assign_bandwidth(kind, bytes),
                    other => {
                        if obs_chan.send(other).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (disk_chan, disk_port) = mpsc::unbounded_channel();
        let mut channels = ChannelSet::new();
        let up_channel = channels.add();
        let down_channel = channels.add();
        let mut own_pieces = Bitfield::new();
        own_pieces.resize(piece_count, own_all);
        let torrent = Arc::new(SharedStatus {
            id: 0,
            info_hash: INFO_HASH,
            client_id: *crate::conf::PEERWIRE_CLIENT_ID,
            storage: StorageInfo {
                piece_count,
                piece_len,
                last_piece_len: piece_len,
                download_len: piece_count as u64 * u64::from(piece_len),
            },
            piece_picker: Arc::new(RwLock::new(Box::new(
                SequentialPicker::new(piece_len, piece_count),
            ))),
            disk: DiskHandle::new(disk_chan),
            own_pieces: RwLock::new(own_pieces),
            paused: Default::default(),
            superseeding: Default::default(),
            up_channel,
            down_channel,
        });
        ctx.torrents
            .write()
            .await
            .insert(INFO_HASH, Arc::clone(&torrent));

        Harness {
            ctx,
            torrent,
            session_cmds,
            disk_port,
            alerts,
        }
    }

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:51413".parse().unwrap()
    }

    fn spawn_inbound(harness: &Harness) -> (DuplexStream, Arc<PeerHandle>) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (session, handle) = PeerSession::inbound(
            Arc::clone(&harness.ctx),
            peer_addr(),
            Vec::new(),
            Vec::new(),
        );
        tokio::spawn(session.accept(local));
        (remote, handle)
    }

    fn spawn_outbound(harness: &Harness) -> (DuplexStream, Arc<PeerHandle>) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (session, handle) = PeerSession::outbound(
            Arc::clone(&harness.ctx),
            Arc::clone(&harness.torrent),
            peer_addr(),
            Vec::new(),
            Vec::new(),
            None,
        );
        tokio::spawn(session.run_outbound(local));
        (remote, handle)
    }

    fn remote_handshake(reserved: [u8; 8]) -> Vec<u8> {
        let mut wire = vec![19u8];
        wire.extend_from_slice(b"BitTorrent protocol");
        wire.extend_from_slice(&reserved);
        wire.extend_from_slice(&INFO_HASH);
        wire.extend_from_slice(&REMOTE_ID);
        wire
    }

    fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut wire =
            ((payload.len() + 1) as u32).to_be_bytes().to_vec();
        wire.push(id);
        wire.extend_from_slice(payload);
        wire
    }

    async fn read_exact(remote: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        timeout(WAIT, remote.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf
    }

    /// Reads one framed message (skipping keep alives) and returns its
    /// body, id byte first.
    async fn read_frame(remote: &mut DuplexStream) -> Vec<u8> {
        loop {
            let len_prefix = read_exact(remote, 4).await;
            let len = u32::from_be_bytes(len_prefix.try_into().unwrap());
            if len == 0 {
                continue;
            }
            return read_exact(remote, len as usize).await;
        }
    }

    /// Reads frames until one with the given message id arrives; anything
    /// else the session sends in between (have-none, allowed-fast, the
    /// extended handshake) is skipped.
    async fn read_frame_expecting(
        remote: &mut DuplexStream,
        id: u8,
    ) -> Vec<u8> {
        timeout(WAIT, async {
            loop {
                let body = read_frame(remote).await;
                if body[0] == id {
                    return body;
                }
            }
        })
        .await
        .expect("expected frame never arrived")
    }

    async fn wait_alert(
        alerts: &AlertQueue,
        mut pred: impl FnMut(&Alert) -> bool,
    ) -> Alert {
        timeout(WAIT, async {
            loop {
                for alert in alerts.wait().await {
                    if pred(&alert) {
                        return alert;
                    }
                }
            }
        })
        .await
        .expect("expected alert never posted")
    }

    /// An incoming connection handshakes, announces its pieces and gets our
    /// interest: the handshake and interested messages have exact wire
    /// layouts.
    #[tokio::test]
    async fn test_handshake_bitfield_interest_exchange() {
        let harness = setup(3, BLOCK_LEN, false).await;
        let (mut remote, _handle) = spawn_inbound(&harness);

        // fast + extended + dht advertised
        remote
            .write_all(&remote_handshake([0, 0, 0, 0, 0, 0x10, 0, 0x05]))
            .await
            .unwrap();

        // our handshake comes back with our info hash and client id
        let hs = read_exact(&mut remote, 68).await;
        assert_eq!(hs[0], 19);
        assert_eq!(&hs[1..20], b"BitTorrent protocol");
        assert_eq!(&hs[28..48], &INFO_HASH);
        assert_eq!(&hs[48..68], crate::conf::PEERWIRE_CLIENT_ID);
        // we advertise extended messaging, fast and dht ourselves
        assert_eq!(hs[25] & 0x10, 0x10);
        assert_eq!(hs[27] & 0x05, 0x05);

        // a bitfield with all three pieces (trailing pad bits are legal and
        // get trimmed)
        remote.write_all(&frame(5, &[0xff])).await.unwrap();

        // they have pieces we lack, so we announce interest
        let interested = read_frame_expecting(&mut remote, 2).await;
        assert_eq!(interested, vec![2]);

        let alert = wait_alert(&harness.alerts, |a| {
            matches!(a, Alert::PeerConnected { .. })
        })
        .await;
        match alert {
            Alert::PeerConnected { peer_id, .. } => {
                assert_eq!(peer_id, REMOTE_ID)
            }
            _ => unreachable!(),
        }
    }

    /// The full download round trip: unchoke, an exactly framed request,
    /// the block arriving, and the payload handed to the disk collaborator.
    #[tokio::test]
    async fn test_request_piece_roundtrip() {
        let mut harness = setup(1, BLOCK_LEN, false).await;
        let (mut remote, _handle) = spawn_outbound(&harness);

        // their side of the handshake: a plain BEP 3 peer
        let _our_hs = read_exact(&mut remote, 68).await;
        remote.write_all(&remote_handshake([0; 8])).await.unwrap();
        remote.write_all(&frame(5, &[0x80])).await.unwrap();

        let interested = read_frame_expecting(&mut remote, 2).await;
        assert_eq!(interested, vec![2]);

        // unchoke them and expect the request for the only block
        remote.write_all(&frame(1, &[])).await.unwrap();
        let request = read_frame_expecting(&mut remote, 6).await;
        assert_eq!(
            request,
            [
                6, // id
                0, 0, 0, 0, // index
                0, 0, 0, 0, // begin
                0, 0, 0x40, 0, // length: 16384
            ]
        );

        // serve the block
        let mut payload = Vec::with_capacity(8 + BLOCK_LEN as usize);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&vec![0x5a; BLOCK_LEN as usize]);
        remote.write_all(&frame(7, &payload)).await.unwrap();

        // the payload reaches the disk collaborator
        let write = timeout(WAIT, harness.disk_port.recv())
            .await
            .unwrap()
            .unwrap();
        match write {
            DiskCommand::WriteBlock { info, data, .. } => {
                assert_eq!(
                    info,
                    BlockInfo {
                        piece_index: 0,
                        offset: 0,
                        len: BLOCK_LEN
                    }
                );
                assert_eq!(data.len(), BLOCK_LEN as usize);
                assert!(data.iter().all(|b| *b == 0x5a));
            }
            other => panic!("unexpected disk command: {:?}", other),
        }

        // and the session was told, for attribution
        let observed = timeout(WAIT, async {
            loop {
                match harness.session_cmds.recv().await.unwrap() {
                    SessionCommand::BlockReceived { block, .. } => {
                        return block
                    }
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(observed.piece_index, 0);
    }

    /// A choke from a FAST-less peer returns every outstanding request to
    /// the picker, without emitting cancels.
    #[tokio::test]
    async fn test_choke_returns_outstanding_requests() {
        let harness = setup(1, 4 * BLOCK_LEN, false).await;
        let (mut remote, _handle) = spawn_outbound(&harness);

        let _our_hs = read_exact(&mut remote, 68).await;
        remote.write_all(&remote_handshake([0; 8])).await.unwrap();
        remote.write_all(&frame(5, &[0x80])).await.unwrap();
        read_frame_expecting(&mut remote, 2).await;

        // unchoking lets the initial pipeline of four requests out
        remote.write_all(&frame(1, &[])).await.unwrap();
        for i in 0..4u32 {
            let request = read_frame_expecting(&mut remote, 6).await;
            assert_eq!(
                &request[5..9],
                &(i * BLOCK_LEN).to_be_bytes(),
                "request {}",
                i
            );
        }

        // choke: the peer is authoritative, everything goes back to the
        // picker and no cancel is emitted
        remote.write_all(&frame(0, &[])).await.unwrap();

        let reclaimed = timeout(WAIT, async {
            loop {
                {
                    let mut picker =
                        harness.torrent.piece_picker.write().await;
                    let mut have = Bitfield::new();
                    have.resize(1, true);
                    let mut blocks = Vec::new();
                    picker.pick_blocks(
                        &have,
                        &crate::picker::PickOptions::default(),
                        8,
                        &mut blocks,
                    );
                    if blocks.len() == 4 {
                        return blocks;
                    }
                    // put them back and retry until the session has
                    // processed the choke
                    for block in blocks {
                        picker.abort_download(block);
                    }
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("blocks were not returned to the picker");
        assert_eq!(reclaimed.len(), 4);

        // nothing further was sent: no cancel messages on the wire
        let mut tail = [0u8; 1];
        let quiet =
            timeout(Duration::from_millis(200), remote.read(&mut tail))
                .await;
        assert!(quiet.is_err(), "unexpected bytes after choke");
    }

    /// An oversized frame is a protocol violation that disconnects the peer
    /// with the exact error kind and failed operation surfaced in the
    /// alert.
    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let harness = setup(1, BLOCK_LEN, false).await;
        let (mut remote, _handle) = spawn_inbound(&harness);

        remote.write_all(&remote_handshake([0; 8])).await.unwrap();
        let _our_hs = read_exact(&mut remote, 68).await;

        // a 33000 byte piece frame, well over the 16397 byte cap
        remote
            .write_all(&33000u32.to_be_bytes())
            .await
            .unwrap();
        remote.write_all(&[7u8]).await.unwrap();

        let alert = wait_alert(&harness.alerts, |a| {
            matches!(a, Alert::PeerDisconnected { .. })
        })
        .await;
        match alert {
            Alert::PeerDisconnected { error, op, .. } => {
                assert!(matches!(error, Error::ProtocolViolation(_)));
                assert_eq!(error.severity(), Severity::PeerError);
                assert_eq!(op, Operation::BittorrentProtocol);
            }
            _ => unreachable!(),
        }

        // the socket is gone too
        let mut buf = [0u8; 1];
        let n = timeout(WAIT, remote.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    /// Disconnecting twice produces the same terminal state as once: one
    /// alert, one counter bump, no second teardown.
    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let harness = setup(1, BLOCK_LEN, false).await;
        let (mut session, handle) = PeerSession::inbound(
            Arc::clone(&harness.ctx),
            peer_addr(),
            Vec::new(),
            Vec::new(),
        );

        session
            .disconnect(Error::NoSuchTorrent, Operation::Handshake)
            .await;
        session
            .disconnect(Error::PeerIdMismatch, Operation::Handshake)
            .await;

        assert_eq!(session.status.state, State::Disconnecting);
        assert!(handle.is_disconnecting());
        let disconnected = harness
            .alerts
            .drain()
            .iter()
            .filter(|a| matches!(a, Alert::PeerDisconnected { .. }))
            .count();
        assert_eq!(disconnected, 1);
        assert_eq!(harness.ctx.counters.get(Counter::Disconnects), 1);
    }

    /// The canonical allowed-fast set depends only on the masked address,
    /// the info hash and the piece count, and never repeats an index.
    #[test]
    fn test_allowed_fast_set_is_deterministic_and_bounded() {
        let ip: std::net::IpAddr = "80.4.4.200".parse().unwrap();
        let a = allowed_fast_set(7, &ip, &[0xaa; 20], 9);
        let b = allowed_fast_set(7, &ip, &[0xaa; 20], 9);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
        assert!(a.iter().all(|i| *i < 9));
        let mut sorted = a.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 7);

        // addresses in the same /24 share the set; others don't
        let sibling: std::net::IpAddr = "80.4.4.1".parse().unwrap();
        assert_eq!(allowed_fast_set(7, &sibling, &[0xaa; 20], 9), a);
        let far: std::net::IpAddr = "12.34.56.78".parse().unwrap();
        assert_ne!(
            allowed_fast_set(7, &far, &[0xaa; 20], 1000),
            allowed_fast_set(7, &ip, &[0xaa; 20], 1000)
        );
    }

    /// Serving an upload: a request is admitted once unchoked, the block is
    /// fetched from the disk cache and leaves the socket without copying,
    /// releasing its cache pin exactly when fully sent.
    #[tokio::test]
    async fn test_serves_block_via_disk_cache() {
        let mut harness = setup(1, BLOCK_LEN, true).await;
        let (mut remote, handle) = spawn_inbound(&harness);

        remote.write_all(&remote_handshake([0; 8])).await.unwrap();
        let _our_hs = read_exact(&mut remote, 68).await;

        // we're a seed, so the remote gets our full bitfield
        let bitfield = read_frame_expecting(&mut remote, 5).await;
        assert_eq!(bitfield, vec![5, 0x80]);

        // grant the peer an upload slot, as the choker would
        handle.cmd.send(Command::Unchoke).unwrap();
        let unchoke = read_frame_expecting(&mut remote, 1).await;
        assert_eq!(unchoke, vec![1]);

        // the remote requests the only block
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&BLOCK_LEN.to_be_bytes());
        remote.write_all(&frame(6, &payload)).await.unwrap();

        // play the disk: answer the read with a pinned cache block
        let pins = Arc::new(AtomicUsize::new(0));
        let read = timeout(WAIT, harness.disk_port.recv())
            .await
            .unwrap()
            .unwrap();
        match read {
            DiskCommand::ReadBlock { info, reply, .. } => {
                assert_eq!(info.len, BLOCK_LEN);
                reply
                    .send(crate::disk::ReadResult {
                        info,
                        result: Ok(CacheBlockRef::new(
                            Bytes::from(vec![0x7e; BLOCK_LEN as usize]),
                            Arc::clone(&pins),
                        )),
                    })
                    .unwrap();
            }
            other => panic!("unexpected disk command: {:?}", other),
        }

        // the piece message arrives with the exact payload
        let piece = read_frame_expecting(&mut remote, 7).await;
        assert_eq!(piece.len(), 9 + BLOCK_LEN as usize);
        assert_eq!(&piece[1..5], &0u32.to_be_bytes());
        assert_eq!(&piece[5..9], &0u32.to_be_bytes());
        assert!(piece[9..].iter().all(|b| *b == 0x7e));

        // with all its bytes off the send queue, the cache pin is released
        timeout(WAIT, async {
            while pins.load(Ordering::SeqCst) != 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cache block still pinned");
    }
}
