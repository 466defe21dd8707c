//! The session: owns the peer connection lifetimes, admits incoming
//! connections, routes engine-internal events between peers, drives the
//! bandwidth scheduler ticks and the choke cycles.
//!
//! All session state is owned by the session task; peers talk to it through
//! the command channel, and the session talks to peers through their
//! command channels. The only data shared directly are the per-peer atomic
//! status fields and the session counters, both read lock-free.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time,
};

use crate::{
    alert::{Alert, AlertQueue},
    bandwidth::{
        BandwidthManager, BandwidthSocket, ChannelId, ChannelKind, ChannelSet,
    },
    choker::{ChokeCandidate, Choker},
    conf::{Conf, SessionConf},
    counter::{Counter, Counters},
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::{Error, Operation, Result},
    peer::{Command, PeerHandle, PeerSession},
    peer_class::{
        IpClassFilter, IpRange, PeerClassMask, PeerClasses, SocketKind,
        SocketTypeFilter,
    },
    picker::PiecePicker,
    torrent::{SharedStatus, StorageInfo},
    BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// How many hash failures a peer may contribute to before it is banned.
const BAN_THRESHOLD: u32 = 3;

/// A raw extended message forwarded to the extensions collaborator:
/// `(peer, extended message sub id, bencoded payload)`.
pub type ExtensionEvent = (SocketAddr, u8, Bytes);

/// Helper supertrait so a boxed transport can require both I/O traits.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncStream for T {}

/// A transport handed to the session for an accepted connection.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// A cloneable handle with which the embedder reaches the session while
/// [`Session::run`] owns it.
#[derive(Clone)]
pub struct SessionHandle {
    cmd: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Routes an accepted socket into the session.
    pub fn accept(&self, socket: BoxedStream, addr: SocketAddr) {
        let _ = self
            .cmd
            .send(SessionCommand::AcceptPeer { socket, addr });
    }

    /// Asks the session to connect out to a peer of the given torrent.
    pub fn connect(
        &self,
        torrent_id: TorrentId,
        addr: SocketAddr,
        expected_peer_id: Option<PeerId>,
    ) {
        let _ = self.cmd.send(SessionCommand::ConnectPeer {
            torrent_id,
            addr,
            expected_peer_id,
        });
    }

    /// Asks the session to stop all peers and shut down.
    pub fn shutdown(&self) {
        let _ = self.cmd.send(SessionCommand::Shutdown);
    }
}

/// Session state and services shared with every peer session.
pub(crate) struct SessionContext {
    pub conf: SessionConf,
    pub counters: Counters,
    pub alerts: Arc<AlertQueue>,
    /// The channel on which peers (and the embedder) reach the session
    /// task.
    pub cmd: mpsc::UnboundedSender<SessionCommand>,
    /// The torrents served by this session, for routing inbound handshakes.
    pub torrents: RwLock<HashMap<Sha1Hash, Arc<SharedStatus>>>,
    /// Where unhandled extended messages are forwarded, if anywhere.
    pub extensions: Option<mpsc::UnboundedSender<ExtensionEvent>>,
}

/// The engine-internal commands the session task serves.
pub(crate) enum SessionCommand {
    /// A peer wants bandwidth; answered through its
    /// [`BandwidthSocket::assign_bandwidth`] callback.
    RequestBandwidth {
        kind: ChannelKind,
        bytes: u32,
        priority: u32,
        socket: Arc<dyn BandwidthSocket>,
        channels: Vec<ChannelId>,
    },
    /// A peer's interest state changed; run a choke cycle soon.
    ScheduleRechoke,
    /// A peer received a block (used for hash-failure attribution, and for
    /// cancelling endgame duplicates on the torrent's other peers).
    BlockReceived {
        torrent_id: TorrentId,
        block: BlockInfo,
        from: SocketAddr,
        endgame: bool,
    },
    /// An inbound peer completed its handshake and belongs to this torrent
    /// now.
    PeerAttached {
        addr: SocketAddr,
        torrent_id: TorrentId,
    },
    /// A peer session ended; its handle moves to the undead list until its
    /// task has verifiably finished.
    PeerClosed { addr: SocketAddr },
    /// An accepted socket routed in through a [`SessionHandle`].
    AcceptPeer {
        socket: BoxedStream,
        addr: SocketAddr,
    },
    /// An outbound connection requested through a [`SessionHandle`].
    ConnectPeer {
        torrent_id: TorrentId,
        addr: SocketAddr,
        expected_peer_id: Option<PeerId>,
    },
    /// The disk engine reported on one of this session's torrents.
    DiskAlert {
        torrent_id: TorrentId,
        alert: TorrentAlert,
    },
    /// Stop all peers and shut the session down.
    Shutdown,
}

/// Everything needed to serve a torrent through this session.
pub struct TorrentParams {
    pub info_hash: Sha1Hash,
    pub storage: StorageInfo,
    pub piece_picker: Box<dyn PiecePicker>,
    pub disk: DiskHandle,
    /// The channel on which the disk engine reports this torrent's writes
    /// and hash checks.
    pub disk_alerts: TorrentAlertReceiver,
}

struct PeerEntry {
    handle: Arc<PeerHandle>,
    task: JoinHandle<()>,
    torrent_id: Option<TorrentId>,
    peer_up: ChannelId,
    peer_down: ChannelId,
    class_mask: PeerClassMask,
}

/// Per-piece attribution of which peers contributed blocks, for parole and
/// ban decisions when the hash check comes back.
type Contributors = HashMap<(TorrentId, PieceIndex), HashSet<SocketAddr>>;

/// The session. See the module documentation.
pub struct Session {
    ctx: Arc<SessionContext>,
    cmd_port: mpsc::UnboundedReceiver<SessionCommand>,
    client_id: PeerId,

    channels: ChannelSet,
    up_manager: BandwidthManager,
    down_manager: BandwidthManager,
    global_up: ChannelId,
    global_down: ChannelId,

    classes: PeerClasses,
    ip_class_filter: IpClassFilter,
    socket_type_filter: SocketTypeFilter,
    /// Outright blocked address ranges.
    ip_filter: Vec<IpRange>,

    torrents_by_id: HashMap<TorrentId, Arc<SharedStatus>>,
    next_torrent_id: TorrentId,

    peers: HashMap<SocketAddr, PeerEntry>,
    /// Insertion ordered addresses, kept consistent with `peers`, so that
    /// round-robin iteration (e.g. for disk fairness) survives removals.
    peer_order: Vec<SocketAddr>,
    rr_cursor: usize,
    /// Disconnecting peers whose tasks have not verifiably finished yet.
    /// Their per-peer channels are only reclaimed after both bandwidth
    /// managers have dropped their requests.
    undead: Vec<PeerEntry>,

    choker: Choker,
    rechoke_scheduled: bool,
    last_optimistic: HashMap<SocketAddr, Instant>,

    contributors: Contributors,
    hash_failures: HashMap<SocketAddr, u32>,

    shutting_down: bool,
}

impl Session {
    pub fn new(conf: Conf) -> Self {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let alerts =
            Arc::new(AlertQueue::new(conf.session.alert_queue_size));
        let mut channels = ChannelSet::new();
        let global_up = channels.add();
        let global_down = channels.add();
        channels
            .get_mut(global_up)
            .throttle(conf.session.upload_rate_limit);
        channels
            .get_mut(global_down)
            .throttle(conf.session.download_rate_limit);

        let choker = Choker::new(&conf.session);
        Self::check_settings(&conf.session, &alerts);
        let ctx = Arc::new(SessionContext {
            conf: conf.session,
            counters: Counters::new(),
            alerts,
            cmd: cmd_chan,
            torrents: RwLock::new(HashMap::new()),
            extensions: None,
        });

        Self {
            ctx,
            cmd_port,
            client_id: conf.engine.client_id,
            channels,
            up_manager: BandwidthManager::new(ChannelKind::Upload),
            down_manager: BandwidthManager::new(ChannelKind::Download),
            global_up,
            global_down,
            classes: PeerClasses::new(),
            ip_class_filter: IpClassFilter::new(),
            socket_type_filter: SocketTypeFilter::new(),
            ip_filter: Vec::new(),
            torrents_by_id: HashMap::new(),
            next_torrent_id: 0,
            peers: HashMap::new(),
            peer_order: Vec::new(),
            rr_cursor: 0,
            undead: Vec::new(),
            choker,
            rechoke_scheduled: false,
            last_optimistic: HashMap::new(),
            contributors: Contributors::new(),
            hash_failures: HashMap::new(),
            shutting_down: false,
        }
    }

    /// Warns about settings combinations known to limit throughput.
    fn check_settings(conf: &SessionConf, alerts: &AlertQueue) {
        use crate::alert::Warning;

        if conf.send_buffer_watermark < conf.send_buffer_low_watermark {
            alerts.post(Alert::PerformanceWarning(
                Warning::SendBufferWatermarkTooLow,
            ));
        }
        if conf.resolved_optimistic_slots() > conf.unchoke_slots_limit / 2 {
            alerts.post(Alert::PerformanceWarning(
                Warning::TooManyOptimisticUnchokeSlots,
            ));
        }
        if conf.upload_rate_limit > 0 && conf.upload_rate_limit < 1024 {
            alerts.post(Alert::PerformanceWarning(
                Warning::UploadLimitTooLow,
            ));
        }
        if conf.download_rate_limit > 0 && conf.download_rate_limit < 1024 {
            alerts.post(Alert::PerformanceWarning(
                Warning::DownloadLimitTooLow,
            ));
        }
    }

    /// The queue on which the session posts alerts for the application.
    pub fn alerts(&self) -> Arc<AlertQueue> {
        Arc::clone(&self.ctx.alerts)
    }

    /// A handle with which the embedder can reach the session (accepting
    /// sockets, connecting peers, shutting down) while [`Session::run`]
    /// owns it.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cmd: self.ctx.cmd.clone(),
        }
    }

    /// Blocks an address range outright.
    pub fn block_ip_range(&mut self, range: IpRange) {
        self.ip_filter.push(range);
    }

    /// Registers a torrent with the session, making it connectable for
    /// inbound and outbound peers.
    pub async fn add_torrent(&mut self, params: TorrentParams) -> TorrentId {
        let id = self.next_torrent_id;
        self.next_torrent_id += 1;

        let up_channel = self.channels.add();
        let down_channel = self.channels.add();
        let piece_count = params.storage.piece_count;
        let torrent = Arc::new(SharedStatus {
            id,
            info_hash: params.info_hash,
            client_id: self.client_id,
            storage: params.storage,
            piece_picker: Arc::new(RwLock::new(params.piece_picker)),
            disk: params.disk,
            own_pieces: RwLock::new({
                let mut pieces = crate::Bitfield::new();
                pieces.resize(piece_count, false);
                pieces
            }),
            paused: Default::default(),
            superseeding: Default::default(),
            up_channel,
            down_channel,
        });

        self.ctx
            .torrents
            .write()
            .await
            .insert(params.info_hash, Arc::clone(&torrent));
        self.torrents_by_id.insert(id, torrent);

        // forward this torrent's disk reports into the session loop
        let cmd = self.ctx.cmd.clone();
        let mut disk_alerts = params.disk_alerts;
        tokio::spawn(async move {
            while let Some(alert) = disk_alerts.recv().await {
                if cmd
                    .send(SessionCommand::DiskAlert {
                        torrent_id: id,
                        alert,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        id
    }

    /// Admits an accepted socket: applies the IP filter, the class scaled
    /// connection limits, and spawns the peer session.
    pub fn accept<S>(&mut self, socket: S, addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.ctx.counters.inc(Counter::IncomingConnections);
        self.admit(&addr)?;

        let (peer_up, peer_down, ups, downs, class_mask) =
            self.peer_channels(&addr);
        let (session, handle) = PeerSession::inbound(
            Arc::clone(&self.ctx),
            addr,
            ups,
            downs,
        );
        let task = tokio::spawn(session.accept(socket));
        self.register(addr, handle, task, peer_up, peer_down, class_mask);
        Ok(())
    }

    /// Starts an outbound connection to a peer of the given torrent.
    pub fn connect_to_peer(
        &mut self,
        torrent_id: TorrentId,
        addr: SocketAddr,
        expected_peer_id: Option<PeerId>,
    ) -> Result<()> {
        let torrent = self
            .torrents_by_id
            .get(&torrent_id)
            .cloned()
            .ok_or(Error::NoSuchTorrent)?;
        self.ctx.counters.inc(Counter::ConnectAttempts);
        self.admit(&addr)?;

        let (peer_up, peer_down, ups, downs, class_mask) =
            self.peer_channels(&addr);
        let (session, handle) = PeerSession::outbound(
            Arc::clone(&self.ctx),
            torrent,
            addr,
            ups,
            downs,
            expected_peer_id,
        );
        let task = tokio::spawn(session.start());
        let entry = self.register(
            addr,
            handle,
            task,
            peer_up,
            peer_down,
            class_mask,
        );
        entry.torrent_id = Some(torrent_id);
        Ok(())
    }

    /// The admission checks shared by inbound and outbound connections.
    fn admit(&self, addr: &SocketAddr) -> Result<()> {
        if self.shutting_down {
            return Err(Error::SessionShuttingDown);
        }
        let ip = addr.ip();
        if self.ip_filter.iter().any(|range| range.contains(&ip)) {
            self.ctx.counters.inc(Counter::Disconnects);
            self.ctx.alerts.post(Alert::PeerDisconnected {
                addr: *addr,
                error: Error::IpFiltered,
                op: Operation::Connect,
            });
            return Err(Error::IpFiltered);
        }

        let class_mask = self.class_mask_for(addr);
        let factor = self.classes.connection_limit_factor(class_mask);
        let limit = self.ctx.conf.connections_limit as u64 * u64::from(factor)
            / 100
            + self.ctx.conf.connections_slack as u64;
        let too_many = self.peers.len() as u64 >= limit
            || (!self.ctx.conf.allow_multiple_connections_per_ip
                && self.peers.keys().any(|a| a.ip() == ip));
        if too_many {
            self.ctx.alerts.post(Alert::PeerDisconnected {
                addr: *addr,
                error: Error::TooManyConnections,
                op: Operation::Connect,
            });
            return Err(Error::TooManyConnections);
        }
        Ok(())
    }

    fn class_mask_for(&self, addr: &SocketAddr) -> PeerClassMask {
        self.socket_type_filter.apply(
            SocketKind::Tcp,
            self.ip_class_filter.classes(&addr.ip()),
        )
    }

    /// Allocates the peer's own channels and assembles the channel lists
    /// its bandwidth requests will traverse (its own, its classes', and the
    /// session-global one; the torrent's is appended by the peer once
    /// attached).
    fn peer_channels(
        &mut self,
        addr: &SocketAddr,
    ) -> (ChannelId, ChannelId, Vec<ChannelId>, Vec<ChannelId>, PeerClassMask)
    {
        let class_mask = self.class_mask_for(addr);
        let peer_up = self.channels.add();
        let peer_down = self.channels.add();

        let mut ups = vec![peer_up];
        ups.extend(
            self.classes.channels_for(class_mask, ChannelKind::Upload),
        );
        ups.push(self.global_up);

        let mut downs = vec![peer_down];
        downs.extend(
            self.classes
                .channels_for(class_mask, ChannelKind::Download),
        );
        downs.push(self.global_down);

        (peer_up, peer_down, ups, downs, class_mask)
    }

    fn register(
        &mut self,
        addr: SocketAddr,
        handle: Arc<PeerHandle>,
        task: JoinHandle<()>,
        peer_up: ChannelId,
        peer_down: ChannelId,
        class_mask: PeerClassMask,
    ) -> &mut PeerEntry {
        self.peer_order.push(addr);
        self.peers.insert(
            addr,
            PeerEntry {
                handle,
                task,
                torrent_id: None,
                peer_up,
                peer_down,
                class_mask,
            },
        );
        self.peers.get_mut(&addr).unwrap()
    }

    /// Runs the session event loop until [`SessionCommand::Shutdown`] is
    /// received (and the peers have been told to stop).
    pub async fn run(&mut self) {
        log::info!("Starting session event loop");
        let mut bandwidth_tick =
            time::interval(self.ctx.conf.tick_interval);
        bandwidth_tick
            .set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut unchoke_tick =
            time::interval(self.ctx.conf.unchoke_interval);
        unchoke_tick
            .set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut optimistic_tick =
            time::interval(self.ctx.conf.optimistic_unchoke_interval);
        optimistic_tick
            .set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                    if self.shutting_down {
                        break;
                    }
                }
                _ = bandwidth_tick.tick() => {
                    self.tick_bandwidth();
                    self.reap_undead();
                    if self.rechoke_scheduled {
                        self.rechoke();
                    }
                }
                _ = unchoke_tick.tick() => self.rechoke(),
                _ = optimistic_tick.tick() => self.optimistic_rechoke(),
            }
        }
        log::info!("Session event loop done");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::RequestBandwidth {
                kind,
                bytes,
                priority,
                socket,
                channels,
            } => {
                let manager = match kind {
                    ChannelKind::Upload => &mut self.up_manager,
                    ChannelKind::Download => &mut self.down_manager,
                };
                let granted = manager.request_bandwidth(
                    &mut self.channels,
                    Arc::clone(&socket),
                    bytes,
                    priority,
                    &channels,
                );
                if granted > 0 {
                    socket.assign_bandwidth(kind, granted);
                }
            }
            SessionCommand::ScheduleRechoke => {
                self.rechoke_scheduled = true;
            }
            SessionCommand::BlockReceived {
                torrent_id,
                block,
                from,
                endgame,
            } => {
                self.contributors
                    .entry((torrent_id, block.piece_index))
                    .or_default()
                    .insert(from);
                if endgame {
                    self.cancel_on_other_peers(torrent_id, block, from);
                }
            }
            SessionCommand::PeerAttached { addr, torrent_id } => {
                if let Some(entry) = self.peers.get_mut(&addr) {
                    entry.torrent_id = Some(torrent_id);
                }
            }
            SessionCommand::PeerClosed { addr } => self.remove_peer(&addr),
            SessionCommand::AcceptPeer { socket, addr } => {
                if let Err(e) = self.accept(socket, addr) {
                    log::info!("Rejected peer {}: {}", addr, e);
                }
            }
            SessionCommand::ConnectPeer {
                torrent_id,
                addr,
                expected_peer_id,
            } => {
                if let Err(e) =
                    self.connect_to_peer(torrent_id, addr, expected_peer_id)
                {
                    log::info!("Failed to connect to peer {}: {}", addr, e);
                }
            }
            SessionCommand::DiskAlert { torrent_id, alert } => {
                self.on_disk_alert(torrent_id, alert).await;
            }
            SessionCommand::Shutdown => {
                log::info!("Session shutting down");
                self.shutting_down = true;
                for entry in self.peers.values() {
                    let _ = entry.handle.cmd.send(Command::Shutdown);
                }
                self.up_manager.close();
                self.down_manager.close();
            }
        }
    }

    /// Advances both bandwidth managers by one tick interval.
    fn tick_bandwidth(&mut self) {
        let dt = self.ctx.conf.tick_interval;
        self.up_manager.update_quotas(&mut self.channels, dt);
        self.down_manager.update_quotas(&mut self.channels, dt);
    }

    /// Relays an endgame cancel for a received block to the torrent's other
    /// peers.
    fn cancel_on_other_peers(
        &self,
        torrent_id: TorrentId,
        block: BlockInfo,
        from: SocketAddr,
    ) {
        for (addr, entry) in &self.peers {
            if *addr == from || entry.torrent_id != Some(torrent_id) {
                continue;
            }
            let _ = entry.handle.cmd.send(Command::CancelBlock(block));
        }
    }

    async fn on_disk_alert(
        &mut self,
        torrent_id: TorrentId,
        alert: TorrentAlert,
    ) {
        match alert {
            TorrentAlert::BlocksWritten { result, .. } => {
                if let Err(error) = result {
                    log::warn!(
                        "Torrent {} disk write error: {}",
                        torrent_id,
                        error
                    );
                    self.ctx
                        .alerts
                        .post(Alert::StorageError { torrent_id, error });
                }
            }
            TorrentAlert::PieceHashed { piece_index, valid } => {
                self.on_piece_hashed(torrent_id, piece_index, valid).await;
            }
        }
    }

    async fn on_piece_hashed(
        &mut self,
        torrent_id: TorrentId,
        piece_index: PieceIndex,
        valid: bool,
    ) {
        let torrent = match self.torrents_by_id.get(&torrent_id) {
            Some(torrent) => Arc::clone(torrent),
            None => return,
        };
        let contributors = self
            .contributors
            .remove(&(torrent_id, piece_index))
            .unwrap_or_default();

        if valid {
            log::info!(
                "Torrent {} piece {} finished",
                torrent_id,
                piece_index
            );
            let finished = {
                let mut own_pieces = torrent.own_pieces.write().await;
                own_pieces.set(piece_index, true);
                own_pieces.all()
            };
            self.ctx.alerts.post(Alert::PieceFinished {
                torrent_id,
                piece_index,
            });
            // a verified piece clears its contributors' parole
            for addr in &contributors {
                self.hash_failures.remove(addr);
                if let Some(entry) = self.peers.get(addr) {
                    let _ = entry.handle.cmd.send(Command::SetParole(false));
                }
            }
            // announce to every peer of the torrent
            for entry in self.peers.values() {
                if entry.torrent_id == Some(torrent_id) {
                    let _ = entry
                        .handle
                        .cmd
                        .send(Command::HaveGained(piece_index));
                }
            }
            if finished {
                self.ctx.alerts.post(Alert::TorrentFinished { torrent_id });
            }
        } else {
            log::warn!(
                "Torrent {} piece {} failed hash check",
                torrent_id,
                piece_index
            );
            let piece_len = torrent
                .storage
                .piece_len(piece_index)
                .unwrap_or_default();
            self.ctx
                .counters
                .add(Counter::FailedBytes, u64::from(piece_len));
            // every contributor is suspect: parole them, ban repeat
            // offenders
            for addr in contributors {
                let failures = {
                    let failures =
                        self.hash_failures.entry(addr).or_insert(0);
                    *failures += 1;
                    *failures
                };
                if failures >= BAN_THRESHOLD {
                    self.ban_peer(&addr);
                } else if let Some(entry) = self.peers.get(&addr) {
                    let _ = entry.handle.cmd.send(Command::SetParole(true));
                }
            }
        }
    }

    fn ban_peer(&mut self, addr: &SocketAddr) {
        log::warn!("Banning peer {}", addr);
        self.ctx.counters.inc(Counter::BannedPeers);
        self.ip_filter.push(IpRange {
            base: addr.ip(),
            prefix_len: if addr.is_ipv4() { 32 } else { 128 },
        });
        if let Some(entry) = self.peers.get(addr) {
            let _ = entry.handle.cmd.send(Command::Shutdown);
        }
    }

    /// Removes a closed peer from the registry, keeping the round-robin
    /// cursor valid, and parks its entry on the undead list until its task
    /// has finished and the bandwidth managers no longer reference it.
    fn remove_peer(&mut self, addr: &SocketAddr) {
        let entry = match self.peers.remove(addr) {
            Some(entry) => entry,
            None => return,
        };
        if let Some(index) = self.peer_order.iter().position(|a| a == addr)
        {
            self.peer_order.remove(index);
            if index < self.rr_cursor {
                self.rr_cursor -= 1;
            }
            if self.rr_cursor >= self.peer_order.len() {
                self.rr_cursor = 0;
            }
        }
        self.choker.remove_peer(addr);
        self.last_optimistic.remove(addr);
        self.undead.push(entry);
    }

    /// Reaps undead peers whose task has finished and whose bandwidth
    /// requests are gone, reclaiming their channels.
    fn reap_undead(&mut self) {
        let mut kept = Vec::new();
        for entry in self.undead.drain(..) {
            let socket =
                Arc::clone(&entry.handle) as Arc<dyn BandwidthSocket>;
            let done = entry.task.is_finished()
                && !self.up_manager.is_queued(&socket)
                && !self.down_manager.is_queued(&socket);
            if done {
                self.channels.remove(entry.peer_up);
                self.channels.remove(entry.peer_down);
            } else {
                kept.push(entry);
            }
        }
        self.undead = kept;
    }

    /// Runs the regular choke cycle.
    fn rechoke(&mut self) {
        self.rechoke_scheduled = false;
        self.ctx.counters.inc(Counter::ChokeCycles);
        let candidates = self.choke_candidates();
        let upload_rate: u64 = self
            .peers
            .values()
            .map(|e| {
                e.handle
                    .status
                    .upload_rate
                    .load(std::sync::atomic::Ordering::Relaxed)
            })
            .sum();
        let decision = self.choker.rechoke(
            &candidates,
            upload_rate,
            self.ctx.conf.upload_rate_limit,
            self.up_manager.queue_size(),
        );
        self.apply_choke_decision(decision, false);
    }

    /// Runs the optimistic unchoke rotation.
    fn optimistic_rechoke(&mut self) {
        let candidates = self.choke_candidates();
        let decision = self.choker.optimistic_rechoke(&candidates);
        self.apply_choke_decision(decision, true);
    }

    fn apply_choke_decision(
        &mut self,
        decision: crate::choker::ChokeDecision,
        optimistic: bool,
    ) {
        for addr in decision.choke {
            if let Some(entry) = self.peers.get(&addr) {
                let _ = entry.handle.cmd.send(Command::Choke);
            }
        }
        for addr in decision.unchoke {
            if let Some(entry) = self.peers.get(&addr) {
                let _ = entry.handle.cmd.send(Command::Unchoke);
                if optimistic {
                    self.ctx.counters.inc(Counter::OptimisticUnchokes);
                    self.last_optimistic.insert(addr, Instant::now());
                }
            }
        }
    }

    /// Gathers the candidate snapshots for a choke cycle: interested,
    /// operational peers of unpaused torrents.
    fn choke_candidates(&self) -> Vec<ChokeCandidate> {
        use std::sync::atomic::Ordering;
        self.peers
            .iter()
            .filter(|(_, entry)| {
                if entry.handle.status.disconnecting.load(Ordering::Relaxed)
                {
                    return false;
                }
                if !entry
                    .handle
                    .status
                    .peer_interested
                    .load(Ordering::Relaxed)
                {
                    return false;
                }
                if self.classes.ignore_unchoke_slots(entry.class_mask) {
                    return false;
                }
                match entry.torrent_id {
                    // still handshaking
                    None => false,
                    Some(id) => self
                        .torrents_by_id
                        .get(&id)
                        .map(|t| !t.is_paused())
                        .unwrap_or(false),
                }
            })
            .map(|(addr, entry)| ChokeCandidate {
                addr: *addr,
                download_rate: entry
                    .handle
                    .status
                    .download_rate
                    .load(Ordering::Relaxed),
                upload_rate: entry
                    .handle
                    .status
                    .upload_rate
                    .load(Ordering::Relaxed),
                est_reciprocation_rate: entry
                    .handle
                    .status
                    .est_reciprocation_rate
                    .load(Ordering::Relaxed),
                last_optimistic_unchoke: self
                    .last_optimistic
                    .get(addr)
                    .copied(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::picker::testing::SequentialPicker;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    fn test_session(conf_mut: impl FnOnce(&mut SessionConf)) -> Session {
        let mut conf = Conf::new();
        conf_mut(&mut conf.session);
        Session::new(conf)
    }

    fn test_torrent_params(info_hash: Sha1Hash) -> (TorrentParams, crate::disk::CommandReceiver) {
        let (disk_chan, disk_port) = mpsc::unbounded_channel();
        let (_alert_chan, alert_port) = mpsc::unbounded_channel();
        (
            TorrentParams {
                info_hash,
                storage: StorageInfo {
                    piece_count: 4,
                    piece_len: crate::BLOCK_LEN,
                    last_piece_len: crate::BLOCK_LEN,
                    download_len: 4 * u64::from(crate::BLOCK_LEN),
                },
                piece_picker: Box::new(SequentialPicker::new(
                    crate::BLOCK_LEN,
                    4,
                )),
                disk: DiskHandle::new(disk_chan),
                disk_alerts: alert_port,
            },
            disk_port,
        )
    }

    #[tokio::test]
    async fn test_ip_filter_rejects_blocked_range() {
        let mut session = test_session(|_| {});
        session.block_ip_range(IpRange {
            base: "10.0.0.0".parse().unwrap(),
            prefix_len: 8,
        });

        let (socket, _other) = tokio::io::duplex(1024);
        let result = session.accept(socket, addr(6881));
        assert!(matches!(result, Err(Error::IpFiltered)));
        assert!(session.peers.is_empty());

        // the rejection surfaced as a peer-disconnected alert
        let alerts = session.alerts().drain();
        assert!(alerts.iter().any(|a| matches!(
            a,
            Alert::PeerDisconnected {
                error: Error::IpFiltered,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_connection_cap_with_slack() {
        let mut session = test_session(|conf| {
            conf.connections_limit = 2;
            conf.connections_slack = 1;
            conf.allow_multiple_connections_per_ip = true;
        });

        for port in 0..3u16 {
            let (socket, _other) = tokio::io::duplex(64);
            // leak the other half so the sessions just idle
            std::mem::forget(_other);
            session.accept(socket, addr(7000 + port)).unwrap();
        }
        assert_eq!(session.peers.len(), 3);

        let (socket, _other) = tokio::io::duplex(64);
        let result = session.accept(socket, addr(7100));
        assert!(matches!(result, Err(Error::TooManyConnections)));
    }

    #[tokio::test]
    async fn test_single_connection_per_ip() {
        let mut session = test_session(|_| {});
        let (socket, _a) = tokio::io::duplex(64);
        std::mem::forget(_a);
        session.accept(socket, addr(8000)).unwrap();

        // same IP, different port
        let (socket, _b) = tokio::io::duplex(64);
        let result = session.accept(socket, addr(8001));
        assert!(matches!(result, Err(Error::TooManyConnections)));
    }

    #[tokio::test]
    async fn test_immediate_bandwidth_grant_roundtrip() {
        use crate::peer::SharedPeerStatus;

        let mut session = test_session(|_| {});
        let (cmd_chan, mut cmd_port) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle {
            cmd: cmd_chan,
            status: SharedPeerStatus::default(),
        });

        // no channels are limiting, so the manager's fast path grants
        // immediately, which must still reach the consumer as a command
        session
            .handle_command(SessionCommand::RequestBandwidth {
                kind: ChannelKind::Upload,
                bytes: 0x4000,
                priority: 1,
                socket: Arc::clone(&handle) as Arc<dyn BandwidthSocket>,
                channels: vec![session.global_up],
            })
            .await;

        match cmd_port.try_recv().unwrap() {
            Command::BandwidthGranted { kind, amount } => {
                assert_eq!(kind, ChannelKind::Upload);
                assert_eq!(amount, 0x4000);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queued_bandwidth_grant_arrives_on_tick() {
        use crate::peer::SharedPeerStatus;

        let mut session = test_session(|conf| {
            conf.upload_rate_limit = 0x4000;
        });
        let (cmd_chan, mut cmd_port) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle {
            cmd: cmd_chan,
            status: SharedPeerStatus::default(),
        });

        session
            .handle_command(SessionCommand::RequestBandwidth {
                kind: ChannelKind::Upload,
                bytes: 0x4000,
                priority: 200,
                socket: Arc::clone(&handle) as Arc<dyn BandwidthSocket>,
                channels: vec![session.global_up],
            })
            .await;
        assert!(cmd_port.try_recv().is_err());
        assert_eq!(session.up_manager.queue_size(), 1);

        // a couple of 500 ms ticks accrue enough quota for the request
        for _ in 0..4 {
            session.tick_bandwidth();
        }
        match cmd_port.try_recv().unwrap() {
            Command::BandwidthGranted { amount, .. } => {
                assert!(amount > 0);
                assert!(amount <= 0x4000);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_robin_cursor_survives_removal() {
        let mut session = test_session(|conf| {
            conf.allow_multiple_connections_per_ip = true;
        });
        for port in 0..4u16 {
            let (socket, other) = tokio::io::duplex(64);
            std::mem::forget(other);
            session.accept(socket, addr(9000 + port)).unwrap();
        }
        session.rr_cursor = 2;

        // removing an entry before the cursor shifts it back so iteration
        // stays aligned
        session.remove_peer(&addr(9000));
        assert_eq!(session.rr_cursor, 1);
        assert_eq!(session.peer_order.len(), 3);

        // removing the tail wraps the cursor
        session.rr_cursor = 2;
        session.remove_peer(&addr(9003));
        assert_eq!(session.rr_cursor, 0);
        assert_eq!(session.undead.len(), 2);
    }

    #[tokio::test]
    async fn test_piece_hash_failure_paroles_then_bans() {
        let mut session = test_session(|conf| {
            conf.allow_multiple_connections_per_ip = true;
        });
        let (params, _disk_port) = test_torrent_params([0xab; 20]);
        let torrent_id = session.add_torrent(params).await;

        let peer_addr = addr(9500);
        let (socket, other) = tokio::io::duplex(64);
        std::mem::forget(other);
        session.accept(socket, peer_addr).unwrap();
        session
            .handle_command(SessionCommand::PeerAttached {
                addr: peer_addr,
                torrent_id,
            })
            .await;

        for round in 0..BAN_THRESHOLD {
            session
                .handle_command(SessionCommand::BlockReceived {
                    torrent_id,
                    block: BlockInfo {
                        piece_index: round as usize,
                        offset: 0,
                        len: crate::BLOCK_LEN,
                    },
                    from: peer_addr,
                    endgame: false,
                })
                .await;
            session
                .on_piece_hashed(torrent_id, round as usize, false)
                .await;
        }

        assert_eq!(session.ctx.counters.get(Counter::BannedPeers), 1);
        // the ban blocks the address from reconnecting
        let (socket, _other) = tokio::io::duplex(64);
        assert!(matches!(
            session.accept(socket, peer_addr),
            Err(Error::IpFiltered)
        ));
    }

    #[tokio::test]
    async fn test_valid_piece_updates_own_pieces_and_announces() {
        let mut session = test_session(|_| {});
        let (params, _disk_port) = test_torrent_params([0xcd; 20]);
        let torrent_id = session.add_torrent(params).await;

        session.on_piece_hashed(torrent_id, 1, true).await;

        let torrent = session.torrents_by_id.get(&torrent_id).unwrap();
        assert!(*torrent.own_pieces.read().await.get(1).unwrap());
        let alerts = session.alerts().drain();
        assert!(alerts.iter().any(|a| matches!(
            a,
            Alert::PieceFinished { piece_index: 1, .. }
        )));
    }
}
