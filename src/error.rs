//! Error types used by the engine.
//!
//! Every failure inside a peer connection funnels through
//! [`PeerSession::disconnect`](crate::peer::PeerSession), carrying the error
//! kind, the [`Operation`] that failed and a [`Severity`]. The same kinds are
//! surfaced to the user in the peer-disconnected alert.

use std::fmt;

use tokio::sync::mpsc;

/// The crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type used by all parts of the engine.
#[derive(Debug)]
pub enum Error {
    /// An IO error from the transport.
    Io(std::io::Error),
    /// The remote sent a malformed or out-of-sequence message. The payload is
    /// a short static description of the violation.
    ProtocolViolation(&'static str),
    /// An outbound connection's remote advertised a different peer id than the
    /// one we expected from the peer database.
    PeerIdMismatch,
    /// An inbound handshake advertised an info hash that no torrent in the
    /// session matches.
    NoSuchTorrent,
    /// The torrent is complete and we are not accepting leech connections.
    TorrentFinished,
    /// The session (or the peer's class-scaled cap) is at its connection
    /// limit.
    TooManyConnections,
    /// The remote address is rejected by the session's IP filter.
    IpFiltered,
    /// The remote queued up more requests than we allow.
    TooManyRequests,
    /// One of the peer's adaptive timers expired.
    Timeout(TimeoutKind),
    /// Surfaced from the disk collaborator.
    Disk(std::io::Error),
    /// The torrent is being stopped; pending operations are cancelled.
    StoppingTorrent,
    /// The whole session is shutting down.
    SessionShuttingDown,
    /// A channel to another part of the engine was unexpectedly closed.
    Channel,
}

impl Error {
    /// The severity with which the peer-level error handler treats this error.
    pub fn severity(&self) -> Severity {
        match self {
            Error::ProtocolViolation(_)
            | Error::PeerIdMismatch
            | Error::TooManyRequests => Severity::PeerError,
            Error::Channel => Severity::FatalSession,
            _ => Severity::Normal,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "socket error: {}", e),
            Error::ProtocolViolation(detail) => {
                write!(f, "protocol violation: {}", detail)
            }
            Error::PeerIdMismatch => write!(f, "unexpected peer id"),
            Error::NoSuchTorrent => write!(f, "no torrent with this info hash"),
            Error::TorrentFinished => write!(f, "torrent already finished"),
            Error::TooManyConnections => write!(f, "connection limit reached"),
            Error::IpFiltered => write!(f, "address rejected by IP filter"),
            Error::TooManyRequests => write!(f, "request queue limit reached"),
            Error::Timeout(kind) => write!(f, "{} timeout", kind),
            Error::Disk(e) => write!(f, "disk error: {}", e),
            Error::StoppingTorrent => write!(f, "torrent is stopping"),
            Error::SessionShuttingDown => write!(f, "session is shutting down"),
            Error::Channel => write!(f, "engine channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::Disk(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

// sending on a closed channel means the receiving half of the engine is gone,
// which the sender cannot recover from
impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

/// Which of the peer's adaptive timers expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The TCP connect did not complete in time.
    Connect,
    /// The remote did not complete the handshake in time.
    Handshake,
    /// The head of the download queue exceeded the adaptive request timeout.
    Request,
    /// A whole piece took too long to arrive.
    Piece,
    /// Nothing was received from the peer for too long.
    Inactivity,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Handshake => "handshake",
            TimeoutKind::Request => "request",
            TimeoutKind::Piece => "piece",
            TimeoutKind::Inactivity => "inactivity",
        };
        f.write_str(s)
    }
}

/// The operation during which a peer error occurred. Carried in the
/// peer-disconnected alert next to the error kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    SockRead,
    SockWrite,
    Connect,
    Handshake,
    Encryption,
    BittorrentProtocol,
    ParseHash,
    Allocate,
    HostnameLookup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::SockRead => "sock_read",
            Operation::SockWrite => "sock_write",
            Operation::Connect => "connect",
            Operation::Handshake => "handshake",
            Operation::Encryption => "encryption",
            Operation::BittorrentProtocol => "bittorrent_protocol",
            Operation::ParseHash => "parse_hash",
            Operation::Allocate => "allocate",
            Operation::HostnameLookup => "hostname_lookup",
        };
        f.write_str(s)
    }
}

/// How severe a peer error is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The peer is closed without further consequences.
    Normal,
    /// The peer misbehaved; its fail count in the peer database is bumped.
    PeerError,
    /// An engine invariant was broken; reserved for unreachable conditions.
    FatalSession,
}
