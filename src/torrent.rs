//! Per-torrent state shared between the session and the torrent's peer
//! sessions.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::RwLock;

use crate::{
    bandwidth::ChannelId, disk::DiskHandle, picker::PiecePicker, Bitfield,
    BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId, BLOCK_LEN,
};

/// The storage geometry of a torrent. The storage engine itself is external;
/// peer sessions only need the piece layout for validating requests.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
}

impl StorageInfo {
    /// The length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        if index + 1 == self.piece_count {
            Some(self.last_piece_len)
        } else if index < self.piece_count {
            Some(self.piece_len)
        } else {
            None
        }
    }

    /// Whether a block request names a valid range within the torrent.
    pub fn is_valid_block(&self, block: &BlockInfo) -> bool {
        if block.len == 0 || block.len > BLOCK_LEN {
            return false;
        }
        match self.piece_len(block.piece_index) {
            Some(piece_len) => {
                u64::from(block.offset) + u64::from(block.len)
                    <= u64::from(piece_len)
            }
            None => false,
        }
    }
}

/// Shared information of a torrent, handed to each of its peer sessions.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    /// The torrent's SHA1 info hash, verified in every handshake.
    pub info_hash: Sha1Hash,
    /// The ID of our client, announced to peers.
    pub client_id: PeerId,
    pub storage: StorageInfo,
    /// The piece picker picks the next most optimal blocks to download and
    /// is shared by all peer sessions of the torrent.
    pub piece_picker: Arc<RwLock<Box<dyn PiecePicker>>>,
    /// The entity used to save downloaded blocks to and serve uploaded
    /// blocks from disk.
    pub disk: DiskHandle,
    /// The pieces we have, served to peers and driving our interest.
    pub own_pieces: RwLock<Bitfield>,
    /// A paused torrent's peers stop requesting and are excluded from
    /// unchoking.
    pub paused: AtomicBool,
    /// In super-seeding mode pieces are advertised to at most one peer at
    /// a time, via synthetic have messages.
    pub superseeding: AtomicBool,
    /// The torrent's upload rate limit channel.
    pub up_channel: ChannelId,
    /// The torrent's download rate limit channel.
    pub down_channel: ChannelId,
}

impl SharedStatus {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn is_superseeding(&self) -> bool {
        self.superseeding.load(Ordering::Relaxed)
    }
}
