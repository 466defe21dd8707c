//! The disk collaborator surface.
//!
//! The storage engine itself runs outside this crate, behind channels: the
//! engine receives [`DiskCommand`]s and reports outcomes on per-torrent
//! alert channels (writes, hash checks) or per-request reply channels
//! (reads). What this crate owns is the zero-copy contract: block payloads
//! read from the disk cache arrive as [`CacheBlockRef`]s, which pin their
//! cache entry for as long as any of their bytes sit in a send buffer, and
//! unpin it when dropped.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{error::Result, send_buffer::OwnedBuf, BlockInfo, PieceIndex, TorrentId};

pub type CommandSender = mpsc::UnboundedSender<DiskCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<DiskCommand>;

pub type ReadResultSender = mpsc::UnboundedSender<ReadResult>;
pub type ReadResultReceiver = mpsc::UnboundedReceiver<ReadResult>;

pub type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// The commands the disk engine serves.
#[derive(Debug)]
pub enum DiskCommand {
    /// Queue a downloaded block for writing. The outcome is reported on the
    /// torrent's alert channel.
    WriteBlock {
        torrent_id: TorrentId,
        info: BlockInfo,
        data: Bytes,
    },
    /// Read a block for serving an upload. The data is sent back on the
    /// requester's reply channel.
    ReadBlock {
        torrent_id: TorrentId,
        info: BlockInfo,
        reply: ReadResultSender,
    },
    /// Verify a completed piece against its expected hash. The outcome is
    /// reported on the torrent's alert channel.
    HashPiece {
        torrent_id: TorrentId,
        piece_index: PieceIndex,
    },
}

/// A completed block read.
#[derive(Debug)]
pub struct ReadResult {
    pub info: BlockInfo,
    pub result: std::io::Result<CacheBlockRef>,
}

/// Per-torrent notifications from the disk engine.
#[derive(Debug)]
pub enum TorrentAlert {
    /// A batch of blocks was written.
    BlocksWritten {
        blocks: Vec<BlockInfo>,
        result: std::io::Result<()>,
    },
    /// A piece's hash check finished.
    PieceHashed {
        piece_index: PieceIndex,
        valid: bool,
    },
}

/// A cloneable handle used by peer sessions to talk to the disk engine.
#[derive(Clone)]
pub struct DiskHandle(CommandSender);

impl DiskHandle {
    pub fn new(chan: CommandSender) -> Self {
        Self(chan)
    }

    pub fn write_block(
        &self,
        torrent_id: TorrentId,
        info: BlockInfo,
        data: Bytes,
    ) -> Result<()> {
        self.0.send(DiskCommand::WriteBlock {
            torrent_id,
            info,
            data,
        })?;
        Ok(())
    }

    pub fn read_block(
        &self,
        torrent_id: TorrentId,
        info: BlockInfo,
        reply: ReadResultSender,
    ) -> Result<()> {
        self.0.send(DiskCommand::ReadBlock {
            torrent_id,
            info,
            reply,
        })?;
        Ok(())
    }

    pub fn hash_piece(
        &self,
        torrent_id: TorrentId,
        piece_index: PieceIndex,
    ) -> Result<()> {
        self.0.send(DiskCommand::HashPiece {
            torrent_id,
            piece_index,
        })?;
        Ok(())
    }
}

/// A pinned reference to a block in the disk cache.
///
/// Creating the reference pins the cache entry (the cache won't evict it)
/// and dropping it unpins it. The reference can be queued in a
/// [`SendBuffer`](crate::send_buffer::SendBuffer) as an owned region, which
/// is how uploaded payload travels from the cache to the socket without
/// being copied: the pin is released exactly when the last of its bytes has
/// been popped off the send queue.
#[derive(Debug)]
pub struct CacheBlockRef {
    data: Bytes,
    pins: Arc<AtomicUsize>,
}

impl CacheBlockRef {
    pub fn new(data: Bytes, pins: Arc<AtomicUsize>) -> Self {
        pins.fetch_add(1, Ordering::SeqCst);
        Self { data, pins }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl OwnedBuf for CacheBlockRef {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for CacheBlockRef {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::send_buffer::SendBuffer;

    #[test]
    fn test_cache_block_pins_and_unpins() {
        let pins = Arc::new(AtomicUsize::new(0));
        let block =
            CacheBlockRef::new(Bytes::from(vec![0u8; 16]), Arc::clone(&pins));
        assert_eq!(pins.load(Ordering::SeqCst), 1);
        drop(block);
        assert_eq!(pins.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cache_block_unpins_when_fully_sent() {
        let pins = Arc::new(AtomicUsize::new(0));
        let block =
            CacheBlockRef::new(Bytes::from(vec![7u8; 16]), Arc::clone(&pins));

        let mut buf = SendBuffer::new();
        buf.append_owned(block, 16);
        assert_eq!(pins.load(Ordering::SeqCst), 1);

        // partially sent: still pinned
        buf.pop_front(10);
        assert_eq!(pins.load(Ordering::SeqCst), 1);

        // last byte leaves the queue: unpinned
        buf.pop_front(6);
        assert_eq!(pins.load(Ordering::SeqCst), 0);
    }
}
