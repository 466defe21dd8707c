//! The piece picker collaborator interface.
//!
//! The picking strategy itself lives outside this crate; peer sessions only
//! rely on the contract below to reserve, abort and hand back blocks.

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex};

/// Options for a single pick.
#[derive(Clone, Debug, Default)]
pub struct PickOptions {
    /// Prefer blocks adjacent to already picked ones, to produce contiguous
    /// disk writes.
    pub prefer_contiguous: bool,
    /// The peer is in endgame: blocks already reserved by other peers may be
    /// picked again (they come back flagged busy).
    pub endgame: bool,
    /// The peer is on parole: only pick blocks of pieces that will be
    /// downloaded in their entirety from this peer.
    pub whole_pieces: bool,
    /// Restrict the pick to these pieces (used for allowed-fast downloads
    /// while choked).
    pub restrict_to: Option<Vec<PieceIndex>>,
}

/// The picker reserves blocks for peers to download and tracks which blocks
/// have arrived.
///
/// Peer sessions share one picker per torrent behind an async lock, the way
/// the torrent layer shares it with its other parts.
pub trait PiecePicker: Send + Sync {
    /// Picks up to `max_blocks` blocks available in `peer_has`, appends them
    /// to `out` and marks them reserved. Returns how many were picked.
    fn pick_blocks(
        &mut self,
        peer_has: &Bitfield,
        opts: &PickOptions,
        max_blocks: usize,
        out: &mut Vec<BlockInfo>,
    ) -> usize;

    /// Records that a block was requested from the given peer.
    fn mark_downloading(&mut self, block: BlockInfo, peer: PeerId);

    /// Returns a reserved block to the pool of pickable blocks (the request
    /// was cancelled, timed out or the peer went away).
    fn abort_download(&mut self, block: BlockInfo);

    /// Whether the block has been downloaded already.
    fn is_downloaded(&self, block: BlockInfo) -> bool;

    /// Records that a block arrived.
    fn received_block(&mut self, block: BlockInfo);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;

    use super::*;
    use crate::block_len;

    /// A picker that hands out blocks in piece-then-offset order. Only used
    /// by tests; real pickers implement rarest-first and friends outside
    /// this crate.
    pub(crate) struct SequentialPicker {
        piece_len: u32,
        piece_count: usize,
        reserved: HashSet<BlockInfo>,
        downloaded: HashSet<BlockInfo>,
        pub aborted: Vec<BlockInfo>,
    }

    impl SequentialPicker {
        pub fn new(piece_len: u32, piece_count: usize) -> Self {
            Self {
                piece_len,
                piece_count,
                reserved: HashSet::new(),
                downloaded: HashSet::new(),
                aborted: Vec::new(),
            }
        }

        fn blocks_in_piece(
            &self,
            index: PieceIndex,
        ) -> impl Iterator<Item = BlockInfo> + '_ {
            let piece_len = self.piece_len;
            (0..crate::block_count(piece_len)).map(move |i| BlockInfo {
                piece_index: index,
                offset: i as u32 * crate::BLOCK_LEN,
                len: block_len(piece_len, i),
            })
        }
    }

    impl PiecePicker for SequentialPicker {
        fn pick_blocks(
            &mut self,
            peer_has: &Bitfield,
            opts: &PickOptions,
            max_blocks: usize,
            out: &mut Vec<BlockInfo>,
        ) -> usize {
            let mut picked = 0;
            for index in 0..self.piece_count {
                if picked == max_blocks {
                    break;
                }
                if !peer_has.get(index).map(|b| *b).unwrap_or(false) {
                    continue;
                }
                if let Some(allowed) = &opts.restrict_to {
                    if !allowed.contains(&index) {
                        continue;
                    }
                }
                let blocks: Vec<BlockInfo> =
                    self.blocks_in_piece(index).collect();
                for block in blocks {
                    if picked == max_blocks {
                        break;
                    }
                    if self.downloaded.contains(&block) {
                        continue;
                    }
                    if self.reserved.contains(&block) && !opts.endgame {
                        continue;
                    }
                    self.reserved.insert(block);
                    out.push(block);
                    picked += 1;
                }
            }
            picked
        }

        fn mark_downloading(&mut self, block: BlockInfo, _peer: PeerId) {
            self.reserved.insert(block);
        }

        fn abort_download(&mut self, block: BlockInfo) {
            self.reserved.remove(&block);
            self.aborted.push(block);
        }

        fn is_downloaded(&self, block: BlockInfo) -> bool {
            self.downloaded.contains(&block)
        }

        fn received_block(&mut self, block: BlockInfo) {
            self.reserved.remove(&block);
            self.downloaded.insert(block);
        }
    }
}
