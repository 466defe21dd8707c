//! The BitTorrent wire codec: the handshake frame and the length-prefixed
//! message envelope, covering the base protocol (BEP 3), the FAST extension
//! (BEP 6), the DHT port message and generic extended messages (BEP 10).
//!
//! The handshake stage runs over a [`tokio_util::codec::Framed`] transport
//! with [`HandshakeCodec`]. After the handshake the session switches to the
//! packet-aware receive buffer and the chained send buffer, so regular
//! messages are parsed from complete frames with [`Message::parse`] and
//! emitted with [`Message::encode`], which writes the framed bytes into the
//! send buffer (handing block payloads over by ownership, without copying).

use std::convert::{TryFrom, TryInto};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    send_buffer::SendBuffer,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed size of the handshake frame on the wire.
pub(crate) const HANDSHAKE_LEN: usize = 68;

/// When a small message doesn't fit the tail of the send buffer, a fresh
/// region of at least this size is chained so that subsequent small messages
/// coalesce into it instead of each allocating their own.
const SEND_CHUNK_LEN: usize = 512;

// reserved field bits
const EXTENDED_BIT: u8 = 0x10; // byte 5
const FAST_BIT: u8 = 0x04; // byte 7
const DHT_BIT: u8 = 0x01; // byte 7

/// The handshake that is exchanged right after connecting, before any
/// messages.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    /// The protocol string, always "BitTorrent protocol" (the codec rejects
    /// anything else).
    pub prot: [u8; 19],
    /// The reserved extension bits.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash.
    pub info_hash: Sha1Hash,
    /// The sender's arbitrary 20 byte id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our side of the handshake, advertising the extensions this
    /// engine speaks: extended messaging, FAST and DHT.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[5] |= EXTENDED_BIT;
        reserved[7] |= FAST_BIT | DHT_BIT;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & EXTENDED_BIT != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_BIT != 0
    }
}

/// Codec for the handshake exchange. Only used until the handshake
/// completes; afterwards the session takes the transport back out of the
/// framed stream, carrying any already buffered bytes into the message
/// receive buffer.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the protocol string length is checkable from the first byte, so
        // an invalid handshake fails as early as possible
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::ProtocolViolation("handshake protocol id"));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolViolation("handshake protocol id"));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, which is included in its header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    DhtPort = 9,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(id: u8) -> std::result::Result<Self, ()> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            9 => Ok(DhtPort),
            13 => Ok(Suggest),
            14 => Ok(HaveAll),
            15 => Ok(HaveNone),
            16 => Ok(RejectRequest),
            17 => Ok(AllowedFast),
            20 => Ok(Extended),
            _ => Err(()),
        }
    }
}

/// A message of the peer wire protocol.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    Cancel(BlockInfo),
    DhtPort(u16),
    Suggest {
        piece_index: PieceIndex,
    },
    HaveAll,
    HaveNone,
    RejectRequest(BlockInfo),
    AllowedFast {
        piece_index: PieceIndex,
    },
    Extended {
        id: u8,
        payload: Bytes,
    },
}

impl Message {
    /// The message's id, or `None` for a keep alive which has no id on the
    /// wire.
    pub fn id(&self) -> Option<MessageId> {
        use Message::*;
        match self {
            KeepAlive => None,
            Choke => Some(MessageId::Choke),
            Unchoke => Some(MessageId::Unchoke),
            Interested => Some(MessageId::Interested),
            NotInterested => Some(MessageId::NotInterested),
            Have { .. } => Some(MessageId::Have),
            Bitfield(_) => Some(MessageId::Bitfield),
            Request(_) => Some(MessageId::Request),
            Piece { .. } => Some(MessageId::Piece),
            Cancel(_) => Some(MessageId::Cancel),
            DhtPort(_) => Some(MessageId::DhtPort),
            Suggest { .. } => Some(MessageId::Suggest),
            HaveAll => Some(MessageId::HaveAll),
            HaveNone => Some(MessageId::HaveNone),
            RejectRequest(_) => Some(MessageId::RejectRequest),
            AllowedFast { .. } => Some(MessageId::AllowedFast),
            Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// The length of the whole frame on the wire, including the 4 byte
    /// length prefix.
    pub fn frame_len(&self) -> usize {
        use Message::*;
        let body = match self {
            KeepAlive => 0,
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => 1,
            Have { .. } | Suggest { .. } | AllowedFast { .. } => 5,
            Bitfield(bitfield) => 1 + bitfield.as_raw_slice().len(),
            Request(_) | Cancel(_) | RejectRequest(_) => 13,
            Piece { data, .. } => 13 + data.len(),
            DhtPort(_) => 3,
            Extended { payload, .. } => 2 + payload.len(),
        };
        4 + body
    }

    /// Parses one complete frame body: the bytes following the 4 byte
    /// length prefix (so the first byte is the message id). The caller
    /// frames the stream and handles zero length keep alives itself.
    ///
    /// Returns `None` for an unknown message id, which the protocol requires
    /// to be ignored.
    pub fn parse(body: &[u8]) -> Result<Option<Message>> {
        debug_assert!(!body.is_empty());
        let id = match MessageId::try_from(body[0]) {
            Ok(id) => id,
            Err(()) => return Ok(None),
        };
        let payload = &body[1..];

        let msg = match id {
            MessageId::Choke => expect_empty(payload, Message::Choke)?,
            MessageId::Unchoke => expect_empty(payload, Message::Unchoke)?,
            MessageId::Interested => {
                expect_empty(payload, Message::Interested)?
            }
            MessageId::NotInterested => {
                expect_empty(payload, Message::NotInterested)?
            }
            MessageId::HaveAll => expect_empty(payload, Message::HaveAll)?,
            MessageId::HaveNone => expect_empty(payload, Message::HaveNone)?,
            MessageId::Have => Message::Have {
                piece_index: parse_u32(payload)? as PieceIndex,
            },
            MessageId::Suggest => Message::Suggest {
                piece_index: parse_u32(payload)? as PieceIndex,
            },
            MessageId::AllowedFast => Message::AllowedFast {
                piece_index: parse_u32(payload)? as PieceIndex,
            },
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_slice(payload))
            }
            MessageId::Request => Message::Request(parse_block_info(payload)?),
            MessageId::Cancel => Message::Cancel(parse_block_info(payload)?),
            MessageId::RejectRequest => {
                Message::RejectRequest(parse_block_info(payload)?)
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(Error::ProtocolViolation(
                        "piece message too short",
                    ));
                }
                let piece_index =
                    u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let offset =
                    u32::from_be_bytes(payload[4..8].try_into().unwrap());
                Message::Piece {
                    piece_index: piece_index as PieceIndex,
                    offset,
                    data: Bytes::copy_from_slice(&payload[8..]),
                }
            }
            MessageId::DhtPort => {
                if payload.len() != 2 {
                    return Err(Error::ProtocolViolation(
                        "dht port message length",
                    ));
                }
                Message::DhtPort(u16::from_be_bytes(
                    payload.try_into().unwrap(),
                ))
            }
            MessageId::Extended => {
                if payload.is_empty() {
                    return Err(Error::ProtocolViolation(
                        "extended message without sub id",
                    ));
                }
                Message::Extended {
                    id: payload[0],
                    payload: Bytes::copy_from_slice(&payload[1..]),
                }
            }
        };
        Ok(Some(msg))
    }

    /// Emits the framed message into the send buffer.
    ///
    /// The header and small payloads are copied into the buffer's tail;
    /// a piece message's block payload is handed over by ownership as its
    /// own region, so payload bytes are never copied.
    pub fn encode(self, buf: &mut SendBuffer) {
        use Message::*;
        let msg_id = self.id();
        match self {
            KeepAlive => put_bytes(buf, &0u32.to_be_bytes()),
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                let mut frame = [0u8; 5];
                frame[..4].copy_from_slice(&1u32.to_be_bytes());
                frame[4] = msg_id.unwrap() as u8;
                put_bytes(buf, &frame);
            }
            Have { piece_index }
            | Suggest { piece_index }
            | AllowedFast { piece_index } => {
                let mut frame = [0u8; 9];
                frame[..4].copy_from_slice(&5u32.to_be_bytes());
                frame[4] = msg_id.unwrap() as u8;
                frame[5..].copy_from_slice(
                    &(piece_index as u32).to_be_bytes(),
                );
                put_bytes(buf, &frame);
            }
            Bitfield(ref bitfield) => {
                let raw = bitfield.as_raw_slice();
                let mut frame = Vec::with_capacity(5 + raw.len());
                frame.extend_from_slice(&(1 + raw.len() as u32).to_be_bytes());
                frame.push(MessageId::Bitfield as u8);
                frame.extend_from_slice(raw);
                let used = frame.len();
                buf.append_owned(frame, used);
            }
            Request(block) | Cancel(block) | RejectRequest(block) => {
                let mut frame = [0u8; 17];
                frame[..4].copy_from_slice(&13u32.to_be_bytes());
                frame[4] = msg_id.unwrap() as u8;
                frame[5..9].copy_from_slice(
                    &(block.piece_index as u32).to_be_bytes(),
                );
                frame[9..13].copy_from_slice(&block.offset.to_be_bytes());
                frame[13..].copy_from_slice(&block.len.to_be_bytes());
                put_bytes(buf, &frame);
            }
            Piece {
                piece_index,
                offset,
                data,
            } => {
                let mut header = [0u8; 13];
                header[..4].copy_from_slice(
                    &(9 + data.len() as u32).to_be_bytes(),
                );
                header[4] = MessageId::Piece as u8;
                header[5..9].copy_from_slice(
                    &(piece_index as u32).to_be_bytes(),
                );
                header[9..].copy_from_slice(&offset.to_be_bytes());
                put_bytes(buf, &header);
                // zero-copy handoff of the block payload
                let used = data.len();
                buf.append_owned(data, used);
            }
            DhtPort(port) => {
                let mut frame = [0u8; 7];
                frame[..4].copy_from_slice(&3u32.to_be_bytes());
                frame[4] = MessageId::DhtPort as u8;
                frame[5..].copy_from_slice(&port.to_be_bytes());
                put_bytes(buf, &frame);
            }
            Extended { id, payload } => {
                let mut frame = Vec::with_capacity(6 + payload.len());
                frame.extend_from_slice(
                    &(2 + payload.len() as u32).to_be_bytes(),
                );
                frame.push(MessageId::Extended as u8);
                frame.push(id);
                frame.extend_from_slice(&payload);
                let used = frame.len();
                buf.append_owned(frame, used);
            }
        }
    }
}

fn expect_empty(payload: &[u8], msg: Message) -> Result<Message> {
    if payload.is_empty() {
        Ok(msg)
    } else {
        Err(Error::ProtocolViolation("unexpected message payload"))
    }
}

fn parse_u32(payload: &[u8]) -> Result<u32> {
    payload
        .try_into()
        .map(u32::from_be_bytes)
        .map_err(|_| Error::ProtocolViolation("expected 4 byte payload"))
}

fn parse_block_info(payload: &[u8]) -> Result<BlockInfo> {
    if payload.len() != 12 {
        return Err(Error::ProtocolViolation("expected 12 byte payload"));
    }
    Ok(BlockInfo {
        piece_index: u32::from_be_bytes(payload[0..4].try_into().unwrap())
            as PieceIndex,
        offset: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
        len: u32::from_be_bytes(payload[8..12].try_into().unwrap()),
    })
}

/// Emits only the header of a piece message. The caller appends the block
/// payload itself as an owned region right after, which is how disk cache
/// blocks travel to the socket without a copy.
pub(crate) fn encode_piece_header(
    buf: &mut SendBuffer,
    piece_index: PieceIndex,
    offset: u32,
    len: u32,
) {
    let mut header = [0u8; 13];
    header[..4].copy_from_slice(&(9 + len).to_be_bytes());
    header[4] = MessageId::Piece as u8;
    header[5..9].copy_from_slice(&(piece_index as u32).to_be_bytes());
    header[9..].copy_from_slice(&offset.to_be_bytes());
    put_bytes(buf, &header);
}

/// Copies framed bytes into the send buffer's tail, chaining a fresh region
/// when there is no room.
fn put_bytes(buf: &mut SendBuffer, bytes: &[u8]) {
    if buf.append_bytes(bytes).is_none() {
        let mut region = vec![0u8; bytes.len().max(SEND_CHUNK_LEN)];
        region[..bytes.len()].copy_from_slice(bytes);
        let used = bytes.len();
        buf.append_owned(region, used);
    }
}

/// The payload of the extended handshake (sub id 0 of the extended
/// message), carrying the client's extension map and limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct ExtendedHandshake {
    /// The mapping of supported extension names to locally assigned ids.
    #[serde(default)]
    pub m: std::collections::HashMap<String, i64>,
    /// The client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// The number of requests the sender is willing to queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,
    /// The sender's listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
}

impl ExtendedHandshake {
    pub fn from_bencode(payload: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(payload).map_err(|_| {
            Error::ProtocolViolation("malformed extended handshake")
        })
    }

    pub fn to_bencode(&self) -> Vec<u8> {
        // serializing a struct of plain fields cannot fail
        serde_bencode::to_bytes(self).expect("bencode encode")
    }
}
