use std::convert::TryFrom;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PieceIndex, BLOCK_LEN};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The message length prefix of the largest frame a well behaved peer may
/// send us, without taking the bitfield message into account: a piece
/// message carrying a 16 KiB block.
pub(super) const DEFAULT_MAX_FRAME_LEN: u32 = 9 + BLOCK_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connection is aborted.
    pub prot: [u8; 19],
    /// A reserved field, currently all zeros. This is where the client's
    /// supported extensions are announced.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// The length of the handshake on the wire: a 1 byte length prefix and
    /// the payload.
    pub fn len(&self) -> u64 {
        1 + 19 + 8 + 20 + 20
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;
    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Block as u8 => Ok(Block),
            k if k == Cancel as u8 => Ok(Cancel),
            k if k == Port as u8 => Ok(Port),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unknown message id",
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum Message {
    KeepAlive,
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// The port of the peer's DHT node. We don't run a DHT but must still
    /// be able to parse the message.
    Port {
        port: u16,
    },
}

impl Message {
    /// Returns the id of the message.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port { .. } => Some(MessageId::Port),
        }
    }

    /// Returns the number of protocol chatter bytes the message takes up on
    /// the wire. For a piece message this is only the header: the block
    /// data itself is tallied as payload, not protocol overhead.
    pub fn protocol_len(&self) -> u64 {
        match self {
            Self::KeepAlive => 4,
            Self::Bitfield(bitfield) => {
                4 + 1 + bitfield.as_raw_slice().len() as u64
            }
            Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested => 4 + 1,
            Self::Have { .. } => 4 + 1 + 4,
            Self::Request(_) | Self::Cancel(_) => 4 + 1 + 3 * 4,
            Self::Block { .. } => 4 + 1 + 2 * 4,
            Self::Port { .. } => 4 + 1 + 2,
        }
    }
}

/// Returns the header of a piece (block) message: the length prefix, the
/// message id, the piece index, and the offset. The block data itself is
/// appended separately by the send buffer, so that cached blocks can be
/// transmitted without copying.
pub(super) fn block_message_header(info: &BlockInfo) -> [u8; 13] {
    let mut header = [0; 13];
    header[0..4].copy_from_slice(&(9 + info.len).to_be_bytes());
    header[4] = MessageId::Block as u8;
    header[5..9].copy_from_slice(&(info.piece_index as u32).to_be_bytes());
    header[9..13].copy_from_slice(&info.offset.to_be_bytes());
    header
}

pub(super) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        // protocol length prefix
        debug_assert_eq!(prot.len(), 19);
        buf.put_u8(prot.len() as u8);
        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(prot, PROTOCOL_STRING.as_bytes());
        // payload
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the protocol string length without consuming it, as the
        // full handshake may not have arrived yet
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake must have the string \"BitTorrent protocol\"",
            ));
        }

        // check that we got the full payload in the buffer
        let payload_len = prot_len + 8 + 20 + 20;
        if buf.len() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        // protocol string
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        // reserved field
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        // info hash
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        // peer id
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

pub(super) struct PeerCodec {
    /// Frames whose length prefix exceeds this are rejected, which
    /// disconnects the peer. The value must accommodate the torrent's
    /// bitfield message, which for large torrents is the longest legitimate
    /// frame.
    max_frame_len: u32,
}

impl PeerCodec {
    pub fn new(max_frame_len: u32) -> Self {
        Self {
            max_frame_len: max_frame_len.max(DEFAULT_MAX_FRAME_LEN),
        }
    }
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                // message length prefix, no payload
                buf.put_u32(0);
            }
            Bitfield(bitfield) => {
                // message length prefix: 1 byte message id and n byte
                // bitfield
                //
                // NOTE: take the length of the underlying storage to get the
                // number of _bytes_, as `bitfield.len()` returns the number
                // of _bits_
                let msg_len = 1 + bitfield.as_raw_slice().len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bitfield.as_raw_slice());
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                // 1 byte message id and 4 byte piece index
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Request(block) => {
                // 1 byte message id, 4 byte piece index, 4 byte offset,
                // 4 byte length
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                // 1 byte message id, 4 byte piece index, 4 byte offset, and
                // n byte block
                let msg_len = 1 + 2 * 4 + data.len() as u32;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Port { port } => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }

        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        // the message length header must be present at the minimum,
        // otherwise we can't determine the message size
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it, as the full
        // message may not have arrived yet
        let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

        // a peer announcing an overlong frame is misbehaving and gets
        // disconnected by this error; only the bitfield message of a large
        // torrent may legitimately exceed the piece message bound
        if msg_len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds maximum message length",
            ));
        }
        if msg_len > DEFAULT_MAX_FRAME_LEN
            && buf.len() >= 5
            && buf[4] != MessageId::Bitfield as u8
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds maximum message length",
            ));
        }

        // the message length is only 0 if this is a keep alive message (all
        // other message types have at least one more field, the message id)
        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        // check that we got the full message in the buffer
        if (buf.len() as u64) < 4 + msg_len as u64 {
            return Ok(None);
        }
        buf.advance(4);
        let msg_len = msg_len as usize;

        let msg_id = MessageId::try_from(buf.get_u8())?;
        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if msg_len != 5 {
                    return Err(invalid_payload());
                }
                Message::Have {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                // preallocate the buffer to the length of the bitfield, by
                // subtracting the id from the message length
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                if msg_len != 13 {
                    return Err(invalid_payload());
                }
                Message::Request(BlockInfo {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                })
            }
            MessageId::Block => {
                if msg_len < 9 {
                    return Err(invalid_payload());
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                // preallocate the vector to the block length, by subtracting
                // the id, piece index and offset lengths from the message
                // length
                let mut data = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => {
                if msg_len != 13 {
                    return Err(invalid_payload());
                }
                Message::Cancel(BlockInfo {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                })
            }
            MessageId::Port => {
                if msg_len != 3 {
                    return Err(invalid_payload());
                }
                Message::Port {
                    port: buf.get_u16(),
                }
            }
        };

        Ok(Some(msg))
    }
}

fn invalid_payload() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "invalid message payload")
}
