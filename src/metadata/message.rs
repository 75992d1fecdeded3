use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::error::FetchError;
use crate::bencode::{decode, decode_prefix, encode, DictBuilder, Value};

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Peer wire message id of every extension protocol message (BEP-10).
pub const EXTENDED_MESSAGE_ID: u8 = 20;
/// Extended message id of the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

pub const UT_METADATA: &str = "ut_metadata";
/// The id we advertise for `ut_metadata`; peers tag their replies with it.
/// Zero would mean "disabled".
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// Size of every metadata piece except possibly the last (BEP-9).
pub const METADATA_PIECE_SIZE: usize = 16384;

pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, FetchError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(FetchError::InvalidHandshake);
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(FetchError::InvalidHandshake);
        }

        let mut handshake = Self {
            reserved: [0u8; 8],
            info_hash: [0u8; 20],
            peer_id: [0u8; 20],
        };
        handshake.reserved.copy_from_slice(&data[20..28]);
        handshake.info_hash.copy_from_slice(&data[28..48]);
        handshake.peer_id.copy_from_slice(&data[48..68]);
        Ok(handshake)
    }
}

/// The BEP-10 extension handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the id the sender wants to receive it under.
    pub extensions: BTreeMap<String, u8>,
    pub client: Option<String>,
    pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
    /// What we send: `ut_metadata` only.
    pub fn local() -> Self {
        let mut hs = Self::default();
        hs.extensions
            .insert(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID);
        hs.client = Some(concat!("rcrawl ", env!("CARGO_PKG_VERSION")).to_string());
        hs
    }

    pub fn encode(&self) -> Bytes {
        let m: BTreeMap<Bytes, Value> = self
            .extensions
            .iter()
            .map(|(name, id)| {
                (
                    Bytes::copy_from_slice(name.as_bytes()),
                    Value::Integer(i64::from(*id)),
                )
            })
            .collect();

        let dict = DictBuilder::new()
            .put("m", m)
            .put_opt("v", self.client.as_deref())
            .put_opt("metadata_size", self.metadata_size);

        Bytes::from(encode(&dict.build()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FetchError> {
        let value = decode(payload)?;
        if value.as_dict().is_none() {
            return Err(FetchError::Protocol("extension handshake is not a dict".into()));
        }

        let mut hs = Self::default();
        if let Some(m) = value.get(b"m").and_then(Value::as_dict) {
            for (name, id) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_integer()) else {
                    continue;
                };
                // Zero disables an extension.
                if let Ok(id @ 1..) = u8::try_from(id) {
                    hs.extensions.insert(name.to_string(), id);
                }
            }
        }

        hs.client = value.get(b"v").and_then(Value::as_str).map(String::from);
        hs.metadata_size = value.get(b"metadata_size").and_then(Value::as_integer);
        Ok(hs)
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_integer(n: i64) -> Option<Self> {
        match n {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }
}

/// A `ut_metadata` message (BEP-9): a bencoded header, followed by the raw
/// piece bytes for `data` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    pub total_size: Option<i64>,
    pub data: Bytes,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: Bytes::new(),
        }
    }

    pub fn data(piece: u32, total_size: i64, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data,
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let header = DictBuilder::new()
            .int("msg_type", self.msg_type as i64)
            .int("piece", i64::from(self.piece))
            .put_opt("total_size", self.total_size)
            .build();

        let mut buf = BytesMut::from(&encode(&header)[..]);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// The payload offset is wherever the bencoded header ends.
    pub fn decode(payload: &Bytes) -> Result<Self, FetchError> {
        let (header, offset) = decode_prefix(payload)?;

        let msg_type = header
            .get(b"msg_type")
            .and_then(Value::as_integer)
            .and_then(MetadataMessageType::from_integer)
            .ok_or_else(|| FetchError::Protocol("missing or invalid msg_type".into()))?;

        let piece = header
            .get(b"piece")
            .and_then(Value::as_integer)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| FetchError::Protocol("missing or invalid piece".into()))?;

        let data = if msg_type == MetadataMessageType::Data {
            payload.slice(offset..)
        } else {
            Bytes::new()
        };

        Ok(Self {
            msg_type,
            piece,
            total_size: header.get(b"total_size").and_then(Value::as_integer),
            data,
        })
    }
}

/// A length-prefixed peer wire message, reduced to what a metadata fetch
/// cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Extended { id: u8, payload: Bytes },
    /// Any other message; bitfields, haves and the like arrive unprompted.
    Other { id: u8 },
}

impl PeerMessage {
    /// Parses a message body, i.e. everything after the length prefix.
    pub fn decode(body: Bytes) -> Result<Self, FetchError> {
        let Some(&id) = body.first() else {
            return Ok(PeerMessage::KeepAlive);
        };

        if id != EXTENDED_MESSAGE_ID {
            return Ok(PeerMessage::Other { id });
        }

        let ext_id = *body
            .get(1)
            .ok_or_else(|| FetchError::Protocol("extended message without an id".into()))?;
        Ok(PeerMessage::Extended {
            id: ext_id,
            payload: body.slice(2..),
        })
    }
}

/// Frames an extension message: length prefix, message id 20, extended id,
/// payload.
pub fn encode_extended(ext_id: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + payload.len());
    buf.put_u32(2 + payload.len() as u32);
    buf.put_u8(EXTENDED_MESSAGE_ID);
    buf.put_u8(ext_id);
    buf.put_slice(payload);
    buf.freeze()
}
