use super::error::DhtError;
use rand::Rng as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const ID_LEN: usize = 20;
pub const ID_BITS: usize = ID_LEN * 8;
pub const COMPACT_NODE_LEN: usize = 26;

/// A 160-bit DHT key. Node ids and info-hashes share this space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        <[u8; ID_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| DhtError::InvalidNodeId)
    }

    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        let bytes = hex::decode(s).map_err(|_| DhtError::InvalidNodeId)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance. Comparing two distances as byte arrays is the same as
    /// comparing them as big-endian unsigned integers.
    pub fn distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Returns true when `a` is strictly closer to `self` than `b` is.
    pub fn closer(&self, a: &NodeId, b: &NodeId) -> bool {
        self.distance(a) < self.distance(b)
    }

    /// Length of the common bit prefix, i.e. the index of the first
    /// differing bit. `None` when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        self.distance(other)
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
    }

    /// A random id that shares exactly `index` leading bits with `self`,
    /// so it lands in bucket `index` of a table owned by `self`.
    pub fn random_in_bucket(&self, index: usize) -> NodeId {
        if index >= ID_BITS {
            return NodeId::generate();
        }

        let mut id = NodeId::generate().0;
        let byte_idx = index / 8;
        let bit = 0x80u8 >> (index % 8);
        let prefix_mask = !(bit | (bit - 1));

        id[..byte_idx].copy_from_slice(&self.0[..byte_idx]);
        id[byte_idx] = (self.0[byte_idx] & prefix_mask)
            | (!self.0[byte_idx] & bit)
            | (id[byte_idx] & (bit - 1));

        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A DHT participant: an id plus the address it was last seen at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);

        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
    }

    /// `None` for IPv6 nodes, which have no 26-byte form.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let SocketAddr::V4(v4) = self.addr else {
            return None;
        };

        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..24].copy_from_slice(&v4.ip().octets());
        compact[24..26].copy_from_slice(&v4.port().to_be_bytes());
        Some(compact)
    }
}

/// Concatenates the 26-byte forms of all IPv4 nodes.
pub fn encode_compact_nodes(nodes: &[Node]) -> Vec<u8> {
    nodes
        .iter()
        .filter_map(Node::to_compact)
        .flatten()
        .collect()
}

pub fn decode_compact_nodes(data: &[u8]) -> Result<Vec<Node>, DhtError> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return Err(DhtError::InvalidCompactLength(data.len()));
    }

    Ok(data
        .chunks_exact(COMPACT_NODE_LEN)
        .filter_map(Node::from_compact)
        .collect())
}
