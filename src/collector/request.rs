use std::net::SocketAddr;

use crate::dht::PeerAnnouncement;

/// One unit of admission: fetch the metadata for `info_hash` from the peer
/// at `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    /// The DHT node id of the announcer.
    pub peer_id: [u8; 20],
}

impl FetchRequest {
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl From<PeerAnnouncement> for FetchRequest {
    fn from(announce: PeerAnnouncement) -> Self {
        Self {
            addr: announce.addr,
            info_hash: announce.info_hash,
            peer_id: *announce.node_id.as_bytes(),
        }
    }
}
