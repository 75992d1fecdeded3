use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::FetchError;
use super::message::{
    metadata_piece_count, ExtensionHandshake, Handshake, MetadataMessage, MetadataMessageType,
    PeerMessage, EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, METADATA_PIECE_SIZE, UT_METADATA,
};
use super::peer_id::PeerId;
use super::transport::Transport;
use crate::bencode::decode;
use crate::collector::{FetchRequest, MetadataFetch};
use crate::config::FetchConfig;
use crate::torrent::Torrent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Connecting,
    Handshaking,
    ExtendedHandshaking,
    FetchingPieces,
    Reassembling,
    Succeeded,
    Failed,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchState::Connecting => "connecting",
            FetchState::Handshaking => "handshaking",
            FetchState::ExtendedHandshaking => "extended-handshaking",
            FetchState::FetchingPieces => "fetching-pieces",
            FetchState::Reassembling => "reassembling",
            FetchState::Succeeded => "succeeded",
            FetchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the remote side told us in its extension handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RemoteMetadata {
    ut_metadata_id: u8,
    size: usize,
}

/// One `ut_metadata` download over an established connection.
///
/// The exchange runs handshake, extension handshake, piece requests and
/// reassembly in order and gives up at the first error. The returned bytes
/// are the info dictionary and are known to hash to the requested info-hash.
pub struct MetadataExchange<S> {
    transport: Transport<S>,
    info_hash: [u8; 20],
    peer_id: PeerId,
    fetch_timeout: Duration,
    max_metadata_size: usize,
    state: FetchState,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MetadataExchange<S> {
    pub fn new(stream: S, info_hash: [u8; 20], peer_id: PeerId, config: &FetchConfig) -> Self {
        Self {
            transport: Transport::new(stream, config.read_timeout(), config.write_timeout()),
            info_hash,
            peer_id,
            fetch_timeout: config.fetch_timeout(),
            max_metadata_size: config.max_metadata_size,
            state: FetchState::Connecting,
        }
    }

    /// `Connecting` until [`run`](Self::run) starts the handshake.
    pub fn state(&self) -> FetchState {
        self.state
    }

    pub async fn run(&mut self) -> Result<Bytes, FetchError> {
        match self.exchange().await {
            Ok(metadata) => {
                self.transition(FetchState::Succeeded);
                Ok(metadata)
            }
            Err(e) => {
                self.transition(FetchState::Failed);
                Err(e)
            }
        }
    }

    async fn exchange(&mut self) -> Result<Bytes, FetchError> {
        self.transition(FetchState::Handshaking);
        self.transport
            .send_handshake(&Handshake::new(self.info_hash, *self.peer_id.as_bytes()))
            .await?;
        let remote = self.transport.receive_handshake().await?;
        if !remote.supports_extension_protocol() {
            return Err(FetchError::UnsupportedExtension);
        }

        self.transition(FetchState::ExtendedHandshaking);
        // Peers may keep chatting without ever sending the handshake.
        let remote = timeout(self.fetch_timeout, self.extended_handshake())
            .await
            .map_err(|_| FetchError::Timeout)??;

        self.transition(FetchState::FetchingPieces);
        let count = metadata_piece_count(remote.size);
        for piece in 0..count {
            let request = MetadataMessage::request(piece as u32).encode();
            self.transport
                .send_extended(remote.ut_metadata_id, &request)
                .await?;
        }

        let pieces = timeout(self.fetch_timeout, self.collect_pieces(count))
            .await
            .map_err(|_| FetchError::Timeout)??;

        self.transition(FetchState::Reassembling);
        let metadata = reassemble(pieces)?;

        if Sha1::digest(&metadata)[..] != self.info_hash[..] {
            return Err(FetchError::InfoHashMismatch);
        }
        if decode(&metadata)?.as_dict().is_none() {
            return Err(FetchError::Protocol("metadata is not a dictionary".into()));
        }

        Ok(metadata)
    }

    async fn extended_handshake(&mut self) -> Result<RemoteMetadata, FetchError> {
        self.transport
            .send_extended(EXTENSION_HANDSHAKE_ID, &ExtensionHandshake::local().encode())
            .await?;

        let handshake = loop {
            match self.transport.receive_message().await? {
                PeerMessage::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload,
                } => break ExtensionHandshake::decode(&payload)?,
                other => trace!("skipping {:?} before extension handshake", other),
            }
        };

        let size = handshake
            .metadata_size
            .ok_or(FetchError::MissingMetadataSize)?;
        if size <= 0 {
            return Err(FetchError::Protocol(format!("metadata_size {}", size)));
        }
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s <= self.max_metadata_size)
            .ok_or(FetchError::TooManyPieces(size))?;

        let ut_metadata_id = handshake
            .extension_id(UT_METADATA)
            .ok_or(FetchError::UnsupportedExtension)?;

        Ok(RemoteMetadata {
            ut_metadata_id,
            size,
        })
    }

    /// Reads `data` messages into their slots until every slot is filled or
    /// a short piece marks the end of the metadata.
    async fn collect_pieces(&mut self, count: usize) -> Result<Vec<Option<Bytes>>, FetchError> {
        let mut pieces: Vec<Option<Bytes>> = vec![None; count];
        let mut filled = 0;

        while filled < count {
            let payload = match self.transport.receive_message().await? {
                PeerMessage::Extended {
                    id: LOCAL_UT_METADATA_ID,
                    payload,
                } => payload,
                other => {
                    trace!("skipping {:?} during piece fetch", other);
                    continue;
                }
            };

            let msg = MetadataMessage::decode(&payload)?;
            match msg.msg_type {
                MetadataMessageType::Reject => return Err(FetchError::Rejected(msg.piece)),
                // We have nothing to serve.
                MetadataMessageType::Request => continue,
                MetadataMessageType::Data => {}
            }

            let index = msg.piece as usize;
            let slot = pieces.get_mut(index).ok_or_else(|| {
                FetchError::Protocol(format!("piece {} out of range 0..{}", index, count))
            })?;
            if slot.is_none() {
                filled += 1;
            }
            let last = msg.data.len() < METADATA_PIECE_SIZE;
            *slot = Some(msg.data);

            if last {
                break;
            }
        }

        Ok(pieces)
    }

    fn transition(&mut self, next: FetchState) {
        trace!("metadata exchange {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Concatenates the pieces in index order. Every slot must be filled.
pub fn reassemble(pieces: Vec<Option<Bytes>>) -> Result<Bytes, FetchError> {
    let total = pieces.iter().flatten().map(Bytes::len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for (index, piece) in pieces.into_iter().enumerate() {
        let piece = piece.ok_or(FetchError::MissingPiece(index))?;
        buf.extend_from_slice(&piece);
    }
    Ok(buf.freeze())
}

/// Fetches metadata over TCP, one connection per request.
#[derive(Debug, Clone)]
pub struct PeerFetcher {
    config: FetchConfig,
    peer_id: PeerId,
}

impl PeerFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config,
            peer_id: PeerId::generate(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Connects to `addr` and downloads the info dictionary for `info_hash`.
    pub async fn fetch_metadata(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
    ) -> Result<Bytes, FetchError> {
        trace!("dialing {} for {}", addr, hex::encode(info_hash));
        let stream = timeout(self.config.dial_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| FetchError::Timeout)??;
        // Reset instead of a graceful close when we drop the connection.
        stream.set_linger(Some(Duration::ZERO))?;

        MetadataExchange::new(stream, info_hash, self.peer_id, &self.config)
            .run()
            .await
    }
}

impl MetadataFetch for PeerFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<Torrent, FetchError> {
        let metadata = self
            .fetch_metadata(request.addr, request.info_hash)
            .await?;
        let torrent = Torrent::from_metadata(request.info_hash, metadata)?;
        debug!("resolved {} from {}", torrent.info_hash_hex(), request.addr);
        Ok(torrent)
    }
}
