use thiserror::Error;

use crate::bencode::BencodeError;
use crate::torrent::TorrentError;

/// Why a metadata fetch failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer does not support ut_metadata")]
    UnsupportedExtension,

    #[error("extended handshake carries no metadata_size")]
    MissingMetadataSize,

    #[error("metadata size {0} exceeds the limit")]
    TooManyPieces(i64),

    #[error("peer rejected metadata piece {0}")]
    Rejected(u32),

    #[error("metadata piece {0} never arrived")]
    MissingPiece(usize),

    #[error("metadata does not hash to the requested info-hash")]
    InfoHashMismatch,

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("invalid torrent: {0}")]
    Torrent(#[from] TorrentError),

    #[error("fetch task aborted")]
    Aborted,
}

impl FetchError {
    /// Dial, read and write failures, as opposed to a peer speaking the
    /// protocol wrong.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FetchError::Io(_) | FetchError::Timeout | FetchError::ConnectionClosed
        )
    }
}
