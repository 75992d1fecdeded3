use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid node id")]
    InvalidNodeId,

    #[error("compact node list length {0} is not a multiple of 26")]
    InvalidCompactLength(usize),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("routing table is stopped")]
    TableStopped,
}
