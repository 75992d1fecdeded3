//! Metadata exchange with a single peer (BEP-9 over BEP-10).
//!
//! A fetch connects to the announcing peer, performs the 68-byte BitTorrent
//! handshake with the extension bit set, learns the peer's `ut_metadata` id
//! and `metadata_size` from the extension handshake, requests every 16 KiB
//! piece and reassembles the info dictionary. Nothing else of the peer wire
//! protocol is spoken.

mod error;
mod exchange;
mod message;
mod peer_id;
mod transport;

pub use error::FetchError;
pub use exchange::{reassemble, FetchState, MetadataExchange, PeerFetcher};
pub use message::{
    encode_extended, metadata_piece_count, ExtensionHandshake, Handshake, MetadataMessage,
    MetadataMessageType, PeerMessage, EXTENDED_MESSAGE_ID, EXTENSION_HANDSHAKE_ID,
    HANDSHAKE_LEN, LOCAL_UT_METADATA_ID, METADATA_PIECE_SIZE, PROTOCOL, UT_METADATA,
};
pub use peer_id::PeerId;
pub use transport::Transport;
