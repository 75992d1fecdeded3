//! Mainline DHT (BEP-5) in crawler form.
//!
//! [`DhtServer`] owns the UDP endpoint and answers other nodes, turning every
//! `announce_peer` it receives into a [`PeerAnnouncement`]. The
//! [`RoutingTable`] is an actor that keeps 160 k-buckets, pings active nodes
//! on a timer and evicts the ones that stop answering.

mod bucket;
mod error;
mod message;
mod node;
mod routing;
mod server;
mod snapshot;

pub use bucket::Bucket;
pub use error::DhtError;
pub use message::{
    decode_compact_peer, encode_compact_peer, new_transaction_id, DhtMessage, DhtQuery,
    DhtResponse, TransactionId, ERROR_GENERIC, ERROR_METHOD_UNKNOWN,
};
pub use node::{decode_compact_nodes, encode_compact_nodes, Node, NodeId, COMPACT_NODE_LEN, ID_BITS, ID_LEN};
pub use routing::{LivenessProbe, RoutingTable, TableConfig, TableStats};
pub use server::{AnnounceHandler, DhtServer, PeerAnnouncement};
pub use snapshot::{BucketSnapshot, TableSnapshot};

#[cfg(test)]
mod tests;
