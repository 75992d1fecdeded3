//! rcrawl - A BitTorrent DHT crawler
//!
//! This library joins the mainline DHT, harvests the info-hashes other nodes
//! announce, and resolves each one into its info dictionary by asking the
//! announcing peer for it.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 Distributed Hash Table: routing table, KRPC codec, crawling node
//! - [`collector`] - Bounded-concurrency admission of metadata fetches
//! - [`metadata`] - BEP-9/10 metadata exchange with a single peer
//! - [`torrent`] - Parsed info dictionaries
//! - [`config`] - TOML configuration
//! - [`crawler`] - DHT announces wired into the collector

pub mod bencode;
pub mod collector;
pub mod config;
pub mod crawler;
pub mod dht;
pub mod metadata;
pub mod torrent;

pub use bencode::{decode, encode, BencodeError, Value};
pub use collector::{Collector, CollectorError, FetchRequest, FetchTicket, MetadataFetch};
pub use config::{ConfigError, CrawlerConfig};
pub use crawler::{Crawler, CrawlerStats};
pub use dht::{DhtError, DhtMessage, DhtServer, Node, NodeId, PeerAnnouncement, RoutingTable};
pub use metadata::{FetchError, MetadataExchange, PeerFetcher};
pub use torrent::{Torrent, TorrentError, TorrentFile};
