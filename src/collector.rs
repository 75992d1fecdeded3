//! Admission control between the DHT and metadata fetching.
//!
//! Announcements arrive far faster than peers can be dialed. The
//! [`Collector`] caps the number of fetches in flight and drops whatever
//! arrives over the cap instead of queueing it.

mod admission;
mod error;
mod request;

pub use admission::{Collector, CollectorStats, FetchTicket, MetadataFetch, ResultHandler};
pub use error::CollectorError;
pub use request::FetchRequest;
