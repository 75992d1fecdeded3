//! Bencode, the dictionary encoding shared by the DHT and the metadata format.
//!
//! Only what the crawler needs is implemented: a [`Value`] tree, canonical
//! encoding, strict decoding, and prefix decoding for `ut_metadata` data
//! messages where raw piece bytes follow the dictionary.
//!
//! ```
//! use rcrawl::bencode::{decode, decode_prefix, encode, Value};
//!
//! let value = decode(b"d3:foo3:bare").unwrap();
//! assert_eq!(value.get(b"foo").and_then(|v| v.as_str()), Some("bar"));
//! assert_eq!(encode(&value), b"d3:foo3:bare");
//!
//! let (head, used) = decode_prefix(b"i7eRAW").unwrap();
//! assert_eq!(head, Value::Integer(7));
//! assert_eq!(used, 3);
//! ```

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::{DictBuilder, Value};

#[cfg(test)]
mod tests;
