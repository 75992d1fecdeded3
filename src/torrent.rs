//! Read-only view of a resolved info dictionary.

use bytes::Bytes;
use thiserror::Error;

use crate::bencode::{decode, encode, BencodeError, Value};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("metadata is not a dictionary")]
    NotADictionary,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// A file within a torrent. Multi-file paths are joined with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: String,
    pub length: u64,
}

/// A torrent described by its info dictionary, as fetched from a peer.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use rcrawl::torrent::Torrent;
///
/// let info = Bytes::from_static(b"d6:lengthi5e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaae");
/// let torrent = Torrent::from_metadata([0u8; 20], info).unwrap();
///
/// assert_eq!(torrent.name(), "a.txt");
/// assert_eq!(torrent.total_length(), 5);
/// assert_eq!(torrent.piece_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Torrent {
    info_hash: [u8; 20],
    announce: Option<String>,
    name: String,
    piece_length: u64,
    pieces: Bytes,
    files: Vec<TorrentFile>,
    raw_info: Bytes,
}

impl Torrent {
    /// Parses a raw info dictionary. `info_hash` is taken as given; callers
    /// that fetched the bytes from an untrusted peer verify it first.
    pub fn from_metadata(info_hash: [u8; 20], raw: Bytes) -> Result<Self, TorrentError> {
        let info = decode(&raw)?;
        if info.as_dict().is_none() {
            return Err(TorrentError::NotADictionary);
        }

        let name = info
            .get(b"name")
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or(TorrentError::MissingField("name"))?;

        let piece_length = info
            .get(b"piece length")
            .ok_or(TorrentError::MissingField("piece length"))?
            .as_integer()
            .and_then(|n| u64::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or(TorrentError::InvalidField("piece length"))?;

        let pieces = info
            .get(b"pieces")
            .ok_or(TorrentError::MissingField("pieces"))?
            .as_bytes()
            .filter(|p| p.len() % 20 == 0)
            .cloned()
            .ok_or(TorrentError::InvalidField("pieces"))?;

        // Info dictionaries rarely carry one, but some clients put it there.
        let announce = info
            .get(b"announce")
            .and_then(Value::as_str)
            .map(String::from);

        let files = match (info.get(b"files"), info.get(b"length")) {
            (Some(files), _) => parse_files(files)?,
            (None, Some(length)) => vec![TorrentFile {
                path: name.clone(),
                length: parse_length(length)?,
            }],
            (None, None) => return Err(TorrentError::MissingField("length or files")),
        };

        Ok(Self {
            info_hash,
            announce,
            name,
            piece_length,
            pieces,
            files,
            raw_info: raw,
        })
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    /// Concatenated 20-byte SHA-1 piece hashes.
    pub fn pieces(&self) -> &Bytes {
        &self.pieces
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    /// Sum of the file lengths, saturating at `u64::MAX`.
    pub fn total_length(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |total, f| total.saturating_add(f.length))
    }

    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    /// A minimal `.torrent` file wrapping the info dictionary byte for byte,
    /// so the file hashes to the same info-hash.
    pub fn to_torrent_file(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw_info.len() + 64);
        out.push(b'd');
        if let Some(announce) = &self.announce {
            out.extend_from_slice(b"8:announce");
            out.extend_from_slice(&encode(&Value::string(announce)));
        }
        out.extend_from_slice(b"4:info");
        out.extend_from_slice(&self.raw_info);
        out.push(b'e');
        out
    }
}

fn parse_length(value: &Value) -> Result<u64, TorrentError> {
    value
        .as_integer()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or(TorrentError::InvalidField("length"))
}

fn parse_files(value: &Value) -> Result<Vec<TorrentFile>, TorrentError> {
    let list = value
        .as_list()
        .ok_or(TorrentError::InvalidField("files"))?;

    list.iter()
        .map(|file| {
            let length = parse_length(
                file.get(b"length")
                    .ok_or(TorrentError::MissingField("length"))?,
            )?;
            let components = file
                .get(b"path")
                .and_then(Value::as_list)
                .filter(|p| !p.is_empty())
                .ok_or(TorrentError::InvalidField("path"))?;

            let path = components
                .iter()
                .map(|c| {
                    c.as_bytes()
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .ok_or(TorrentError::InvalidField("path"))
                })
                .collect::<Result<Vec<_>, _>>()?
                .join("/");

            Ok(TorrentFile { path, length })
        })
        .collect()
}
