mod pieces;
mod verify;

pub use pieces::{Digest, PieceCalculation, Pieces};
pub use verify::{HashStatus, TouchStatus, VerifyResult};

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use glob::Pattern;
use serde_bencode::value::Value;
use sha1_smol::Sha1;
use thiserror::Error;

use crate::util::{cleanup_torrent_path_segment, decode_bytes, matches_any_pattern};

#[derive(Debug, Error)]
pub enum ParseTorrentError {
    #[error("torrent is not a bencoded dictionary")]
    NotADictionary,
    #[error("info dict not found")]
    MissingInfo,
    #[error("unable to parse name of torrent")]
    InvalidName,
    #[error("missing or invalid field: {0}")]
    InvalidField(&'static str),
    #[error("broken path elements found in torrent, try utf-8 compat mode")]
    InvalidPathEncoding,
    #[error("empty file path in torrent")]
    EmptyPath,
    #[error("pieces blob is not a multiple of the digest length")]
    InvalidPieces,
    #[error("piece count does not cover the torrent payload")]
    PieceCountMismatch,
    #[error("failed to re-encode the info dict: {0}")]
    Encode(#[from] serde_bencode::Error),
}

/// One file of a torrent payload.
///
/// `path` is the POSIX-style relative path rooted at the torrent name;
/// `pieces` is the piece engine projected to this file's byte offset.
#[derive(Clone, Debug)]
pub struct TorrentFile {
    pub path: PathBuf,
    pub size: u64,
    pub pieces: Pieces,
    pub is_last_file: bool,
}

/// An immutable, parsed torrent.
#[derive(Clone)]
pub struct Torrent {
    pub name: String,
    pub size: u64,
    pub piece_length: u64,
    pub filelist: Vec<TorrentFile>,
    pub trackers: Vec<String>,
}

impl fmt::Debug for Torrent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Torrent")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("piece_length", &self.piece_length)
            .field("files", &self.filelist.len())
            .finish()
    }
}

impl Torrent {
    /// True if any file's basename matches one of the patterns.
    pub fn has_file_patterns(&self, patterns: &[Pattern]) -> bool {
        self.filelist.iter().any(|file| {
            file.path
                .file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|name| matches_any_pattern(&name, patterns, true))
        })
    }
}

fn as_dict(value: &Value) -> Option<&HashMap<Vec<u8>, Value>> {
    match value {
        Value::Dict(dict) => Some(dict),
        _ => None,
    }
}

fn dict_bytes<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(Value::Bytes(bytes)) => Some(bytes),
        _ => None,
    }
}

fn dict_int(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(value)) => Some(*value),
        _ => None,
    }
}

fn dict_size(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<u64> {
    dict_int(dict, key).and_then(|v| u64::try_from(v).ok())
}

/// Parse a decoded metainfo tree into a `Torrent`.
pub fn parse_torrent(data: &Value, utf8_compat_mode: bool) -> Result<Torrent, ParseTorrentError> {
    let root = as_dict(data).ok_or(ParseTorrentError::NotADictionary)?;
    let info = root
        .get(b"info".as_slice())
        .and_then(as_dict)
        .ok_or(ParseTorrentError::MissingInfo)?;

    let name_bytes = dict_bytes(info, b"name").ok_or(ParseTorrentError::InvalidName)?;
    let name = decode_bytes(name_bytes, utf8_compat_mode)
        .ok_or(ParseTorrentError::InvalidName)
        .map(|n| cleanup_torrent_path_segment(&n).to_string())?;
    if name.is_empty() {
        return Err(ParseTorrentError::InvalidName);
    }

    let piece_length =
        dict_size(info, b"piece length").ok_or(ParseTorrentError::InvalidField("piece length"))?;
    if piece_length == 0 {
        return Err(ParseTorrentError::InvalidField("piece length"));
    }
    let blob = dict_bytes(info, b"pieces").ok_or(ParseTorrentError::InvalidField("pieces"))?;
    let pieces = Pieces::from_blob(piece_length, blob).ok_or(ParseTorrentError::InvalidPieces)?;

    let mut size = 0u64;
    let mut filelist = Vec::new();
    match info.get(b"files".as_slice()) {
        Some(Value::List(files)) => {
            let last_index = files.len().saturating_sub(1);
            for (index, file) in files.iter().enumerate() {
                let file = as_dict(file).ok_or(ParseTorrentError::InvalidField("files"))?;
                let length =
                    dict_size(file, b"length").ok_or(ParseTorrentError::InvalidField("length"))?;
                let raw_path = match file.get(b"path".as_slice()) {
                    Some(Value::List(segments)) => segments,
                    _ => return Err(ParseTorrentError::InvalidField("path")),
                };

                let mut path = PathBuf::from(&name);
                let mut segments = 0;
                for segment in raw_path {
                    let Value::Bytes(segment) = segment else {
                        return Err(ParseTorrentError::InvalidField("path"));
                    };
                    if segment.is_empty() {
                        continue;
                    }
                    let segment = decode_bytes(segment, utf8_compat_mode)
                        .ok_or(ParseTorrentError::InvalidPathEncoding)?;
                    let segment = cleanup_torrent_path_segment(&segment);
                    if segment.is_empty() {
                        continue;
                    }
                    path.push(segment);
                    segments += 1;
                }
                if segments == 0 {
                    return Err(ParseTorrentError::EmptyPath);
                }

                filelist.push(TorrentFile {
                    path,
                    size: length,
                    pieces: pieces.slice_from(size),
                    is_last_file: index == last_index,
                });
                size += length;
            }
        }
        Some(_) => return Err(ParseTorrentError::InvalidField("files")),
        None => {
            let length =
                dict_size(info, b"length").ok_or(ParseTorrentError::InvalidField("length"))?;
            filelist.push(TorrentFile {
                path: PathBuf::from(&name),
                size: length,
                pieces: pieces.clone(),
                is_last_file: true,
            });
            size = length;
        }
    }

    if pieces.piece_count() != size.div_ceil(piece_length) {
        return Err(ParseTorrentError::PieceCountMismatch);
    }

    let trackers = parse_trackers(root, utf8_compat_mode);

    Ok(Torrent {
        name,
        size,
        piece_length,
        filelist,
        trackers,
    })
}

/// `announce` first, then every `announce-list` entry, flattened and
/// deduplicated with order preserved.
fn parse_trackers(root: &HashMap<Vec<u8>, Value>, utf8_compat_mode: bool) -> Vec<String> {
    let mut trackers = Vec::new();
    if let Some(announce) = dict_bytes(root, b"announce") {
        if let Some(url) = decode_bytes(announce, utf8_compat_mode) {
            if !url.is_empty() {
                trackers.push(url);
            }
        }
    }

    if let Some(Value::List(groups)) = root.get(b"announce-list".as_slice()) {
        for group in groups {
            let entries = match group {
                Value::List(list) => list.as_slice(),
                single @ Value::Bytes(_) => std::slice::from_ref(single),
                _ => continue,
            };
            for entry in entries {
                let Value::Bytes(bytes) = entry else {
                    continue;
                };
                let Some(url) = decode_bytes(bytes, utf8_compat_mode) else {
                    continue;
                };
                if !url.is_empty() && !trackers.contains(&url) {
                    trackers.push(url);
                }
            }
        }
    }

    trackers
}

/// SHA-1 of the bencoded `info` dict as 40 lowercase hex chars.
pub fn infohash(data: &Value) -> Result<String, ParseTorrentError> {
    let root = as_dict(data).ok_or(ParseTorrentError::NotADictionary)?;
    let info = root
        .get(b"info".as_slice())
        .ok_or(ParseTorrentError::MissingInfo)?;
    let encoded = serde_bencode::to_bytes(info)?;
    Ok(Sha1::from(&encoded[..]).hexdigest())
}

/// The `info.source` field some trackers stamp into their torrents.
pub fn info_source(data: &Value) -> Option<String> {
    let info = as_dict(data).and_then(|root| root.get(b"info".as_slice()))?;
    dict_bytes(as_dict(info)?, b"source").and_then(|bytes| decode_bytes(bytes, true))
}

/// Host of a tracker URL, used for the `{tracker_domain}` store path
/// variable.
pub fn tracker_domain(tracker: &str) -> Option<String> {
    url::Url::parse(tracker)
        .ok()?
        .host_str()
        .map(|host| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TorrentBuilder;

    #[test]
    fn parses_multi_file_torrent() {
        let raw = TorrentBuilder::new("testfiles", 8)
            .file("file_a.txt", b"aaaaaaaaaaa")
            .file("file_b.txt", b"bbbbbbbbbbbb")
            .file("file_c.txt", b"ccccccccccccc")
            .announce("http://tracker.example.com/announce")
            .to_value();
        let torrent = parse_torrent(&raw, false).unwrap();

        assert_eq!(torrent.name, "testfiles");
        assert_eq!(torrent.size, 36);
        assert_eq!(torrent.piece_length, 8);
        assert_eq!(
            torrent
                .filelist
                .iter()
                .map(|f| f.path.clone())
                .collect::<Vec<_>>(),
            vec![
                PathBuf::from("testfiles/file_a.txt"),
                PathBuf::from("testfiles/file_b.txt"),
                PathBuf::from("testfiles/file_c.txt"),
            ]
        );
        assert!(torrent.filelist[2].is_last_file);
        assert!(!torrent.filelist[0].is_last_file);
        assert_eq!(torrent.trackers, vec!["http://tracker.example.com/announce"]);

        // Piece accounting identity.
        let total: u64 = torrent.filelist.iter().map(|f| f.size).sum();
        assert_eq!(total, torrent.size);
        assert_eq!(
            torrent.filelist[0].pieces.piece_count(),
            torrent.size.div_ceil(torrent.piece_length)
        );
    }

    #[test]
    fn parses_single_file_torrent() {
        let raw = TorrentBuilder::new("data.bin", 8)
            .single_file(b"0123456789")
            .to_value();
        let torrent = parse_torrent(&raw, false).unwrap();
        assert_eq!(torrent.filelist.len(), 1);
        assert_eq!(torrent.filelist[0].path, PathBuf::from("data.bin"));
        assert!(torrent.filelist[0].is_last_file);
        assert_eq!(torrent.size, 10);
    }

    #[test]
    fn flattens_and_deduplicates_announce_list() {
        let raw = TorrentBuilder::new("t", 8)
            .single_file(b"xxxxxxxx")
            .announce("http://a.example/announce")
            .announce_tier(&["http://a.example/announce", "http://b.example/announce"])
            .announce_tier(&["http://c.example/announce"])
            .to_value();
        let torrent = parse_torrent(&raw, false).unwrap();
        assert_eq!(
            torrent.trackers,
            vec![
                "http://a.example/announce",
                "http://b.example/announce",
                "http://c.example/announce",
            ]
        );
    }

    #[test]
    fn rejects_broken_torrents() {
        let empty = Value::Dict(Default::default());
        assert!(matches!(
            parse_torrent(&empty, false),
            Err(ParseTorrentError::MissingInfo)
        ));

        let bad_pieces = TorrentBuilder::new("t", 8)
            .single_file(b"xxxxxxxx")
            .corrupt_pieces_blob()
            .to_value();
        assert!(matches!(
            parse_torrent(&bad_pieces, false),
            Err(ParseTorrentError::InvalidPieces)
        ));

        let empty_path = TorrentBuilder::new("t", 8)
            .file("", b"xxxxxxxx")
            .to_value();
        assert!(matches!(
            parse_torrent(&empty_path, false),
            Err(ParseTorrentError::EmptyPath)
        ));
    }

    #[test]
    fn rejects_non_utf8_without_compat_mode() {
        let raw = TorrentBuilder::new("t", 8)
            .file_raw(vec![b"file_\xff.txt".to_vec()], b"xxxxxxxx")
            .to_value();
        assert!(matches!(
            parse_torrent(&raw, false),
            Err(ParseTorrentError::InvalidPathEncoding)
        ));

        let torrent = parse_torrent(&raw, true).unwrap();
        assert_eq!(torrent.filelist[0].path, PathBuf::from("t/file_\u{fffd}.txt"));
    }

    #[test]
    fn infohash_is_stable_hex() {
        let raw = TorrentBuilder::new("t", 8).single_file(b"xxxxxxxx").to_value();
        let hash = infohash(&raw).unwrap();
        assert_eq!(hash.len(), 40);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(hash, infohash(&raw).unwrap());
    }

    #[test]
    fn tracker_domain_extraction() {
        assert_eq!(
            tracker_domain("http://tracker.example.com:8080/announce"),
            Some("tracker.example.com".to_string())
        );
        assert_eq!(tracker_domain("not a url"), None);
    }
}
