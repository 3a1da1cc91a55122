//! Shared fixtures for the test suites: an in-memory metainfo builder
//! and a temp-dir payload that mirrors it on disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde_bencode::value::Value;
use sha1_smol::Sha1;

use crate::torrent::{parse_torrent, Torrent};

pub fn patterns(raw: &[&str]) -> Vec<Pattern> {
    raw.iter().map(|p| Pattern::new(p).unwrap()).collect()
}

pub struct TorrentBuilder {
    name: String,
    piece_length: u64,
    files: Vec<(Vec<Vec<u8>>, Vec<u8>)>,
    single: Option<Vec<u8>>,
    announce: Option<String>,
    announce_tiers: Vec<Vec<String>>,
    source: Option<String>,
    corrupt_pieces: bool,
}

impl TorrentBuilder {
    pub fn new(name: &str, piece_length: u64) -> Self {
        TorrentBuilder {
            name: name.to_string(),
            piece_length,
            files: Vec::new(),
            single: None,
            announce: None,
            announce_tiers: Vec::new(),
            source: None,
            corrupt_pieces: false,
        }
    }

    pub fn file(mut self, relative_path: &str, content: &[u8]) -> Self {
        let segments = relative_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
            .collect();
        self.files.push((segments, content.to_vec()));
        self
    }

    pub fn file_raw(mut self, segments: Vec<Vec<u8>>, content: &[u8]) -> Self {
        self.files.push((segments, content.to_vec()));
        self
    }

    pub fn single_file(mut self, content: &[u8]) -> Self {
        self.single = Some(content.to_vec());
        self
    }

    pub fn announce(mut self, url: &str) -> Self {
        self.announce = Some(url.to_string());
        self
    }

    pub fn announce_tier(mut self, urls: &[&str]) -> Self {
        self.announce_tiers
            .push(urls.iter().map(|u| u.to_string()).collect());
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn corrupt_pieces_blob(mut self) -> Self {
        self.corrupt_pieces = true;
        self
    }

    fn payload(&self) -> Vec<u8> {
        match &self.single {
            Some(content) => content.clone(),
            None => self
                .files
                .iter()
                .flat_map(|(_, content)| content.iter().copied())
                .collect(),
        }
    }

    fn pieces_blob(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut blob: Vec<u8> = payload
            .chunks(self.piece_length as usize)
            .flat_map(|chunk| Sha1::from(chunk).digest().bytes())
            .collect();
        if self.corrupt_pieces {
            blob.pop();
        }
        blob
    }

    pub fn to_value(&self) -> Value {
        let mut info: HashMap<Vec<u8>, Value> = HashMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(self.name.as_bytes().to_vec()));
        info.insert(
            b"piece length".to_vec(),
            Value::Int(self.piece_length as i64),
        );
        info.insert(b"pieces".to_vec(), Value::Bytes(self.pieces_blob()));
        if let Some(source) = &self.source {
            info.insert(b"source".to_vec(), Value::Bytes(source.as_bytes().to_vec()));
        }

        match &self.single {
            Some(content) => {
                info.insert(b"length".to_vec(), Value::Int(content.len() as i64));
            }
            None => {
                let files = self
                    .files
                    .iter()
                    .map(|(segments, content)| {
                        let mut file: HashMap<Vec<u8>, Value> = HashMap::new();
                        file.insert(b"length".to_vec(), Value::Int(content.len() as i64));
                        file.insert(
                            b"path".to_vec(),
                            Value::List(
                                segments.iter().map(|s| Value::Bytes(s.clone())).collect(),
                            ),
                        );
                        Value::Dict(file)
                    })
                    .collect();
                info.insert(b"files".to_vec(), Value::List(files));
            }
        }

        let mut root: HashMap<Vec<u8>, Value> = HashMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        if let Some(announce) = &self.announce {
            root.insert(
                b"announce".to_vec(),
                Value::Bytes(announce.as_bytes().to_vec()),
            );
        }
        if !self.announce_tiers.is_empty() {
            root.insert(
                b"announce-list".to_vec(),
                Value::List(
                    self.announce_tiers
                        .iter()
                        .map(|tier| {
                            Value::List(
                                tier.iter()
                                    .map(|u| Value::Bytes(u.as_bytes().to_vec()))
                                    .collect(),
                            )
                        })
                        .collect(),
                ),
            );
        }
        Value::Dict(root)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(&self.to_value()).unwrap()
    }

    pub fn parse(&self) -> Torrent {
        parse_torrent(&self.to_value(), false).unwrap()
    }
}

/// A parsed torrent together with its payload written into a temp dir.
pub struct TestTorrentDisk {
    pub tempdir: tempfile::TempDir,
    pub builder: TorrentBuilder,
    files: Vec<(PathBuf, Vec<u8>)>,
}

impl TestTorrentDisk {
    /// Three files of 11, 12 and 13 bytes under `testfiles/`, hashed
    /// with 8-byte pieces: file_a owns piece 0, shares piece 1 with
    /// file_b; file_b fits no piece of its own and shares piece 2 with
    /// file_c; file_c owns pieces 3 and 4.
    pub fn standard() -> Self {
        Self::build(
            "testfiles",
            8,
            &[
                ("file_a.txt", &[b'a'; 11][..]),
                ("file_b.txt", &[b'b'; 12][..]),
                ("file_c.txt", &[b'c'; 13][..]),
            ],
        )
    }

    pub fn build(name: &str, piece_length: u64, files: &[(&str, &[u8])]) -> Self {
        let mut builder = TorrentBuilder::new(name, piece_length);
        for (path, content) in files {
            builder = builder.file(path, content);
        }

        let tempdir = tempfile::tempdir().unwrap();
        let mut on_disk = Vec::new();
        for (path, content) in files {
            let full = tempdir.path().join(name).join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(&full, content).unwrap();
            on_disk.push((PathBuf::from(name).join(path), content.to_vec()));
        }

        TestTorrentDisk {
            tempdir,
            builder,
            files: on_disk,
        }
    }

    pub fn torrent(&self) -> Torrent {
        self.builder.parse()
    }

    pub fn root(&self) -> &Path {
        self.tempdir.path()
    }

    pub fn full_mapping(&self) -> HashMap<PathBuf, Option<PathBuf>> {
        self.files
            .iter()
            .map(|(path, _)| (path.clone(), Some(self.root().join(path))))
            .collect()
    }

    pub fn mapping_without(&self, absent: &[&str]) -> HashMap<PathBuf, Option<PathBuf>> {
        let mut mapping = self.full_mapping();
        for path in absent {
            mapping.insert(PathBuf::from(path), None);
        }
        mapping
    }

    /// Map one torrent path to a copy with a single byte flipped.
    pub fn mapping_with_corrupted(
        &self,
        path: &str,
        offset: usize,
    ) -> HashMap<PathBuf, Option<PathBuf>> {
        let (_, content) = self
            .files
            .iter()
            .find(|(p, _)| p == Path::new(path))
            .expect("unknown fixture path");
        let mut corrupted = content.clone();
        corrupted[offset] ^= 0xff;

        let bad_path = self.root().join(format!(
            "{}_bad",
            Path::new(path).file_name().unwrap().to_str().unwrap()
        ));
        fs::write(&bad_path, corrupted).unwrap();

        let mut mapping = self.full_mapping();
        mapping.insert(PathBuf::from(path), Some(bad_path));
        mapping
    }
}
