use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use glob::Pattern;
use log::debug;
use sha1_smol::Sha1;

use super::{PieceCalculation, Torrent};
use crate::util::matches_any_pattern;

/// Read granularity for piece verification.
const HASH_READ_BLOCK_SIZE: u64 = 256 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum HashStatus {
    Success,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TouchStatus {
    Success,
    Failed,
}

/// Outcome of `Torrent::verify_hash`.
///
/// `hash_status` has an entry for every file whose basename matched a
/// verification pattern. `touch_status` flags files whose pieces are
/// shared with absent or failed data and that therefore must not be
/// mutated in place.
#[derive(Debug, Default)]
pub struct VerifyResult {
    pub hash_status: HashMap<PathBuf, HashStatus>,
    pub touch_status: HashMap<PathBuf, TouchStatus>,
}

impl VerifyResult {
    pub fn all_verified_ok(&self) -> bool {
        self.hash_status
            .values()
            .all(|status| *status == HashStatus::Success)
    }
}

impl Torrent {
    /// Hash only the pieces needed to judge the files matching
    /// `patterns` against `file_mapping`, which maps every torrent
    /// path to its on-disk location (or `None` when absent).
    ///
    /// A piece's SHA-1 is accumulated across all files contributing to
    /// it; each piece is hashed at most once and a failed piece skips
    /// the rest of the current file.
    pub fn verify_hash(
        &self,
        patterns: &[Pattern],
        file_mapping: &HashMap<PathBuf, Option<PathBuf>>,
    ) -> io::Result<VerifyResult> {
        let calculations: Vec<PieceCalculation> = self
            .filelist
            .iter()
            .map(|f| f.pieces.calculate_offsets(f.size, f.is_last_file))
            .collect();
        let verified: Vec<bool> = self
            .filelist
            .iter()
            .map(|f| {
                f.path
                    .file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|name| matches_any_pattern(&name, patterns, true))
            })
            .collect();

        let mut pieces_to_verify: HashSet<u64> = HashSet::new();
        for (index, calculation) in calculations.iter().enumerate() {
            if verified[index] {
                pieces_to_verify.extend(calculation.piece_indices());
            }
        }

        // None marks a piece that cannot be decided because a file
        // contributing to it is absent.
        let mut piece_status: HashMap<u64, Option<bool>> = HashMap::new();
        let mut piece_files: HashMap<u64, Vec<usize>> = HashMap::new();
        let file_has_inner: Vec<bool> = calculations
            .iter()
            .map(|c| c.has_complete_pieces())
            .collect();

        let mut hasher: Option<Sha1> = None;
        let mut hasher_piece: Option<u64> = None;
        let mut data_left = 0u64;
        let mut skip_to_piece: Option<u64> = None;
        let mut buffer = vec![0u8; HASH_READ_BLOCK_SIZE as usize];

        for (index, torrent_file) in self.filelist.iter().enumerate() {
            let calculation = &calculations[index];
            let full_path = file_mapping.get(&torrent_file.path).and_then(|p| p.as_ref());
            let Some(full_path) = full_path else {
                piece_status.insert(calculation.start_piece, None);
                piece_status.insert(calculation.end_piece, None);
                skip_to_piece = Some(calculation.end_piece + 1);
                continue;
            };

            let mut fp: Option<File> = None;
            for (offset, expected) in calculation.pieces().iter().enumerate() {
                let piece_index = calculation.start_piece + offset as u64;
                piece_files.entry(piece_index).or_default().push(index);

                if skip_to_piece.is_some_and(|skip| skip > piece_index) {
                    continue;
                }
                if !pieces_to_verify.contains(&piece_index) {
                    continue;
                }
                if piece_status.contains_key(&piece_index) {
                    continue;
                }

                // Where this piece starts, relative to the current file.
                let expected_tell = if piece_index > calculation.start_piece {
                    calculation.start_offset
                        + (piece_index - calculation.first_complete_piece) * self.piece_length
                } else {
                    0
                };

                if fp.is_none() {
                    let mut file = File::open(full_path)?;
                    if expected_tell != 0 {
                        file.seek(SeekFrom::Start(expected_tell))?;
                    }
                    fp = Some(file);
                }
                let file = fp.as_mut().expect("file handle opened above");

                if hasher_piece != Some(piece_index) {
                    hasher = Some(Sha1::new());
                    hasher_piece = Some(piece_index);
                    data_left =
                        (self.size - piece_index * self.piece_length).min(self.piece_length);
                    if file.stream_position()? != expected_tell {
                        file.seek(SeekFrom::Start(expected_tell))?;
                    }
                }

                let hasher = hasher.as_mut().expect("hasher set with hasher_piece");
                while data_left > 0 {
                    let wanted = data_left.min(HASH_READ_BLOCK_SIZE) as usize;
                    let read = file.read(&mut buffer[..wanted])?;
                    hasher.update(&buffer[..read]);
                    data_left -= read as u64;
                    if read == 0 {
                        break;
                    }
                }

                if data_left == 0 {
                    let passed = hasher.digest().bytes() == expected.bytes();
                    piece_status.insert(piece_index, Some(passed));
                    if !passed {
                        debug!(
                            "piece {piece_index} failed verification, skipping to the end of {}",
                            torrent_file.path.display()
                        );
                        skip_to_piece = Some(calculation.end_piece);
                    }
                }
            }
        }

        let mut result = VerifyResult::default();
        for (index, torrent_file) in self.filelist.iter().enumerate() {
            if !verified[index] {
                continue;
            }
            let calculation = &calculations[index];
            let status_of = |piece: u64| piece_status.get(&piece).copied().flatten();

            let inner: Vec<Option<bool>> = calculation
                .complete_piece_indices()
                .map(status_of)
                .collect();
            let mut edges: Vec<Option<bool>> = Vec::new();
            if calculation.start_piece != calculation.first_complete_piece {
                edges.push(status_of(calculation.start_piece));
            }
            if calculation.last_complete_piece() != Some(calculation.end_piece) {
                edges.push(status_of(calculation.end_piece));
            }

            let all_inner_pass = !inner.is_empty() && inner.iter().all(|s| *s == Some(true));
            let no_edge_failed = edges.iter().all(|s| *s != Some(false));
            let all_edges_pass = edges.iter().all(|s| *s == Some(true));
            // An edge piece can only be blamed on a neighbor when that
            // neighbor has pieces of its own to be judged by.
            let neighbors_judged_separately = [calculation.start_piece, calculation.end_piece]
                .iter()
                .all(|piece| {
                    piece_files
                        .get(piece)
                        .is_none_or(|files| files.iter().all(|&f| file_has_inner[f]))
                });

            let status = if all_inner_pass && no_edge_failed {
                HashStatus::Success
            } else if inner.is_empty() && all_edges_pass {
                HashStatus::Success
            } else if all_inner_pass && neighbors_judged_separately {
                HashStatus::Success
            } else {
                HashStatus::Failed
            };
            result.hash_status.insert(torrent_file.path.clone(), status);
        }

        for (index, torrent_file) in self.filelist.iter().enumerate() {
            let calculation = &calculations[index];
            let statuses: HashSet<Option<bool>> = calculation
                .piece_indices()
                .filter_map(|piece| piece_status.get(&piece).copied())
                .collect();

            let hash_failed =
                result.hash_status.get(&torrent_file.path) == Some(&HashStatus::Failed);
            if hash_failed || statuses.contains(&Some(false)) {
                result
                    .touch_status
                    .insert(torrent_file.path.clone(), TouchStatus::Failed);
            } else if statuses.contains(&None) {
                result
                    .touch_status
                    .insert(torrent_file.path.clone(), TouchStatus::Success);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{patterns, TestTorrentDisk};

    fn statuses(result: &VerifyResult) -> (Vec<(&str, HashStatus)>, Vec<(&str, TouchStatus)>) {
        let mut hashes: Vec<_> = result
            .hash_status
            .iter()
            .map(|(k, v)| (k.to_str().unwrap(), *v))
            .collect();
        hashes.sort();
        let mut touches: Vec<_> = result
            .touch_status
            .iter()
            .map(|(k, v)| (k.to_str().unwrap(), *v))
            .collect();
        touches.sort();
        (hashes, touches)
    }

    #[test]
    fn all_files_present_and_intact() {
        let disk = TestTorrentDisk::standard();
        let result = disk
            .torrent()
            .verify_hash(&patterns(&["*"]), &disk.full_mapping())
            .unwrap();
        assert_eq!(result.hash_status.len(), 3);
        assert!(result.all_verified_ok());
        assert!(result.touch_status.is_empty());
    }

    #[test]
    fn missing_last_file_fails_its_neighbors_edge() {
        let disk = TestTorrentDisk::standard();
        let result = disk
            .torrent()
            .verify_hash(
                &patterns(&["*"]),
                &disk.mapping_without(&["testfiles/file_c.txt"]),
            )
            .unwrap();
        let (hashes, touches) = statuses(&result);
        assert_eq!(
            hashes,
            vec![
                ("testfiles/file_a.txt", HashStatus::Success),
                ("testfiles/file_b.txt", HashStatus::Failed),
                ("testfiles/file_c.txt", HashStatus::Failed),
            ]
        );
        assert_eq!(
            touches,
            vec![
                ("testfiles/file_b.txt", TouchStatus::Failed),
                ("testfiles/file_c.txt", TouchStatus::Failed),
            ]
        );
    }

    #[test]
    fn missing_middle_file_touches_both_neighbors() {
        let disk = TestTorrentDisk::standard();
        let result = disk
            .torrent()
            .verify_hash(
                &patterns(&["*"]),
                &disk.mapping_without(&["testfiles/file_b.txt"]),
            )
            .unwrap();
        let (hashes, touches) = statuses(&result);
        assert_eq!(
            hashes,
            vec![
                ("testfiles/file_a.txt", HashStatus::Success),
                ("testfiles/file_b.txt", HashStatus::Failed),
                ("testfiles/file_c.txt", HashStatus::Success),
            ]
        );
        assert_eq!(
            touches,
            vec![
                ("testfiles/file_a.txt", TouchStatus::Success),
                ("testfiles/file_b.txt", TouchStatus::Failed),
                ("testfiles/file_c.txt", TouchStatus::Success),
            ]
        );
    }

    #[test]
    fn missing_first_file() {
        let disk = TestTorrentDisk::standard();
        let result = disk
            .torrent()
            .verify_hash(
                &patterns(&["*"]),
                &disk.mapping_without(&["testfiles/file_a.txt"]),
            )
            .unwrap();
        let (hashes, touches) = statuses(&result);
        assert_eq!(
            hashes,
            vec![
                ("testfiles/file_a.txt", HashStatus::Failed),
                ("testfiles/file_b.txt", HashStatus::Failed),
                ("testfiles/file_c.txt", HashStatus::Success),
            ]
        );
        assert_eq!(
            touches,
            vec![
                ("testfiles/file_a.txt", TouchStatus::Failed),
                ("testfiles/file_b.txt", TouchStatus::Failed),
            ]
        );
    }

    #[test]
    fn corruption_in_an_unshared_piece_blames_one_file() {
        let disk = TestTorrentDisk::standard();
        // Piece 0 holds only file_a data.
        let mapping = disk.mapping_with_corrupted("testfiles/file_a.txt", 1);
        let result = disk
            .torrent()
            .verify_hash(&patterns(&["*"]), &mapping)
            .unwrap();
        let (hashes, touches) = statuses(&result);
        assert_eq!(
            hashes,
            vec![
                ("testfiles/file_a.txt", HashStatus::Failed),
                ("testfiles/file_b.txt", HashStatus::Success),
                ("testfiles/file_c.txt", HashStatus::Success),
            ]
        );
        assert_eq!(touches, vec![("testfiles/file_a.txt", TouchStatus::Failed)]);
    }

    #[test]
    fn corruption_in_a_shared_piece_fails_both_tenants() {
        let disk = TestTorrentDisk::standard();
        // Byte 9 of file_a is inside the piece shared with file_b.
        let mapping = disk.mapping_with_corrupted("testfiles/file_a.txt", 9);
        let result = disk
            .torrent()
            .verify_hash(&patterns(&["*"]), &mapping)
            .unwrap();
        let (hashes, touches) = statuses(&result);
        assert_eq!(
            hashes,
            vec![
                ("testfiles/file_a.txt", HashStatus::Failed),
                ("testfiles/file_b.txt", HashStatus::Failed),
                ("testfiles/file_c.txt", HashStatus::Success),
            ]
        );
        assert_eq!(
            touches,
            vec![
                ("testfiles/file_a.txt", TouchStatus::Failed),
                ("testfiles/file_b.txt", TouchStatus::Failed),
            ]
        );
    }

    #[test]
    fn single_pattern_still_touches_untested_neighbors() {
        let disk = TestTorrentDisk::standard();
        let mapping = disk.mapping_with_corrupted("testfiles/file_b.txt", 1);
        let result = disk
            .torrent()
            .verify_hash(&patterns(&["file_b.txt"]), &mapping)
            .unwrap();
        let (hashes, touches) = statuses(&result);
        assert_eq!(hashes, vec![("testfiles/file_b.txt", HashStatus::Failed)]);
        assert_eq!(
            touches,
            vec![
                ("testfiles/file_a.txt", TouchStatus::Failed),
                ("testfiles/file_b.txt", TouchStatus::Failed),
            ]
        );
    }

    #[test]
    fn verify_is_idempotent_and_never_upgrades() {
        let disk = TestTorrentDisk::standard();
        let mapping = disk.mapping_without(&["testfiles/file_b.txt"]);
        let first = disk
            .torrent()
            .verify_hash(&patterns(&["*"]), &mapping)
            .unwrap();
        let second = disk
            .torrent()
            .verify_hash(&patterns(&["*"]), &mapping)
            .unwrap();
        assert_eq!(first.hash_status, second.hash_status);
        assert_eq!(first.touch_status, second.touch_status);

        // Removing a mapping entry must not upgrade any other file.
        let smaller = disk.mapping_without(&["testfiles/file_a.txt", "testfiles/file_b.txt"]);
        let reduced = disk
            .torrent()
            .verify_hash(&patterns(&["*"]), &smaller)
            .unwrap();
        for (path, status) in &first.hash_status {
            if *status == HashStatus::Failed {
                assert_eq!(reduced.hash_status.get(path), Some(&HashStatus::Failed));
            }
        }
    }
}
