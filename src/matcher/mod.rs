use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::db::{Database, FileQuery, SearchedFile};
use crate::torrent::{Torrent, TorrentFile};
use crate::util::{
    can_potentially_miss_in_unsplittable, get_root_of_unsplittable, is_unsplittable,
};

/// Fraction of a filelist used as anchor lookups before candidate
/// roots are probed file by file.
const EXACT_MATCH_FACTOR: f64 = 0.05;

/// Queued seeded-path lookups are flushed at this many files.
const SEEDED_BATCH_SIZE: usize = 1000;

pub type Result<T> = std::result::Result<T, rusqlite::Error>;

#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// Groups of path prefixes that alias the same storage, so lookups of
/// one spelling also consider the others.
pub struct PathRewriter {
    paths: HashMap<PathBuf, usize>,
    groups: Vec<Vec<PathBuf>>,
}

impl PathRewriter {
    pub fn new(path_mappings: &[Vec<PathBuf>]) -> Self {
        let mut paths = HashMap::new();
        let mut groups = Vec::new();
        for mapping in path_mappings {
            let index = groups.len();
            for path in mapping {
                paths.insert(path.clone(), index);
            }
            groups.push(mapping.clone());
        }
        PathRewriter { paths, groups }
    }

    pub fn rewrite_path(&self, path: &Path, prefix_match: bool) -> Vec<PathBuf> {
        let mut postfix: Option<PathBuf> = None;
        let mut current = path;
        loop {
            if postfix.is_some() && !prefix_match {
                break;
            }
            if let Some(&group) = self.paths.get(current) {
                return match &postfix {
                    None => self.groups[group].clone(),
                    Some(postfix) => self.groups[group].iter().map(|p| p.join(postfix)).collect(),
                };
            }

            let Some(name) = current.file_name() else {
                break;
            };
            postfix = Some(match postfix {
                None => PathBuf::from(name),
                Some(rest) => PathBuf::from(name).join(rest),
            });
            match current.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => current = parent,
                _ => break,
            }
        }
        vec![path.to_path_buf()]
    }
}

struct MatchedFile<'t> {
    torrent_file: &'t TorrentFile,
    searched_files: Vec<SearchedFile>,
}

struct MatchResult<'t> {
    root_path: PathBuf,
    matched_files: Vec<MatchedFile<'t>>,
    size: u64,
}

/// Outcome of a dynamic match.
#[derive(Debug)]
pub enum DynamicMatch {
    Failed {
        missing_size: u64,
    },
    Matched {
        missing_size: u64,
        /// Every torrent path, mapped to its on-disk location or
        /// `None` when unmatched.
        matched_files: HashMap<PathBuf, Option<PathBuf>>,
        /// Files sharing a piece with unmatched data; linking them
        /// directly would let the client corrupt the originals.
        touched_files: Vec<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicMatchOptions {
    pub match_hash_size: bool,
    pub add_limit_size: u64,
    pub add_limit_percent: u64,
    pub hash_probe: bool,
}

#[derive(Clone, Debug)]
pub struct MappedFile {
    pub size: u64,
    pub clients: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct MapResult {
    pub total_size: u64,
    pub seeded_size: u64,
    pub files: HashMap<PathBuf, MappedFile>,
}

pub struct Matcher<'a> {
    rewriter: &'a PathRewriter,
    db: &'a Database,
}

fn anchor_count(len: usize) -> usize {
    ((len as f64) * EXACT_MATCH_FACTOR).ceil() as usize
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Climb `levels` directories, stopping at the filesystem root.
fn climb(path: &Path, levels: usize) -> PathBuf {
    let mut current = path;
    for _ in 0..levels {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current.to_path_buf()
}

fn sorted_for_anchoring<'t>(files: impl IntoIterator<Item = &'t TorrentFile>) -> Vec<&'t TorrentFile> {
    let mut files: Vec<&TorrentFile> = files.into_iter().collect();
    files.sort_by(|a, b| {
        let key_a = (!can_potentially_miss_in_unsplittable(&a.path), a.size);
        let key_b = (!can_potentially_miss_in_unsplittable(&b.path), b.size);
        key_b.cmp(&key_a)
    });
    files
}

impl<'a> Matcher<'a> {
    pub fn new(rewriter: &'a PathRewriter, db: &'a Database) -> Self {
        Matcher { rewriter, db }
    }

    /// Find a single directory that contains the whole filelist at the
    /// exact relative paths, names and sizes.
    pub fn match_files_exact(&self, torrent: &Torrent) -> Result<Option<PathBuf>> {
        info!("doing exact lookup for {torrent:?}");
        let match_results = self.match_filelist_exact(&torrent.filelist, false)?;
        for match_result in match_results {
            if match_result
                .matched_files
                .iter()
                .any(|m| m.searched_files.is_empty())
            {
                debug!("match with missing files found, skipping");
                continue;
            }
            return Ok(Some(match_result.root_path));
        }
        info!("no exact match found for {torrent:?}");
        Ok(None)
    }

    fn match_filelist_exact<'t>(
        &self,
        filelist: &'t [TorrentFile],
        match_normalized_filename: bool,
    ) -> Result<Vec<MatchResult<'t>>> {
        let filelist = sorted_for_anchoring(filelist);
        if filelist.is_empty() {
            warn!("empty filelist, bailing");
            return Ok(Vec::new());
        }

        let mut handled_roots: HashSet<PathBuf> = HashSet::new();
        let mut match_results = Vec::new();
        for &search_file in &filelist[..anchor_count(filelist.len())] {
            let name = file_name_string(&search_file.path);
            let parent = search_file.path.parent().unwrap_or(Path::new(""));
            let query = if match_normalized_filename {
                FileQuery {
                    normalized_filename: Some(&name),
                    size: Some(search_file.size),
                    parent_postfix: Some(parent),
                    ..Default::default()
                }
            } else {
                FileQuery {
                    filename: Some(&name),
                    size: Some(search_file.size),
                    parent_postfix: Some(parent),
                    ..Default::default()
                }
            };

            for entry in self.db.search_file(&query)? {
                let root_path = climb(&entry.path, search_file.path.components().count() - 1);
                if !handled_roots.insert(root_path.clone()) {
                    debug!("skipping already scanned root_path {}", root_path.display());
                    continue;
                }
                debug!("scanning root_path {} for matches", root_path.display());

                let mut matched_size = entry.size;
                let mut matched_files = vec![MatchedFile {
                    torrent_file: search_file,
                    searched_files: vec![entry],
                }];
                for &file in &filelist {
                    if file.path == search_file.path {
                        continue;
                    }
                    let full_path = root_path.join(&file.path);
                    let file_name = file_name_string(&full_path);
                    let file_parent = full_path.parent().unwrap_or(Path::new(""));
                    let query = if match_normalized_filename {
                        FileQuery {
                            normalized_filename: Some(&file_name),
                            size: Some(file.size),
                            parent: Some(file_parent),
                            ..Default::default()
                        }
                    } else {
                        FileQuery {
                            filename: Some(&file_name),
                            size: Some(file.size),
                            parent: Some(file_parent),
                            ..Default::default()
                        }
                    };
                    let search_result = self.db.search_file(&query)?;
                    if !search_result.is_empty() {
                        matched_size += file.size;
                    }
                    matched_files.push(MatchedFile {
                        torrent_file: file,
                        searched_files: search_result,
                    });
                }
                match_results.push(MatchResult {
                    root_path,
                    matched_files,
                    size: matched_size,
                });
            }
        }
        Ok(match_results)
    }

    /// Match the subtree below an unsplittable root, tolerating a
    /// renamed release folder as long as every non-missable file is
    /// accounted for.
    fn match_filelist_unsplittable<'t>(
        &self,
        filelist: &'t [TorrentFile],
        prefix: &Path,
        match_normalized_filename: bool,
    ) -> Result<Vec<MatchResult<'t>>> {
        let filelist =
            sorted_for_anchoring(filelist.iter().filter(|f| f.path.starts_with(prefix)));
        if filelist.is_empty() {
            warn!("empty filelist for prefix {}, bailing", prefix.display());
            return Ok(Vec::new());
        }

        let mut handled_roots: HashSet<PathBuf> = HashSet::new();
        let mut match_results = Vec::new();
        for &search_file in &filelist[..anchor_count(filelist.len())] {
            let relative = search_file
                .path
                .strip_prefix(prefix)
                .expect("filelist filtered by prefix");
            let name = file_name_string(&search_file.path);
            let relative_parent = relative.parent().unwrap_or(Path::new(""));
            let query = if match_normalized_filename {
                FileQuery {
                    normalized_filename: Some(&name),
                    size: Some(search_file.size),
                    parent_postfix: Some(relative_parent),
                    ..Default::default()
                }
            } else {
                FileQuery {
                    filename: Some(&name),
                    size: Some(search_file.size),
                    parent_postfix: Some(relative_parent),
                    ..Default::default()
                }
            };

            for entry in self.db.search_file(&query)? {
                let root_path = climb(&entry.path, relative.components().count() - 1);
                if !handled_roots.insert(root_path.clone()) {
                    debug!("skipping already scanned root_path {}", root_path.display());
                    continue;
                }

                let root_path_is_correct_name = root_path.file_name() == prefix.file_name();
                debug!(
                    "scanning root_path {} for matches with root_path_is_correct_name={root_path_is_correct_name}",
                    root_path.display()
                );

                let mut matched_size = entry.size;
                let mut matched_files = vec![MatchedFile {
                    torrent_file: search_file,
                    searched_files: vec![entry],
                }];
                let mut bad_path_found = false;
                for &file in &filelist {
                    if file.path == search_file.path {
                        continue;
                    }
                    let full_path = root_path.join(
                        file.path.strip_prefix(prefix).expect("filtered by prefix"),
                    );
                    let file_name = file_name_string(&full_path);
                    let file_parent = full_path.parent().unwrap_or(Path::new(""));
                    let query = if match_normalized_filename {
                        FileQuery {
                            normalized_filename: Some(&file_name),
                            size: Some(file.size),
                            parent: Some(file_parent),
                            ..Default::default()
                        }
                    } else {
                        FileQuery {
                            filename: Some(&file_name),
                            size: Some(file.size),
                            parent: Some(file_parent),
                            ..Default::default()
                        }
                    };
                    let search_result = self.db.search_file(&query)?;
                    if !search_result.is_empty() {
                        matched_size += file.size;
                    }
                    let found = !search_result.is_empty();
                    matched_files.push(MatchedFile {
                        torrent_file: file,
                        searched_files: search_result,
                    });

                    if !found
                        && !root_path_is_correct_name
                        && !can_potentially_miss_in_unsplittable(&file.path)
                    {
                        bad_path_found = true;
                        break;
                    }
                }

                if bad_path_found {
                    debug!("bad path found with root_path {}", root_path.display());
                    continue;
                }
                match_results.push(MatchResult {
                    root_path,
                    matched_files,
                    size: matched_size,
                });
            }
        }
        Ok(match_results)
    }

    /// Pick the best hit for one torrent file, preferring exact
    /// filename matches and optionally probing piece hashes.
    fn match_best_file(
        &self,
        torrent_file: &TorrentFile,
        mut searched_files: Vec<SearchedFile>,
        hash_probe: bool,
        match_hash_size: bool,
    ) -> Option<SearchedFile> {
        let wanted_name = file_name_string(&torrent_file.path);
        searched_files.sort_by_key(|candidate| candidate.name != wanted_name);

        for searched_file in searched_files {
            if hash_probe {
                let full_path = searched_file.to_full_path();
                let probe = File::open(&full_path).and_then(|mut fp| {
                    torrent_file.pieces.probe_hash(searched_file.size, &mut fp)
                });
                match probe {
                    Ok(Some(false)) => {
                        debug!(
                            "file {} matched against {} failed hash probe, skipping",
                            full_path.display(),
                            torrent_file.path.display()
                        );
                        continue;
                    }
                    Ok(None) if match_hash_size => {
                        debug!(
                            "file {} has no probeable piece and sizes-only matching is on, skipping",
                            full_path.display()
                        );
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!("failed to probe {}: {err}", full_path.display());
                        continue;
                    }
                }
            }
            return Some(searched_file);
        }
        None
    }

    /// Evaluate all candidate roots of one subtree and keep the one
    /// with the most matched bytes.
    fn select_best_candidate(
        &self,
        candidates: &[MatchResult<'_>],
        hash_probe: bool,
        match_hash_size: bool,
    ) -> HashMap<PathBuf, Option<SearchedFile>> {
        let mut best: Option<(u64, HashMap<PathBuf, Option<SearchedFile>>)> = None;
        for match_result in candidates {
            let mut candidate_result = HashMap::new();
            for matched_file in &match_result.matched_files {
                candidate_result.insert(
                    matched_file.torrent_file.path.clone(),
                    self.match_best_file(
                        matched_file.torrent_file,
                        matched_file.searched_files.clone(),
                        hash_probe,
                        match_hash_size,
                    ),
                );
            }
            let matched_size: u64 = candidate_result
                .values()
                .filter_map(|hit| hit.as_ref())
                .map(|hit| hit.size)
                .sum();
            if best.as_ref().is_none_or(|(size, _)| matched_size > *size) {
                best = Some((matched_size, candidate_result));
            }
        }
        best.map(|(_, mapping)| mapping).unwrap_or_default()
    }

    /// Assemble the torrent from files scattered across the index:
    /// unsplittable subtrees are matched whole, everything else per
    /// file by normalized name and size (or size alone).
    pub fn match_files_dynamic(
        &self,
        torrent: &Torrent,
        options: DynamicMatchOptions,
    ) -> Result<DynamicMatch> {
        let hash_probe = options.hash_probe || options.match_hash_size;
        let match_hash_size = options.match_hash_size;

        let mut directory_order: Vec<PathBuf> = Vec::new();
        let mut path_files: HashMap<PathBuf, Vec<&TorrentFile>> = HashMap::new();
        for file in &torrent.filelist {
            let parent = file.path.parent().unwrap_or(Path::new("")).to_path_buf();
            if !path_files.contains_key(&parent) {
                directory_order.push(parent.clone());
            }
            path_files.entry(parent).or_default().push(file);
        }

        let inside_unsplittable = |roots: &HashSet<PathBuf>, dir: &Path| {
            dir.ancestors()
                .any(|ancestor| !ancestor.as_os_str().is_empty() && roots.contains(ancestor))
        };

        let mut unsplittable_roots: HashSet<PathBuf> = HashSet::new();
        for directory in &directory_order {
            if inside_unsplittable(&unsplittable_roots, directory) {
                continue;
            }
            let names: Vec<&Path> = path_files[directory]
                .iter()
                .map(|f| f.path.as_path())
                .collect();
            if is_unsplittable(&names) {
                if let Some(root) = get_root_of_unsplittable(directory) {
                    unsplittable_roots.insert(root);
                }
            }
        }

        // Unsplittable subtrees are matched by normalized name even in
        // sizes-only mode; release sets contain too many equally-sized
        // chunks for size matching to be useful.
        let mut best_possible_size = 0u64;
        let mut candidate_paths: Vec<(PathBuf, Vec<MatchResult<'_>>)> = Vec::new();
        for root in &unsplittable_roots {
            let mut match_results =
                self.match_filelist_unsplittable(&torrent.filelist, root, true)?;
            match_results.sort_by_key(|result| std::cmp::Reverse(result.size));
            if let Some(first) = match_results.first() {
                best_possible_size += first.size;
            }
            candidate_paths.push((root.clone(), match_results));
        }

        let mut candidate_files: Vec<(&TorrentFile, Vec<SearchedFile>)> = Vec::new();
        for directory in &directory_order {
            if inside_unsplittable(&unsplittable_roots, directory) {
                continue;
            }
            for &torrent_file in &path_files[directory] {
                let name = file_name_string(&torrent_file.path);
                let query = if match_hash_size {
                    FileQuery {
                        size: Some(torrent_file.size),
                        ..Default::default()
                    }
                } else {
                    FileQuery {
                        normalized_filename: Some(&name),
                        size: Some(torrent_file.size),
                        ..Default::default()
                    }
                };
                let searched_files = self.db.search_file(&query)?;
                if !searched_files.is_empty() {
                    best_possible_size += torrent_file.size;
                }
                candidate_files.push((torrent_file, searched_files));
            }
        }

        let max_missing_size = options
            .add_limit_size
            .min(options.add_limit_percent * torrent.size / 100);
        let current_missing_size = torrent.size.saturating_sub(best_possible_size);
        if current_missing_size > max_missing_size {
            info!(
                "torrent missing too much data, size:{} found data size:{best_possible_size}",
                torrent.size
            );
            return Ok(DynamicMatch::Failed {
                missing_size: current_missing_size,
            });
        }

        let mut result_mapping: HashMap<PathBuf, Option<SearchedFile>> = HashMap::new();
        for (_, candidates) in &candidate_paths {
            if candidates.is_empty() {
                continue;
            }
            result_mapping.extend(self.select_best_candidate(
                candidates,
                hash_probe,
                match_hash_size,
            ));
        }
        for (torrent_file, searched_files) in candidate_files {
            result_mapping.insert(
                torrent_file.path.clone(),
                self.match_best_file(torrent_file, searched_files, hash_probe, match_hash_size),
            );
        }

        let mut missing_pieces: HashSet<u64> = HashSet::new();
        let mut found_pieces: HashSet<u64> = HashSet::new();
        let mut found_piece_files: HashMap<u64, Vec<&TorrentFile>> = HashMap::new();
        let mut current_missing_size = 0u64;
        for torrent_file in &torrent.filelist {
            let calculation = torrent_file.pieces.calculate_offsets(torrent_file.size, false);
            let matched = result_mapping
                .get(&torrent_file.path)
                .is_some_and(|hit| hit.is_some());
            if matched {
                for piece in [calculation.start_piece, calculation.end_piece] {
                    found_pieces.insert(piece);
                    found_piece_files.entry(piece).or_default().push(torrent_file);
                }
            } else {
                missing_pieces.insert(calculation.start_piece);
                missing_pieces.insert(calculation.end_piece);
                current_missing_size += torrent_file.size;
            }
        }

        if current_missing_size > max_missing_size {
            info!(
                "torrent missing too much data after matching files, size:{} missing size:{current_missing_size} max missing size:{max_missing_size}",
                torrent.size
            );
            return Ok(DynamicMatch::Failed {
                missing_size: current_missing_size,
            });
        }

        let mut touched_files: HashSet<PathBuf> = HashSet::new();
        for piece in missing_pieces.intersection(&found_pieces) {
            for torrent_file in &found_piece_files[piece] {
                touched_files.insert(torrent_file.path.clone());
            }
        }

        let matched_files = torrent
            .filelist
            .iter()
            .map(|file| {
                let hit = result_mapping
                    .get(&file.path)
                    .cloned()
                    .flatten()
                    .map(|hit| hit.to_full_path());
                (file.path.clone(), hit)
            })
            .collect();

        Ok(DynamicMatch::Matched {
            missing_size: current_missing_size,
            matched_files,
            touched_files: touched_files.into_iter().collect(),
        })
    }

    /// Map a path and all files below it to the clients seeding them.
    pub fn map_path_to_clients(&self, path: &Path) -> std::result::Result<MapResult, MapError> {
        let mut scanned_folders: HashSet<PathBuf> = HashSet::new();
        let mut total_size = 0u64;
        let mut real_files_seen: HashSet<PathBuf> = HashSet::new();
        let mut real_files_mapping: HashMap<PathBuf, PathBuf> = HashMap::new();
        let mut files: HashMap<PathBuf, MappedFile> = HashMap::new();
        let mut check_queue: Vec<PathBuf> = Vec::new();

        let mut flush = |queue: &mut Vec<PathBuf>,
                         total_size: &mut u64,
                         real_files_seen: &mut HashSet<PathBuf>,
                         real_files_mapping: &mut HashMap<PathBuf, PathBuf>,
                         files: &mut HashMap<PathBuf, MappedFile>|
         -> std::result::Result<(), MapError> {
            debug!("flushing queue of {} paths", queue.len());
            for path in queue.iter() {
                let resolved = path.canonicalize().unwrap_or_else(|_| path.clone());
                let size = path.metadata()?.len();
                if real_files_seen.insert(resolved.clone()) {
                    *total_size += size;
                }
                real_files_mapping.insert(path.clone(), resolved);
                files.insert(
                    path.clone(),
                    MappedFile {
                        size,
                        clients: Vec::new(),
                    },
                );
            }
            for seeded_file in self.db.get_seeded_paths(queue)? {
                if let Some(mapped) = files.get_mut(&seeded_file.path) {
                    mapped
                        .clients
                        .push((seeded_file.client, seeded_file.infohash));
                }
            }
            queue.clear();
            Ok(())
        };

        let mut stack = vec![path.to_path_buf()];
        while let Some(directory) = stack.pop() {
            if !scanned_folders.insert(directory.clone()) {
                continue;
            }
            debug!("scanning path {}", directory.display());

            for rewritten in self.rewriter.rewrite_path(&directory, false) {
                if rewritten.is_file() {
                    check_queue.push(rewritten);
                    continue;
                }
                match std::fs::read_dir(&rewritten) {
                    Ok(entries) => {
                        for entry in entries {
                            let entry_path = entry?.path();
                            if entry_path.is_dir() {
                                stack.push(entry_path);
                            } else if entry_path.is_file() {
                                check_queue.push(entry_path);
                            }
                        }
                    }
                    // Symlink loops are skipped, everything else is real.
                    Err(err) if err.raw_os_error() == Some(libc::ELOOP) => {}
                    Err(err) => return Err(err.into()),
                }
            }

            if check_queue.len() > SEEDED_BATCH_SIZE {
                flush(
                    &mut check_queue,
                    &mut total_size,
                    &mut real_files_seen,
                    &mut real_files_mapping,
                    &mut files,
                )?;
            }
        }
        flush(
            &mut check_queue,
            &mut total_size,
            &mut real_files_seen,
            &mut real_files_mapping,
            &mut files,
        )?;

        let mut seeded_size = 0u64;
        let mut counted: HashSet<&PathBuf> = HashSet::new();
        for (path, mapped_file) in &files {
            if mapped_file.clients.is_empty() {
                continue;
            }
            let resolved = &real_files_mapping[path];
            if counted.insert(resolved) {
                seeded_size += mapped_file.size;
            }
        }

        Ok(MapResult {
            total_size,
            seeded_size,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::Indexer;
    use crate::testutil::{TestTorrentDisk, TorrentBuilder};
    use std::fs;

    fn scan(db: &mut Database, root: &Path) {
        Indexer::new(Vec::new(), Vec::new())
            .scan_paths(db, &[root.to_path_buf()], true)
            .unwrap();
    }

    fn no_rewrites() -> PathRewriter {
        PathRewriter::new(&[])
    }

    fn default_options() -> DynamicMatchOptions {
        DynamicMatchOptions {
            match_hash_size: false,
            add_limit_size: 128_000_000,
            add_limit_percent: 5,
            hash_probe: false,
        }
    }

    #[test]
    fn exact_match_finds_the_single_root() {
        let disk = TestTorrentDisk::standard();
        let mut db = Database::open_in_memory().unwrap();
        scan(&mut db, disk.root());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);

        let root = matcher.match_files_exact(&disk.torrent()).unwrap();
        assert_eq!(root, Some(disk.root().to_path_buf()));
    }

    #[test]
    fn exact_match_rejects_size_and_name_mutations() {
        let disk = TestTorrentDisk::standard();
        let mut db = Database::open_in_memory().unwrap();

        // Grow one file by a byte.
        let mutated = disk.root().join("testfiles/file_b.txt");
        let mut content = fs::read(&mutated).unwrap();
        content.push(b'!');
        fs::write(&mutated, &content).unwrap();
        scan(&mut db, disk.root());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);
        assert_eq!(matcher.match_files_exact(&disk.torrent()).unwrap(), None);

        // Restore the size but rename another file.
        content.pop();
        fs::write(&mutated, &content).unwrap();
        fs::rename(
            disk.root().join("testfiles/file_a.txt"),
            disk.root().join("testfiles/file_a_renamed.txt"),
        )
        .unwrap();
        scan(&mut db, disk.root());
        let matcher = Matcher::new(&rewriter, &db);
        assert_eq!(matcher.match_files_exact(&disk.torrent()).unwrap(), None);
    }

    #[test]
    fn dynamic_match_covers_the_whole_filelist() {
        let disk = TestTorrentDisk::standard();
        let mut db = Database::open_in_memory().unwrap();
        scan(&mut db, disk.root());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);

        let result = matcher
            .match_files_dynamic(&disk.torrent(), default_options())
            .unwrap();
        let DynamicMatch::Matched {
            missing_size,
            matched_files,
            touched_files,
        } = result
        else {
            panic!("expected a successful match");
        };
        assert_eq!(missing_size, 0);
        assert!(touched_files.is_empty());
        assert_eq!(matched_files.len(), 3);
        for (torrent_path, actual) in &matched_files {
            let actual = actual.as_ref().expect("every file matched");
            assert_eq!(actual, &disk.root().join(torrent_path));
            assert!(actual.is_file());
        }
    }

    #[test]
    fn dynamic_match_survives_renamed_files_via_normalization() {
        let disk = TestTorrentDisk::standard();
        for (from, to) in [
            ("file_a.txt", "FILE  A.txt"),
            ("file_b.txt", "file_B.txt"),
            ("file_c.txt", "filE-c.txt"),
        ] {
            fs::rename(
                disk.root().join("testfiles").join(from),
                disk.root().join("testfiles").join(to),
            )
            .unwrap();
        }
        let mut db = Database::open_in_memory().unwrap();
        scan(&mut db, disk.root());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);

        let result = matcher
            .match_files_dynamic(&disk.torrent(), default_options())
            .unwrap();
        let DynamicMatch::Matched { matched_files, .. } = result else {
            panic!("expected a successful match");
        };
        assert_eq!(
            matched_files[Path::new("testfiles/file_a.txt")],
            Some(disk.root().join("testfiles/FILE  A.txt"))
        );
        assert_eq!(
            matched_files[Path::new("testfiles/file_b.txt")],
            Some(disk.root().join("testfiles/file_B.txt"))
        );
        assert_eq!(
            matched_files[Path::new("testfiles/file_c.txt")],
            Some(disk.root().join("testfiles/filE-c.txt"))
        );
    }

    #[test]
    fn corrupt_file_fails_probe_and_gates_on_missing_size() {
        let disk = TestTorrentDisk::standard();
        // One flipped byte at offset 0 lands in the piece only file_a
        // occupies alone.
        let target = disk.root().join("testfiles/file_a.txt");
        let mut content = fs::read(&target).unwrap();
        content[0] ^= 0xff;
        fs::write(&target, content).unwrap();

        let mut db = Database::open_in_memory().unwrap();
        scan(&mut db, disk.root());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);

        let probing = DynamicMatchOptions {
            hash_probe: true,
            ..default_options()
        };
        let result = matcher
            .match_files_dynamic(&disk.torrent(), probing)
            .unwrap();
        assert!(matches!(result, DynamicMatch::Failed { missing_size: 11 }));

        let permissive = DynamicMatchOptions {
            hash_probe: true,
            add_limit_percent: 100,
            ..default_options()
        };
        let result = matcher
            .match_files_dynamic(&disk.torrent(), permissive)
            .unwrap();
        let DynamicMatch::Matched {
            missing_size,
            matched_files,
            touched_files,
        } = result
        else {
            panic!("expected a successful match");
        };
        assert_eq!(missing_size, 11);
        assert_eq!(matched_files[Path::new("testfiles/file_a.txt")], None);
        assert_eq!(
            touched_files,
            vec![PathBuf::from("testfiles/file_b.txt")]
        );
    }

    fn release_torrent(with_r03: bool) -> TorrentBuilder {
        let mut builder = TorrentBuilder::new("Some-Release [test]", 16)
            .file("some-release.rar", &[b'r'; 100])
            .file("some-release.r00", &[b'0'; 50]);
        if with_r03 {
            builder = builder.file("some-release.r03", &[b'3'; 30]);
        }
        builder.file("some-release.nfo", &[b'n'; 5])
    }

    fn write_release_on_disk(root: &Path) {
        for (name, content) in [
            ("some-release.rar", vec![b'r'; 100]),
            ("some-release.r00", vec![b'0'; 50]),
        ] {
            let full = root.join("Some-Release").join(name);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    #[test]
    fn unsplittable_release_matches_under_renamed_root() {
        let tmp = tempfile::tempdir().unwrap();
        write_release_on_disk(tmp.path());
        let mut db = Database::open_in_memory().unwrap();
        scan(&mut db, tmp.path());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);

        // The missing .nfo is potentially missable and within limits.
        let torrent = release_torrent(false).parse();
        let result = matcher
            .match_files_dynamic(&torrent, default_options())
            .unwrap();
        let DynamicMatch::Matched {
            missing_size,
            matched_files,
            ..
        } = result
        else {
            panic!("expected a successful match");
        };
        assert_eq!(missing_size, 5);
        assert_eq!(
            matched_files[Path::new("Some-Release [test]/some-release.rar")],
            Some(tmp.path().join("Some-Release/some-release.rar"))
        );
        assert_eq!(
            matched_files[Path::new("Some-Release [test]/some-release.nfo")],
            None
        );
    }

    #[test]
    fn unsplittable_release_missing_archive_chunk_does_not_match() {
        let tmp = tempfile::tempdir().unwrap();
        write_release_on_disk(tmp.path());
        let mut db = Database::open_in_memory().unwrap();
        scan(&mut db, tmp.path());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);

        // some-release.r03 is not missable and absent on disk.
        let torrent = release_torrent(true).parse();
        let result = matcher
            .match_files_dynamic(&torrent, default_options())
            .unwrap();
        assert!(matches!(result, DynamicMatch::Failed { .. }));
    }

    #[test]
    fn best_file_prefers_exact_filename() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();
        fs::write(tmp.path().join("a/file-x.txt"), [b'x'; 11]).unwrap();
        fs::write(tmp.path().join("b/file_x.txt"), [b'x'; 11]).unwrap();
        let mut db = Database::open_in_memory().unwrap();
        scan(&mut db, tmp.path());
        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);

        let torrent = TorrentBuilder::new("t", 8)
            .file("file_x.txt", &[b'x'; 11])
            .parse();
        let result = matcher
            .match_files_dynamic(&torrent, default_options())
            .unwrap();
        let DynamicMatch::Matched { matched_files, .. } = result else {
            panic!("expected a successful match");
        };
        assert_eq!(
            matched_files[Path::new("t/file_x.txt")],
            Some(tmp.path().join("b/file_x.txt"))
        );
    }

    #[test]
    fn path_rewriter_exact_and_group_rewrites() {
        let rewriter = PathRewriter::new(&[vec![
            PathBuf::from("/mnt/store_a"),
            PathBuf::from("/mnt/store_b"),
        ]]);
        assert_eq!(
            rewriter.rewrite_path(Path::new("/mnt/store_a"), false),
            vec![PathBuf::from("/mnt/store_a"), PathBuf::from("/mnt/store_b")]
        );
        assert_eq!(
            rewriter.rewrite_path(Path::new("/mnt/other"), false),
            vec![PathBuf::from("/mnt/other")]
        );
        assert_eq!(
            rewriter.rewrite_path(Path::new("/mnt/store_a/sub/file"), true),
            vec![
                PathBuf::from("/mnt/store_a/sub/file"),
                PathBuf::from("/mnt/store_b/sub/file"),
            ]
        );
    }

    #[test]
    fn map_path_to_clients_reports_seeded_share() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("tree")).unwrap();
        fs::write(tmp.path().join("tree/seeded.bin"), [b's'; 10]).unwrap();
        fs::write(tmp.path().join("tree/unseeded.bin"), [b'u'; 30]).unwrap();

        let mut db = Database::open_in_memory().unwrap();
        db.insert_torrent_files_paths(
            "testclient",
            &[crate::db::InsertTorrentFile {
                infohash: "a".repeat(40),
                name: "seeded".to_string(),
                download_path: tmp.path().join("tree"),
                paths: vec![(tmp.path().join("tree/seeded.bin"), 10)],
            }],
        )
        .unwrap();

        let rewriter = no_rewrites();
        let matcher = Matcher::new(&rewriter, &db);
        let result = matcher.map_path_to_clients(&tmp.path().join("tree")).unwrap();
        assert_eq!(result.total_size, 40);
        assert_eq!(result.seeded_size, 10);
        let seeded = &result.files[&tmp.path().join("tree/seeded.bin")];
        assert_eq!(seeded.clients, vec![("testclient".to_string(), "a".repeat(40))]);
        assert!(result.files[&tmp.path().join("tree/unseeded.bin")]
            .clients
            .is_empty());
    }
}
