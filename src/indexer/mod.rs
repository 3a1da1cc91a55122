use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use glob::Pattern;
use log::{debug, error, info};

use crate::clients::Client;
use crate::db::{Database, InsertTorrentFile};
use crate::util::{get_root_of_unsplittable, is_unsplittable, matches_any_pattern};

const INSERT_BATCH_SIZE: usize = 1000;

/// How long to wait for worker output before checking for dead workers.
const SCAN_QUEUE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum IndexAction {
    Add(PathBuf, u64),
    MarkUnsplittable(PathBuf),
    Finished(PathBuf),
}

#[derive(Default)]
struct PathTrieNode {
    children: HashMap<OsString, PathTrieNode>,
    is_file: bool,
    is_unsplittable: bool,
    size: u64,
}

/// Accumulates scan output so unsplittable roots can be assigned after
/// all children of a directory have been visited.
#[derive(Default)]
struct PathTrie {
    root: PathTrieNode,
}

impl PathTrie {
    fn insert_path(&mut self, path: &Path, size: u64) {
        let mut current = &mut self.root;
        for component in path.components() {
            current = current
                .children
                .entry(component.as_os_str().to_os_string())
                .or_default();
        }
        current.is_file = true;
        current.size = size;
    }

    fn mark_unsplittable(&mut self, path: &Path) {
        let mut current = &mut self.root;
        for component in path.components() {
            current = current
                .children
                .entry(component.as_os_str().to_os_string())
                .or_default();
        }
        current.is_unsplittable = true;
    }

    /// Flatten into `(file path, size, unsplittable root)` rows,
    /// directory-first so roots apply to everything below them.
    fn flatten(&self) -> Vec<(PathBuf, u64, Option<PathBuf>)> {
        let mut rows = Vec::new();
        Self::walk_node(&self.root, &PathBuf::new(), None, &mut rows);
        rows
    }

    fn walk_node(
        node: &PathTrieNode,
        current_path: &Path,
        unsplittable_root: Option<&Path>,
        rows: &mut Vec<(PathBuf, u64, Option<PathBuf>)>,
    ) {
        let mut directories: Vec<(&OsString, &PathTrieNode)> = Vec::new();
        let mut files: Vec<(&OsString, &PathTrieNode)> = Vec::new();
        for (name, child) in &node.children {
            if child.is_file {
                files.push((name, child));
            } else {
                directories.push((name, child));
            }
        }

        for (name, child) in directories {
            let child_path = current_path.join(name);
            let root_for_children = if child.is_unsplittable && unsplittable_root.is_none() {
                Some(child_path.clone())
            } else {
                unsplittable_root.map(|p| p.to_path_buf())
            };
            Self::walk_node(child, &child_path, root_for_children.as_deref(), rows);
        }
        for (name, child) in files {
            rows.push((
                current_path.join(name),
                child.size,
                unsplittable_root.map(|p| p.to_path_buf()),
            ));
        }
    }
}

/// Resolve symlinks like `Path::canonicalize`, but tolerate a final
/// component that does not exist yet (a client may report files it has
/// not finished downloading) by resolving the parent and rejoining the
/// name.
fn resolve_symlinks_lenient(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Some(resolved);
    }
    let parent = path.parent()?.canonicalize().ok()?;
    Some(parent.join(path.file_name()?))
}

pub struct Indexer {
    ignore_file_patterns: Vec<Pattern>,
    ignore_directory_patterns: Vec<Pattern>,
}

impl Indexer {
    pub fn new(ignore_file_patterns: Vec<Pattern>, ignore_directory_patterns: Vec<Pattern>) -> Self {
        Indexer {
            ignore_file_patterns,
            ignore_directory_patterns,
        }
    }

    /// Walk each root on its own worker thread and feed the results
    /// into the file index. A full scan truncates existing entries.
    pub fn scan_paths(
        &self,
        db: &mut Database,
        roots: &[PathBuf],
        full_scan: bool,
    ) -> crate::db::Result<()> {
        let mut trie = PathTrie::default();
        let progress = crate::util::new_progress_spinner();
        progress.enable_steady_tick(Duration::from_millis(125));
        progress.set_message("indexing files");

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            let mut workers: HashMap<PathBuf, thread::ScopedJoinHandle<'_, ()>> = HashMap::new();
            for root in roots {
                info!("indexing path {}", root.display());
                let tx = tx.clone();
                workers.insert(
                    root.clone(),
                    scope.spawn(move || self.scan_path_worker(root, &tx, true)),
                );
            }
            drop(tx);

            while !workers.is_empty() {
                match rx.recv_timeout(SCAN_QUEUE_TIMEOUT) {
                    Ok(IndexAction::Add(path, size)) => {
                        progress.inc(1);
                        trie.insert_path(&path, size);
                    }
                    Ok(IndexAction::MarkUnsplittable(path)) => trie.mark_unsplittable(&path),
                    Ok(IndexAction::Finished(root)) => {
                        workers.remove(&root);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        debug!(
                            "no scan output received in {}s, checking workers",
                            SCAN_QUEUE_TIMEOUT.as_secs()
                        );
                        let finished: Vec<PathBuf> = workers
                            .iter()
                            .filter(|(_, handle)| handle.is_finished())
                            .map(|(root, _)| root.clone())
                            .collect();
                        for root in finished {
                            if let Some(handle) = workers.remove(&root) {
                                if let Err(panic) = handle.join() {
                                    error!(
                                        "worker for path {} died: {panic:?}",
                                        root.display()
                                    );
                                }
                            }
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        progress.finish_with_message(format!("indexed {} files", progress.position()));

        if full_scan {
            db.truncate_files()?;
        }
        let rows = trie.flatten();
        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            db.insert_file_paths(chunk.iter().cloned())?;
        }
        Ok(())
    }

    fn scan_path_worker(&self, path: &Path, tx: &Sender<IndexAction>, root_thread: bool) {
        if let Err(err) = self.scan_directory(path, tx) {
            error!("failed to scan {}: {err}", path.display());
        }
        if root_thread {
            let _ = tx.send(IndexAction::Finished(path.to_path_buf()));
        }
    }

    fn scan_directory(&self, path: &Path, tx: &Sender<IndexAction>) -> io::Result<()> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if entry_path.is_dir() {
                if matches_any_pattern(&name, &self.ignore_directory_patterns, false) {
                    continue;
                }
                // Recurse synchronously; a failure below only loses
                // that subtree.
                self.scan_path_worker(&entry_path, tx, false);
            } else if entry_path.is_file() {
                if matches_any_pattern(&name, &self.ignore_file_patterns, true) {
                    continue;
                }
                let size = entry_path.metadata()?.len();
                files.push(entry_path.clone());
                let _ = tx.send(IndexAction::Add(entry_path, size));
            }
        }

        if is_unsplittable(&files) {
            if let Some(root) = get_root_of_unsplittable(path) {
                let _ = tx.send(IndexAction::MarkUnsplittable(root));
            }
        }
        Ok(())
    }

    /// Index every torrent the clients report, recording each file
    /// under both its literal and symlink-resolved path.
    pub fn scan_clients(
        &self,
        db: &mut Database,
        clients: &[(&str, &dyn Client)],
        full_scan: bool,
        fast_scan: bool,
    ) -> anyhow::Result<()> {
        for &(name, client) in clients {
            if full_scan {
                db.truncate_torrent_files(Some(name))?;
            }
            self.scan_client(db, name, client, !full_scan && fast_scan)?;
        }
        Ok(())
    }

    fn scan_client(
        &self,
        db: &mut Database,
        client_name: &str,
        client: &dyn Client,
        fast_scan: bool,
    ) -> anyhow::Result<()> {
        let torrents = client.list()?;
        let mut insert_queue: Vec<InsertTorrentFile> = Vec::new();

        for torrent in &torrents {
            let stored = db.get_torrent_file_info(client_name, &torrent.infohash)?;
            if fast_scan && stored.is_some() {
                debug!(
                    "torrent {} already indexed for {client_name}, fast-scan skips it",
                    torrent.infohash
                );
                continue;
            }

            let download_path = client.get_download_path(&torrent.infohash)?;
            if stored.as_ref().map(|(_, path)| path) == Some(&download_path) {
                debug!(
                    "torrent {} download path unchanged, skipping",
                    torrent.infohash
                );
                continue;
            }

            let files = client.get_files(&torrent.infohash)?;
            if files.is_empty() {
                debug!("torrent {} reports no files, not loaded", torrent.infohash);
            }
            let mut paths = Vec::new();
            for file in files {
                let full_path = download_path.join(&file.path);
                paths.push((full_path.clone(), file.size));
                if let Some(resolved) = resolve_symlinks_lenient(&full_path) {
                    if resolved != full_path {
                        paths.push((resolved, file.size));
                    }
                }
            }

            insert_queue.push(InsertTorrentFile {
                infohash: torrent.infohash.clone(),
                name: torrent.name.clone(),
                download_path,
                paths,
            });
            if insert_queue.len() > INSERT_BATCH_SIZE {
                db.insert_torrent_files_paths(client_name, &insert_queue)?;
                insert_queue.clear();
            }
        }
        if !insert_queue.is_empty() {
            db.insert_torrent_files_paths(client_name, &insert_queue)?;
        }

        let observed = torrents.into_iter().map(|t| t.infohash).collect();
        db.remove_non_existing_infohashes(client_name, &observed)?;
        Ok(())
    }
}
