use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use rustix::fs::FlockOperation;
use serde::{Deserialize, Serialize};
use sha1_smol::Sha1;
use thiserror::Error;

use crate::linker::{chown_recursive, create_link, Chown, LinkType};

const CACHE_DATA_PATH: &str = "data";
const CACHE_CONF_NAME: &str = "reseed.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("broken cache manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheTarget {
    path: PathBuf,
    link_type: LinkType,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheManifest {
    source_path: PathBuf,
    target_paths: Vec<CacheTarget>,
}

/// Copy-on-touch cache for files whose pieces a client may rewrite.
///
/// Each entry is a directory holding a copy of the file under `data/`
/// plus a manifest recording the original source and every link that
/// points into the cache. Expired entries are unwound by pointing the
/// links back at the original.
pub struct ReadWriteFileCache {
    path: PathBuf,
    ttl: Duration,
    chown: Option<Chown>,
}

impl ReadWriteFileCache {
    pub fn new(path: PathBuf, ttl: Duration, chown: Option<Chown>) -> Self {
        ReadWriteFileCache { path, ttl, chown }
    }

    fn entry_path(&self, path: &Path) -> PathBuf {
        let joined = path
            .components()
            .filter(|c| !matches!(c, Component::RootDir))
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("__");
        let head: String = joined.chars().take(25).collect();
        let tail: String = {
            let chars: Vec<char> = joined.chars().collect();
            chars[chars.len().saturating_sub(50)..].iter().collect()
        };
        let fingerprint = Sha1::from(path.to_string_lossy().as_bytes()).hexdigest();
        self.path.join(format!("{head}__{tail}__{fingerprint}"))
    }

    /// Copy `path` into the cache (once) and record `target_path` as a
    /// consumer. Returns the cached data file to link against.
    ///
    /// Entry creation is guarded by the directory's prior absence, so
    /// concurrent adds of the same file cooperate; manifest appends
    /// run under an exclusive lock.
    pub fn cache_file(
        &self,
        path: &Path,
        target_path: &Path,
        link_type: LinkType,
    ) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&self.path)?;
        let entry_path = self.entry_path(path);
        let data_path = entry_path.join(CACHE_DATA_PATH);
        let data_file = data_path.join(path.file_name().unwrap_or(path.as_os_str()));
        let conf_path = entry_path.join(CACHE_CONF_NAME);

        match fs::create_dir(&entry_path) {
            Ok(()) => {
                info!(
                    "cache entry {} does not exist, copying file from {}",
                    entry_path.display(),
                    path.display()
                );
                fs::create_dir(&data_path)?;
                fs::copy(path, &data_file)?;
                if let Some(chown) = self.chown {
                    chown_recursive(chown, &data_file)?;
                }
                fs::write(
                    &conf_path,
                    serde_json::to_string(&CacheManifest {
                        source_path: path.to_path_buf(),
                        target_paths: Vec::new(),
                    })?,
                )?;
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }

        let mut conf_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&conf_path)?;
        rustix::fs::flock(&conf_file, FlockOperation::LockExclusive).map_err(io::Error::from)?;

        let mut raw = String::new();
        conf_file.read_to_string(&mut raw)?;
        let mut manifest = match serde_json::from_str::<CacheManifest>(&raw) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(
                    "cache manifest {} unreadable ({err}), rebuilding it",
                    conf_path.display()
                );
                CacheManifest {
                    source_path: path.to_path_buf(),
                    target_paths: Vec::new(),
                }
            }
        };
        manifest.target_paths.push(CacheTarget {
            path: target_path.to_path_buf(),
            link_type,
        });

        // Rewriting the manifest also refreshes the entry's mtime,
        // which is what the TTL cleanup keys on.
        conf_file.seek(SeekFrom::Start(0))?;
        conf_file.set_len(0)?;
        conf_file.write_all(serde_json::to_string(&manifest)?.as_bytes())?;

        Ok(data_file)
    }

    /// Remove entries older than the TTL, re-pointing every recorded
    /// link back at the original source first so nothing dangles.
    pub fn cleanup_cache(&self) -> Result<Vec<PathBuf>, CacheError> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry_path = entry?.path();
            if !entry_path.is_dir() {
                continue;
            }
            let conf_path = entry_path.join(CACHE_CONF_NAME);
            let modified = match conf_path.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(
                        "cache entry {} has no readable manifest ({err}), skipping",
                        entry_path.display()
                    );
                    continue;
                }
            };
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age <= self.ttl {
                continue;
            }
            debug!(
                "cache entry {} is older than the ttl and should be deleted",
                entry_path.display()
            );

            let manifest: CacheManifest = match fs::read_to_string(&conf_path)
                .map_err(CacheError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(CacheError::from))
            {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!(
                        "cache manifest {} unreadable ({err}), skipping entry",
                        conf_path.display()
                    );
                    continue;
                }
            };

            for target in &manifest.target_paths {
                if !target.path.exists() {
                    warn!("target path {} does not exist", target.path.display());
                    continue;
                }
                debug!(
                    "rewriting {} to {}",
                    target.path.display(),
                    manifest.source_path.display()
                );
                fs::remove_file(&target.path)?;
                create_link(&manifest.source_path, &target.path, target.link_type)?;
            }

            fs::remove_dir_all(&entry_path)?;
            removed.push(entry_path);
        }
        Ok(removed)
    }
}
