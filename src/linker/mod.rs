use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::rw_cache::{CacheError, ReadWriteFileCache};

const STORE_DATA_PATH: &str = "data";
const STORE_CONF_NAME: &str = "reseed.json";

static TEMPLATE_VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("path {0} already exists")]
    StoreExists(PathBuf),
    #[error("unresolved variable {{{0}}} in store path template")]
    UnresolvedVariable(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Soft,
    Hard,
    Reflink,
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "soft" => Ok(LinkType::Soft),
            "hard" => Ok(LinkType::Hard),
            "reflink" => Ok(LinkType::Reflink),
            other => Err(format!("unknown link type {other:?}")),
        }
    }
}

/// How one matched file is materialized into the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkAction {
    Link,
    CacheLink,
    Copy,
}

#[derive(Debug)]
pub struct CreateLinkResult {
    pub store_path: PathBuf,
    pub torrent_path: Option<PathBuf>,
    pub conf_path: Option<PathBuf>,
    pub data_path: PathBuf,
}

/// Numeric `uid:gid` ownership, either side optional.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chown {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl std::str::FromStr for Chown {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let (user, group) = match value.split_once(':') {
            Some((user, group)) => (user, group),
            None => (value, ""),
        };
        let parse = |part: &str| -> std::result::Result<Option<u32>, String> {
            if part.is_empty() {
                return Ok(None);
            }
            part.parse()
                .map(Some)
                .map_err(|_| format!("not a numeric id: {part:?}"))
        };
        Ok(Chown {
            uid: parse(user)?,
            gid: parse(group)?,
        })
    }
}

/// Recursively change ownership, without following symlinks.
pub fn chown_recursive(chown: Chown, path: &Path) -> io::Result<()> {
    if chown.uid.is_none() && chown.gid.is_none() {
        return Ok(());
    }
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::other)?;
        debug!("changing ownership of {}", entry.path().display());
        std::os::unix::fs::lchown(entry.path(), chown.uid, chown.gid)?;
    }
    Ok(())
}

/// Render a store path template, substituting `{variable}` markers.
/// Unknown markers are an error rather than silently kept.
pub fn render_store_path(
    template: &str,
    variables: &BTreeMap<String, String>,
) -> Result<PathBuf, LinkError> {
    let mut unknown = None;
    let rendered = TEMPLATE_VARIABLE_RE.replace_all(template, |captures: &regex::Captures<'_>| {
        let key = &captures[1];
        match variables.get(key) {
            Some(value) => value.clone(),
            None => {
                unknown.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match unknown {
        Some(variable) => Err(LinkError::UnresolvedVariable(variable)),
        None => Ok(PathBuf::from(rendered.into_owned())),
    }
}

pub fn template_has_variables(template: &str) -> bool {
    TEMPLATE_VARIABLE_RE.is_match(template)
}

pub struct Linker<'a> {
    pub link_type: LinkType,
    pub rw_cache: Option<&'a ReadWriteFileCache>,
    pub chown: Option<Chown>,
    pub dry_run: bool,
    pub skip_store_metadata: bool,
}

impl Linker<'_> {
    /// Stage a torrent into `store_path`: create the directory (its
    /// prior absence doubles as the cross-instance lock), copy the
    /// metainfo, then link or copy every matched file into the data
    /// root.
    ///
    /// Returns `None` on a dry run.
    pub fn create_link_path(
        &self,
        store_path: &Path,
        file_mapping: &BTreeMap<PathBuf, (LinkAction, PathBuf)>,
        torrent_file_path: &Path,
    ) -> Result<Option<CreateLinkResult>, LinkError> {
        if self.dry_run {
            if store_path.exists() {
                return Err(LinkError::StoreExists(store_path.to_path_buf()));
            }
            return Ok(None);
        }

        if let Some(parent) = store_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(err) = fs::create_dir(store_path) {
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Err(LinkError::StoreExists(store_path.to_path_buf()));
            }
            return Err(err.into());
        }

        let (data_path, torrent_path, conf_path) = if self.skip_store_metadata {
            (store_path.to_path_buf(), None, None)
        } else {
            let data_path = store_path.join(STORE_DATA_PATH);
            fs::create_dir(&data_path)?;

            let torrent_path = store_path.join(
                torrent_file_path
                    .file_name()
                    .unwrap_or(torrent_file_path.as_os_str()),
            );
            fs::copy(torrent_file_path, &torrent_path)?;

            let conf_path = store_path.join(STORE_CONF_NAME);
            fs::write(&conf_path, serde_json::json!({}).to_string())?;
            (data_path, Some(torrent_path), Some(conf_path))
        };

        for (torrent_path, (action, actual_path)) in file_mapping {
            let link_path = data_path.join(torrent_path);
            if let Some(parent) = link_path.parent() {
                fs::create_dir_all(parent)?;
            }
            match action {
                LinkAction::Link => create_link(actual_path, &link_path, self.link_type)?,
                LinkAction::CacheLink => {
                    let source = match self.rw_cache {
                        Some(cache) => cache.cache_file(actual_path, &link_path, self.link_type)?,
                        None => actual_path.clone(),
                    };
                    create_link(&source, &link_path, self.link_type)?;
                }
                LinkAction::Copy => {
                    fs::copy(actual_path, &link_path)?;
                }
            }
        }

        if let Some(chown) = self.chown {
            chown_recursive(chown, &data_path)?;
        }

        Ok(Some(CreateLinkResult {
            store_path: store_path.to_path_buf(),
            torrent_path,
            conf_path,
            data_path,
        }))
    }
}

/// Create one link of the requested type.
pub fn create_link(actual_path: &Path, link_path: &Path, link_type: LinkType) -> io::Result<()> {
    match link_type {
        LinkType::Soft => std::os::unix::fs::symlink(actual_path, link_path),
        LinkType::Hard => fs::hard_link(actual_path, link_path),
        LinkType::Reflink => reflink(actual_path, link_path),
    }
}

/// Clone a file's extents on filesystems that support it (xfs, btrfs,
/// apfs).
#[cfg(target_os = "linux")]
fn reflink(source: &Path, destination: &Path) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    const FICLONE: libc::c_ulong = 0x4004_9409;

    let source_file = fs::File::open(source)?;
    let destination_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)?;
    let ret = unsafe {
        libc::ioctl(
            destination_file.as_raw_fd(),
            FICLONE as _,
            source_file.as_raw_fd(),
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        drop(destination_file);
        let _ = fs::remove_file(destination);
        return Err(err);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn reflink(source: &Path, destination: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let source = CString::new(source.as_os_str().as_bytes())?;
    let destination = CString::new(destination.as_os_str().as_bytes())?;
    let ret = unsafe { libc::clonefile(source.as_ptr(), destination.as_ptr(), 0) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn reflink(_source: &Path, _destination: &Path) -> io::Result<()> {
    Err(io::Error::other("reflink is not supported on this platform"))
}
