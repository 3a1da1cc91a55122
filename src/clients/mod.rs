use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use serde::Deserialize;
use sha1_smol::Sha1;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client command finished with non-zero status: {0}")]
    CommandFailed(String),
    #[error("client returned invalid data: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("client output was not valid utf-8")]
    InvalidEncoding,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A torrent as listed by a download client.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientTorrent {
    pub infohash: String,
    pub name: String,
}

/// One payload file as reported by a download client, relative to the
/// torrent's download path.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Capability interface of an external download client.
pub trait Client: Send + Sync {
    fn list(&self) -> Result<Vec<ClientTorrent>, ClientError>;
    fn get_download_path(&self, infohash: &str) -> Result<PathBuf, ClientError>;
    fn get_files(&self, infohash: &str) -> Result<Vec<ClientFile>, ClientError>;
    fn add(
        &self,
        torrent_data: &[u8],
        destination: &Path,
        fast_resume: bool,
        stopped: bool,
    ) -> Result<(), ClientError>;
    fn remove(&self, infohash: &str) -> Result<(), ClientError>;
    fn test_connection(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct RawDownloadPath {
    download_path: PathBuf,
}

/// Drives a bridge executable that speaks JSON on stdout, one
/// subcommand per capability.
pub struct ExecClient {
    command: PathBuf,
}

impl ExecClient {
    pub fn new(command: PathBuf) -> Self {
        ExecClient { command }
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>, ClientError> {
        debug!("running {} {args:?}", self.command.display());
        let output = Command::new(&self.command).args(args).output()?;
        if !output.status.success() {
            return Err(ClientError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(output.stdout)
    }

    fn run_json<T: for<'de> Deserialize<'de>>(&self, args: &[&str]) -> Result<T, ClientError> {
        let stdout = self.run(args)?;
        let text = std::str::from_utf8(&stdout).map_err(|_| ClientError::InvalidEncoding)?;
        Ok(serde_json::from_str(text)?)
    }
}

impl Client for ExecClient {
    fn list(&self) -> Result<Vec<ClientTorrent>, ClientError> {
        self.run_json(&["list"])
    }

    fn get_download_path(&self, infohash: &str) -> Result<PathBuf, ClientError> {
        let raw: RawDownloadPath = self.run_json(&["download-path", infohash])?;
        Ok(raw.download_path)
    }

    fn get_files(&self, infohash: &str) -> Result<Vec<ClientFile>, ClientError> {
        self.run_json(&["files", infohash])
    }

    fn add(
        &self,
        torrent_data: &[u8],
        destination: &Path,
        fast_resume: bool,
        stopped: bool,
    ) -> Result<(), ClientError> {
        // The bridge takes a file path, so park the metainfo in a
        // uniquely-named temp file for the duration of the call.
        let fingerprint = Sha1::from(torrent_data).hexdigest();
        let temp_path = std::env::temp_dir().join(format!("reseed-{fingerprint}.torrent"));
        let mut temp_file = std::fs::File::create(&temp_path)?;
        temp_file.write_all(torrent_data)?;
        drop(temp_file);

        let mut args = vec!["add"];
        if fast_resume {
            args.push("--fast-resume");
        }
        if stopped {
            args.push("--stopped");
        }
        args.push("--destination");
        let destination = destination.to_string_lossy();
        args.push(&destination);
        let torrent_arg = temp_path.to_string_lossy().into_owned();
        args.push(&torrent_arg);

        let result = self.run(&args).map(|_| ());
        let _ = std::fs::remove_file(&temp_path);
        result
    }

    fn remove(&self, infohash: &str) -> Result<(), ClientError> {
        self.run(&["remove", infohash]).map(|_| ())
    }

    fn test_connection(&self) -> bool {
        self.run(&["ping"]).is_ok()
    }
}

#[cfg(test)]
pub use memory::MemoryClient;
