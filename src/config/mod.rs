use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use serde::Deserialize;

use crate::clients::{Client, ExecClient};
use crate::db::Database;
use crate::linker::LinkType;
use crate::matcher::PathRewriter;
use crate::rw_cache::ReadWriteFileCache;

/// Written the first time the tool runs without a config file.
const BASE_CONFIG_FILE: &str = r#"[reseed]
database_path = "./reseed.db"
link_type = "soft"
always_verify_hash = [
    "*.nfo",
    "*.sfv",
    "*.diz",
]
paths = [ ]
same_paths = [ ]
add_limit_size = 128_000_000
add_limit_percent = 5
store_path = "/mnt/store_path/{client}/{torrent_name}"
skip_store_metadata = false
cache_touched_files = false
# rw_file_cache_chown = "1000:1000"
rw_file_cache_ttl = 86400
rw_file_cache_path = "/mnt/store_path/cache"
# WARNING: setting fast_resume to true can cause errors and problems.
fast_resume = false
ignore_file_patterns = [ ]
ignore_directory_patterns = [ ]

[clients]
"#;

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub reseed: Settings,
    #[serde(default)]
    pub clients: BTreeMap<String, ClientConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub link_type: LinkType,
    pub always_verify_hash: Vec<String>,
    pub paths: Vec<PathBuf>,
    pub same_paths: Vec<Vec<PathBuf>>,
    pub add_limit_size: u64,
    pub add_limit_percent: u64,
    pub store_path: Option<String>,
    pub skip_store_metadata: bool,
    pub cache_touched_files: bool,
    pub rw_file_cache_path: Option<PathBuf>,
    pub rw_file_cache_ttl: u64,
    pub rw_file_cache_chown: Option<String>,
    pub fast_resume: bool,
    pub ignore_file_patterns: Vec<String>,
    pub ignore_directory_patterns: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("./reseed.db"),
            link_type: LinkType::Soft,
            always_verify_hash: Vec::new(),
            paths: Vec::new(),
            same_paths: Vec::new(),
            add_limit_size: 128_000_000,
            add_limit_percent: 5,
            store_path: None,
            skip_store_metadata: false,
            cache_touched_files: false,
            rw_file_cache_path: None,
            rw_file_cache_ttl: 86_400,
            rw_file_cache_chown: None,
            fast_resume: false,
            ignore_file_patterns: Vec::new(),
            ignore_directory_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClientConfig {
    /// A bridge executable speaking JSON on stdout.
    Exec { command: PathBuf },
}

/// Locate the config file: explicit flag, then `$RESEED_CONFIG`, then
/// `./config.toml`, then the user config dir (bootstrapped with a
/// template on first use).
pub fn locate_config(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        if !path.is_file() {
            bail!("config file {} does not exist or is not a file", path.display());
        }
        return Ok(path);
    }

    if let Ok(value) = std::env::var("RESEED_CONFIG") {
        if !value.is_empty() {
            let mut path = PathBuf::from(value);
            if path.is_dir() {
                path = path.join("config.toml");
            }
            if path.is_file() {
                return Ok(path);
            }
        }
    }

    let cwd_config = PathBuf::from("config.toml");
    if cwd_config.is_file() {
        return Ok(cwd_config);
    }

    let config_dir = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(base) if !base.is_empty() => PathBuf::from(base).join("reseed"),
        _ => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".config/reseed"),
            None => bail!("no config file found and no home directory to create one in"),
        },
    };
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;
    let config_path = config_dir.join("config.toml");
    if !config_path.exists() {
        println!(
            "Config file does not exist, creating an empty config file at path: {}",
            config_path.display()
        );
        println!("Remember to modify it to actually do anything useful");
        std::fs::write(&config_path, BASE_CONFIG_FILE)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }
    Ok(config_path)
}

pub fn load_config(path: &Path) -> anyhow::Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&raw)
        .with_context(|| format!("config file {} contains invalid toml", path.display()))?;
    Ok(config)
}

/// Everything a subcommand needs, wired together from the config.
pub struct Context {
    pub settings: Settings,
    pub db: Database,
    pub rewriter: PathRewriter,
    pub rw_cache: Option<ReadWriteFileCache>,
    pub clients: BTreeMap<String, Box<dyn Client>>,
    pub utf8_compat_mode: bool,
}

pub fn build_context(
    config_flag: Option<PathBuf>,
    utf8_compat_mode: bool,
) -> anyhow::Result<Context> {
    let config_path = locate_config(config_flag)?;
    let config = load_config(&config_path)?;
    let settings = config.reseed;

    let database_path = match config_path.parent() {
        Some(parent) => parent.join(&settings.database_path),
        None => settings.database_path.clone(),
    };
    let db = Database::open(&database_path, utf8_compat_mode)
        .with_context(|| format!("failed to open database {}", database_path.display()))?;

    let rewriter = PathRewriter::new(&settings.same_paths);

    let rw_cache = if settings.cache_touched_files {
        let Some(cache_path) = settings.rw_file_cache_path.clone() else {
            bail!("cache_touched_files is enabled but rw_file_cache_path is not set");
        };
        let chown = settings
            .rw_file_cache_chown
            .as_deref()
            .map(|raw| raw.parse().map_err(anyhow::Error::msg))
            .transpose()?;
        Some(ReadWriteFileCache::new(
            cache_path,
            Duration::from_secs(settings.rw_file_cache_ttl),
            chown,
        ))
    } else {
        None
    };

    let mut clients: BTreeMap<String, Box<dyn Client>> = BTreeMap::new();
    for (name, client_config) in config.clients {
        let client: Box<dyn Client> = match client_config {
            ClientConfig::Exec { command } => Box::new(ExecClient::new(command)),
        };
        clients.insert(name, client);
    }

    Ok(Context {
        settings,
        db,
        rewriter,
        rw_cache,
        clients,
        utf8_compat_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_config_parses() {
        let config: ConfigFile = toml::from_str(BASE_CONFIG_FILE).unwrap();
        assert_eq!(config.reseed.link_type, LinkType::Soft);
        assert_eq!(config.reseed.add_limit_percent, 5);
        assert_eq!(config.reseed.always_verify_hash.len(), 3);
        assert!(config.clients.is_empty());
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ConfigFile = toml::from_str("[reseed]\n").unwrap();
        assert_eq!(config.reseed.add_limit_size, 128_000_000);
        assert_eq!(config.reseed.rw_file_cache_ttl, 86_400);
        assert!(!config.reseed.fast_resume);
    }

    #[test]
    fn client_config_parses() {
        let raw = r#"
[reseed]
link_type = "hard"

[clients.deluge]
kind = "exec"
command = "/usr/local/bin/deluge-bridge"
"#;
        let config: ConfigFile = toml::from_str(raw).unwrap();
        assert_eq!(config.reseed.link_type, LinkType::Hard);
        assert!(matches!(
            &config.clients["deluge"],
            ClientConfig::Exec { command } if command == Path::new("/usr/local/bin/deluge-bridge")
        ));
    }
}
