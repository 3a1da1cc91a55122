use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::Args;
use console::style;
use log::debug;

use crate::config::Context;
use crate::linker::{
    render_store_path, template_has_variables, Chown, LinkAction, LinkError, Linker,
};
use crate::matcher::{DynamicMatch, DynamicMatchOptions, Matcher};
use crate::torrent::{self, HashStatus, TouchStatus};
use crate::util::{compile_patterns, print_add_status, AddStatus};

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !value.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err("format must be 'key=value'".to_string()),
    }
}

fn sanitize_path_variable(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

#[derive(Args)]
pub struct AddArgs {
    /// Client to add the torrents to.
    client: String,

    /// Exact matching mode, essentially a "reseed" mode. Disables all
    /// other matching modes.
    #[arg(short, long)]
    exact: bool,

    /// Probe matched files for full pieces to ensure the data matches.
    #[arg(short = 's', long)]
    hash_probe: bool,

    /// Hash size matching mode, considers files with the same size but
    /// different filenames.
    #[arg(short = 'a', long = "hash-size")]
    hash_size: bool,

    /// Print a summary of all actions when done.
    #[arg(long)]
    print_summary: bool,

    /// Chown the staged data, numeric "uid:gid".
    #[arg(long)]
    chown: Option<String>,

    /// Do not create links or add torrents, just report what would
    /// happen.
    #[arg(long)]
    dry_run: bool,

    /// Move each torrent file here after it was added successfully.
    #[arg(long)]
    move_torrent_on_add: Option<PathBuf>,

    /// Add the torrents in stopped state.
    #[arg(long)]
    stopped: bool,

    /// Store path template overriding the one from the config file.
    #[arg(short = 't', long)]
    store_path_template: Option<String>,

    /// Extra store path variable, "key=value". May be repeated.
    #[arg(long = "store-path-variable", value_parser = parse_key_value)]
    store_path_variables: Vec<(String, String)>,

    /// Torrent files to add.
    #[arg(required = true)]
    torrents: Vec<PathBuf>,
}

#[derive(Default)]
struct AddStats {
    seeded: usize,
    added: usize,
    exists: usize,
    failed: usize,
    missing_files: usize,
}

impl AddArgs {
    pub fn exec(self, ctx: &Context) -> anyhow::Result<()> {
        let client = ctx
            .clients
            .get(&self.client)
            .ok_or_else(|| anyhow!("unknown client: {}", self.client))?;
        let existing_torrents: HashSet<String> =
            client.list()?.into_iter().map(|t| t.infohash).collect();

        let store_template = self
            .store_path_template
            .clone()
            .or_else(|| ctx.settings.store_path.clone())
            .ok_or_else(|| anyhow!("no store path template configured"))?;
        if !self.exact && !template_has_variables(&store_template) {
            bail!(
                "store path does not contain any variables and therefore would be the same for every torrent"
            );
        }

        let always_verify = compile_patterns(&ctx.settings.always_verify_hash)?;
        let ignore_file_patterns = compile_patterns(&ctx.settings.ignore_file_patterns)?;
        let chown: Option<Chown> = self
            .chown
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(anyhow::Error::msg)?;
        let base_variables: BTreeMap<String, String> =
            self.store_path_variables.iter().cloned().collect();

        println!(
            "Matching {} torrent{}",
            self.torrents.len(),
            if self.torrents.len() == 1 { "" } else { "s" }
        );

        let matcher = Matcher::new(&ctx.rewriter, &ctx.db);
        let mut stats = AddStats::default();

        for torrent_path in &self.torrents {
            let mut variables: BTreeMap<String, String> = BTreeMap::new();
            variables.insert("client".to_string(), self.client.clone());
            variables.insert(
                "torrent_name".to_string(),
                torrent_path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );

            let raw = match std::fs::read(torrent_path) {
                Ok(raw) => raw,
                Err(err) => {
                    debug!("failed to read {}: {err}", torrent_path.display());
                    print_add_status(
                        AddStatus::Failed,
                        torrent_path,
                        "failed to read torrent file",
                    );
                    stats.failed += 1;
                    continue;
                }
            };
            let decoded = match serde_bencode::from_bytes::<serde_bencode::value::Value>(&raw) {
                Ok(decoded) => decoded,
                Err(err) => {
                    debug!("failed to decode {}: {err}", torrent_path.display());
                    print_add_status(
                        AddStatus::Failed,
                        torrent_path,
                        "failed to parse torrent file",
                    );
                    stats.failed += 1;
                    continue;
                }
            };
            let torrent = match torrent::parse_torrent(&decoded, ctx.utf8_compat_mode) {
                Ok(torrent) => torrent,
                Err(err) => {
                    debug!("failed to parse {}: {err}", torrent_path.display());
                    print_add_status(
                        AddStatus::Failed,
                        torrent_path,
                        "failed to parse torrent file",
                    );
                    stats.failed += 1;
                    continue;
                }
            };

            if let Some(domain) = torrent
                .trackers
                .first()
                .and_then(|tracker| torrent::tracker_domain(tracker))
            {
                variables.insert("tracker_domain".to_string(), sanitize_path_variable(&domain));
            }
            if let Some(source) = torrent::info_source(&decoded) {
                variables.insert("torrent_source".to_string(), sanitize_path_variable(&source));
            }
            // User-supplied variables win over the computed ones.
            variables.extend(base_variables.clone());

            if torrent.has_file_patterns(&ignore_file_patterns) {
                print_add_status(
                    AddStatus::Failed,
                    torrent_path,
                    "file contains ignored patterns and can therefore never be matched",
                );
                stats.failed += 1;
                continue;
            }

            let infohash = match torrent::infohash(&decoded) {
                Ok(infohash) => infohash,
                Err(err) => {
                    debug!("failed to compute infohash: {err}");
                    print_add_status(
                        AddStatus::Failed,
                        torrent_path,
                        "failed to parse torrent file",
                    );
                    stats.failed += 1;
                    continue;
                }
            };
            if existing_torrents.contains(&infohash) {
                print_add_status(AddStatus::Seeded, torrent_path, "is already seeded");
                stats.seeded += 1;
                continue;
            }

            let max_missing_size = ctx
                .settings
                .add_limit_size
                .min(ctx.settings.add_limit_percent * torrent.size / 100);

            let mut found_bad_hash = false;
            let mut missing_size: Option<u64> = None;
            let mut torrent_root_path: Option<PathBuf> = None;

            if self.exact {
                if let Some(root_path) = matcher.match_files_exact(&torrent)? {
                    let mapping: HashMap<PathBuf, Option<PathBuf>> = torrent
                        .filelist
                        .iter()
                        .map(|f| (f.path.clone(), Some(root_path.join(&f.path))))
                        .collect();
                    match torrent.verify_hash(&always_verify, &mapping) {
                        Ok(verify) if verify.all_verified_ok() => {
                            torrent_root_path = Some(root_path);
                        }
                        Ok(_) => found_bad_hash = true,
                        Err(err) => {
                            debug!("hash verification failed to run: {err}");
                            print_add_status(
                                AddStatus::Failed,
                                torrent_path,
                                "failed to verify matched files",
                            );
                            stats.failed += 1;
                            continue;
                        }
                    }
                }
            } else {
                let options = DynamicMatchOptions {
                    match_hash_size: self.hash_size,
                    add_limit_size: ctx.settings.add_limit_size,
                    add_limit_percent: ctx.settings.add_limit_percent,
                    hash_probe: self.hash_probe,
                };
                match matcher.match_files_dynamic(&torrent, options)? {
                    DynamicMatch::Failed {
                        missing_size: missing,
                    } => missing_size = Some(missing),
                    DynamicMatch::Matched {
                        missing_size: missing,
                        matched_files,
                        touched_files,
                    } => {
                        let verify = match torrent.verify_hash(&always_verify, &matched_files) {
                            Ok(verify) => verify,
                            Err(err) => {
                                debug!("hash verification failed to run: {err}");
                                print_add_status(
                                    AddStatus::Failed,
                                    torrent_path,
                                    "failed to verify matched files",
                                );
                                stats.failed += 1;
                                continue;
                            }
                        };
                        let failed_files: HashSet<&PathBuf> = verify
                            .hash_status
                            .iter()
                            .filter(|(_, status)| **status == HashStatus::Failed)
                            .map(|(path, _)| path)
                            .collect();
                        let failed_size: u64 = torrent
                            .filelist
                            .iter()
                            .filter(|f| failed_files.contains(&f.path))
                            .map(|f| f.size)
                            .sum();
                        let missing = missing + failed_size;
                        missing_size = Some(missing);

                        if missing <= max_missing_size {
                            let touched: HashSet<PathBuf> = if ctx.settings.cache_touched_files {
                                let mut touched: HashSet<PathBuf> =
                                    touched_files.into_iter().collect();
                                for (path, status) in &verify.touch_status {
                                    let include = match status {
                                        TouchStatus::Success => true,
                                        TouchStatus::Failed => !failed_files.contains(path),
                                    };
                                    if include {
                                        touched.insert(path.clone());
                                    }
                                }
                                touched
                            } else {
                                HashSet::new()
                            };

                            let mut link_mapping: BTreeMap<PathBuf, (LinkAction, PathBuf)> =
                                BTreeMap::new();
                            for (torrent_data_path, actual_path) in &matched_files {
                                let Some(actual_path) = actual_path else {
                                    continue;
                                };
                                let action = if failed_files.contains(torrent_data_path) {
                                    LinkAction::Copy
                                } else if touched.contains(torrent_data_path) {
                                    LinkAction::CacheLink
                                } else {
                                    LinkAction::Link
                                };
                                link_mapping
                                    .insert(torrent_data_path.clone(), (action, actual_path.clone()));
                            }

                            let store_path = match render_store_path(&store_template, &variables) {
                                Ok(store_path) => store_path,
                                Err(err) => {
                                    print_add_status(
                                        AddStatus::Failed,
                                        torrent_path,
                                        &err.to_string(),
                                    );
                                    stats.failed += 1;
                                    continue;
                                }
                            };
                            let linker = Linker {
                                link_type: ctx.settings.link_type,
                                rw_cache: ctx.rw_cache.as_ref(),
                                chown,
                                dry_run: self.dry_run,
                                skip_store_metadata: ctx.settings.skip_store_metadata,
                            };
                            match linker.create_link_path(&store_path, &link_mapping, torrent_path)
                            {
                                Ok(Some(result)) => torrent_root_path = Some(result.data_path),
                                Ok(None) => {
                                    // Dry run, nothing was created.
                                    torrent_root_path = Some(store_path);
                                }
                                Err(LinkError::StoreExists(path)) => {
                                    debug!("store path {} already exists", path.display());
                                    print_add_status(
                                        AddStatus::Exists,
                                        torrent_path,
                                        "the link folder already exists but this torrent is not seeded by the client",
                                    );
                                    stats.exists += 1;
                                    continue;
                                }
                                Err(LinkError::Io(err))
                                    if err.kind() == std::io::ErrorKind::NotADirectory =>
                                {
                                    debug!("failed to create path: {err}");
                                    print_add_status(
                                        AddStatus::Failed,
                                        torrent_path,
                                        "store path is not a folder",
                                    );
                                    stats.failed += 1;
                                    continue;
                                }
                                Err(LinkError::Io(err))
                                    if err.kind() == std::io::ErrorKind::PermissionDenied =>
                                {
                                    debug!("failed to create path: {err}");
                                    print_add_status(
                                        AddStatus::Failed,
                                        torrent_path,
                                        "permissions on the store path restrict the ability to create links",
                                    );
                                    stats.failed += 1;
                                    continue;
                                }
                                Err(err) => {
                                    debug!("failed to create path: {err}");
                                    print_add_status(
                                        AddStatus::Failed,
                                        torrent_path,
                                        "failed to create links",
                                    );
                                    stats.failed += 1;
                                    continue;
                                }
                            }
                        } else {
                            found_bad_hash = true;
                        }
                    }
                }
            }

            if let Some(root_path) = torrent_root_path {
                if self.dry_run {
                    print_add_status(AddStatus::Added, torrent_path, "added");
                    stats.added += 1;
                } else {
                    match client.add(&raw, &root_path, ctx.settings.fast_resume, self.stopped) {
                        Ok(()) => {
                            print_add_status(AddStatus::Added, torrent_path, "added");
                            stats.added += 1;
                            if let Some(move_dir) = &self.move_torrent_on_add {
                                std::fs::create_dir_all(move_dir)?;
                                let target = move_dir.join(
                                    torrent_path.file_name().unwrap_or(torrent_path.as_os_str()),
                                );
                                std::fs::rename(torrent_path, target)?;
                            }
                        }
                        Err(err) => {
                            debug!("failed to add torrent: {err:?}");
                            print_add_status(
                                AddStatus::Failed,
                                torrent_path,
                                "failed to send torrent to client",
                            );
                            stats.failed += 1;
                        }
                    }
                }
            } else {
                let mut message = String::from("is missing data");
                if let Some(missing) = missing_size {
                    let mut percent = if torrent.size > 0 {
                        ((1.0 - missing as f64 / torrent.size as f64) * 100.0) as i64
                    } else {
                        0
                    };
                    let styled = if missing < torrent.size {
                        percent = percent.clamp(1, 99);
                        style(format!("{percent:>3}%")).yellow()
                    } else {
                        style(format!("{percent:>3}%")).red()
                    };
                    message.push_str(&format!(" with {styled} found"));
                }
                if found_bad_hash {
                    message.push_str(" due to bad file hashes");
                }
                print_add_status(AddStatus::MissingFiles, torrent_path, &message);
                stats.missing_files += 1;
            }
        }

        if self.print_summary {
            println!();
            println!("Summary:");
            println!(" Added:          {}", stats.added);
            println!(" Missing files:  {}", stats.missing_files);
            println!(" Failed:         {}", stats.failed);
            println!(" Folder exists:  {}", stats.exists);
            println!(" Already seeded: {}", stats.seeded);
            println!(
                " Total:          {}",
                stats.added + stats.missing_files + stats.failed + stats.exists + stats.seeded
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Client, ClientTorrent, MemoryClient};
    use crate::config::Settings;
    use crate::db::Database;
    use crate::indexer::Indexer;
    use crate::matcher::PathRewriter;
    use crate::testutil::TestTorrentDisk;
    use std::fs;

    fn context_for(disk: &TestTorrentDisk, client: MemoryClient, store_template: &str) -> Context {
        let mut db = Database::open_in_memory().unwrap();
        Indexer::new(Vec::new(), Vec::new())
            .scan_paths(&mut db, &[disk.root().to_path_buf()], true)
            .unwrap();
        let mut clients: BTreeMap<String, Box<dyn Client>> = BTreeMap::new();
        clients.insert("testclient".to_string(), Box::new(client));
        Context {
            settings: Settings {
                store_path: Some(store_template.to_string()),
                always_verify_hash: vec!["*.nfo".into(), "*.sfv".into(), "*.diz".into()],
                ..Default::default()
            },
            db,
            rewriter: PathRewriter::new(&[]),
            rw_cache: None,
            clients,
            utf8_compat_mode: false,
        }
    }

    fn add_args(torrents: Vec<PathBuf>) -> AddArgs {
        AddArgs {
            client: "testclient".to_string(),
            exact: false,
            hash_probe: false,
            hash_size: false,
            print_summary: false,
            chown: None,
            dry_run: false,
            move_torrent_on_add: None,
            stopped: false,
            store_path_template: None,
            store_path_variables: Vec::new(),
            torrents,
        }
    }

    #[test]
    fn add_stages_links_and_sends_to_client() {
        let disk = TestTorrentDisk::standard();
        let torrent_file = disk.root().join("test.torrent");
        fs::write(&torrent_file, disk.builder.to_bytes()).unwrap();
        let client = MemoryClient::default();
        let handle = client.clone();
        let store = disk.root().join("store");
        let ctx = context_for(
            &disk,
            client,
            &format!("{}/{{torrent_name}}", store.display()),
        );

        add_args(vec![torrent_file]).exec(&ctx).unwrap();

        assert_eq!(handle.added(), 1);
        let destination = handle.last_added_destination().unwrap();
        assert_eq!(destination, store.join("test/data"));
        for name in ["file_a.txt", "file_b.txt", "file_c.txt"] {
            let link = destination.join("testfiles").join(name);
            assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
            assert_eq!(
                fs::read_link(&link).unwrap(),
                disk.root().join("testfiles").join(name)
            );
        }
        assert!(store.join("test/test.torrent").is_file());
        assert!(store.join("test/reseed.json").is_file());
    }

    #[test]
    fn add_skips_already_seeded_torrents() {
        let disk = TestTorrentDisk::standard();
        let torrent_file = disk.root().join("test.torrent");
        fs::write(&torrent_file, disk.builder.to_bytes()).unwrap();
        let infohash = crate::torrent::infohash(&disk.builder.to_value()).unwrap();

        let client = MemoryClient::default();
        client.seed_torrent(
            ClientTorrent {
                infohash,
                name: "testfiles".to_string(),
            },
            disk.root().to_path_buf(),
            Vec::new(),
        );
        let handle = client.clone();
        let store = disk.root().join("store");
        let ctx = context_for(
            &disk,
            client,
            &format!("{}/{{torrent_name}}", store.display()),
        );

        add_args(vec![torrent_file]).exec(&ctx).unwrap();
        assert_eq!(handle.added(), 0);
        assert!(!store.exists());
    }

    #[test]
    fn existing_store_folder_does_not_fail_the_batch() {
        let disk = TestTorrentDisk::standard();
        let torrent_file = disk.root().join("test.torrent");
        fs::write(&torrent_file, disk.builder.to_bytes()).unwrap();
        let client = MemoryClient::default();
        let handle = client.clone();
        let store = disk.root().join("store");
        fs::create_dir_all(store.join("test")).unwrap();
        let ctx = context_for(
            &disk,
            client,
            &format!("{}/{{torrent_name}}", store.display()),
        );

        add_args(vec![torrent_file]).exec(&ctx).unwrap();
        assert_eq!(handle.added(), 0);
    }

    #[test]
    fn user_supplied_variables_override_computed_ones() {
        let disk = TestTorrentDisk::standard();
        let torrent_file = disk.root().join("test.torrent");
        fs::write(&torrent_file, disk.builder.to_bytes()).unwrap();
        let client = MemoryClient::default();
        let handle = client.clone();
        let store = disk.root().join("store");
        let ctx = context_for(
            &disk,
            client,
            &format!("{}/{{torrent_name}}", store.display()),
        );

        let mut args = add_args(vec![torrent_file]);
        args.store_path_variables =
            vec![("torrent_name".to_string(), "custom-name".to_string())];
        args.exec(&ctx).unwrap();

        assert_eq!(handle.added(), 1);
        assert_eq!(
            handle.last_added_destination().unwrap(),
            store.join("custom-name/data")
        );
    }

    #[test]
    fn dry_run_creates_nothing() {
        let disk = TestTorrentDisk::standard();
        let torrent_file = disk.root().join("test.torrent");
        fs::write(&torrent_file, disk.builder.to_bytes()).unwrap();
        let client = MemoryClient::default();
        let handle = client.clone();
        let store = disk.root().join("store");
        let ctx = context_for(
            &disk,
            client,
            &format!("{}/{{torrent_name}}", store.display()),
        );

        let mut args = add_args(vec![torrent_file]);
        args.dry_run = true;
        args.exec(&ctx).unwrap();
        assert_eq!(handle.added(), 0);
        assert!(!store.exists());
    }
}
