use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::debug;
use rusqlite::{params, params_from_iter, Connection};

use crate::util::{decode_path, normalize_filename};

pub type Result<T> = std::result::Result<T, rusqlite::Error>;

/// SQLite cannot bind unbounded parameter lists; stay under its
/// default variable limit.
const MAX_QUERY_PARAMETERS: usize = 500;

/// One row of the file index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub normalized_name: String,
    pub unsplittable_root: Option<PathBuf>,
}

impl SearchedFile {
    pub fn to_full_path(&self) -> PathBuf {
        self.path.join(&self.name)
    }
}

/// A client-reported file that is currently being seeded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeededFile {
    pub name: String,
    pub path: PathBuf,
    pub download_path: PathBuf,
    pub infohash: String,
    pub client: String,
    pub size: u64,
}

/// A torrent as reported by a client, queued for indexing.
#[derive(Clone, Debug)]
pub struct InsertTorrentFile {
    pub infohash: String,
    pub name: String,
    pub download_path: PathBuf,
    pub paths: Vec<(PathBuf, u64)>,
}

/// Conjunction of constraints for `Database::search_file`. At least
/// one of the lookup fields must be set.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileQuery<'a> {
    pub filename: Option<&'a str>,
    pub normalized_filename: Option<&'a str>,
    pub size: Option<u64>,
    pub parent: Option<&'a Path>,
    pub parent_postfix: Option<&'a Path>,
    pub is_unsplittable: Option<bool>,
    pub unsplittable_root: Option<&'a Path>,
}

pub struct Database {
    conn: Connection,
    pub utf8_compat_mode: bool,
}

impl Database {
    pub fn open(path: &Path, utf8_compat_mode: bool) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database {
            conn,
            utf8_compat_mode,
        };
        db.create_tables()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn,
            utf8_compat_mode: false,
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                normalized_name TEXT NOT NULL,
                unsplittable_root TEXT,
                UNIQUE(name, path)
            );
            CREATE INDEX IF NOT EXISTS idx_normalized_name ON files(normalized_name);
            CREATE INDEX IF NOT EXISTS idx_size ON files(size);
            CREATE TABLE IF NOT EXISTS client_torrents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                download_path TEXT NOT NULL,
                infohash TEXT NOT NULL,
                client TEXT NOT NULL,
                UNIQUE(infohash, client)
            );
            CREATE TABLE IF NOT EXISTS client_torrentfiles (
                torrent_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                UNIQUE(path, torrent_id)
            );",
        )
    }

    fn db_path(&self, path: &Path) -> Option<String> {
        decode_path(path, self.utf8_compat_mode)
    }

    /// Insert file entries, ignoring duplicates on `(name, path)`.
    /// Paths that cannot be decoded are skipped.
    pub fn insert_file_paths<I>(&mut self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (PathBuf, u64, Option<PathBuf>)>,
    {
        let utf8_compat_mode = self.utf8_compat_mode;
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut statement = tx.prepare(
                "INSERT OR IGNORE INTO files (name, path, size, normalized_name, unsplittable_root)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (path, size, unsplittable_root) in entries {
                let Some(decoded) = decode_path(&path, utf8_compat_mode) else {
                    debug!("skipping undecodable path {path:?}");
                    continue;
                };
                let (parent, name) = match decoded.rsplit_once('/') {
                    Some(("", name)) => ("/".to_string(), name.to_string()),
                    Some((parent, name)) => (parent.to_string(), name.to_string()),
                    None => (String::new(), decoded),
                };
                let normalized_name = normalize_filename(&name);
                let root = unsplittable_root
                    .as_deref()
                    .and_then(|p| decode_path(p, utf8_compat_mode));
                debug!(
                    "inserting name: {name:?} path: {parent:?} size: {size} normalized_name: {normalized_name:?} unsplittable_root: {root:?}"
                );
                inserted += statement.execute(params![
                    name,
                    parent,
                    size as i64,
                    normalized_name,
                    root
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn truncate_files(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM files", [])?;
        Ok(())
    }

    /// Search the file index with a conjunction of constraints.
    ///
    /// `parent_postfix` matches entries whose stored parent path ends
    /// with `/<postfix>`. Combining `is_unsplittable` with
    /// `unsplittable_root` is a programming error.
    pub fn search_file(&self, query: &FileQuery<'_>) -> Result<Vec<SearchedFile>> {
        assert!(
            query.filename.is_some()
                || query.normalized_filename.is_some()
                || query.size.is_some()
                || query.parent.is_some(),
            "must specify at least one constraint"
        );
        assert!(
            query.is_unsplittable.is_none() || query.unsplittable_root.is_none(),
            "must specify only unsplittable_root or is_unsplittable, not both"
        );

        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(normalized) = query.normalized_filename {
            clauses.push("normalized_name = ?");
            args.push(normalize_filename(normalized).into());
        }
        if let Some(filename) = query.filename {
            clauses.push("name = ?");
            args.push(filename.to_string().into());
        }
        if let Some(size) = query.size {
            clauses.push("size = ?");
            args.push((size as i64).into());
        }
        if let Some(parent) = query.parent {
            clauses.push("path = ?");
            args.push(self.db_path(parent).unwrap_or_default().into());
        }
        if let Some(postfix) = query.parent_postfix {
            let postfix = postfix.to_string_lossy();
            let postfix = postfix.trim_start_matches('/');
            if !postfix.is_empty() && postfix != "." {
                clauses.push("path LIKE ?");
                args.push(format!("%/{postfix}").into());
            }
        }
        if let Some(unsplittable) = query.is_unsplittable {
            clauses.push(if unsplittable {
                "unsplittable_root IS NOT NULL"
            } else {
                "unsplittable_root IS NULL"
            });
        }
        if let Some(root) = query.unsplittable_root {
            clauses.push("unsplittable_root = ?");
            args.push(self.db_path(root).unwrap_or_default().into());
        }

        let sql = format!(
            "SELECT name, path, size, normalized_name, unsplittable_root FROM files WHERE {}",
            clauses.join(" AND ")
        );
        debug!("doing query: {sql:?} with args: {args:?}");

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(args), |row| {
            Ok(SearchedFile {
                name: row.get(0)?,
                path: PathBuf::from(row.get::<_, String>(1)?),
                size: row.get::<_, i64>(2)? as u64,
                normalized_name: row.get(3)?,
                unsplittable_root: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
            })
        })?;
        rows.collect()
    }

    /// Name and download path previously recorded for a torrent.
    pub fn get_torrent_file_info(
        &self,
        client: &str,
        infohash: &str,
    ) -> Result<Option<(String, PathBuf)>> {
        let mut statement = self.conn.prepare(
            "SELECT name, download_path FROM client_torrents WHERE client = ?1 AND infohash = ?2",
        )?;
        let mut rows = statement.query_map(params![client, infohash], |row| {
            Ok((
                row.get::<_, String>(0)?,
                PathBuf::from(row.get::<_, String>(1)?),
            ))
        })?;
        rows.next().transpose()
    }

    /// Replace the stored torrents for `(client, infohash)` and insert
    /// their files in one transaction.
    pub fn insert_torrent_files_paths(
        &mut self,
        client: &str,
        torrents: &[InsertTorrentFile],
    ) -> Result<()> {
        let utf8_compat_mode = self.utf8_compat_mode;
        let tx = self.conn.transaction()?;
        {
            let mut delete_files = tx.prepare(
                "DELETE FROM client_torrentfiles WHERE torrent_id IN
                 (SELECT id FROM client_torrents WHERE client = ?1 AND infohash = ?2)",
            )?;
            let mut delete_torrents =
                tx.prepare("DELETE FROM client_torrents WHERE client = ?1 AND infohash = ?2")?;
            let mut insert_torrent = tx.prepare(
                "INSERT OR IGNORE INTO client_torrents (name, download_path, infohash, client)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut insert_file = tx.prepare(
                "INSERT OR IGNORE INTO client_torrentfiles (torrent_id, path, size)
                 VALUES (?1, ?2, ?3)",
            )?;

            for torrent in torrents {
                delete_files.execute(params![client, torrent.infohash])?;
                delete_torrents.execute(params![client, torrent.infohash])?;

                let Some(download_path) =
                    decode_path(&torrent.download_path, utf8_compat_mode)
                else {
                    continue;
                };
                insert_torrent.execute(params![
                    torrent.name,
                    download_path,
                    torrent.infohash,
                    client
                ])?;
                let torrent_id = tx.last_insert_rowid();

                for (path, size) in &torrent.paths {
                    let Some(path) = decode_path(path, utf8_compat_mode) else {
                        continue;
                    };
                    insert_file.execute(params![torrent_id, path, *size as i64])?;
                }
            }
        }
        tx.commit()
    }

    /// Remove stored torrents, for one client or all of them.
    pub fn truncate_torrent_files(&mut self, client: Option<&str>) -> Result<()> {
        match client {
            Some(client) => {
                self.conn.execute(
                    "DELETE FROM client_torrentfiles WHERE torrent_id IN
                     (SELECT id FROM client_torrents WHERE client = ?1)",
                    params![client],
                )?;
                self.conn
                    .execute("DELETE FROM client_torrents WHERE client = ?1", params![
                        client
                    ])?;
            }
            None => {
                self.conn.execute("DELETE FROM client_torrentfiles", [])?;
                self.conn.execute("DELETE FROM client_torrents", [])?;
            }
        }
        Ok(())
    }

    /// Drop torrents the client no longer reports.
    pub fn remove_non_existing_infohashes(
        &mut self,
        client: &str,
        observed: &HashSet<String>,
    ) -> Result<()> {
        let stored: Vec<(i64, String)> = {
            let mut statement = self
                .conn
                .prepare("SELECT id, infohash FROM client_torrents WHERE client = ?1")?;
            let rows = statement
                .query_map(params![client], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_>>()?
        };

        let tx = self.conn.transaction()?;
        for (id, infohash) in stored {
            if observed.contains(&infohash) {
                continue;
            }
            debug!("removing no longer seeded torrent {infohash} from {client}");
            tx.execute("DELETE FROM client_torrents WHERE id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM client_torrentfiles WHERE torrent_id = ?1",
                params![id],
            )?;
        }
        tx.commit()
    }

    /// The subset of `paths` that some client torrent is seeding.
    pub fn get_seeded_paths(&self, paths: &[PathBuf]) -> Result<Vec<SeededFile>> {
        let mut seeded = Vec::new();
        for chunk in paths.chunks(MAX_QUERY_PARAMETERS) {
            let decoded: Vec<String> = chunk
                .iter()
                .filter_map(|p| self.db_path(p))
                .collect();
            if decoded.is_empty() {
                continue;
            }
            let placeholders = vec!["?"; decoded.len()].join(",");
            let sql = format!(
                "SELECT name, download_path, infohash, client, path, size
                 FROM client_torrentfiles
                 LEFT JOIN client_torrents ON client_torrents.id = client_torrentfiles.torrent_id
                 WHERE path IN ({placeholders})"
            );
            let mut statement = self.conn.prepare(&sql)?;
            let rows = statement.query_map(params_from_iter(decoded), |row| {
                Ok(SeededFile {
                    name: row.get(0)?,
                    download_path: PathBuf::from(row.get::<_, String>(1)?),
                    infohash: row.get(2)?,
                    client: row.get(3)?,
                    path: PathBuf::from(row.get::<_, String>(4)?),
                    size: row.get::<_, i64>(5)? as u64,
                })
            })?;
            for row in rows {
                seeded.push(row?);
            }
        }
        Ok(seeded)
    }
}
