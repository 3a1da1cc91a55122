use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use clap::Args;

use crate::config::Context;
use crate::matcher::Matcher;
use crate::util::shell_quote;

#[derive(Args)]
pub struct FindUnseededArgs {
    /// Quote the printed paths for shell consumption.
    #[arg(short, long)]
    escape_paths: bool,

    /// Paths to inspect; defaults to the current directory's entries.
    path: Vec<PathBuf>,
}

impl FindUnseededArgs {
    pub fn exec(self, ctx: &Context) -> anyhow::Result<()> {
        let paths = if self.path.is_empty() {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(".")? {
                paths.push(entry?.path());
            }
            paths.sort();
            paths
        } else {
            self.path.clone()
        };

        let matcher = Matcher::new(&ctx.rewriter, &ctx.db);
        for path in paths {
            let root = std::path::absolute(&path)?;
            let map_result = matcher.map_path_to_clients(&root)?;

            // Mark every ancestor of a seeded file as seeded, so only
            // fully-unseeded subtrees remain.
            let mut path_seeds: HashMap<PathBuf, bool> = HashMap::new();
            for (file, mapped_file) in &map_result.files {
                if file
                    .symlink_metadata()
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
                {
                    continue;
                }
                let is_seeded = !mapped_file.clients.is_empty();
                let mut current = file.clone();
                while current.starts_with(&root) {
                    if !is_seeded && path_seeds.contains_key(&current) {
                        break;
                    }
                    if path_seeds.get(&current).copied().unwrap_or(false) {
                        break;
                    }
                    path_seeds.insert(current.clone(), is_seeded);
                    match current.parent() {
                        Some(parent) => current = parent.to_path_buf(),
                        None => break,
                    }
                }
            }

            let unseeded: HashSet<PathBuf> = path_seeds
                .iter()
                .filter(|(_, seeded)| !**seeded)
                .map(|(path, _)| path.clone())
                .collect();
            let mut base_unseeded: Vec<&PathBuf> = unseeded
                .iter()
                .filter(|path| {
                    path.parent()
                        .is_none_or(|parent| !unseeded.contains(parent))
                })
                .collect();
            base_unseeded.sort();

            for unseeded_path in base_unseeded {
                let display = unseeded_path.to_string_lossy();
                if self.escape_paths {
                    println!("{}", shell_quote(&display));
                } else {
                    println!("{display}");
                }
            }
        }
        Ok(())
    }
}
