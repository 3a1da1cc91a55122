use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::bail;
use clap::Args;

use crate::config::Context;
use crate::matcher::Matcher;

#[derive(Args)]
pub struct RmArgs {
    /// Remove from a specific client.
    #[arg(short = 'l', long)]
    client: Option<String>,

    /// Paths whose seeding torrents should be removed. The data is
    /// never deleted.
    #[arg(required = true)]
    path: Vec<PathBuf>,
}

impl RmArgs {
    pub fn exec(self, ctx: &Context) -> anyhow::Result<()> {
        let clients: BTreeMap<&str, _> = ctx
            .clients
            .iter()
            .filter(|(name, _)| self.client.as_deref().is_none_or(|wanted| wanted == *name))
            .map(|(name, client)| (name.as_str(), client))
            .collect();
        if clients.is_empty() {
            bail!("no clients found");
        }

        let matcher = Matcher::new(&ctx.rewriter, &ctx.db);
        let mut infohashes_to_remove: BTreeMap<&str, HashSet<String>> = BTreeMap::new();
        for path in &self.path {
            let absolute = std::path::absolute(path)?;
            let map_result = matcher.map_path_to_clients(&absolute)?;
            for mapped_file in map_result.files.values() {
                for (client_name, infohash) in &mapped_file.clients {
                    if let Some((name, _)) = clients.get_key_value(client_name.as_str()) {
                        infohashes_to_remove
                            .entry(*name)
                            .or_default()
                            .insert(infohash.clone());
                    }
                }
            }
        }

        if infohashes_to_remove.is_empty() {
            println!("Nothing found to remove");
            return Ok(());
        }

        for (client_name, infohashes) in infohashes_to_remove {
            println!(
                "Removing {} torrent{} from {client_name}",
                infohashes.len(),
                if infohashes.len() == 1 { "" } else { "s" }
            );
            let client = &clients[client_name];
            for infohash in infohashes {
                client.remove(&infohash)?;
            }
        }
        Ok(())
    }
}
