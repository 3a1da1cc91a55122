use anyhow::bail;
use clap::Args;

use crate::clients::Client;
use crate::config::Context;
use crate::indexer::Indexer;
use crate::util::compile_patterns;

#[derive(Args)]
pub struct ScanClientsArgs {
    /// Scan a specific client.
    #[arg(short = 'l', long)]
    client: Option<String>,

    /// Clear old data and do a full scan.
    #[arg(short, long)]
    full: bool,

    /// Run a fast scan; does not detect moved torrents. Overridden by
    /// full.
    #[arg(short = 'a', long)]
    fast: bool,
}

impl ScanClientsArgs {
    pub fn exec(self, ctx: &mut Context) -> anyhow::Result<()> {
        let selected: Vec<(&str, &dyn Client)> = ctx
            .clients
            .iter()
            .filter(|(name, _)| self.client.as_deref().is_none_or(|wanted| wanted == *name))
            .map(|(name, client)| (name.as_str(), client.as_ref()))
            .collect();
        if selected.is_empty() {
            bail!("no clients found");
        }

        println!("Scanning clients");
        let indexer = Indexer::new(
            compile_patterns(&ctx.settings.ignore_file_patterns)?,
            compile_patterns(&ctx.settings.ignore_directory_patterns)?,
        );
        indexer.scan_clients(&mut ctx.db, &selected, self.full, self.fast)?;
        Ok(())
    }
}
