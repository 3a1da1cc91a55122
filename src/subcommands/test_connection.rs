use anyhow::bail;
use clap::Args;
use console::style;
use rayon::prelude::*;

use crate::clients::Client;
use crate::config::Context;

#[derive(Args)]
pub struct TestConnectionArgs {
    /// Check a specific client.
    #[arg(short = 'l', long)]
    client: Option<String>,
}

impl TestConnectionArgs {
    pub fn exec(self, ctx: &Context) -> anyhow::Result<()> {
        let clients: Vec<(&str, &dyn Client)> = ctx
            .clients
            .iter()
            .filter(|(name, _)| self.client.as_deref().is_none_or(|wanted| wanted == *name))
            .map(|(name, client)| (name.as_str(), client.as_ref()))
            .collect();
        if clients.is_empty() {
            bail!("no clients found");
        }

        let results: Vec<(&str, bool)> = clients
            .par_iter()
            .map(|(name, client)| (*name, client.test_connection()))
            .collect();

        for (name, connected) in results {
            if connected {
                println!("{} {name}", style("OK ").green());
            } else {
                println!("{} {name}", style("BAD").red());
            }
        }
        Ok(())
    }
}
