use clap::Args;

use crate::config::Context;

#[derive(Args)]
pub struct CleanupCacheArgs {}

impl CleanupCacheArgs {
    pub fn exec(self, ctx: &Context) -> anyhow::Result<()> {
        let Some(rw_cache) = &ctx.rw_cache else {
            println!("No RW cache configured");
            return Ok(());
        };

        let removed_paths = rw_cache.cleanup_cache()?;
        println!(
            "Done cleaning up cache, removed {} path{}",
            removed_paths.len(),
            if removed_paths.len() == 1 { "" } else { "s" }
        );
        Ok(())
    }
}
