use std::path::PathBuf;

use clap::Args;

use crate::config::Context;
use crate::indexer::Indexer;
use crate::util::compile_patterns;

#[derive(Args)]
pub struct ScanArgs {
    /// Partially scan a given path; does not remove already-indexed
    /// files from the database.
    #[arg(short, long)]
    path: Option<PathBuf>,
}

impl ScanArgs {
    pub fn exec(self, ctx: &mut Context) -> anyhow::Result<()> {
        let indexer = Indexer::new(
            compile_patterns(&ctx.settings.ignore_file_patterns)?,
            compile_patterns(&ctx.settings.ignore_directory_patterns)?,
        );

        match self.path {
            Some(path) => {
                println!("Scanning single path {}", path.display());
                let path = std::path::absolute(path)?;
                indexer.scan_paths(&mut ctx.db, &[path], false)?;
            }
            None => {
                println!("Doing full scan");
                let roots = ctx
                    .settings
                    .paths
                    .iter()
                    .map(std::path::absolute)
                    .collect::<std::io::Result<Vec<_>>>()?;
                indexer.scan_paths(&mut ctx.db, &roots, true)?;
            }
        }
        println!("Done scanning");
        Ok(())
    }
}
