use clap::Args;

use crate::config::Context;

#[derive(Args)]
pub struct CheckConfigArgs {}

impl CheckConfigArgs {
    pub fn exec(self, _ctx: &Context) -> anyhow::Result<()> {
        println!("We made it this far without a crash so the config must be loadable.");
        Ok(())
    }
}
