mod clients;
mod config;
mod db;
mod indexer;
mod linker;
mod matcher;
mod rw_cache;
mod subcommands;
#[cfg(test)]
mod testutil;
mod torrent;
mod util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "Cross-seed torrents from data you already have on disk")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Try to work around non-UTF-8 torrents and paths, not
    /// recommended.
    #[arg(short = 'u', long, global = true)]
    utf8_compat_mode: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add new torrents to a client, seeded from data already on disk.
    Add(subcommands::AddArgs),

    /// Scan the configured paths and index their files.
    Scan(subcommands::ScanArgs),
    /// Scan the download clients for seeded torrents.
    ScanClients(subcommands::ScanClientsArgs),

    /// See what is seeded for the given paths.
    Ls(subcommands::LsArgs),
    /// Find paths nothing is seeding.
    FindUnseeded(subcommands::FindUnseededArgs),
    /// Remove all torrents seeding data from a path. Does not delete
    /// the actual data.
    Rm(subcommands::RmArgs),

    /// Clean up expired read-write cache entries.
    CleanupCache(subcommands::CleanupCacheArgs),
    /// Test the connection to the configured clients.
    TestConnection(subcommands::TestConnectionArgs),
    /// Check that the config file exists and is loadable.
    CheckConfig(subcommands::CheckConfigArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default());
    if cli.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let mut ctx = config::build_context(cli.config, cli.utf8_compat_mode)?;

    match cli.command {
        Commands::Add(args) => args.exec(&ctx),
        Commands::Scan(args) => args.exec(&mut ctx),
        Commands::ScanClients(args) => args.exec(&mut ctx),
        Commands::Ls(args) => args.exec(&ctx),
        Commands::FindUnseeded(args) => args.exec(&ctx),
        Commands::Rm(args) => args.exec(&ctx),
        Commands::CleanupCache(args) => args.exec(&ctx),
        Commands::TestConnection(args) => args.exec(&ctx),
        Commands::CheckConfig(args) => args.exec(&ctx),
    }
}
