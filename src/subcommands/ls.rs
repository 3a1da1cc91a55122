use std::path::PathBuf;

use clap::Args;
use console::style;

use crate::config::Context;
use crate::matcher::Matcher;
use crate::util::humanize_bytes;

#[derive(Args)]
pub struct LsArgs {
    /// End the listing with a summary.
    #[arg(short, long)]
    summary: bool,

    /// Descend this many directory levels before reporting.
    #[arg(short, long, default_value_t = 0)]
    depth: u32,

    /// Paths to inspect; defaults to the current directory's entries.
    path: Vec<PathBuf>,
}

#[derive(Default)]
struct LsStats {
    count: usize,
    total_size: u64,
    total_seed_size: u64,
}

impl LsArgs {
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
        let mut stats = LsStats::default();
        dive_paths(&matcher, &paths, self.depth, &mut stats)?;

        if self.summary {
            println!("Number of paths: {}", stats.count);
            println!("Total size: {}", humanize_bytes(stats.total_size));
            println!("Total seed size: {}", humanize_bytes(stats.total_seed_size));
            println!(
                "Total unseeded size: {}",
                humanize_bytes(stats.total_size - stats.total_seed_size)
            );
        }
        Ok(())
    }
}

fn dive_paths(
    matcher: &Matcher<'_>,
    paths: &[PathBuf],
    depth: u32,
    stats: &mut LsStats,
) -> anyhow::Result<()> {
    if depth == 0 {
        return scan_paths(matcher, paths, stats);
    }

    let mut file_paths = Vec::new();
    let mut dir_paths = Vec::new();
    for path in paths {
        if path.is_dir() {
            dir_paths.push(path.clone());
        } else if path.is_file() {
            file_paths.push(path.clone());
        }
    }

    scan_paths(matcher, &file_paths, stats)?;
    for path in dir_paths {
        let mut children = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            children.push(entry?.path());
        }
        children.sort();
        dive_paths(matcher, &children, depth - 1, stats)?;
    }
    Ok(())
}

fn scan_paths(matcher: &Matcher<'_>, paths: &[PathBuf], stats: &mut LsStats) -> anyhow::Result<()> {
    for path in paths {
        let absolute = std::path::absolute(path)?;
        let map_result = matcher.map_path_to_clients(&absolute)?;

        let mut percent = if map_result.total_size > 0 {
            (map_result.seeded_size * 100 / map_result.total_size) as i64
        } else {
            0
        };
        let styled = if map_result.total_size > 0 && map_result.total_size == map_result.seeded_size
        {
            style(format!("{percent:>3}%")).green()
        } else if map_result.seeded_size > 0 {
            percent = percent.clamp(1, 99);
            style(format!("{percent:>3}%")).yellow()
        } else {
            style(format!("{percent:>3}%")).red()
        };

        stats.count += 1;
        stats.total_size += map_result.total_size;
        stats.total_seed_size += map_result.seeded_size;

        println!("[{styled}] {}", path.display());
    }
    Ok(())
}
