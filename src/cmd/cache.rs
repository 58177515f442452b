//! The `cache` subcommand: inspect or clear the on-disk response cache.

use clap::{Args, Subcommand};

use crate::{async_utils::write_json_output, cache::FileCache, prelude::*};

/// `cache` command line arguments.
#[derive(Debug, Args)]
pub struct CacheOpts {
    /// Engine configuration, used to locate the cache directory unless
    /// `--cache-dir` is given directly.
    #[clap(short = 'c', long = "config")]
    pub config_path: Option<PathBuf>,

    /// Override the cache directory.
    #[clap(long)]
    pub cache_dir: Option<PathBuf>,

    #[clap(subcommand)]
    pub action: CacheAction,
}

/// What to do to the cache.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Print cache statistics (entry counts, size).
    Stats,
    /// Remove one entry by key, or the whole cache if no key is given.
    Clear {
        /// The raw cache key to remove (not the MD5 filename).
        #[clap(long)]
        key: Option<String>,
    },
}

/// Run the `cache` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_cache(opts: &CacheOpts) -> Result<()> {
    let cache_dir = match &opts.cache_dir {
        Some(dir) => dir.clone(),
        None => super::load_config(opts.config_path.as_deref()).await?.cache_dir,
    };
    let cache = FileCache::new(cache_dir.as_path())?;

    match &opts.action {
        CacheAction::Stats => {
            let stats = cache.stats().await?;
            write_json_output(None, &stats).await?;
        }
        CacheAction::Clear { key } => {
            cache.clear(key.as_deref()).await?;
            match key {
                Some(key) => info!("Cleared cache entry for {key:?}"),
                None => info!("Cleared all cache entries under {cache_dir:?}"),
            }
        }
    }
    Ok(())
}
