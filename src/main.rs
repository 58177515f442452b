use std::str::FromStr;

use clap::{Parser, Subcommand};
use pasture::{cmd, prelude::*};
use tracing_subscriber::{EnvFilter, filter::Directive, util::SubscriberInitExt as _};

/// Orchestrate multi-step LLM inference DAGs over a local model backend.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OLLAMA_API_BASE (optional): Override the inference backend's base URL.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run a declared pipeline against one input.
    Run(cmd::run::RunOpts),
    /// Inspect or clear the on-disk response cache.
    Cache(cmd::cache::CacheOpts),
    /// Print schemas for our config and pipeline record types.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// The `--config` path this subcommand was given, if any. `Schema`
    /// doesn't take one, since it only inspects Rust types, not a loaded
    /// `Config`.
    fn config_path(&self) -> Option<&Path> {
        match self {
            Cmd::Run(opts) => opts.config_path.as_deref(),
            Cmd::Cache(opts) => opts.config_path.as_deref(),
            Cmd::Schema(_) => None,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a `.env` file before anything else
    // consults the environment (config path resolution, backend base URL).
    dotenvy::dotenv().ok();

    // Parse command-line arguments up front so we know which subcommand's
    // `--config` to consult for the effective log level before the
    // subscriber is installed.
    let opts = Opts::parse();

    // Initialize tracing. `RUST_LOG` always wins; absent that, the
    // subcommand's config file (or built-in defaults) picks the directive,
    // honoring `Config::debug_mode`/`log_level` per SPEC_FULL.md §1.
    let config_path = opts.subcmd.config_path();
    let config = cmd::load_config(config_path).await.unwrap_or_default();
    let directive = Directive::from_str(config.effective_log_directive())
        .expect("config-derived directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish()
        .init();

    real_main(opts).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(opts: Opts) -> Result<()> {
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(run_opts) => cmd::run::cmd_run(run_opts).await?,
        Cmd::Cache(cache_opts) => cmd::cache::cmd_cache(cache_opts).await?,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await?,
    }
    Ok(())
}
