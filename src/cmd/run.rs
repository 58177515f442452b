//! The `run` subcommand: execute a declared pipeline against one input.

use clap::Args;

use crate::{
    async_utils::{read_json_file, write_json_output},
    cache::FileCache,
    model_manager::ModelManager,
    pipeline::Pipeline,
    prelude::*,
    step::StepDefinition,
};

/// `run` command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Pipeline definition, as a JSON array of step definitions.
    pub pipeline_path: PathBuf,

    /// Input data, as a single JSON object merged into every step's
    /// template data.
    pub input_path: PathBuf,

    /// Engine configuration. Defaults to built-in defaults if omitted.
    #[clap(short = 'c', long = "config")]
    pub config_path: Option<PathBuf>,

    /// Output location for the pipeline result, in JSON format. Defaults to
    /// standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Run the `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(opts: &RunOpts) -> Result<()> {
    let config = super::load_config(opts.config_path.as_deref()).await?;
    let patching = config.json_patching.clone();

    let cache = FileCache::new(config.cache_dir.as_path())?;
    let manager = ModelManager::new(config, cache)?;

    let steps: Vec<StepDefinition> = read_json_file(&opts.pipeline_path)
        .await
        .context("failed to load pipeline definition")?;
    let pipeline = Pipeline::new(steps).context("failed to construct pipeline")?;

    let input: Value = read_json_file(&opts.input_path)
        .await
        .context("failed to load pipeline input")?;

    let result = pipeline.run(input, &manager, &patching).await;
    manager.close().await;

    info!(
        "Pipeline run complete: {}/{} steps succeeded in {:.2}s",
        result.success_count, result.total_count, result.total_time
    );

    write_json_output(opts.output_path.as_deref(), &result).await
}
