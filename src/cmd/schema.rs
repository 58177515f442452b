//! The `schema` subcommand: print the JSON Schema for one of the engine's
//! declarative record types, so pipeline and config files can be validated
//! or autocompleted externally. Mirrors the teacher's `cmd::schema`, with
//! the schema type list swapped for this engine's own data model
//! (spec.md §3) instead of the teacher's chat/OCR input-output types.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{async_utils::write_json_output, prelude::*};

/// The different schema types we support.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// Engine configuration.
    Config,
    /// A single step's declarative definition.
    StepDefinition,
    /// The result of running a whole pipeline.
    PipelineResult,
    /// A single cache entry's on-disk shape.
    CacheEntry,
    /// A model's tracked health state.
    ModelStatus,
}

/// `schema` command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to. Defaults to standard
    /// output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Run the `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.schema_type {
        SchemaType::Config => schema_for!(crate::config::Config),
        SchemaType::StepDefinition => schema_for!(crate::step::StepDefinition),
        SchemaType::PipelineResult => schema_for!(crate::pipeline::PipelineResult),
        SchemaType::CacheEntry => schema_for!(crate::cache::CacheEntry),
        SchemaType::ModelStatus => schema_for!(crate::model_manager::ModelStatus),
    };
    write_json_output(opts.output_path.as_deref(), &schema).await
}
