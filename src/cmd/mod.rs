//! Command-line entry points.

pub mod cache;
pub mod run;
pub mod schema;

use crate::prelude::*;

/// Load the engine's [`crate::config::Config`] from an optional file,
/// falling back to defaults, and validate it. Shared by every subcommand
/// that talks to the model manager or the cache, matching the teacher's
/// `cmd` module convention of small shared helpers in `mod.rs`.
pub async fn load_config(path: Option<&Path>) -> Result<crate::config::Config> {
    let config = match path {
        Some(path) => crate::config::Config::from_file(path).await,
        None => crate::config::Config::default(),
    };
    config.validate()?;
    Ok(config)
}
