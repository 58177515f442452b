//! Small async I/O helpers.
//!
//! Adapted from the teacher's `async_utils::io::read_json_or_toml`, narrowed
//! to JSON only — every on-disk format this engine reads (config, pipeline
//! definitions, external schemas) is JSON per spec.md §6.

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::prelude::*;

/// Read and parse a JSON file.
pub async fn read_json_file<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open file at path: {:?}", path))?;
    let mut data = String::new();
    file.read_to_string(&mut data)
        .await
        .with_context(|| format!("failed to read file at path: {:?}", path))?;
    serde_json::from_str(&data)
        .with_context(|| format!("failed to parse JSON from file at path: {:?}", path))
}

/// Serialize `value` as pretty JSON, writing it to `path` if given, or to
/// standard output otherwise. Used by the CLI's `run` and `schema`
/// subcommands, which both produce a single JSON document per invocation
/// rather than a record stream (unlike the teacher's `SmartReader`/queue
/// machinery, which this engine doesn't need — see SPEC_FULL.md §0).
pub async fn write_json_output(path: Option<&Path>, value: &impl Serialize) -> Result<()> {
    let serialized =
        serde_json::to_string_pretty(value).context("failed to serialize output as JSON")?;
    match path {
        Some(path) => {
            tokio::fs::write(path, serialized.as_bytes())
                .await
                .with_context(|| format!("failed to write output to {:?}", path))?;
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(serialized.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
