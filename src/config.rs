//! Process-scoped configuration.
//!
//! Mirrors `pasture_core.py`'s `Config` model: an optional JSON file on disk,
//! merged over built-in defaults, with a handful of invariants enforced at
//! construction rather than left to blow up later.

use schemars::JsonSchema;

use crate::{async_utils::read_json_file, prelude::*};

/// Valid log levels, matching the original's `LogLevel` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Convert to a `tracing` directive string.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

/// Retry strategy, selected uniformly for every `GenerateWithModel` /
/// `GenerateWithChat` failure kind (see SPEC_FULL.md §9, Open Question 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Fixed,
    RandomExponential,
    None,
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first), so `1` disables
    /// retrying altogether.
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,

    /// Which backoff strategy to apply between attempts.
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Minimum wait, in seconds, between attempts.
    #[serde(default = "RetryPolicy::default_min_wait")]
    pub min_wait: f64,

    /// Maximum wait, in seconds, between attempts.
    #[serde(default = "RetryPolicy::default_max_wait")]
    pub max_wait: f64,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_min_wait() -> f64 {
        1.0
    }

    fn default_max_wait() -> f64 {
        10.0
    }

    /// Validate our invariants: `max_wait >= min_wait`.
    pub fn validate(&self) -> Result<()> {
        if self.max_wait < self.min_wait {
            return Err(anyhow!(
                "retry policy max_wait ({}) must be >= min_wait ({})",
                self.max_wait,
                self.min_wait
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            strategy: RetryStrategy::default(),
            min_wait: Self::default_min_wait(),
            max_wait: Self::default_max_wait(),
        }
    }
}

/// JSON-patching behavior, used by [`crate::json_processor`] and
/// [`crate::step`] when a step's output doesn't validate against its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JsonPatchingConfig {
    /// Enable JSON patching globally.
    #[serde(default = "JsonPatchingConfig::default_enabled")]
    pub enabled: bool,

    /// Maximum number of patching attempts.
    #[serde(default = "JsonPatchingConfig::default_max_attempts")]
    pub max_attempts: u32,

    /// Fall back to wrapping raw text as `{"response": ...}` if patching
    /// fails.
    #[serde(default = "JsonPatchingConfig::default_fallback_to_text")]
    pub fallback_to_text: bool,

    /// Prompt template used to ask the model to fix its own output. Must
    /// contain a `{schema}` placeholder (may be empty).
    #[serde(default = "JsonPatchingConfig::default_patching_prompt")]
    pub patching_prompt: String,
}

impl JsonPatchingConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_max_attempts() -> u32 {
        3
    }

    fn default_fallback_to_text() -> bool {
        true
    }

    fn default_patching_prompt() -> String {
        "The previous output was not valid JSON. Please fix it and return only \
         valid JSON that matches the expected schema: {schema}"
            .to_owned()
    }
}

impl Default for JsonPatchingConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_attempts: Self::default_max_attempts(),
            fallback_to_text: Self::default_fallback_to_text(),
            patching_prompt: Self::default_patching_prompt(),
        }
    }
}

/// Process-scoped, immutable configuration for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Where the [`crate::cache::FileCache`] stores its entries.
    pub cache_dir: PathBuf,

    /// JSON-patching behavior.
    pub json_patching: JsonPatchingConfig,

    /// When set, the backend is never actually called; `ModelManager`
    /// synthesizes deterministic canned responses instead.
    pub simulation_mode: bool,

    /// Logging verbosity.
    pub log_level: LogLevel,

    /// HTTP request timeout, in seconds. Must be `> 0`.
    pub request_timeout: f64,

    /// Retry policy applied around every backend call.
    pub retry: RetryPolicy,

    /// Preload/unload models around generate calls so only one model is
    /// resident in the backend at a time.
    pub preload_models: bool,

    /// Kept for parity with the original `Config`; the engine always runs
    /// model calls sequentially behind one lock regardless of this flag
    /// (see spec.md §5 Non-goals), so this only documents intent.
    pub sequential_execution: bool,

    /// Consecutive failures before a model is marked unhealthy.
    pub fallback_threshold: u32,

    /// Minimum acceptable response length, in characters.
    pub min_response_length: usize,

    /// Forces DEBUG-level logging even if `log_level` is coarser.
    pub debug_mode: bool,

    /// Log response previews at INFO level.
    pub verbose_output: bool,

    /// Override for the backend base URL. Defaults to
    /// `http://localhost:11434` if unset here and in the environment.
    pub api_base: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            json_patching: JsonPatchingConfig::default(),
            simulation_mode: false,
            log_level: LogLevel::default(),
            request_timeout: 90.0,
            retry: RetryPolicy::default(),
            preload_models: true,
            sequential_execution: true,
            fallback_threshold: 2,
            min_response_length: 10,
            debug_mode: false,
            verbose_output: false,
            api_base: None,
        }
    }
}

impl Config {
    /// Validate our invariants: `max_wait >= min_wait`, `request_timeout >
    /// 0`, `fallback_threshold >= 0` (trivially true for `u32`).
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.request_timeout <= 0.0 {
            return Err(anyhow!(
                "request_timeout must be > 0, got {}",
                self.request_timeout
            ));
        }
        Ok(())
    }

    /// Load configuration from a JSON file, falling back to defaults (with a
    /// logged warning/error) on any failure — matching
    /// `pasture_core.py`'s `Config.from_file`, which never aborts startup
    /// over a bad config file.
    pub async fn from_file(path: &Path) -> Self {
        match read_json_file::<Config>(path).await {
            Ok(config) => match config.validate() {
                Ok(()) => config,
                Err(err) => {
                    error!("Validation error in config file {:?}: {err}", path);
                    Config::default()
                }
            },
            Err(err) => {
                if !path.exists() {
                    warn!("Config file not found: {:?}, using defaults", path);
                } else {
                    error!("Error loading config {:?}: {err}", path);
                }
                Config::default()
            }
        }
    }

    /// The effective `tracing` directive for this configuration, honoring
    /// `debug_mode` as an override regardless of `log_level`.
    pub fn effective_log_directive(&self) -> &'static str {
        if self.debug_mode {
            "debug"
        } else {
            self.log_level.as_directive()
        }
    }
}
