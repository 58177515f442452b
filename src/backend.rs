//! Wire types for the fixed Ollama-style HTTP backend contract (spec.md §6):
//! `POST /api/generate`, `POST /api/chat`, `GET /api/tags`.
//!
//! These are plain serde structs with no behavior; [`crate::model_manager`]
//! owns the HTTP client, retrying, and caching around them.

use schemars::JsonSchema;

use crate::prelude::*;

/// Default backend base URL, used when neither `Config::api_base` nor the
/// environment specifies one.
pub const DEFAULT_API_BASE: &str = "http://localhost:11434";

/// A single chat message, as sent to and received from `/api/chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_owned(),
            content: content.into(),
        }
    }
}

/// Request body for `POST /api/generate`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<&'a str>,
}

/// Response body from `POST /api/generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    /// Total wall-clock time the backend spent on this request, in
    /// nanoseconds. Passed through into the step's output per spec.md §4.3.
    #[serde(default)]
    pub total_duration: Option<u64>,
    #[serde(default)]
    pub load_duration: Option<u64>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

/// Request body for `POST /api/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<&'a str>,
}

/// Response body from `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub message: ChatResponseMessage,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub content: String,
}

/// A single entry from `GET /api/tags`.
#[derive(Debug, Clone, Deserialize)]
pub struct TagsModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

/// Response body from `GET /api/tags`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<TagsModel>,
}

/// `keep_alive: "0"` tells the backend to unload the model immediately
/// after this call, used by [`crate::model_manager::ModelManager`]'s
/// preload/unload discipline.
pub const KEEP_ALIVE_UNLOAD: &str = "0";
