//! A single model invocation: prompt or chat history in, validated JSON or
//! text out, with fallback-model and JSON-patch-loop support (spec.md
//! §4.4).

use schemars::JsonSchema;

use crate::{
    backend::ChatMessage,
    config::JsonPatchingConfig,
    json_processor,
    model_manager::ModelManager,
    prelude::*,
    schema::OutputSchema,
    template::{FormatOutcome, Template},
};

fn default_true() -> bool {
    true
}

/// Which backend call a step makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Completion,
    Chat,
}

/// A step's declarative configuration, as loaded from a pipeline
/// definition file. Names are unique within a [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
    pub model_name: String,

    /// Required for [`StepKind::Completion`]; ignored for chat steps,
    /// which use [`Self::system_prompt`] instead.
    #[serde(default)]
    pub prompt_template: Option<String>,

    /// Leading system message for [`StepKind::Chat`] steps.
    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub options: Value,

    /// Explicit fallback candidates, tried in order. If empty,
    /// [`crate::model_manager::ModelManager::get_fallback_model`] is asked
    /// for one candidate instead.
    #[serde(default)]
    pub fallback_models: Vec<String>,

    #[serde(default)]
    pub output_schema: Option<OutputSchema>,

    #[serde(default = "default_true")]
    pub use_patching: bool,

    /// Overrides [`JsonPatchingConfig::max_attempts`] for this step, if
    /// set.
    #[serde(default)]
    pub max_patching_attempts: Option<u32>,

    #[serde(default = "default_true")]
    pub fallback_to_text: bool,

    /// Names of steps this one depends on.
    #[serde(default)]
    pub deps: Vec<String>,
}

/// Outcome of one step invocation.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct StepResult {
    pub output: Value,
    pub time: f64,
    pub model: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub patched: bool,
}

/// Execute `def` against `data` (the step's materialized input: the
/// pipeline's base input merged with prior steps' outputs).
pub async fn execute(
    def: &StepDefinition,
    data: &Value,
    model_manager: &ModelManager,
    patching: &JsonPatchingConfig,
) -> StepResult {
    let start = std::time::Instant::now();
    let mut result = match def.kind {
        StepKind::Completion => execute_completion(def, data, model_manager, patching).await,
        StepKind::Chat => execute_chat(def, data, model_manager, patching).await,
    };
    result.time = start.elapsed().as_secs_f64();
    result
}

async fn execute_completion(
    def: &StepDefinition,
    data: &Value,
    mm: &ModelManager,
    patching: &JsonPatchingConfig,
) -> StepResult {
    let outcome = format_completion_prompt(def, data);

    // A cached answer for this exact prompt means we never touch the
    // backend at all (spec.md §8 scenario 5), so skip the health probe too.
    let cached = mm
        .completion_is_cached(&def.model_name, &outcome.text, &def.options)
        .await;
    if !cached && !mm.check_model_health(&def.model_name).await {
        return completion_fallback(def, data, mm, patching).await;
    }

    let result = mm
        .generate_with_model(&def.model_name, &outcome.text, &def.options)
        .await;

    if result.get("error").is_some() {
        return completion_fallback(def, data, mm, patching).await;
    }

    let (output, patched) = match &def.output_schema {
        Some(schema_def) => match schema_def.to_json_schema().await {
            Ok(schema) => apply_schema(result, &schema, def, mm, patching).await,
            Err(err) => (
                json!({"error": "schema_validation_failed", "details": err.to_string()}),
                false,
            ),
        },
        None => (result, false),
    };

    success_result(output, def.model_name.clone(), Some(outcome.text), false, patched)
}

async fn completion_fallback(
    def: &StepDefinition,
    data: &Value,
    mm: &ModelManager,
    patching: &JsonPatchingConfig,
) -> StepResult {
    let candidates = pick_fallback_candidates(def, mm).await;
    let outcome = format_completion_prompt(def, data);

    for candidate in &candidates {
        if !mm.check_model_health(candidate).await {
            continue;
        }
        let result = mm
            .generate_with_model(candidate, &outcome.text, &def.options)
            .await;
        if result.get("error").is_some() {
            continue;
        }
        let (output, patched) = match &def.output_schema {
            Some(schema_def) => match schema_def.to_json_schema().await {
                Ok(schema) => apply_schema(result, &schema, def, mm, patching).await,
                Err(_) => (result, false),
            },
            None => (result, false),
        };
        return success_result(output, candidate.clone(), Some(outcome.text), true, patched);
    }

    error_result(
        json!({"error": "all_models_failed"}),
        def.model_name.clone(),
        Some(outcome.text),
    )
}

async fn execute_chat(
    def: &StepDefinition,
    data: &Value,
    mm: &ModelManager,
    patching: &JsonPatchingConfig,
) -> StepResult {
    let messages = build_chat_messages(def, data);
    let format = match resolve_chat_format(def).await {
        Ok(format) => format,
        Err(err) => {
            let mut result = error_result(
                json!({"error": "schema_validation_failed", "details": err.to_string()}),
                def.model_name.clone(),
                None,
            );
            result.messages = Some(messages);
            return result;
        }
    };

    // As in execute_completion: a cache hit skips the health probe too.
    let cached = mm
        .chat_is_cached(&def.model_name, &messages, &def.options, format.as_ref())
        .await;
    if !cached && !mm.check_model_health(&def.model_name).await {
        return chat_fallback(def, data, mm, patching).await;
    }

    let result = mm
        .generate_with_chat(&def.model_name, &messages, &def.options, format.as_ref())
        .await;

    if result.get("error").is_some() {
        return chat_fallback(def, data, mm, patching).await;
    }

    let (output, patched) = match &format {
        Some(schema) => apply_schema(result, schema, def, mm, patching).await,
        None => (result, false),
    };

    let mut step_result = success_result(output, def.model_name.clone(), None, false, patched);
    step_result.messages = Some(messages);
    step_result
}

async fn chat_fallback(
    def: &StepDefinition,
    data: &Value,
    mm: &ModelManager,
    patching: &JsonPatchingConfig,
) -> StepResult {
    let candidates = pick_fallback_candidates(def, mm).await;
    let messages = build_chat_messages(def, data);
    let format = resolve_chat_format(def).await.unwrap_or(None);

    for candidate in &candidates {
        if !mm.check_model_health(candidate).await {
            continue;
        }
        let result = mm
            .generate_with_chat(candidate, &messages, &def.options, format.as_ref())
            .await;
        if result.get("error").is_some() {
            continue;
        }
        let (output, patched) = match &format {
            Some(schema) => apply_schema(result, schema, def, mm, patching).await,
            None => (result, false),
        };
        let mut step_result =
            success_result(output, candidate.clone(), None, true, patched);
        step_result.messages = Some(messages);
        return step_result;
    }

    let mut step_result = error_result(
        json!({"error": "all_models_failed"}),
        def.model_name.clone(),
        None,
    );
    step_result.messages = Some(messages);
    step_result
}

async fn resolve_chat_format(def: &StepDefinition) -> Result<Option<Value>> {
    match &def.output_schema {
        Some(schema_def) => Ok(Some(schema_def.to_json_schema().await?)),
        None => Ok(None),
    }
}

async fn pick_fallback_candidates(def: &StepDefinition, mm: &ModelManager) -> Vec<String> {
    if !def.fallback_models.is_empty() {
        return def.fallback_models.clone();
    }
    match mm.get_available_models().await {
        Ok(available) => mm
            .get_fallback_model(&def.model_name, &available)
            .await
            .into_iter()
            .collect(),
        Err(err) => {
            warn!("Failed to list available models for fallback: {err}");
            Vec::new()
        }
    }
}

/// Format a completion step's prompt, falling through to a safe assembly
/// when the template references a missing key (spec.md §4.4 step 2).
fn format_completion_prompt(def: &StepDefinition, data: &Value) -> FormatOutcome {
    let source = def.prompt_template.as_deref().unwrap_or_default();
    let template = Template::parse(source);
    let outcome = template.format(data);
    if outcome.missing.is_empty() {
        outcome
    } else {
        warn!(
            "Step {:?}: template references missing keys {:?}, falling back to a safe prompt",
            def.name, outcome.missing
        );
        FormatOutcome {
            text: safe_prompt(source, data),
            missing: outcome.missing,
        }
    }
}

/// Assemble a prompt from whatever `query` and prior step outputs are
/// present, for when the declared template can't be fully resolved.
fn safe_prompt(template_source: &str, data: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(query) = data.get("query").and_then(Value::as_str) {
        parts.push(query.to_owned());
    }
    if let Some(obj) = data.as_object() {
        let mut entries: Vec<(&String, &Value)> =
            obj.iter().filter(|(key, _)| key.as_str() != "query").collect();
        entries.sort_by_key(|(key, _)| key.as_str().to_owned());
        for (key, value) in entries {
            if let Some(response) = value.get("response").and_then(Value::as_str) {
                parts.push(format!("{key}: {response}"));
            }
        }
    }
    let mut prompt = parts.join("\n");
    let lower = template_source.to_lowercase();
    if lower.contains("combine") || lower.contains("integrat") {
        prompt.push_str("\nPlease combine and integrate the above information into a single coherent response.");
    }
    prompt
}

/// Assemble a chat step's messages: leading system prompt, then either an
/// explicit `messages` array from `data` or a synthesized user message plus
/// a system "Context" message built from prior steps' outputs (spec.md
/// §4.4, `ChatStep`).
fn build_chat_messages(def: &StepDefinition, data: &Value) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut has_system = false;
    if let Some(system_prompt) = &def.system_prompt {
        messages.push(ChatMessage::system(system_prompt.clone()));
        has_system = true;
    }

    if let Some(explicit) = data.get("messages").and_then(Value::as_array) {
        for entry in explicit {
            let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
            if role == "system" && has_system {
                continue;
            }
            if role == "system" {
                has_system = true;
            }
            let content = entry.get("content").and_then(Value::as_str).unwrap_or_default();
            messages.push(ChatMessage {
                role: role.to_owned(),
                content: content.to_owned(),
            });
        }
        return messages;
    }

    let mut context_parts = Vec::new();
    if let Some(obj) = data.as_object() {
        let mut entries: Vec<(&String, &Value)> = obj
            .iter()
            .filter(|(key, _)| key.as_str() != "query" && key.as_str() != "messages")
            .collect();
        entries.sort_by_key(|(key, _)| key.as_str().to_owned());
        for (key, value) in entries {
            if let Some(response) = value.get("response").and_then(Value::as_str) {
                context_parts.push(format!("{key}: {response}"));
            }
        }
    }
    if !context_parts.is_empty() {
        messages.push(ChatMessage::system(format!(
            "Context:\n{}",
            context_parts.join("\n")
        )));
    }
    let query = data.get("query").and_then(Value::as_str).unwrap_or_default();
    messages.push(ChatMessage::user(query.to_owned()));
    messages
}

/// Validate `result` against `schema`, driving the patch loop on failure
/// (spec.md §4.4.1). Returns the (possibly replaced) output and whether a
/// patch was applied.
async fn apply_schema(
    result: Value,
    schema: &Value,
    def: &StepDefinition,
    mm: &ModelManager,
    patching: &JsonPatchingConfig,
) -> (Value, bool) {
    let text = response_text(&result);
    let parsed = json_processor::parse(&text);
    if parsed.get("error").is_none() {
        let (ok, validated) = json_processor::validate_with_schema(&parsed, schema);
        if ok {
            return (validated, false);
        }
    }

    if def.use_patching && patching.enabled {
        let attempts = def.max_patching_attempts.unwrap_or(patching.max_attempts).max(1);
        let mut current_text = text.clone();
        // Copy options and halve/clamp the temperature once, before the
        // loop, per spec.md §4.4.1 and `_patch_json_output` in
        // `original_source/pasture_core.py`: the caller computes
        // `patching_options` up front and passes it unchanged into every
        // patch attempt, rather than re-deriving it each time.
        let patching_options = patching_options_for(&def.options);
        for _ in 0..attempts {
            let (ok, value) = json_processor::patch_with_model(
                mm,
                &def.model_name,
                &current_text,
                Some(schema),
                patching,
                patching_options.clone(),
            )
            .await;
            if ok {
                return (value, true);
            }
            match value.get("response").and_then(Value::as_str) {
                Some(next_text) => current_text = next_text.to_owned(),
                None => break,
            }
        }
    }

    if def.fallback_to_text && patching.fallback_to_text {
        (json_processor::wrap_text_as_json(&text), false)
    } else {
        (json!({"error": "schema_validation_failed", "response": text}), false)
    }
}

/// Copy `options`, halving the temperature and clamping it to `<= 0.3`,
/// for the patch loop's re-prompt calls (spec.md §4.4.1).
fn patching_options_for(options: &Value) -> Value {
    let mut patching_options = options.clone();
    let temperature = patching_options
        .get("temperature")
        .and_then(Value::as_f64)
        .unwrap_or(0.7);
    let patched_temperature = (temperature * 0.5).min(0.3);
    match patching_options.as_object_mut() {
        Some(obj) => {
            obj.insert("temperature".to_owned(), json!(patched_temperature));
        }
        None => patching_options = json!({"temperature": patched_temperature}),
    }
    patching_options
}

/// Recover the text a step's raw output represents, for re-parsing and
/// patching: the `response` field if present, else the whole object
/// (bookkeeping fields stripped) serialized back to a string.
fn response_text(result: &Value) -> String {
    if let Some(text) = result.get("response").and_then(Value::as_str) {
        return text.to_owned();
    }
    let mut cloned = result.clone();
    if let Some(obj) = cloned.as_object_mut() {
        obj.remove("model");
        obj.remove("execution_time");
    }
    serde_json::to_string(&cloned).unwrap_or_default()
}

fn success_result(output: Value, model: String, prompt: Option<String>, fallback: bool, patched: bool) -> StepResult {
    StepResult {
        output,
        time: 0.0,
        model,
        status: StepStatus::Success,
        prompt,
        messages: None,
        error_details: None,
        fallback,
        patched,
    }
}

fn error_result(output: Value, model: String, prompt: Option<String>) -> StepResult {
    StepResult {
        error_details: Some(output.clone()),
        output,
        time: 0.0,
        model,
        status: StepStatus::Error,
        prompt,
        messages: None,
        fallback: false,
        patched: false,
    }
}
