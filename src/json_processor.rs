//! Detect, extract, repair and schema-validate JSON payloads produced by a
//! model, and drive the re-prompt loop used to patch malformed output.
//!
//! Ported from `original_source/pasture_core.py`'s `JSONProcessor`. Every
//! function here is pure aside from [`patch_with_model`], which is the only
//! one allowed to talk to the backend (through a [`ModelManager`]).

use std::sync::LazyLock;

use regex::Regex;

use crate::{config::JsonPatchingConfig, model_manager::ModelManager, prelude::*};

/// Is `s` valid JSON?
pub fn is_valid(s: &str) -> bool {
    serde_json::from_str::<Value>(s).is_ok()
}

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

static BARE_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Scan `text` for the first valid JSON object: first inside fenced code
/// blocks, then as any balanced-looking `{...}` substring.
pub fn extract(text: &str) -> Option<String> {
    for capture in FENCED_BLOCK.captures_iter(text) {
        let candidate = capture[1].to_owned();
        if is_valid(&candidate) {
            return Some(candidate);
        }
    }
    // Try progressively shorter candidates anchored at the first `{`,
    // because a naive greedy `{.*}` across the whole text will usually
    // swallow trailing prose. We scan every `{` as a possible start and
    // every `}` at or after it as a possible end, preferring the first
    // valid parse in left-to-right, shortest-first order.
    let bytes = text.as_bytes();
    let starts: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'{')
        .map(|(i, _)| i)
        .collect();
    let ends: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'}')
        .map(|(i, _)| i)
        .collect();
    for &start in &starts {
        for &end in ends.iter().filter(|&&end| end > start) {
            let candidate = &text[start..=end];
            if is_valid(candidate) {
                return Some(candidate.to_owned());
            }
        }
    }
    // Fall back to whatever the permissive regex finds, for inputs whose
    // brace-scan above missed a valid parse entirely (e.g. braces inside
    // string literals that confuse the byte scan in the other direction).
    let whole = BARE_OBJECT.find(text)?;
    if is_valid(whole.as_str()) {
        Some(whole.as_str().to_owned())
    } else {
        None
    }
}

static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\w+)(\s*:)").unwrap());
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[\]}])").unwrap());

/// Attempt to fix common JSON formatting issues, per spec.md §4.2.
///
/// Returns an error (mirroring the original's raised `JSONDecodeError`) if
/// the repaired text still doesn't parse.
pub fn repair(s: &str) -> Result<String> {
    let mut fixed = s.trim().to_owned();

    if let Some(extracted) = extract(&fixed) {
        fixed = extracted;
    }

    fixed = fixed.replace('\'', "\"");
    fixed = TRAILING_COMMA.replace_all(&fixed, "$1").into_owned();
    fixed = BARE_KEY.replace_all(&fixed, "\"$1\"$2").into_owned();

    if !(fixed.starts_with('{') && fixed.ends_with('}')) {
        let escaped = fixed.replace('"', "\\\"").replace('\n', "\\n");
        fixed = format!(r#"{{"response": "{escaped}"}}"#);
    }

    if is_valid(&fixed) {
        Ok(fixed)
    } else {
        Err(anyhow!("JSON repair failed: result is still not valid JSON"))
    }
}

/// Parse `input`, repairing it first if necessary. Never raises: an
/// unparseable input produces `{"response": input, "error":
/// "json_parsing_failed"}`, and an empty input produces `{"response": "",
/// "error": "empty_response"}`.
pub fn parse(input: &str) -> Value {
    if input.trim().is_empty() {
        return json!({"response": "", "error": "empty_response"});
    }
    if let Ok(value) = serde_json::from_str::<Value>(input) {
        return value;
    }
    warn!("Initial JSON parsing failed, attempting repair...");
    match repair(input).and_then(|repaired| {
        serde_json::from_str::<Value>(&repaired).context("repaired JSON still invalid")
    }) {
        Ok(value) => value,
        Err(err) => {
            error!("JSON repair failed: {err}");
            json!({"response": input, "error": "json_parsing_failed"})
        }
    }
}

/// Wrap plain text as `{"response": text}`, per spec.md §4.4.
pub fn wrap_text_as_json(text: &str) -> Value {
    if text.is_empty() {
        return json!({"response": "", "error": "empty_response"});
    }
    json!({"response": text.trim()})
}

/// Validate `value` against a JSON Schema document. On success, returns the
/// value unchanged (schemas here are structural checks, not coercions —
/// `jsonschema` doesn't rewrite the input). On failure, returns an error
/// object carrying the validation details, matching spec.md §4.2's
/// `(ok, validated | errorObj)` contract.
pub fn validate_with_schema(value: &Value, schema: &Value) -> (bool, Value) {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            error!("Invalid schema: {err}");
            return (
                false,
                json!({"error": "schema_validation_failed", "details": err.to_string()}),
            );
        }
    };
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if errors.is_empty() {
        (true, value.clone())
    } else {
        error!("Schema validation error: {}", errors.join("; "));
        (
            false,
            json!({"error": "schema_validation_failed", "details": errors}),
        )
    }
}

/// Ask the model to fix malformed JSON it previously produced.
///
/// Builds a fix-request prompt containing the schema (if any) and the
/// malformed text, calls the model with `options` verbatim, and attempts
/// to parse-and-validate the response. Does not loop itself, and doesn't
/// touch `options` itself — the caller (`crate::step`'s patch loop) is
/// responsible for lowering the temperature once before entering the
/// loop, matching `patch_json_with_model` in
/// `original_source/pasture_core.py`, which also receives
/// `patching_options` pre-halved and never adjusts them itself (spec.md
/// §4.4.1).
pub async fn patch_with_model(
    model_manager: &ModelManager,
    model_name: &str,
    input_text: &str,
    schema: Option<&Value>,
    patching: &JsonPatchingConfig,
    options: Value,
) -> (bool, Value) {
    let schema_text = schema
        .map(|schema| serde_json::to_string_pretty(schema).unwrap_or_default())
        .unwrap_or_default();
    let fix_prompt_template = patching.patching_prompt.replace("{schema}", &schema_text);
    let fix_prompt = format!("{fix_prompt_template}\n\nPrevious output:\n{input_text}");

    let result = model_manager
        .generate_with_model(model_name, &fix_prompt, &options)
        .await;

    if result.get("error").is_some() {
        error!(
            "Error when patching JSON with model {model_name}: {:?}",
            result.get("error")
        );
        return (
            false,
            json!({"error": "patching_failed", "response": input_text}),
        );
    }

    let fixed_text = result
        .get("response")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let parsed = extract(fixed_text)
        .and_then(|extracted| serde_json::from_str::<Value>(&extracted).ok())
        .or_else(|| serde_json::from_str::<Value>(fixed_text).ok());

    let Some(fixed_json) = parsed else {
        warn!("Model {model_name} failed to produce valid JSON for patching");
        return (
            false,
            json!({"response": fixed_text, "error": "patching_failed"}),
        );
    };

    if let Some(schema) = schema {
        let (ok, validated) = validate_with_schema(&fixed_json, schema);
        if ok {
            (true, validated)
        } else {
            warn!("Patched JSON from {model_name} doesn't match schema");
            (false, fixed_json)
        }
    } else {
        (true, fixed_json)
    }
}
