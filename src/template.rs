//! Named-field prompt templates.
//!
//! Replaces host-language string formatting (`format!`, a templating
//! engine like `handlebars`) with an explicit little language: a template
//! is parsed once into literal chunks and `{name}` / `{name[field]}`
//! references, then resolved against a data map at execution time. Missing
//! references don't error here — callers (see [`crate::step`]) fall
//! through to the safe-prompt assembly rule instead (spec.md §4.4, §9
//! "Dynamic template interpolation").

use crate::prelude::*;

#[derive(Debug, Clone, PartialEq)]
enum Chunk {
    Literal(String),
    Reference { name: String, field: Option<String> },
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    chunks: Vec<Chunk>,
}

/// The result of formatting a template against a data map.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatOutcome {
    /// The formatted text, with every resolvable reference substituted.
    /// References that couldn't be resolved are left out entirely (not
    /// substituted with anything), since the caller is expected to ignore
    /// `text` and fall back to a safe assembly when `missing` is non-empty.
    pub text: String,
    /// Names referenced in the template but absent (or un-indexable) in
    /// the data map, in first-occurrence order.
    pub missing: Vec<String>,
}

impl Template {
    /// Parse `source` into literal chunks and references. Never fails: an
    /// unmatched `{` is treated as a literal character.
    pub fn parse(source: &str) -> Self {
        let mut chunks = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(start) = rest.find('{') {
            literal.push_str(&rest[..start]);
            let after_brace = &rest[start + 1..];
            match after_brace.find('}') {
                Some(end) => {
                    let inner = &after_brace[..end];
                    if !literal.is_empty() {
                        chunks.push(Chunk::Literal(std::mem::take(&mut literal)));
                    }
                    let (name, field) = parse_reference(inner);
                    chunks.push(Chunk::Reference { name, field });
                    rest = &after_brace[end + 1..];
                }
                None => {
                    literal.push('{');
                    rest = after_brace;
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            chunks.push(Chunk::Literal(literal));
        }

        Self { chunks }
    }

    /// Does this template reference `name` at all?
    pub fn references(&self, name: &str) -> bool {
        self.chunks
            .iter()
            .any(|chunk| matches!(chunk, Chunk::Reference { name: n, .. } if n == name))
    }

    /// Resolve every reference against `data`, a JSON object.
    pub fn format(&self, data: &Value) -> FormatOutcome {
        let mut text = String::new();
        let mut missing = Vec::new();
        for chunk in &self.chunks {
            match chunk {
                Chunk::Literal(literal) => text.push_str(literal),
                Chunk::Reference { name, field } => {
                    match resolve(data, name, field.as_deref()) {
                        Some(resolved) => text.push_str(&resolved),
                        None => {
                            if !missing.contains(name) {
                                missing.push(name.clone());
                            }
                        }
                    }
                }
            }
        }
        FormatOutcome { text, missing }
    }
}

fn parse_reference(inner: &str) -> (String, Option<String>) {
    match inner.find('[') {
        Some(bracket) => {
            let name = inner[..bracket].trim().to_owned();
            let field = inner[bracket + 1..]
                .trim_end_matches(']')
                .trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .to_owned();
            (name, Some(field))
        }
        None => (inner.trim().to_owned(), None),
    }
}

fn resolve(data: &Value, name: &str, field: Option<&str>) -> Option<String> {
    let value = data.get(name)?;
    let value = match field {
        Some(field) => value.get(field)?,
        None => value,
    };
    Some(value_to_text(value))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_simple_reference() {
        let template = Template::parse("Answer: {query}");
        let outcome = template.format(&json!({"query": "hi"}));
        assert_eq!(outcome.text, "Answer: hi");
        assert!(outcome.missing.is_empty());
    }

    #[test]
    fn test_format_field_reference() {
        let template = Template::parse("Result: {step_a[response]}");
        let data = json!({"step_a": {"response": "42"}});
        let outcome = template.format(&data);
        assert_eq!(outcome.text, "Result: 42");
        assert!(outcome.missing.is_empty());
    }

    #[test]
    fn test_format_missing_key_is_reported_not_substituted() {
        let template = Template::parse("Answer: {query}, Context: {missing_step}");
        let outcome = template.format(&json!({"query": "hi"}));
        assert_eq!(outcome.missing, vec!["missing_step".to_owned()]);
        assert_eq!(outcome.text, "Answer: hi, Context: ");
    }

    #[test]
    fn test_format_missing_field_on_present_key() {
        let template = Template::parse("{step_a[missing_field]}");
        let data = json!({"step_a": {"response": "42"}});
        let outcome = template.format(&data);
        assert_eq!(outcome.missing, vec!["step_a".to_owned()]);
    }

    #[test]
    fn test_unmatched_brace_is_literal() {
        let template = Template::parse("cost is {5 each");
        let outcome = template.format(&json!({}));
        assert_eq!(outcome.text, "cost is {5 each");
    }

    #[test]
    fn test_references_numbers_and_null_render_without_quotes() {
        let template = Template::parse("{n} and {nothing}");
        let outcome = template.format(&json!({"n": 3, "nothing": null}));
        assert_eq!(outcome.text, "3 and ");
    }

    #[test]
    fn test_references_helper() {
        let template = Template::parse("{query} {step_a[response]}");
        assert!(template.references("query"));
        assert!(template.references("step_a"));
        assert!(!template.references("step_b"));
    }
}
