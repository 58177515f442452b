//! Output schemas: declared JSON-Schema data, not host-language types
//! (spec.md §9, "Schema descriptions").
//!
//! An [`OutputSchema`] is either a full JSON-Schema document (inline or
//! loaded from a file) or a convenience declarative shorthand
//! ([`SimpleSchema`]) for the common case of "an object with these typed
//! fields" — itself compiled down to plain JSON Schema, never inspected as
//! a Rust type. Validation against the resulting document happens in
//! [`crate::json_processor::validate_with_schema`] via the `jsonschema`
//! crate. Adapted from the teacher's `Schema`/`SimpleSchema` pair, with the
//! TOML-external-file and OpenAI-specific `additionalProperties`/`required`
//! forcing dropped (this engine validates with `jsonschema`, which doesn't
//! need those OpenAI-function-calling workarounds).

use std::collections::HashMap;

use schemars::JsonSchema;

use crate::{async_utils::read_json_file, prelude::*};

/// Either an externally-stored schema, an inline JSON-Schema document, or a
/// declarative shorthand compiled to one.
#[derive(Debug, Clone, Deserialize, PartialEq, JsonSchema)]
#[serde(untagged, deny_unknown_fields, rename_all = "snake_case")]
pub enum OutputSchema {
    /// An external schema, provided as a path to a JSON file.
    External { path: PathBuf },

    /// A schema given directly as a JSON value.
    JsonValue { json: Value },

    /// A declarative shorthand, compiled to JSON Schema.
    Internal(SimpleSchema),
}

impl OutputSchema {
    /// Resolve this schema to a full JSON-Schema document.
    pub async fn to_json_schema(&self) -> Result<Value> {
        match self {
            OutputSchema::External { path } => read_json_file::<Value>(path).await,
            OutputSchema::JsonValue { json } => Ok(json.clone()),
            OutputSchema::Internal(schema) => {
                let mut schema_json = schema.to_json_schema()?;
                schema_json["$schema"] =
                    Value::String("http://json-schema.org/draft-07/schema#".to_owned());
                Ok(schema_json)
            }
        }
    }
}

/// A simplified declarative schema: "a value of this shape, with this
/// description", compiled to standard JSON Schema by [`ToJsonSchema`].
#[derive(Debug, Clone, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct SimpleSchema {
    /// A human-readable description of this value, carried into the
    /// compiled schema's `description` field.
    pub description: String,

    #[serde(flatten)]
    pub details: SimpleSchemaDetails,
}

#[derive(Debug, Clone, Deserialize, PartialEq, JsonSchema)]
#[serde(untagged, deny_unknown_fields, rename_all = "snake_case")]
pub enum SimpleSchemaDetails {
    Array {
        items: Box<SimpleSchema>,
    },
    Object {
        properties: HashMap<String, SimpleSchema>,
        #[serde(default)]
        title: Option<String>,
        /// Which properties are required. Defaults to all of them, since
        /// that's the common case for a step's output.
        #[serde(default)]
        required: Option<Vec<String>>,
    },
    Scalar {
        #[serde(default)]
        r#type: ScalarType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        r#enum: Option<Vec<Value>>,
    },
}

#[derive(Debug, Default, Clone, Deserialize, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub enum ScalarType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
}

pub trait ToJsonSchema {
    fn to_json_schema(&self) -> Result<Value>;
}

impl ToJsonSchema for SimpleSchema {
    fn to_json_schema(&self) -> Result<Value> {
        let description = Value::String(self.description.clone());
        match &self.details {
            SimpleSchemaDetails::Array { items } => {
                let mut schema = json!({
                    "type": "array",
                    "items": items.to_json_schema()?,
                });
                schema["description"] = description;
                Ok(schema)
            }
            SimpleSchemaDetails::Object {
                title,
                properties,
                required,
            } => {
                let required = required.clone().unwrap_or_else(|| {
                    let mut keys: Vec<String> = properties.keys().cloned().collect();
                    keys.sort();
                    keys
                });
                let mut schema = json!({
                    "type": "object",
                    "properties": properties.to_json_schema()?,
                    "required": required,
                });
                if let Some(title) = title {
                    schema["title"] = Value::String(title.clone());
                }
                schema["description"] = description;
                Ok(schema)
            }
            SimpleSchemaDetails::Scalar { r#type, r#enum } => {
                let mut schema = json!({"type": r#type.to_json_schema()?});
                if let Some(enum_values) = r#enum {
                    schema["enum"] = Value::Array(enum_values.clone());
                }
                schema["description"] = description;
                Ok(schema)
            }
        }
    }
}

impl ToJsonSchema for HashMap<String, SimpleSchema> {
    fn to_json_schema(&self) -> Result<Value> {
        let mut properties = serde_json::Map::new();
        for (key, value) in self {
            properties.insert(key.clone(), value.to_json_schema()?);
        }
        Ok(Value::Object(properties))
    }
}

impl ToJsonSchema for ScalarType {
    fn to_json_schema(&self) -> Result<Value> {
        let r#type = match self {
            ScalarType::String => "string",
            ScalarType::Number => "number",
            ScalarType::Integer => "integer",
            ScalarType::Boolean => "boolean",
        };
        Ok(Value::String(r#type.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_value_schema() {
        let schema: OutputSchema =
            serde_json::from_value(json!({"json": {"type": "integer"}})).unwrap();
        assert_eq!(schema, OutputSchema::JsonValue { json: json!({"type": "integer"}) });
    }

    #[test]
    fn test_external_schema() {
        let schema: OutputSchema =
            serde_json::from_value(json!({"path": "schema.json"})).unwrap();
        assert_eq!(
            schema,
            OutputSchema::External { path: "schema.json".into() }
        );
    }

    #[test]
    fn test_internal_schema_compiles_to_json_schema() {
        let schema_json = json!({
            "description": "Extracted fields.",
            "properties": {
                "x": {"description": "a number", "type": "integer"},
                "y": {"description": "a string"},
            },
        });
        let schema: SimpleSchema = serde_json::from_value(schema_json).unwrap();
        let compiled = schema.to_json_schema().unwrap();
        assert_eq!(compiled["type"], json!("object"));
        assert_eq!(compiled["properties"]["x"]["type"], json!("integer"));
        assert_eq!(compiled["properties"]["y"]["type"], json!("string"));
        let mut required =
            serde_json::from_value::<Vec<String>>(compiled["required"].clone()).unwrap();
        required.sort();
        assert_eq!(required, vec!["x".to_owned(), "y".to_owned()]);
    }

    #[tokio::test]
    async fn test_to_json_schema_resolves_internal_schema() {
        let schema: OutputSchema = serde_json::from_value(json!({
            "description": "a scalar",
            "type": "number",
        }))
        .unwrap();
        let resolved = schema.to_json_schema().await.unwrap();
        assert_eq!(resolved["type"], json!("number"));
        assert_eq!(
            resolved["$schema"],
            json!("http://json-schema.org/draft-07/schema#")
        );
    }
}
