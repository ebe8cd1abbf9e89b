//! Strict JSON-Schema validation of tool arguments.
//!
//! Validation is a trust boundary and fails closed: a missing or
//! uncompilable schema rejects the call. Strict mode goes beyond the
//! declared schema: every object level that does not set
//! `additionalProperties` gets `additionalProperties: false`, so undeclared
//! arguments are rejected rather than silently forwarded. There is no type
//! coercion; `integer` and `number` are distinct.

use serde_json::{Map, Value};

use jsonschema::Draft;

/// One validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    /// JSON-Pointer path to the offending fragment in the arguments.
    pub path: String,
    /// The violated constraint (resolved schema value where possible, e.g.
    /// "integer", otherwise the keyword, e.g. "required").
    pub constraint: String,
    /// Human-readable validator message.
    pub message: String,
}

/// Why validation could not pass.
#[derive(Debug)]
pub enum ValidateError {
    /// The schema itself is missing or not a valid JSON Schema.
    InvalidSchema(String),
    /// The arguments violated the schema.
    Failed(Vec<ValidationFailure>),
}

/// Strict argument validator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl SchemaValidator {
    /// Validate `args` for `tool` against `schema`.
    ///
    /// Returns all violations, each with a JSON-Pointer path, the expected
    /// constraint, and a message.
    pub fn validate(
        &self,
        tool: &str,
        args: &Value,
        schema: &Value,
    ) -> Result<(), ValidateError> {
        if schema.is_null() {
            return Err(ValidateError::InvalidSchema(format!(
                "tool '{tool}' has no input schema"
            )));
        }

        let strict = strictify(schema);
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&strict)
            .map_err(|e| {
                ValidateError::InvalidSchema(format!("tool '{tool}' schema does not compile: {e}"))
            })?;

        let failures: Vec<ValidationFailure> = validator
            .iter_errors(args)
            .map(|e| {
                let schema_path = e.schema_path.to_string();
                ValidationFailure {
                    path: e.instance_path.to_string(),
                    constraint: constraint_at(&strict, &schema_path),
                    message: e.to_string(),
                }
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ValidateError::Failed(failures))
        }
    }
}

/// Resolve the expected constraint for a schema-path like
/// `/properties/x/type`: the schema value when it is a plain string
/// ("integer"), otherwise the keyword itself ("required", "enum", …).
fn constraint_at(schema: &Value, schema_path: &str) -> String {
    let keyword = schema_path
        .rsplit('/')
        .next()
        .filter(|k| !k.is_empty())
        .unwrap_or("schema")
        .to_string();
    match schema.pointer(schema_path) {
        Some(Value::String(s)) => s.clone(),
        _ => keyword,
    }
}

/// Recursively inject `additionalProperties: false` into every object-shaped
/// schema level that does not declare it, descending through the standard
/// applicator keywords.
fn strictify(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };

    let mut out = Map::with_capacity(map.len() + 1);
    for (key, value) in map {
        let rewritten = match key.as_str() {
            // Maps of subschemas
            "properties" | "patternProperties" | "$defs" | "definitions" => match value {
                Value::Object(subs) => Value::Object(
                    subs.iter()
                        .map(|(name, sub)| (name.clone(), strictify(sub)))
                        .collect(),
                ),
                other => other.clone(),
            },
            // Single subschemas
            "items" | "additionalProperties" | "contains" | "propertyNames" | "if" | "then"
            | "else" | "not" => strictify(value),
            // Arrays of subschemas
            "allOf" | "anyOf" | "oneOf" | "prefixItems" => match value {
                Value::Array(subs) => Value::Array(subs.iter().map(strictify).collect()),
                other => other.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), rewritten);
    }

    if is_object_schema(&out) && !out.contains_key("additionalProperties") {
        out.insert("additionalProperties".to_string(), Value::Bool(false));
    }

    Value::Object(out)
}

fn is_object_schema(map: &Map<String, Value>) -> bool {
    if map.contains_key("properties") {
        return true;
    }
    match map.get("type") {
        Some(Value::String(t)) => t == "object",
        Some(Value::Array(ts)) => ts.iter().any(|t| t == "object"),
        _ => false,
    }
}
