//! Argument validation against a tool's declared input schema.
//!
//! This is a structural check on top-level fields only: required fields
//! present, declared types respected, and unknown fields rejected when the
//! schema closes itself with `additionalProperties: false`. Anything deeper
//! is left to the server.

use super::errors::SupervisorError;
use super::types::{QueryParameters, Tool};

/// Validate mapped arguments before they are sent to `tool`.
///
/// Tools that publish no schema (or a non-object one) accept anything.
pub fn validate_arguments(tool: &Tool, args: &QueryParameters) -> Result<(), SupervisorError> {
    let Some(schema) = tool.input_schema.as_ref().and_then(|s| s.as_object()) else {
        return Ok(());
    };

    let invalid = |reason: String| SupervisorError::InvalidArguments {
        tool: tool.name.clone(),
        reason,
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args.contains_key(field) {
                return Err(invalid(format!("missing required field: '{field}'")));
            }
        }
    }

    let properties = schema.get("properties").and_then(|p| p.as_object());
    let closed = schema.get("additionalProperties") == Some(&serde_json::Value::Bool(false));

    for (key, value) in args {
        let declared = properties.and_then(|p| p.get(key));

        let Some(declared) = declared else {
            if closed {
                return Err(invalid(format!("unknown field: '{key}'")));
            }
            continue;
        };

        let Some(expected) = declared.get("type") else {
            continue;
        };
        let allowed: Vec<&str> = match expected {
            serde_json::Value::String(t) => vec![t.as_str()],
            serde_json::Value::Array(ts) => ts.iter().filter_map(|t| t.as_str()).collect(),
            _ => continue,
        };
        if !allowed.iter().any(|t| matches_type(value, t)) {
            return Err(invalid(format!(
                "field '{key}' must be {}, got {}",
                allowed.join(" or "),
                json_type_name(value)
            )));
        }
    }

    Ok(())
}

fn matches_type(value: &serde_json::Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        // JSON Schema counts 3.0 as an integer.
        "integer" => value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to enforce.
        _ => true,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "number",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
