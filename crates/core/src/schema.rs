//! JSON Schema argument validation.
//!
//! Covers the subset tool schemas actually use: `type`, `properties`,
//! `required`, `items`, and `enum`. Unknown keywords are ignored rather
//! than rejected, so schemas written for richer validators still work.
//! Rejections happen before any execution environment is touched.

use serde_json::Value;

pub struct SchemaValidator;

impl SchemaValidator {
    /// Validate `value` against `schema`.
    ///
    /// Returns the first violation found, phrased for feeding back to the
    /// model. A missing, null, or empty schema accepts everything.
    pub fn validate(schema: &Value, value: &Value) -> std::result::Result<(), String> {
        match schema {
            Value::Null => Ok(()),
            Value::Object(map) if map.is_empty() => Ok(()),
            Value::Object(_) => validate_at(schema, value, ""),
            _ => Ok(()),
        }
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    if let Some(expected) = schema.get("type") {
        check_type(expected, value, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.iter().any(|v| v == value) {
            return Err(format!(
                "value {} at {} is not one of the allowed values",
                compact(value),
                display_path(path)
            ));
        }
    }

    if let Value::Object(obj) = value {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(format!(
                        "missing required property: {}",
                        join_path(path, name)
                    ));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in properties {
                if let Some(prop_value) = obj.get(name) {
                    validate_at(prop_schema, prop_value, &join_path(path, name))?;
                }
            }
        }
    }

    if let (Value::Array(elements), Some(items)) = (value, schema.get("items")) {
        for (i, element) in elements.iter().enumerate() {
            validate_at(items, element, &format!("{}[{}]", display_path(path), i))?;
        }
    }

    Ok(())
}

fn check_type(expected: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    let matches = match expected {
        Value::String(name) => type_matches(name, value),
        // "type": ["string", "null"] style unions
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| type_matches(name, value)),
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(format!(
            "expected {} at {}, got {}",
            type_name_of(expected),
            display_path(path),
            actual_type(value)
        ))
    }
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown type names do not reject
        _ => true,
    }
}

fn actual_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_name_of(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        _ => String::from("value"),
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "arguments" } else { path }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("?"))
}
