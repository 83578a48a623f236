//! Minimal JSON Schema validation
//!
//! Tool argument schemas use a neutral JSON Schema representation; this
//! validator covers the subset tools actually declare: `type`, `properties`,
//! `required`, `enum`, `items`, and numeric/string bounds. Anything outside
//! the subset is ignored rather than rejected, matching how providers treat
//! unknown keywords.

use serde_json::Value;

/// Validate `value` against `schema`, returning the first violation
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema_obj.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    return Err(format!("{path}: missing required property '{key}'"));
                }
            }
        }
        if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
            for (key, prop_schema) in properties {
                if let Some(prop_value) = object.get(key) {
                    validate_at(prop_schema, prop_value, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(item_schema) = schema_obj.get("items") {
            for (idx, item) in items.iter().enumerate() {
                validate_at(item_schema, item, &format!("{path}[{idx}]"))?;
            }
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64) {
            if number < min {
                return Err(format!("{path}: {number} below minimum {min}"));
            }
        }
        if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64) {
            if number > max {
                return Err(format!("{path}: {number} above maximum {max}"));
            }
        }
    }

    if let Some(s) = value.as_str() {
        if let Some(min) = schema_obj.get("minLength").and_then(Value::as_u64) {
            if (s.chars().count() as u64) < min {
                return Err(format!("{path}: string shorter than {min}"));
            }
        }
        if let Some(max) = schema_obj.get("maxLength").and_then(Value::as_u64) {
            if (s.chars().count() as u64) > max {
                return Err(format!("{path}: string longer than {max}"));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"},
            },
            "required": ["a", "b"],
        })
    }

    #[test]
    fn test_valid_arguments() {
        assert!(validate(&add_schema(), &json!({"a": 2, "b": 3})).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&add_schema(), &json!({"a": 2})).unwrap_err();
        assert!(err.contains("missing required property 'b'"));
    }

    #[test]
    fn test_wrong_type() {
        let err = validate(&add_schema(), &json!({"a": "two", "b": 3})).unwrap_err();
        assert!(err.contains("expected number"));
    }

    #[test]
    fn test_enum_and_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["fast", "slow"]},
                "tags": {"type": "array", "items": {"type": "string"}},
            },
        });
        assert!(validate(&schema, &json!({"mode": "fast", "tags": ["x"]})).is_ok());
        assert!(validate(&schema, &json!({"mode": "medium"})).is_err());
        assert!(validate(&schema, &json!({"tags": [1]})).is_err());
    }

    #[test]
    fn test_unknown_keywords_ignored() {
        let schema = json!({"type": "string", "format": "uri", "x-custom": true});
        assert!(validate(&schema, &json!("https://example.com")).is_ok());
    }
}
