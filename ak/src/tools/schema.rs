//! Input validation against a tool's declared schema
//!
//! Supports the subset of JSON Schema the catalogue uses: an object with
//! `properties` (each carrying a primitive `type`) and a `required` list.

use serde_json::Value;

/// Validate `input` against a tool's `input_schema`
///
/// Checks that every required field is present and that provided fields
/// match their declared primitive type. Unknown fields pass through.
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), String> {
    let Some(obj) = input.as_object() else {
        return Err("arguments must be an object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if !obj.contains_key(name) {
                return Err(format!("missing required field: {}", name));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, value) in obj {
            let Some(declared) = properties.get(name) else { continue };
            let Some(expected) = declared.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "field {} expected type {}, got {}",
                    name,
                    expected,
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown declared types are not enforced
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

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "count": { "type": "integer" },
                "recursive": { "type": "boolean" }
            },
            "required": ["path"]
        })
    }

    #[test]
    fn test_valid_input() {
        let input = json!({"path": "a.txt", "count": 3, "recursive": true});
        assert!(validate_input(&schema(), &input).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let input = json!({"count": 3});
        let err = validate_input(&schema(), &input).unwrap_err();
        assert!(err.contains("missing required field: path"));
    }

    #[test]
    fn test_wrong_type() {
        let input = json!({"path": 42});
        let err = validate_input(&schema(), &input).unwrap_err();
        assert!(err.contains("expected type string"));
    }

    #[test]
    fn test_extra_fields_pass() {
        let input = json!({"path": "a.txt", "unknown": [1, 2]});
        assert!(validate_input(&schema(), &input).is_ok());
    }

    #[test]
    fn test_non_object_input_rejected() {
        let input = json!("just a string");
        assert!(validate_input(&schema(), &input).is_err());
    }

    #[test]
    fn test_number_accepts_float_integer_does_not() {
        let schema = json!({
            "properties": {
                "ratio": { "type": "number" },
                "count": { "type": "integer" }
            },
            "required": []
        });
        assert!(validate_input(&schema, &json!({"ratio": 0.5})).is_ok());
        assert!(validate_input(&schema, &json!({"count": 0.5})).is_err());
    }
}
