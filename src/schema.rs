use serde_json::Value;

/// A deliberately small structural checker, not a full JSON Schema engine.
///
/// Supports the subset the compose engine actually needs to validate
/// registry-declared `inputSchema`/`outputSchema` documents: `type`,
/// `required` and `properties` (recursive, object schemas only). Anything
/// else present in the schema document is accepted without further checks.
pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !matches_type(value, expected) {
            return Err(format!(
                "expected type `{expected}`, got `{}`",
                type_name(value)
            ));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let obj = value.as_object();
        for key in required {
            let Some(key) = key.as_str() else { continue };
            let present = obj.map(|o| o.contains_key(key)).unwrap_or(false);
            if !present {
                return Err(format!("missing required property `{key}`"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        if let Some(obj) = value.as_object() {
            for (key, sub_schema) in properties {
                if let Some(sub_value) = obj.get(key) {
                    validate(sub_value, sub_schema)
                        .map_err(|err| format!("property `{key}`: {err}"))?;
                }
            }
        }
    }

    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
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

    #[test]
    fn accepts_matching_object() {
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        });
        assert!(validate(&json!({ "name": "a" }), &schema).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let schema = json!({ "type": "object", "required": ["name"] });
        assert!(validate(&json!({}), &schema).is_err());
    }

    #[test]
    fn rejects_wrong_type() {
        let schema = json!({ "type": "string" });
        assert!(validate(&json!(42), &schema).is_err());
    }

    #[test]
    fn ignores_unsupported_keywords() {
        let schema = json!({ "type": "number", "minimum": 10 });
        assert!(validate(&json!(1), &schema).is_ok());
    }
}
