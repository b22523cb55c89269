//! Provider quirks for the `json` call shape. This is the only place in the
//! crate that string-munges a model's raw output; every other caller sees a
//! clean `(object) -> object` contract through [`super::gateway::LlmGateway`].

use serde_json::Value;

/// Strip ```json fences (or bare ```) wrapping a model's response.
pub fn strip_markdown_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches('\n');
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Ensure the literal word "JSON" appears in a system message, since some
/// providers refuse JSON mode otherwise.
pub fn ensure_json_keyword(system_message: &str) -> String {
    if system_message.to_uppercase().contains("JSON") {
        system_message.to_string()
    } else {
        format!("{system_message}\n\nRespond with a single JSON object.")
    }
}

/// Hard clamp applied to every `json` gateway call.
pub fn clamp_max_tokens(requested: u64, ceiling: u64) -> u64 {
    requested.min(ceiling)
}

/// Coerce common shape drifts a small model's JSON output exhibits:
/// - a bare top-level array is wrapped as `{ <wrap_key>: [...] }`
/// - a scalar `duplicates` field is promoted to a singleton list
/// - string-encoded integers are coerced to numbers
/// - a missing `duplicate_idx` defaults to -1
pub fn coerce_shape(mut value: Value, wrap_key: &str) -> Value {
    if let Value::Array(_) = value {
        let mut wrapped = serde_json::Map::new();
        wrapped.insert(wrap_key.to_string(), value);
        return Value::Object(wrapped);
    }

    if let Value::Object(ref mut map) = value {
        if let Some(dups) = map.get("duplicates") {
            if !dups.is_array() {
                let singleton = Value::Array(vec![dups.clone()]);
                map.insert("duplicates".to_string(), singleton);
            }
        }

        coerce_string_ints(map);

        if !map.contains_key("duplicate_idx") {
            map.insert("duplicate_idx".to_string(), Value::from(-1));
        } else if let Some(Value::String(s)) = map.get("duplicate_idx").cloned() {
            if let Ok(n) = s.parse::<i64>() {
                map.insert("duplicate_idx".to_string(), Value::from(n));
            }
        }
    }

    value
}

fn coerce_string_ints(map: &mut serde_json::Map<String, Value>) {
    for (_, v) in map.iter_mut() {
        if let Value::String(s) = v {
            if let Ok(n) = s.parse::<i64>() {
                if s == &n.to_string() {
                    *v = Value::from(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence() {
        let raw = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn leaves_unfenced_output_alone() {
        assert_eq!(strip_markdown_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn adds_json_keyword_when_missing() {
        let sys = ensure_json_keyword("Extract entities.");
        assert!(sys.to_uppercase().contains("JSON"));
    }

    #[test]
    fn leaves_json_keyword_when_present() {
        let sys = ensure_json_keyword("Return JSON matching the schema.");
        assert_eq!(sys, "Return JSON matching the schema.");
    }

    #[test]
    fn clamps_max_tokens() {
        assert_eq!(clamp_max_tokens(8192, 4096), 4096);
        assert_eq!(clamp_max_tokens(100, 4096), 100);
    }

    #[test]
    fn wraps_bare_array() {
        let value = json!([{"name": "alice"}]);
        let wrapped = coerce_shape(value, "extracted_entities");
        assert_eq!(
            wrapped,
            json!({"extracted_entities": [{"name": "alice"}]})
        );
    }

    #[test]
    fn promotes_scalar_duplicates() {
        let value = json!({"duplicates": 3});
        let coerced = coerce_shape(value, "extracted_entities");
        assert_eq!(coerced["duplicates"], json!([3]));
    }

    #[test]
    fn defaults_missing_duplicate_idx() {
        let value = json!({"facts": []});
        let coerced = coerce_shape(value, "extracted_entities");
        assert_eq!(coerced["duplicate_idx"], json!(-1));
    }

    #[test]
    fn coerces_string_duplicate_idx() {
        let value = json!({"duplicate_idx": "2"});
        let coerced = coerce_shape(value, "extracted_entities");
        assert_eq!(coerced["duplicate_idx"], json!(2));
    }
}
