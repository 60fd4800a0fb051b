//! Schema-constrained generation plumbing: the prompt preamble, tolerant
//! extraction of the first JSON value from a model reply, and the canonical
//! JSON form used when running consensus over structured values.

use serde_json::Value;

/// Augment a prompt so the model emits bare JSON matching `schema`.
pub fn schema_prompt(prompt: &str, schema: &Value) -> String {
    format!(
        "Respond with a single JSON value that conforms to the following JSON schema. \
         Output only the JSON value, with no surrounding prose and no code fences.\n\n\
         Schema:\n{schema}\n\n{prompt}"
    )
}

/// Locate the first complete JSON object or array in `text`.
///
/// Tolerates code fences and leading/trailing narration: scanning starts at
/// the first `{` or `[` and ends when the brackets balance, honoring string
/// literals and escapes.
pub fn extract_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the first JSON value found in `text`.
pub fn parse_first_json(text: &str) -> Result<Value, serde_json::Error> {
    match extract_json(text) {
        Some(slice) => serde_json::from_str(slice),
        // No bracketed value; let serde report on the raw text.
        None => serde_json::from_str(text.trim()),
    }
}

/// Render a value with object keys sorted recursively, so equal structures
/// always produce equal strings.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_from_code_fence() {
        let reply = "Here you go:\n```json\n{\"name\": \"Ada\"}\n```\nHope that helps!";
        assert_eq!(extract_json(reply), Some("{\"name\": \"Ada\"}"));
    }

    #[test]
    fn extracts_despite_narration() {
        let reply = "The answer is [1, 2, 3] as requested.";
        assert_eq!(extract_json(reply), Some("[1, 2, 3]"));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let reply = r#"{"text": "curly } inside", "n": 1}"#;
        assert_eq!(extract_json(reply), Some(reply));
        let value = parse_first_json(reply).unwrap();
        assert_eq!(value["n"], json!(1));
    }

    #[test]
    fn unbalanced_input_yields_none() {
        assert_eq!(extract_json("{\"open\": true"), None);
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn canonical_form_sorts_keys_recursively() {
        let a = json!({"b": {"y": 2, "x": 1}, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": {"x": 1, "y": 2}});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":[1,2],"b":{"x":1,"y":2}}"#);
    }

    #[test]
    fn schema_prompt_demands_bare_json() {
        let prompt = schema_prompt("List a user.", &json!({"type": "object"}));
        assert!(prompt.contains("no code fences"));
        assert!(prompt.contains("\"type\""));
        assert!(prompt.ends_with("List a user."));
    }
}
