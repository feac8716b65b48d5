//! Helpers for pulling JSON out of free-form provider responses.

/// Find the first balanced `open`..`close` span in `text`, skipping
/// delimiters that appear inside JSON string literals.
fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + i + ch.len_utf8();
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract a JSON object from text that may contain other content.
pub fn extract_json_object(text: &str) -> Option<String> {
    extract_balanced(text, '{', '}')
}

/// Extract a JSON array from text that may contain other content.
pub fn extract_json_array(text: &str) -> Option<String> {
    extract_balanced(text, '[', ']')
}

/// Parse the first JSON value in `text`: the whole text if it parses,
/// otherwise whichever of an embedded object or array starts first.
pub fn extract_json_value(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let object_at = trimmed.find('{');
    let array_at = trimmed.find('[');
    let candidate = match (object_at, array_at) {
        (Some(o), Some(a)) if a < o => extract_json_array(trimmed),
        (Some(_), _) => extract_json_object(trimmed),
        (None, Some(_)) => extract_json_array(trimmed),
        (None, None) => None,
    }?;
    serde_json::from_str(&candidate).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"{"code": "fn main() { }", "note": "a \" quote }"} after"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"code": "fn main() { }", "note": "a \" quote }"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_array_from_code_fence() {
        let text = "```json\n[{\"title\": \"Intro\"}, {\"title\": \"Joins\"}]\n```";
        assert_eq!(
            extract_json_array(text),
            Some(r#"[{"title": "Intro"}, {"title": "Joins"}]"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_value_prefers_earliest_container() {
        let value = extract_json_value("Modules: [{\"title\": \"A\"}]").unwrap();
        assert!(value.is_array());

        let value = extract_json_value("Course: {\"items\": [1, 2]}").unwrap();
        assert!(value.is_object());
        assert_eq!(value["items"][1], 2);
    }

    #[test]
    fn test_extract_json_value_plain_string() {
        assert_eq!(
            extract_json_value("\"just text\"").unwrap(),
            serde_json::Value::String("just text".to_string())
        );
        assert!(extract_json_value("no json at all").is_none());
    }
}
