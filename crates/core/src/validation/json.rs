//! Depth-bounded JSON parsing for payloads arriving over the local channel.

use serde_json::Value;

use super::ValidationError;

/// Default nesting limit for [`parse_json_safely`].
pub const DEFAULT_MAX_JSON_DEPTH: usize = 10;

/// Parse `text` as JSON after checking its nesting depth.
///
/// Brackets and braces are counted outside of string literals, and parsing
/// is never attempted once the depth exceeds `max_depth`.
pub fn parse_json_safely(text: &str, max_depth: usize) -> Result<Value, ValidationError> {
    check_depth(text, max_depth)?;
    serde_json::from_str(text).map_err(|e| ValidationError::InvalidJson(e.to_string()))
}

fn check_depth(text: &str, max_depth: usize) -> Result<(), ValidationError> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' | '[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(ValidationError::JsonTooDeep { max: max_depth });
                }
            }
            '}' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn nesting_beyond_limit_is_rejected() {
        let text = r#"{"a":{"b":{"c":1}}}"#;
        assert_matches!(
            parse_json_safely(text, 2),
            Err(ValidationError::JsonTooDeep { max: 2 })
        );
        let value = parse_json_safely(text, 5).unwrap();
        assert_eq!(value, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn brackets_inside_strings_do_not_count() {
        let text = r#"{"label":"[[[{{{\"}}}","n":1}"#;
        let value = parse_json_safely(text, 1).unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn arrays_count_towards_depth() {
        assert!(parse_json_safely("[[[1]]]", 3).is_ok());
        assert!(parse_json_safely("[[[1]]]", 2).is_err());
    }

    #[test]
    fn malformed_json_is_reported() {
        assert_matches!(
            parse_json_safely("{\"a\":", DEFAULT_MAX_JSON_DEPTH),
            Err(ValidationError::InvalidJson(_))
        );
    }
}
