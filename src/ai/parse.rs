//! Lenient JSON parsing for model responses.
//!
//! Models asked for JSON still wrap it in prose or code fences often
//! enough that three strategies are tried in order: parse the raw text,
//! parse the contents of a code fence, parse the substring from the
//! first `{` to the last `}`. All three failing is not an error; the
//! caller substitutes its explicit empty record.

use serde_json::Value;

/// Parse model output into JSON, trying the three fallback strategies
/// in order. Returns `None` when nothing parses.
pub fn parse_lenient_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(fenced) = strip_code_fence(trimmed) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Some(value);
        }
    }

    let first = trimmed.find('{')?;
    let last = trimmed.rfind('}')?;
    if last > first {
        if let Ok(value) = serde_json::from_str(&trimmed[first..=last]) {
            return Some(value);
        }
    }

    None
}

/// Extract the body of the first fenced block, tolerating a language
/// tag after the opening fence.
fn strip_code_fence(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raw_json() {
        let value = parse_lenient_json(r#"{"trust_score": 0.9}"#).unwrap();
        assert_eq!(value["trust_score"], 0.9);
    }

    #[test]
    fn parses_fenced_json() {
        let text = "Here you go:\n```json\n{\"trust_score\": 0.8}\n```\nHope that helps!";
        let value = parse_lenient_json(text).unwrap();
        assert_eq!(value["trust_score"], 0.8);
    }

    #[test]
    fn parses_fence_without_language_tag() {
        let text = "```\n{\"relevance_score\": 0.4}\n```";
        let value = parse_lenient_json(text).unwrap();
        assert_eq!(value["relevance_score"], 0.4);
    }

    #[test]
    fn parses_braces_buried_in_prose() {
        let text = "The evaluation is {\"trust_score\": 0.7, \"reasoning\": \"OEM source\"} overall.";
        let value = parse_lenient_json(text).unwrap();
        assert_eq!(value["trust_score"], 0.7);
    }

    #[test]
    fn no_braces_is_none() {
        assert!(parse_lenient_json("I cannot evaluate this chunk.").is_none());
    }

    #[test]
    fn garbage_between_braces_is_none() {
        assert!(parse_lenient_json("{this is not json}").is_none());
    }
}
