//! Repairs near-valid JSON emitted by the structuring model.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("valid regex"));
static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));

/// Runs the repair stages in order, re-parsing after each one. Returns the
/// first successful parse, or `None` when every stage still fails.
pub fn sanitize_json(raw: &str) -> Option<Value> {
    let stages: [fn(&str) -> String; 6] = [
        unwrap_fence,
        trim_to_object,
        strip_trailing_commas,
        quote_bare_keys,
        single_to_double_quotes,
        close_unbalanced,
    ];

    let mut text = raw.trim().to_string();
    if let Some(value) = parse(&text) {
        return Some(value);
    }

    for stage in stages {
        text = stage(&text);
        if let Some(value) = parse(&text) {
            return Some(value);
        }
    }

    None
}

fn parse(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|value| value.is_object())
}

fn unwrap_fence(text: &str) -> String {
    FENCED_JSON
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|body| body.as_str().trim().to_string())
        .unwrap_or_else(|| text.to_string())
}

fn trim_to_object(text: &str) -> String {
    let Some(start) = text.find('{') else {
        return text.to_string();
    };
    match text.rfind('}') {
        Some(end) if end > start => text[start..=end].to_string(),
        // truncated output: keep the tail so the last stage can close it
        _ => text[start..].to_string(),
    }
}

fn strip_trailing_commas(text: &str) -> String {
    TRAILING_COMMA.replace_all(text, "$1").into_owned()
}

/// Quotes identifiers that follow `{` or `,` and precede `:`. Text inside
/// single- or double-quoted strings is copied untouched.
fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        out.push(ch);
        i += 1;

        if let Some(open) = quote {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                _ if ch == open => quote = None,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' | ',' => {
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                let key_start = j;
                if j < chars.len() && (chars[j].is_ascii_alphabetic() || chars[j] == '_') {
                    while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                        j += 1;
                    }
                    let key_end = j;
                    while j < chars.len() && chars[j].is_whitespace() {
                        j += 1;
                    }
                    if j < chars.len() && chars[j] == ':' {
                        out.extend(&chars[i..key_start]);
                        out.push('"');
                        out.extend(&chars[key_start..key_end]);
                        out.push('"');
                        i = key_end;
                    }
                }
            }
            _ => {}
        }
    }

    out
}

fn single_to_double_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            // \' is not a valid JSON escape
            if in_single && ch == '\'' {
                out.pop();
            }
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_double || in_single => {
                out.push(ch);
                escaped = true;
            }
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push(ch);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(ch),
        }
    }

    out
}

fn close_unbalanced(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
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
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    if stack.is_empty() {
        return out;
    }

    let trimmed_len = out.trim_end().trim_end_matches(',').trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str("null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    strip_trailing_commas(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_json_passes_through() {
        let value = sanitize_json(r#"{"title": "Guide"}"#).unwrap();
        assert_eq!(value["title"], "Guide");
    }

    #[test]
    fn unwraps_fenced_block_with_prose_around_it() {
        let raw = "Here is the guide:\n```json\n{\"title\": \"Fenced\"}\n```\nHope it helps.";
        assert_eq!(sanitize_json(raw).unwrap()["title"], "Fenced");
    }

    #[test]
    fn repairs_trailing_commas_and_bare_keys() {
        let raw = "Sure! {title: \"Guide\", chapters: [{title: \"Chapter 1\", sections: [],},],}";
        let value = sanitize_json(raw).unwrap();
        assert_eq!(value["chapters"][0]["title"], "Chapter 1");
    }

    #[test]
    fn bare_key_repair_leaves_string_values_alone() {
        let raw = "{title: \"Guide\", chapters: [{title: \"Chapter 1\", sections: [{title: \"Scope\", requirements: \"Cover aims, scope: and limits\"}]}]}";
        let value = sanitize_json(raw).unwrap();
        assert_eq!(
            value["chapters"][0]["sections"][0]["requirements"],
            "Cover aims, scope: and limits"
        );

        let single = "{title: 'Notes, part: one', chapters: []}";
        assert_eq!(sanitize_json(single).unwrap()["title"], "Notes, part: one");
    }

    #[test]
    fn converts_single_quoted_strings() {
        let raw = "{'title': 'It\\'s a \"guide\"', 'chapters': []}";
        let value = sanitize_json(raw).unwrap();
        assert_eq!(value["title"], "It's a \"guide\"");
    }

    #[test]
    fn closes_truncated_output() {
        let raw = r#"{"title": "Cut", "chapters": [{"title": "Chapter 1", "sections": [{"title": "Intro", "requirements": "Write the intro"#;
        let value = sanitize_json(raw).unwrap();
        assert_eq!(
            value["chapters"][0]["sections"][0]["requirements"],
            "Write the intro"
        );
    }

    #[test]
    fn hopeless_input_returns_none() {
        assert!(sanitize_json("no structure at all").is_none());
        assert!(sanitize_json("").is_none());
        assert!(sanitize_json("[1, 2, 3]").is_none());
    }
}
