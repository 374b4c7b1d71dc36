use once_cell::sync::Lazy;
use regex::Regex;

const MIN_CONTINUATION_LEN: usize = 10;

static MARKED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-\u{2022}*]|\d+[.)])\s+(.+)$").expect("valid regex")
});

/// Splits a planning answer into bullet points. Marked lines (`-`, `•`, `*`,
/// `1.`, `1)`) lose their marker; unmarked lines longer than ten characters
/// are kept whole. A message that yields nothing becomes a single bullet.
pub fn extract_bullets(message: &str) -> Vec<String> {
    let mut bullets: Vec<String> = message
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match MARKED_LINE.captures(line) {
            Some(caps) => caps.get(1).map(|m| m.as_str().trim().to_string()),
            None if line.chars().count() > MIN_CONTINUATION_LEN => Some(line.to_string()),
            None => None,
        })
        .collect();

    if bullets.is_empty() && !message.trim().is_empty() {
        bullets.push(message.trim().to_string());
    }

    bullets
}
