use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Chapter, Guide, Section, DEFAULT_GUIDE_TITLE};

const EXTRACTED_REQUIREMENTS: &str = "Requirement extracted from guide";

static TITLE_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""title"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex"));
static DESCRIPTION_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""description"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex")
});
static CHAPTER_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:chapter|part|unit)\b").expect("valid regex"));

/// Salvages what it can from structuring output that no repair stage could
/// parse. `None` when no chapter-like title survives.
pub fn extract_partial_guide(text: &str) -> Option<Guide> {
    let titles: Vec<String> = TITLE_VALUE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape(m.as_str()))
        .collect();

    let title = titles
        .iter()
        .find(|t| !CHAPTER_LIKE.is_match(t) && !t.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_GUIDE_TITLE.to_string());

    let description = DESCRIPTION_VALUE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(m.as_str()))
        .filter(|d| !d.trim().is_empty());

    let chapters: Vec<Chapter> = titles
        .iter()
        .filter(|t| CHAPTER_LIKE.is_match(t))
        .enumerate()
        .map(|(idx, chapter_title)| {
            Chapter::new(
                chapter_title.trim(),
                vec![Section::new(
                    format!("Section {}.1", idx + 1),
                    EXTRACTED_REQUIREMENTS,
                )],
            )
        })
        .collect();

    tracing::debug!(
        recovered_chapters = chapters.len(),
        "partial guide extraction finished"
    );
    if chapters.is_empty() {
        return None;
    }

    Some(
        Guide {
            title,
            description,
            chapters,
        }
        .complete(),
    )
}

fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.to_string())
}
