use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_FIELD: &str = "notes";

static FIELD_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([A-Z_]+)\]").expect("valid regex"));

/// Control tags the intake prompt asks the model to end each question with.
const TAG_FIELDS: &[(&str, &str)] = &[
    ("TITLE", "title"),
    ("REPORT_TITLE", "title"),
    ("DEPARTMENT", "department"),
    ("ACADEMIC_LEVEL", "academic_level"),
    ("TARGET_AUDIENCE", "target_audience"),
    ("TOPIC", "topic"),
    ("LENGTH", "length"),
    ("DEADLINE", "deadline"),
    ("ADDITIONAL_REQUIREMENTS", "additional_requirements"),
    ("FORMAT", "format"),
    ("CITATIONS", "citations"),
    ("NOTES", "notes"),
];

// first match wins, so order matters
const KEYWORD_FIELDS: &[(&str, &[&str])] = &[
    ("title", &["title", "name", "heading"]),
    ("department", &["department", "faculty", "school", "discipline"]),
    ("academic_level", &["academic level", "level", "grade", "year"]),
    (
        "target_audience",
        &["audience", "readers", "who will read", "intended for"],
    ),
    ("topic", &["topic", "subject", "about", "focus"]),
    ("length", &["length", "pages", "words", "how long"]),
    ("deadline", &["deadline", "due date", "when is", "submit"]),
    ("format", &["format", "style", "structure", "organized"]),
    ("citations", &["citation", "reference", "sources", "bibliography"]),
    (
        "additional_requirements",
        &["requirements", "additional", "special", "specific"],
    ),
    (
        "notes",
        &["notes", "anything else", "other", "additional information"],
    ),
];

/// Decides which intake field an answer belongs to from the question that
/// prompted it. A `[FIELD]` tag wins over keywords; unknown tags and
/// unmatched questions land in `notes`.
pub fn infer_field(prior_question: Option<&str>) -> &'static str {
    let Some(question) = prior_question else {
        return DEFAULT_FIELD;
    };

    if let Some(tag) = FIELD_TAG
        .captures(question)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    {
        return TAG_FIELDS
            .iter()
            .find(|(known, _)| *known == tag)
            .map(|(_, field)| *field)
            .unwrap_or(DEFAULT_FIELD);
    }

    let lowered = question.to_lowercase();
    KEYWORD_FIELDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|(field, _)| *field)
        .unwrap_or(DEFAULT_FIELD)
}
