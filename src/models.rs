use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_GUIDE_TITLE: &str = "Report Guide";
pub const PLACEHOLDER_REQUIREMENTS: &str = "Requirements should be added manually";

/// Section requirements as they appear in a guide: either free text or a list
/// of items. Deserialization is lenient so model output with mixed scalars or
/// `null` still produces a guide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Requirements {
    Text(String),
    List(Vec<String>),
}

impl Requirements {
    pub fn is_empty(&self) -> bool {
        match self {
            Requirements::Text(text) => text.trim().is_empty(),
            Requirements::List(items) => items.iter().all(|item| item.trim().is_empty()),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Requirements::Text(text) => text.trim().to_string(),
            Requirements::List(items) => items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .map(|item| format!("- {item}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl Default for Requirements {
    fn default() -> Self {
        Requirements::Text(String::new())
    }
}

impl From<serde_json::Value> for Requirements {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Requirements::default(),
            serde_json::Value::String(text) => Requirements::Text(text),
            serde_json::Value::Array(items) => Requirements::List(
                items
                    .into_iter()
                    .filter(|item| !item.is_null())
                    .map(|item| match item {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => Requirements::Text(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Requirements {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Requirements::from(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub requirements: Requirements,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsections: Option<Vec<Subsection>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

/// Canonical outline of the report a session is writing.
///
/// A guide produced by [`Guide::complete`] always has at least one chapter and
/// every chapter has at least one section; section ids index into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guide {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub chapters: Vec<Chapter>,
}

impl Section {
    pub fn new(title: impl Into<String>, requirements: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            requirements: Requirements::Text(requirements.into()),
            subsections: None,
        }
    }
}

impl Chapter {
    pub fn new(title: impl Into<String>, sections: Vec<Section>) -> Self {
        Self {
            title: title.into(),
            description: None,
            sections,
        }
    }
}

impl Guide {
    /// The default one-chapter, one-section outline used whenever nothing
    /// usable could be recovered from the input.
    pub fn placeholder() -> Self {
        Self {
            title: DEFAULT_GUIDE_TITLE.to_string(),
            description: None,
            chapters: vec![placeholder_chapter(0)],
        }
    }

    /// Completeness post-pass: fills empty titles, gives section-less chapters
    /// a placeholder section, and collapses single-subsection sections whose
    /// own requirements are empty.
    pub fn complete(mut self) -> Self {
        if self.title.trim().is_empty() {
            self.title = DEFAULT_GUIDE_TITLE.to_string();
        }
        self.description = self.description.filter(|d| !d.trim().is_empty());

        if self.chapters.is_empty() {
            self.chapters.push(placeholder_chapter(0));
        }

        for (chapter_idx, chapter) in self.chapters.iter_mut().enumerate() {
            if chapter.title.trim().is_empty() {
                chapter.title = format!("Chapter {}", chapter_idx + 1);
            }
            chapter.description = chapter.description.take().filter(|d| !d.trim().is_empty());

            if chapter.sections.is_empty() {
                let requirements = chapter
                    .description
                    .clone()
                    .unwrap_or_else(|| PLACEHOLDER_REQUIREMENTS.to_string());
                chapter.sections.push(Section::new(
                    format!("Section {}.1", chapter_idx + 1),
                    requirements,
                ));
            }

            for (section_idx, section) in chapter.sections.iter_mut().enumerate() {
                if section.title.trim().is_empty() {
                    section.title = format!("Section {}.{}", chapter_idx + 1, section_idx + 1);
                }
                collapse_single_subsection(section);
            }
        }

        self
    }

    pub fn section_count(&self) -> usize {
        self.chapters.iter().map(|c| c.sections.len()).sum()
    }

    /// Every section id in chapter-then-section order.
    pub fn section_ids(&self) -> Vec<SectionId> {
        self.chapters
            .iter()
            .enumerate()
            .flat_map(|(chapter, c)| {
                (0..c.sections.len()).map(move |section| SectionId::new(chapter, section))
            })
            .collect()
    }

    /// Resolves a section id against the guide. Out-of-range ids produce a
    /// descriptor flagged as a placeholder instead of an error.
    pub fn section_descriptor(&self, id: &SectionId) -> SectionDescriptor {
        let found = self.chapters.get(id.chapter).and_then(|chapter| {
            chapter
                .sections
                .get(id.section)
                .map(|section| (chapter, section))
        });

        match found {
            Some((chapter, section)) => SectionDescriptor {
                section_id: *id,
                chapter_title: chapter.title.clone(),
                section_title: section.title.clone(),
                requirements: section.requirements.clone(),
                subsections: section.subsections.clone().unwrap_or_default(),
                is_placeholder: false,
            },
            None => {
                tracing::warn!("section {} is not present in the guide", id);
                SectionDescriptor {
                    section_id: *id,
                    chapter_title: "Unknown Chapter".to_string(),
                    section_title: "Unknown Section".to_string(),
                    requirements: Requirements::Text("No description available.".to_string()),
                    subsections: vec![],
                    is_placeholder: true,
                }
            }
        }
    }
}

fn placeholder_chapter(chapter_idx: usize) -> Chapter {
    Chapter::new(
        format!("Chapter {}", chapter_idx + 1),
        vec![Section::new(
            format!("Section {}.1", chapter_idx + 1),
            PLACEHOLDER_REQUIREMENTS,
        )],
    )
}

fn collapse_single_subsection(section: &mut Section) {
    let Some(subsections) = section.subsections.take() else {
        return;
    };
    if subsections.is_empty() {
        return;
    }
    if subsections.len() == 1 && section.requirements.is_empty() {
        if let Some(only) = subsections.into_iter().next() {
            section.requirements = only.requirements;
        }
        return;
    }
    section.subsections = Some(subsections);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionDescriptor {
    pub section_id: SectionId,
    pub chapter_title: String,
    pub section_title: String,
    pub requirements: Requirements,
    pub subsections: Vec<Subsection>,
    pub is_placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SectionIdError {
    #[error("section id `{0}` is not of the form chapter.section")]
    Malformed(String),
}

/// `"chapter.section"` with both indices zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SectionId {
    pub chapter: usize,
    pub section: usize,
}

impl SectionId {
    pub fn new(chapter: usize, section: usize) -> Self {
        Self { chapter, section }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.chapter, self.section)
    }
}

impl FromStr for SectionId {
    type Err = SectionIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || SectionIdError::Malformed(value.to_string());
        let (chapter, section) = value.trim().split_once('.').ok_or_else(malformed)?;
        let parse = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            part.parse::<usize>().map_err(|_| malformed())
        };
        Ok(Self::new(parse(chapter)?, parse(section)?))
    }
}

impl TryFrom<String> for SectionId {
    type Error = SectionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SectionId> for String {
    fn from(value: SectionId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Pending,
    Drafted,
    Saved,
}

impl SectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionStatus::Pending => "pending",
            SectionStatus::Drafted => "drafted",
            SectionStatus::Saved => "saved",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "drafted" => SectionStatus::Drafted,
            "saved" => SectionStatus::Saved,
            _ => SectionStatus::Pending,
        }
    }

    /// Status never regresses: requesting a lower status keeps the current one.
    pub fn advance(self, target: SectionStatus) -> SectionStatus {
        self.max(target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionRecord {
    pub session_id: String,
    pub chapter_idx: usize,
    pub section_idx: usize,
    pub status: SectionStatus,
    pub draft_content: Option<String>,
    pub saved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SectionRecord {
    pub fn pending(session_id: &str, id: SectionId) -> Self {
        Self {
            session_id: session_id.to_string(),
            chapter_idx: id.chapter,
            section_idx: id.section,
            status: SectionStatus::Pending,
            draft_content: None,
            saved_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> SectionId {
        SectionId::new(self.chapter_idx, self.section_idx)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Planning,
    Execution,
    Reflection,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Planning => "planning",
            Phase::Execution => "execution",
            Phase::Reflection => "reflection",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorState {
    pub session_id: String,
    pub phase: Phase,
    pub current_section_id: Option<SectionId>,
}

impl OrchestratorState {
    pub fn fresh(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            phase: Phase::Intake,
            current_section_id: None,
        }
    }

    /// Intake never carries a section; Execution and Reflection always do.
    pub fn is_consistent(&self) -> bool {
        match self.phase {
            Phase::Intake => self.current_section_id.is_none(),
            Phase::Planning => true,
            Phase::Execution | Phase::Reflection => self.current_section_id.is_some(),
        }
    }
}

/// Requirement fields gathered during intake. Only ever extended.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct IntakeData(BTreeMap<String, String>);

impl IntakeData {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn has_title(&self) -> bool {
        self.get("title").is_some_and(|title| !title.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnMetadata {
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_section_id: Option<SectionId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub draft_generated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub section_completed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub all_sections_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bullet_points: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_sections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub message: String,
    pub metadata: TurnMetadata,
    #[serde(skip)]
    pub state: OrchestratorState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSectionRequest {
    pub chapter_idx: usize,
    pub section_idx: usize,
}

/// Sets one intake field directly, outside the chat loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeUpdateRequest {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeUpdated {
    pub intake_done: bool,
    pub intake: IntakeData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub guide: Guide,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub guide: Guide,
    pub intake: IntakeData,
    pub intake_done: bool,
    pub phase: Phase,
    pub current_section_id: Option<SectionId>,
    pub sections_status: BTreeMap<String, SectionStatus>,
    pub created_at: Option<DateTime<Utc>>,
}
