//! Line-oriented outline recovery for guides that arrive as plain text.
//!
//! Every non-empty line is classified as a heading at one of three depths or
//! as content. Content accumulates in a buffer that is flushed into the
//! deepest open level whenever a new heading starts.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Chapter, Guide, Requirements, Section, Subsection};

const MAX_HEADING_LEN: usize = 120;
const SHORT_LINE_LEN: usize = 60;
const BOOTSTRAP_WINDOW: usize = 5;

static MARKDOWN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*$").expect("valid regex"));
static NUMERIC_SUBSECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+\.?\s+\S").expect("valid regex"));
static NUMERIC_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.?\s+\S").expect("valid regex"));
static NUMERIC_CHAPTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)[.)]\s+\S").expect("valid regex"));
static KEYWORD_CHAPTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:chapter|part|unit)\s+(?:\d+|[ivxlc]+)\b").expect("valid regex")
});
static KEYWORD_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^section\s+\d+(?:\.\d+)*\b").expect("valid regex"));
static ROMAN_CHAPTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:XX|XIX|XVIII|XVII|XVI|XV|XIV|XIII|XII|XI|X|IX|VIII|VII|VI|V|IV|III|II|I)\.\s+\S")
        .expect("valid regex")
});
static LETTERED_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][.)]\s+\S").expect("valid regex"));
static LETTERED_SUBSECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z][.)]|\((?:[ivx]+|[a-z])\))\s+\S").expect("valid regex")
});
static BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-\u{2022}*+]\s+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineKind {
    GuideTitle(String),
    Chapter(String, ChapterStyle),
    Section(String),
    Subsection(String),
    Content,
}

/// How the currently open chapter was recognised. Numeric `N.` chapters are
/// only accepted while the outline itself is numbered, so numbered
/// requirement lists under other heading styles stay content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChapterStyle {
    Numbered(u64),
    Other,
}

#[derive(Default)]
struct OutlineBuilder {
    title: Option<String>,
    description: Vec<String>,
    chapters: Vec<Chapter>,
    chapter_style: Option<ChapterStyle>,
    section_open: bool,
    subsection_open: bool,
    buffer: Vec<String>,
    // number of the last `N.` line kept as content, for list continuation
    numbered_item: Option<u64>,
}

/// Parses free text into a complete guide. Never fails: input with no
/// recognisable chapter yields the default single-chapter outline.
pub fn parse_outline(text: &str) -> Guide {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let mut builder = OutlineBuilder::default();
    for (idx, line) in lines.iter().enumerate() {
        let kind = builder.classify(line, idx, lines.len());
        builder.apply(kind, line);
    }

    builder.finish()
}

impl OutlineBuilder {
    fn classify(&self, line: &str, idx: usize, total: usize) -> LineKind {
        if let Some(kind) = self.strong_heading(line) {
            return kind;
        }
        if BULLET.is_match(line) {
            return LineKind::Content;
        }
        if let Some(kind) = self.weak_heading(line) {
            return kind;
        }
        if idx == 0 && total > 1 && is_short(line) && self.title.is_none() {
            return LineKind::GuideTitle(line.to_string());
        }
        if idx < BOOTSTRAP_WINDOW
            && self.chapters.is_empty()
            && is_short(line)
            && !ends_like_sentence(line)
        {
            return LineKind::Chapter(line.to_string(), ChapterStyle::Other);
        }
        LineKind::Content
    }

    fn strong_heading(&self, line: &str) -> Option<LineKind> {
        if let Some(caps) = MARKDOWN.captures(line) {
            let depth = caps.get(1).map_or(1, |m| m.as_str().len());
            let title = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            return Some(match depth {
                1 if self.chapters.is_empty() && self.title.is_none() => {
                    LineKind::GuideTitle(title)
                }
                1 | 2 => LineKind::Chapter(title, ChapterStyle::Other),
                3 => LineKind::Section(title),
                _ => LineKind::Subsection(title),
            });
        }

        if line.len() > MAX_HEADING_LEN {
            return None;
        }

        if NUMERIC_SUBSECTION.is_match(line) {
            return Some(LineKind::Subsection(line.to_string()));
        }
        if NUMERIC_SECTION.is_match(line) {
            return Some(LineKind::Section(line.to_string()));
        }
        if let Some(number) = NUMERIC_CHAPTER
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            return Some(if self.accepts_numbered_chapter(number) {
                LineKind::Chapter(line.to_string(), ChapterStyle::Numbered(number))
            } else {
                LineKind::Content
            });
        }

        if KEYWORD_CHAPTER.is_match(line) || ROMAN_CHAPTER.is_match(line) {
            return Some(LineKind::Chapter(line.to_string(), ChapterStyle::Other));
        }
        if KEYWORD_SECTION.is_match(line) {
            return Some(LineKind::Section(line.to_string()));
        }

        None
    }

    fn weak_heading(&self, line: &str) -> Option<LineKind> {
        if is_all_caps(line) {
            return Some(LineKind::Chapter(line.to_string(), ChapterStyle::Other));
        }
        if line.len() > MAX_HEADING_LEN {
            return None;
        }
        if LETTERED_SECTION.is_match(line) {
            return Some(LineKind::Section(line.to_string()));
        }
        if LETTERED_SUBSECTION.is_match(line) {
            return Some(LineKind::Subsection(line.to_string()));
        }
        None
    }

    fn accepts_numbered_chapter(&self, number: u64) -> bool {
        if self.numbered_item.is_some_and(|prev| number == prev + 1) {
            return false;
        }
        match self.chapter_style {
            None => true,
            Some(ChapterStyle::Numbered(open)) => number > open,
            Some(ChapterStyle::Other) => false,
        }
    }

    fn apply(&mut self, kind: LineKind, line: &str) {
        match kind {
            LineKind::Content => {
                self.numbered_item = NUMERIC_CHAPTER
                    .captures(line)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse().ok());
                self.buffer.push(line.to_string());
                return;
            }
            LineKind::GuideTitle(title) => {
                self.flush();
                self.title = Some(title);
            }
            LineKind::Chapter(title, style) => self.open_chapter(title, style),
            LineKind::Section(title) => self.open_section(title),
            LineKind::Subsection(title) => self.open_subsection(title),
        }
        self.numbered_item = None;
    }

    fn open_chapter(&mut self, title: String, style: ChapterStyle) {
        self.flush();
        self.chapters.push(Chapter::new(title, vec![]));
        self.chapter_style = Some(style);
        self.section_open = false;
        self.subsection_open = false;
    }

    fn open_section(&mut self, title: String) {
        self.flush();
        if self.chapters.is_empty() {
            let implicit = format!("Chapter {}", self.chapters.len() + 1);
            self.open_chapter(implicit, ChapterStyle::Other);
        }
        if let Some(chapter) = self.chapters.last_mut() {
            chapter.sections.push(Section::new(title, String::new()));
        }
        self.section_open = true;
        self.subsection_open = false;
    }

    fn open_subsection(&mut self, title: String) {
        if !self.section_open {
            self.open_section(title);
            return;
        }
        self.flush();
        if let Some(section) = self
            .chapters
            .last_mut()
            .and_then(|chapter| chapter.sections.last_mut())
        {
            section.subsections.get_or_insert_with(Vec::new).push(Subsection {
                title,
                requirements: Requirements::default(),
            });
        }
        self.subsection_open = true;
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let text = self.buffer.join("\n");
        self.buffer.clear();

        let section_open = self.section_open;
        let subsection_open = self.subsection_open;
        match self.chapters.last_mut() {
            None => self.description.push(text),
            Some(chapter) if !section_open => {
                let description = chapter.description.get_or_insert_with(String::new);
                append_text(description, &text);
            }
            Some(chapter) => {
                let Some(section) = chapter.sections.last_mut() else {
                    return;
                };
                let open_subsection = section
                    .subsections
                    .as_mut()
                    .and_then(|subs| subs.last_mut())
                    .filter(|_| subsection_open);
                match open_subsection {
                    Some(sub) => append_requirements(&mut sub.requirements, &text),
                    None => append_requirements(&mut section.requirements, &text),
                }
            }
        }
    }

    fn finish(mut self) -> Guide {
        self.flush();
        let description = Some(self.description.join("\n")).filter(|d| !d.trim().is_empty());
        if self.chapters.is_empty() {
            tracing::debug!("heuristic outline found no chapters; using default outline");
        }
        Guide {
            title: self.title.unwrap_or_default(),
            description,
            chapters: self.chapters,
        }
        .complete()
    }
}

fn append_requirements(requirements: &mut Requirements, text: &str) {
    match requirements {
        Requirements::Text(existing) => append_text(existing, text),
        Requirements::List(items) => items.push(text.to_string()),
    }
}

fn append_text(existing: &mut String, text: &str) {
    if !existing.is_empty() {
        existing.push('\n');
    }
    existing.push_str(text);
}

fn is_short(line: &str) -> bool {
    line.chars().count() <= SHORT_LINE_LEN
}

fn ends_like_sentence(line: &str) -> bool {
    line.ends_with(['.', '!', '?', ',', ';', ':'])
}

fn is_all_caps(line: &str) -> bool {
    let letters = line.chars().filter(|c| c.is_alphabetic()).count();
    letters >= 2
        && is_short(line)
        && !line.chars().any(char::is_lowercase)
        && !ends_like_sentence(line)
}
