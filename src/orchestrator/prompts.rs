use crate::models::{Guide, IntakeData, SectionDescriptor};
use crate::references::Reference;

pub const OPENING_QUESTION: &str = "What is the title of your report? [TITLE]";

pub const INTAKE_FALLBACK: &str =
    "I'm sorry, I'm having trouble processing your request. Could you please try again?";

pub const INTAKE_HANDOFF: &str = "Thanks, I have what I need to get started. \
Let's plan your report one section at a time. Send any message when you're ready \
for the first section.";

pub const FORCE_HANDOFF: &str = "Understood, we'll skip the remaining intake questions. \
Send any message when you're ready to plan the first section.";

pub const FORCE_IGNORED: &str =
    "Intake is already complete, so there is nothing to skip. We'll continue from where we are.";

pub const ALL_SECTIONS_COMPLETE: &str =
    "All sections of your report are complete. You can review or save any of them.";

pub const DRAFT_RETRY: &str = "I'm sorry, I couldn't write the draft just now. \
Please send another message to try again.";

pub const SECTION_RESELECT: &str =
    "Let's pick the section to work on next. Send any message to continue.";

pub const REFLECTION_FALLBACK: &str =
    "Thank you for your reflections. Let's move on to the next section.";

pub const PERSISTENCE_FAILED: &str = "I'm sorry, I couldn't save your progress. \
Nothing was lost; please send your message again.";

pub const STORAGE_UNAVAILABLE: &str = "I'm sorry, I couldn't load your session just now. \
Please try again in a moment.";

pub const SESSION_NOT_FOUND: &str =
    "I couldn't find that session. Please upload your guide to start a new one.";

pub const TEMPERATURE: f32 = 0.7;

const INTAKE_TAGS: &str = "[TITLE], [DEPARTMENT], [ACADEMIC_LEVEL], [TARGET_AUDIENCE], \
[TOPIC], [LENGTH], [DEADLINE], [FORMAT], [CITATIONS], [ADDITIONAL_REQUIREMENTS], [NOTES]";

#[derive(Debug, Clone)]
pub struct SavedSection {
    pub title: String,
    pub content: String,
}

pub fn guide_outline(guide: &Guide) -> String {
    let mut out = format!("Guide: {}\n", guide.title);
    for (c, chapter) in guide.chapters.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", c + 1, chapter.title));
        for (s, section) in chapter.sections.iter().enumerate() {
            out.push_str(&format!("   {}.{} {}\n", c + 1, s + 1, section.title));
        }
    }
    out
}

fn intake_summary(intake: &IntakeData) -> String {
    if intake.is_empty() {
        return "Nothing collected yet.".to_string();
    }
    intake
        .iter()
        .map(|(field, value)| format!("- {field}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn section_brief(descriptor: &SectionDescriptor) -> String {
    let mut brief = format!(
        "Chapter: {}\nSection: {}\nRequirements:\n{}",
        descriptor.chapter_title,
        descriptor.section_title,
        descriptor.requirements.to_text()
    );
    for sub in &descriptor.subsections {
        brief.push_str(&format!("\nSubsection {}: {}", sub.title, sub.requirements.to_text()));
    }
    brief
}

fn saved_context(saved: &[SavedSection]) -> String {
    if saved.is_empty() {
        return "No sections have been written yet.".to_string();
    }
    saved
        .iter()
        .map(|s| format!("### {}\n{}", s.title, s.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn intake_system(guide: &Guide, intake: &IntakeData) -> String {
    format!(
        "You are helping a student prepare to write a report. Ask one short question at a \
         time to learn what they need. End every question with the tag of the field it asks \
         about, one of: {INTAKE_TAGS}. When you know enough to start planning, reply with a \
         brief summary followed by [INTAKE_COMPLETE].\n\n{}\nCollected so far:\n{}",
        guide_outline(guide),
        intake_summary(intake)
    )
}

pub fn planning_system(
    guide: &Guide,
    intake: &IntakeData,
    descriptor: &SectionDescriptor,
    saved: &[SavedSection],
) -> String {
    format!(
        "You are a writing coach. Introduce the next section of the report and ask the \
         student for the bullet points they want it to cover. Keep it short.\n\n{}\n\
         Report details:\n{}\n\nNext section:\n{}\n\nAlready written:\n{}",
        guide_outline(guide),
        intake_summary(intake),
        section_brief(descriptor),
        saved_context(saved)
    )
}

pub fn planning_fallback(descriptor: &SectionDescriptor) -> String {
    format!(
        "Next up is '{}' in '{}'.\n\nRequirements:\n{}\n\nWhat key points would you like \
         this section to cover? A short bullet list works best.",
        descriptor.section_title,
        descriptor.chapter_title,
        descriptor.requirements.to_text()
    )
}

pub fn bullets_captured(descriptor: &SectionDescriptor, count: usize) -> String {
    format!(
        "Great! I've captured your bullet points for the section '{}' ({count} in total). \
         Send any message and I'll write the draft.",
        descriptor.section_title
    )
}

pub fn draft_system(
    intake: &IntakeData,
    descriptor: &SectionDescriptor,
    bullets: &[String],
    saved: &[SavedSection],
    references: &[Reference],
) -> String {
    let mut prompt = format!(
        "You are writing one section of a student's report. Follow the requirements, cover \
         every bullet point, and match the tone of the sections already written.\n\n\
         Report details:\n{}\n\n{}\n\nBullet points:\n{}\n\nAlready written:\n{}",
        intake_summary(intake),
        section_brief(descriptor),
        bullets
            .iter()
            .map(|b| format!("- {b}"))
            .collect::<Vec<_>>()
            .join("\n"),
        saved_context(saved)
    );

    if !references.is_empty() {
        prompt.push_str(
            "\n\nSources (cite them inline as [Source N] where N is the source number):\n",
        );
        for (idx, reference) in references.iter().enumerate() {
            prompt.push_str(&format!(
                "[Source {}] {} ({})\n{}\n",
                idx + 1,
                reference.title,
                reference.source,
                reference.excerpt
            ));
        }
    }

    prompt
}

pub fn draft_request(descriptor: &SectionDescriptor) -> String {
    format!("Write the draft for '{}'.", descriptor.section_title)
}

pub fn draft_presented(descriptor: &SectionDescriptor, draft: &str) -> String {
    format!(
        "Here is a draft of '{}':\n\n{draft}\n\nHow does this read to you? Share your \
         reflections and I'll save the section.",
        descriptor.section_title
    )
}

pub fn reflection_system(descriptor: &SectionDescriptor, draft: &str) -> String {
    format!(
        "You are a writing coach. The student just reflected on a draft section. Thank them \
         and ask one or two short reflective questions they could keep in mind for the rest \
         of the report.\n\n{}\n\nDraft:\n{draft}",
        section_brief(descriptor)
    )
}

pub fn reflection_closing(remaining: Option<usize>) -> &'static str {
    match remaining {
        Some(0) => "Every section of your report is now complete.",
        _ => "Send any message when you're ready for the next section.",
    }
}
