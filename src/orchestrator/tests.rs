use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::*;
use crate::models::{Chapter, Section};
use crate::references::{NoReferenceSearch, Reference};
use crate::store::MemoryStore;
use crate::test_support::{
    text, FailingMemory, FailingReferences, FixedReferences, ReadOnlyLedger, Reply,
    ScriptedGenerator,
};

fn two_chapter_guide() -> Guide {
    Guide {
        title: "Field Study".to_string(),
        description: None,
        chapters: vec![
            Chapter::new(
                "Introduction",
                vec![
                    Section::new("Background", "Explain the context"),
                    Section::new("Aims", "State the aims"),
                ],
            ),
            Chapter::new("Method", vec![Section::new("Sampling", "Describe sampling")]),
        ],
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<MemoryStore>,
    generator: Arc<ScriptedGenerator>,
    session: String,
}

async fn harness_with(
    guide: Guide,
    generator: ScriptedGenerator,
    references: Arc<dyn ReferenceSearch>,
) -> Harness {
    harness_wired(guide, generator, references, |collaborators, _| collaborators).await
}

/// Like `harness_with`, but lets a test swap individual collaborators.
async fn harness_wired(
    guide: Guide,
    generator: ScriptedGenerator,
    references: Arc<dyn ReferenceSearch>,
    wire: impl FnOnce(Collaborators, &Arc<MemoryStore>) -> Collaborators,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let generator = Arc::new(generator);
    let collaborators = wire(
        Collaborators::from_store(store.clone(), generator.clone(), references),
        &store,
    );
    let orchestrator = Orchestrator::new(collaborators, TokenConfig::default());
    let created = orchestrator.create_session(&guide, "hash").await.unwrap();
    Harness {
        orchestrator,
        store,
        generator,
        session: created.session_id,
    }
}

async fn harness(generator: ScriptedGenerator) -> Harness {
    harness_with(two_chapter_guide(), generator, Arc::new(NoReferenceSearch)).await
}

impl Harness {
    async fn turn(&self, message: &str) -> TurnOutcome {
        self.orchestrator
            .handle_turn(&self.session, message)
            .await
            .unwrap()
    }

    /// Runs intake to planning by answering the opening title question.
    async fn past_intake(&self) {
        let outcome = self.turn("Soil Moisture Report").await;
        assert_eq!(outcome.state.phase, Phase::Planning);
    }
}

#[tokio::test]
async fn create_session_opens_with_title_question() {
    let h = harness(ScriptedGenerator::new(vec![])).await;

    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Intake);
    assert_eq!(snapshot.current_section_id, None);
    assert_eq!(snapshot.sections_status.len(), 3);

    let seeded = h
        .store
        .query(&h.session, &MemoryQuery::tagged([TAG_INTAKE]))
        .await
        .unwrap();
    assert_eq!(seeded.len(), 1);
    assert_eq!(seeded[0].content, prompts::OPENING_QUESTION);
}

#[tokio::test]
async fn title_answer_is_attributed_and_moves_to_planning() {
    let h = harness(ScriptedGenerator::new(vec![]).with_fallback("What department? [DEPARTMENT]"))
        .await;

    let outcome = h.turn("Soil Moisture Report").await;
    assert_eq!(outcome.metadata.intake_field.as_deref(), Some("title"));
    assert_eq!(outcome.metadata.phase, Some(Phase::Planning));
    assert_eq!(outcome.state.current_section_id, None);
    assert_eq!(outcome.message, prompts::INTAKE_HANDOFF);

    let intake = h.store.intake(&h.session).await.unwrap();
    assert_eq!(intake.get("title"), Some("Soil Moisture Report"));
}

#[tokio::test]
async fn intake_follows_the_previous_question_tag() {
    let h = harness(ScriptedGenerator::new(vec![])).await;
    h.store
        .append(
            &h.session,
            Role::Assistant,
            "Which department is this for? [DEPARTMENT]",
            &[TAG_INTAKE.to_string()],
        )
        .await
        .unwrap();

    let outcome = h.turn("Geography").await;
    assert_eq!(outcome.metadata.intake_field.as_deref(), Some("department"));
    assert_eq!(outcome.state.phase, Phase::Intake);
    assert_eq!(outcome.message, prompts::INTAKE_FALLBACK);
}

#[tokio::test]
async fn model_completion_tag_ends_intake() {
    let h = harness(ScriptedGenerator::new(vec![text(
        "Great, that covers it. [INTAKE_COMPLETE]",
    )]))
    .await;
    h.store
        .append(
            &h.session,
            Role::Assistant,
            "Who is the audience? [TARGET_AUDIENCE]",
            &[TAG_INTAKE.to_string()],
        )
        .await
        .unwrap();

    let outcome = h.turn("First-year students").await;
    assert_eq!(outcome.state.phase, Phase::Planning);
    assert_eq!(outcome.message, "Great, that covers it.");
    assert_eq!(outcome.metadata.intake_field.as_deref(), Some("target_audience"));

    let request = h.generator.requests().pop().unwrap();
    assert_eq!(
        request.history.last().map(|turn| turn.content.as_str()),
        Some("First-year students")
    );
}

#[tokio::test]
async fn full_loop_saves_every_section_in_guide_order() {
    let h = harness(ScriptedGenerator::new(vec![]).with_fallback("Drafted text.")).await;
    h.past_intake().await;

    for expected in [SectionId::new(0, 0), SectionId::new(0, 1), SectionId::new(1, 0)] {
        let selected = h.turn("ready").await;
        assert_eq!(selected.state.phase, Phase::Planning);
        assert_eq!(selected.metadata.current_section_id, Some(expected));

        let planned = h.turn("- first idea\n- second idea").await;
        assert_eq!(planned.state.phase, Phase::Execution);
        assert_eq!(
            planned.metadata.bullet_points,
            Some(vec!["first idea".to_string(), "second idea".to_string()])
        );

        let drafted = h.turn("go ahead").await;
        assert_eq!(drafted.state.phase, Phase::Reflection);
        assert!(drafted.metadata.draft_generated);
        assert!(drafted.message.contains("Drafted text."));
        let record = h.store.record(&h.session, expected).await.unwrap().unwrap();
        assert_eq!(record.status, SectionStatus::Drafted);

        let reflected = h.turn("I like it").await;
        assert_eq!(reflected.state.phase, Phase::Planning);
        assert_eq!(reflected.state.current_section_id, None);
        assert!(reflected.metadata.section_completed);
        let record = h.store.record(&h.session, expected).await.unwrap().unwrap();
        assert_eq!(record.status, SectionStatus::Saved);
        assert!(record.saved_at.is_some());
    }

    let records = h.orchestrator.sections(&h.session).await.unwrap();
    assert!(records.iter().all(|r| r.status == SectionStatus::Saved));

    let done = h.turn("anything else?").await;
    assert!(done.metadata.all_sections_complete);
    assert_eq!(done.metadata.remaining_sections, Some(0));
    assert_eq!(done.message, prompts::ALL_SECTIONS_COMPLETE);
    assert_eq!(done.state.phase, Phase::Planning);
}

#[tokio::test]
async fn last_reflection_reports_completion() {
    let guide = Guide {
        title: "Short".to_string(),
        description: None,
        chapters: vec![Chapter::new("Only", vec![Section::new("One", "r")])],
    };
    let h = harness_with(
        guide,
        ScriptedGenerator::new(vec![]).with_fallback("Fine."),
        Arc::new(NoReferenceSearch),
    )
    .await;
    h.past_intake().await;
    h.turn("next").await;
    h.turn("- point").await;
    h.turn("draft").await;

    let reflected = h.turn("done").await;
    assert!(reflected.metadata.all_sections_complete);
    assert_eq!(reflected.metadata.remaining_sections, Some(0));
    assert!(reflected.message.ends_with(prompts::reflection_closing(Some(0))));
}

#[tokio::test]
async fn draft_prompt_carries_bullets_and_saved_sections() {
    let h = harness(ScriptedGenerator::new(vec![]).with_fallback("Body text.")).await;
    h.past_intake().await;
    for _ in 0..4 {
        h.turn("- soil sensors placed weekly").await;
    }
    h.turn("next").await;
    h.turn("- aims list").await;
    h.turn("draft").await;

    let requests = h.generator.requests();
    let last = requests.last().unwrap();
    assert!(last.system.contains("- aims list"));
    assert!(last.system.contains("### Background"));
    assert!(last.system.contains("Body text."));
}

#[tokio::test]
async fn references_are_cited_in_draft_prompt() {
    let references = FixedReferences(vec![Reference {
        source: "soil.md".to_string(),
        title: "Soil Handbook".to_string(),
        excerpt: "Moisture varies with depth.".to_string(),
        score: 1.0,
    }]);
    let h = harness_with(
        two_chapter_guide(),
        ScriptedGenerator::new(vec![]).with_fallback("Body."),
        Arc::new(references),
    )
    .await;
    h.past_intake().await;
    h.turn("next").await;
    h.turn("- depth").await;
    h.turn("draft").await;

    let last = h.generator.requests().pop().unwrap();
    assert!(last.system.contains("[Source 1] Soil Handbook"));
}

#[tokio::test]
async fn failing_reference_search_still_drafts() {
    let h = harness_with(
        two_chapter_guide(),
        ScriptedGenerator::new(vec![]).with_fallback("Body."),
        Arc::new(FailingReferences),
    )
    .await;
    h.past_intake().await;
    h.turn("next").await;
    h.turn("- depth").await;

    let drafted = h.turn("draft").await;
    assert_eq!(drafted.state.phase, Phase::Reflection);
    assert!(!h.generator.requests().last().unwrap().system.contains("[Source"));
}

#[tokio::test]
async fn generation_failure_keeps_execution() {
    let h = harness(ScriptedGenerator::new(vec![
        text("ok"),
        text("Tell me your points."),
        Reply::Error,
    ]))
    .await;
    h.past_intake().await;
    h.turn("next").await;
    h.turn("- point").await;

    let failed = h.turn("draft").await;
    assert_eq!(failed.state.phase, Phase::Execution);
    assert_eq!(failed.metadata.error.as_deref(), Some(ERROR_GENERATION_FAILED));
    assert_eq!(failed.message, prompts::DRAFT_RETRY);
    let record = h
        .store
        .record(&h.session, SectionId::new(0, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SectionStatus::Pending);
}

#[tokio::test]
async fn planning_falls_back_when_generator_fails() {
    let h = harness(ScriptedGenerator::new(vec![text("ok"), Reply::Error])).await;
    h.past_intake().await;

    let selected = h.turn("next").await;
    assert_eq!(selected.metadata.current_section_id, Some(SectionId::new(0, 0)));
    assert!(selected.message.contains("Background"));
    assert!(selected.message.contains("Explain the context"));
}

#[tokio::test]
async fn reflection_falls_back_when_generator_fails() {
    let h = harness(ScriptedGenerator::new(vec![
        text("ok"),
        text("points?"),
        text("Draft."),
        Reply::Error,
    ]))
    .await;
    h.past_intake().await;
    h.turn("next").await;
    h.turn("- point").await;
    h.turn("draft").await;

    let reflected = h.turn("thoughts").await;
    assert!(reflected.message.starts_with(prompts::REFLECTION_FALLBACK));
    assert_eq!(reflected.metadata.remaining_sections, Some(2));
}

#[tokio::test]
async fn force_complete_skips_intake() {
    let h = harness(ScriptedGenerator::new(vec![])).await;

    let outcome = h.turn(FORCE_COMPLETE_INTAKE).await;
    assert_eq!(outcome.state.phase, Phase::Planning);
    assert_eq!(outcome.message, prompts::FORCE_HANDOFF);
    assert!(h.generator.requests().is_empty());

    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Planning);
}

#[tokio::test]
async fn force_complete_outside_intake_changes_nothing() {
    let h = harness(ScriptedGenerator::new(vec![]).with_fallback("ok")).await;
    h.past_intake().await;
    h.turn("next").await;

    let outcome = h.turn(FORCE_COMPLETE_INTAKE).await;
    assert_eq!(outcome.message, prompts::FORCE_IGNORED);
    assert_eq!(outcome.state.phase, Phase::Planning);
    assert_eq!(outcome.state.current_section_id, Some(SectionId::new(0, 0)));
}

#[tokio::test]
async fn malformed_state_restarts_at_intake() {
    let h = harness(ScriptedGenerator::new(vec![]).with_fallback("Which topic? [TOPIC]")).await;
    h.store.put_raw_state(&h.session, "{not json").await.unwrap();

    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Intake);

    let inconsistent = format!(
        r#"{{"session_id":"{}","phase":"execution","current_section_id":null}}"#,
        h.session
    );
    h.store.put_raw_state(&h.session, &inconsistent).await.unwrap();
    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Intake);
}

#[tokio::test]
async fn unknown_session_is_reported() {
    let h = harness(ScriptedGenerator::new(vec![])).await;

    let outcome = h
        .orchestrator
        .handle_turn("no-such-session", "hello")
        .await
        .unwrap();
    assert_eq!(outcome.metadata.error.as_deref(), Some(ERROR_SESSION_NOT_FOUND));
    assert_eq!(outcome.message, prompts::SESSION_NOT_FOUND);
    assert!(h.orchestrator.snapshot("no-such-session").await.unwrap().is_none());
}

struct UnreadableStates;

#[async_trait]
impl StateStore for UnreadableStates {
    async fn load_state(&self, _session_id: &str) -> Result<Option<String>> {
        anyhow::bail!("database is locked")
    }

    async fn save_state(&self, _session_id: &str, _state: &OrchestratorState) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn unreadable_state_is_an_apology_not_an_error() {
    let h = harness_wired(
        two_chapter_guide(),
        ScriptedGenerator::new(vec![]),
        Arc::new(NoReferenceSearch),
        |collaborators, _| Collaborators {
            states: Arc::new(UnreadableStates),
            ..collaborators
        },
    )
    .await;

    let outcome = h.turn("Soil Moisture Report").await;
    assert_eq!(outcome.metadata.error.as_deref(), Some(ERROR_STORAGE_UNAVAILABLE));
    assert_eq!(outcome.message, prompts::STORAGE_UNAVAILABLE);
    assert_eq!(outcome.metadata.phase, Some(Phase::Intake));
    assert!(h.generator.requests().is_empty());

    let intake = h.store.intake(&h.session).await.unwrap();
    assert!(!intake.has_title());
}

struct UnwritableStates;

#[async_trait]
impl StateStore for UnwritableStates {
    async fn load_state(&self, _session_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn save_state(&self, _session_id: &str, _state: &OrchestratorState) -> Result<()> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn state_write_failure_keeps_previous_state() {
    let store = Arc::new(MemoryStore::new());
    let generator = Arc::new(ScriptedGenerator::new(vec![]).with_fallback("ok"));
    let collaborators = Collaborators {
        states: Arc::new(UnwritableStates),
        ..Collaborators::from_store(store.clone(), generator, Arc::new(NoReferenceSearch))
    };
    let orchestrator = Orchestrator::new(collaborators, TokenConfig::default());
    let session = orchestrator
        .create_session(&two_chapter_guide(), "hash")
        .await
        .unwrap()
        .session_id;

    let outcome = orchestrator
        .handle_turn(&session, "Soil Moisture Report")
        .await
        .unwrap();
    assert_eq!(outcome.metadata.error.as_deref(), Some(ERROR_PERSISTENCE_FAILED));
    assert_eq!(outcome.state.phase, Phase::Intake);
    assert_eq!(outcome.message, prompts::PERSISTENCE_FAILED);

    let forced = orchestrator
        .handle_turn(&session, FORCE_COMPLETE_INTAKE)
        .await
        .unwrap();
    assert_eq!(forced.metadata.error.as_deref(), Some(ERROR_PERSISTENCE_FAILED));
    assert_eq!(forced.state.phase, Phase::Intake);
}

#[tokio::test]
async fn save_section_marks_saved_and_rejects_unknown() {
    let h = harness(ScriptedGenerator::new(vec![])).await;

    let saved = h
        .orchestrator
        .save_section(&h.session, SectionId::new(1, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.status, SectionStatus::Saved);

    let missing = h
        .orchestrator
        .save_section(&h.session, SectionId::new(7, 0))
        .await
        .unwrap();
    assert!(missing.is_none());

    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.sections_status["1.0"], SectionStatus::Saved);
    assert_eq!(snapshot.sections_status["0.0"], SectionStatus::Pending);
}

#[tokio::test]
async fn section_missing_from_guide_is_reselected() {
    let h = harness(ScriptedGenerator::new(vec![])).await;

    for phase in ["planning", "execution", "reflection"] {
        let stale = format!(
            r#"{{"session_id":"{}","phase":"{}","current_section_id":"9.9"}}"#,
            h.session, phase
        );
        h.store.put_raw_state(&h.session, &stale).await.unwrap();

        let outcome = h.turn("- keep going").await;
        assert_eq!(outcome.state.phase, Phase::Planning, "from {phase}");
        assert_eq!(outcome.state.current_section_id, None, "from {phase}");
        assert_eq!(outcome.message, prompts::SECTION_RESELECT);
        assert!(outcome.metadata.error.is_none());
    }

    assert!(h.generator.requests().is_empty());
    let records = h.orchestrator.sections(&h.session).await.unwrap();
    assert!(records.iter().all(|r| r.status == SectionStatus::Pending));
    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Planning);
    assert_eq!(snapshot.current_section_id, None);
}

#[tokio::test]
async fn failing_memory_does_not_stop_the_loop() {
    let h = harness_wired(
        two_chapter_guide(),
        ScriptedGenerator::new(vec![]).with_fallback("Drafted text."),
        Arc::new(NoReferenceSearch),
        |collaborators, _| Collaborators {
            memory: Arc::new(FailingMemory),
            ..collaborators
        },
    )
    .await;

    // without memory the previous question is unknown
    let answered = h.turn("Soil Moisture Report").await;
    assert_eq!(answered.metadata.intake_field.as_deref(), Some("notes"));
    assert_eq!(answered.state.phase, Phase::Intake);
    h.turn(FORCE_COMPLETE_INTAKE).await;

    let selected = h.turn("next").await;
    assert_eq!(selected.metadata.current_section_id, Some(SectionId::new(0, 0)));
    let planned = h.turn("- first idea").await;
    assert_eq!(planned.state.phase, Phase::Execution);

    let drafted = h.turn("draft").await;
    assert!(drafted.metadata.draft_generated);
    assert!(drafted.metadata.error.is_none());
    let draft_request = h.generator.requests().pop().unwrap();
    assert!(!draft_request.system.contains("first idea"));

    let reflected = h.turn("looks good").await;
    assert!(reflected.metadata.section_completed);
    let record = h
        .store
        .record(&h.session, SectionId::new(0, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SectionStatus::Saved);
}

#[tokio::test]
async fn ledger_write_failure_keeps_previous_state() {
    let h = harness_wired(
        two_chapter_guide(),
        ScriptedGenerator::new(vec![]).with_fallback("Drafted text."),
        Arc::new(NoReferenceSearch),
        |collaborators, store| Collaborators {
            ledger: Arc::new(ReadOnlyLedger(store.clone())),
            ..collaborators
        },
    )
    .await;
    h.past_intake().await;
    h.turn("next").await;
    h.turn("- first idea").await;

    let drafted = h.turn("draft").await;
    assert_eq!(drafted.metadata.error.as_deref(), Some(ERROR_PERSISTENCE_FAILED));
    assert_eq!(drafted.message, prompts::PERSISTENCE_FAILED);
    assert_eq!(drafted.state.phase, Phase::Execution);
    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Execution);
    assert_eq!(snapshot.current_section_id, Some(SectionId::new(0, 0)));

    let reflecting = format!(
        r#"{{"session_id":"{}","phase":"reflection","current_section_id":"0.0"}}"#,
        h.session
    );
    h.store.put_raw_state(&h.session, &reflecting).await.unwrap();
    let reflected = h.turn("looks good").await;
    assert_eq!(reflected.metadata.error.as_deref(), Some(ERROR_PERSISTENCE_FAILED));
    assert_eq!(reflected.state.phase, Phase::Reflection);
    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Reflection);
    assert_eq!(snapshot.sections_status["0.0"], SectionStatus::Pending);
}

#[tokio::test]
async fn direct_title_update_completes_intake() {
    let h = harness(ScriptedGenerator::new(vec![])).await;

    let updated = h
        .orchestrator
        .update_intake(&h.session, " Department ", " Geography ")
        .await
        .unwrap()
        .unwrap();
    assert!(!updated.intake_done);
    assert_eq!(updated.intake.get("department"), Some("Geography"));
    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Intake);
    assert!(!snapshot.intake_done);

    let updated = h
        .orchestrator
        .update_intake(&h.session, "title", "Soil Moisture Report")
        .await
        .unwrap()
        .unwrap();
    assert!(updated.intake_done);
    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Planning);
    assert!(snapshot.intake_done);
    assert_eq!(snapshot.intake.get("title"), Some("Soil Moisture Report"));
    assert!(h.generator.requests().is_empty());
}

#[tokio::test]
async fn intake_update_leaves_later_phases_alone() {
    let h = harness(ScriptedGenerator::new(vec![]).with_fallback("ok")).await;
    h.past_intake().await;
    h.turn("next").await;
    h.turn("- point").await;

    let updated = h
        .orchestrator
        .update_intake(&h.session, "target_audience", "Examiners")
        .await
        .unwrap()
        .unwrap();
    assert!(updated.intake_done);
    let snapshot = h.orchestrator.snapshot(&h.session).await.unwrap().unwrap();
    assert_eq!(snapshot.phase, Phase::Execution);
    assert_eq!(snapshot.current_section_id, Some(SectionId::new(0, 0)));

    let missing = h
        .orchestrator
        .update_intake("no-such-session", "title", "x")
        .await
        .unwrap();
    assert!(missing.is_none());
}
