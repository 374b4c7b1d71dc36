//! Phase orchestrator: the persisted state machine behind every chat turn.
//!
//! A turn loads the session's guide, intake answers and orchestrator state,
//! runs the handler for the current [`Phase`], and persists the state the
//! handler returns. Nothing is cached between turns; callers serialize turns
//! per session.

pub mod bullets;
pub mod fields;
pub mod prompts;

mod execution;
mod intake;
mod planning;
mod reflection;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::TokenConfig;
use crate::llm::{Generated, GenerationRequest, ResponseGenerator, Role};
use crate::memory::{ContextMemory, MemoryQuery, TAG_INTAKE};
use crate::models::{
    Guide, IntakeData, IntakeUpdated, OrchestratorState, Phase, SectionId, SectionRecord,
    SectionStatus, SessionCreated, SessionSnapshot, TurnMetadata, TurnOutcome,
};
use crate::references::ReferenceSearch;
use crate::store::{SectionLedger, SessionStore, StateStore};

pub use bullets::extract_bullets;
pub use fields::infer_field;

use prompts::SavedSection;

/// Typed by the user (or a UI button) to leave intake early.
pub const FORCE_COMPLETE_INTAKE: &str = "force-complete-intake";

pub const ERROR_SESSION_NOT_FOUND: &str = "session_not_found";
pub const ERROR_PERSISTENCE_FAILED: &str = "persistence_failed";
pub const ERROR_STORAGE_UNAVAILABLE: &str = "storage_unavailable";
pub const ERROR_GENERATION_FAILED: &str = "generation_failed";

#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn SectionLedger>,
    pub states: Arc<dyn StateStore>,
    pub memory: Arc<dyn ContextMemory>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub references: Arc<dyn ReferenceSearch>,
}

impl Collaborators {
    /// Wires every storage seam to one backend.
    pub fn from_store<S>(
        store: Arc<S>,
        generator: Arc<dyn ResponseGenerator>,
        references: Arc<dyn ReferenceSearch>,
    ) -> Self
    where
        S: SessionStore + SectionLedger + StateStore + ContextMemory + 'static,
    {
        Self {
            sessions: store.clone(),
            ledger: store.clone(),
            states: store.clone(),
            memory: store,
            generator,
            references,
        }
    }
}

/// Everything a phase handler may touch during one turn.
pub struct TurnContext<'a> {
    pub session_id: &'a str,
    pub guide: &'a Guide,
    pub intake: &'a IntakeData,
    pub collaborators: &'a Collaborators,
    pub tokens: &'a TokenConfig,
}

pub struct PhaseResult {
    pub message: String,
    pub state: OrchestratorState,
    pub metadata: TurnMetadata,
}

/// One implementation per [`Phase`]. An `Err` means a persistence write
/// failed; collaborator failures are absorbed inside the handler.
#[async_trait]
trait PhaseHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &TurnContext<'_>,
        state: OrchestratorState,
        message: &str,
    ) -> Result<PhaseResult>;
}

fn handler_for(phase: Phase) -> &'static dyn PhaseHandler {
    match phase {
        Phase::Intake => &intake::IntakeHandler,
        Phase::Planning => &planning::PlanningHandler,
        Phase::Execution => &execution::ExecutionHandler,
        Phase::Reflection => &reflection::ReflectionHandler,
    }
}

pub struct Orchestrator {
    collaborators: Collaborators,
    tokens: TokenConfig,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, tokens: TokenConfig) -> Self {
        Self {
            collaborators,
            tokens,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Stores a normalized guide as a new session and seeds the opening
    /// intake question into memory.
    pub async fn create_session(&self, guide: &Guide, source_hash: &str) -> Result<SessionCreated> {
        let session_id = self
            .collaborators
            .sessions
            .create_session(guide, source_hash)
            .await
            .context("failed to create session")?;

        if let Err(err) = self
            .collaborators
            .memory
            .append(
                &session_id,
                Role::Assistant,
                prompts::OPENING_QUESTION,
                &[TAG_INTAKE.to_string()],
            )
            .await
        {
            tracing::warn!(session = %session_id, "failed to seed opening question: {err:#}");
        }

        tracing::info!(
            session = %session_id,
            sections = guide.section_count(),
            "session created"
        );
        Ok(SessionCreated {
            session_id,
            guide: guide.clone(),
            message: prompts::OPENING_QUESTION.to_string(),
        })
    }

    pub fn opening_message(&self) -> &'static str {
        prompts::OPENING_QUESTION
    }

    /// Runs one chat turn. Storage failures come back as an apology outcome
    /// with `metadata.error` set rather than as `Err`.
    pub async fn handle_turn(&self, session_id: &str, message: &str) -> Result<TurnOutcome> {
        let (guide, intake, state) = match self.load_turn_inputs(session_id).await {
            Ok(Some(inputs)) => inputs,
            Ok(None) => {
                tracing::warn!(session = %session_id, "turn for unknown session");
                return Ok(apology(
                    OrchestratorState::fresh(session_id),
                    prompts::SESSION_NOT_FOUND,
                    ERROR_SESSION_NOT_FOUND,
                ));
            }
            Err(err) => {
                tracing::error!(session = %session_id, "failed to load session: {err:#}");
                return Ok(apology(
                    OrchestratorState::fresh(session_id),
                    prompts::STORAGE_UNAVAILABLE,
                    ERROR_STORAGE_UNAVAILABLE,
                ));
            }
        };

        if message.trim().eq_ignore_ascii_case(FORCE_COMPLETE_INTAKE) {
            return self.force_complete_intake(state).await;
        }

        let ctx = TurnContext {
            session_id,
            guide: &guide,
            intake: &intake,
            collaborators: &self.collaborators,
            tokens: &self.tokens,
        };

        let from = state.phase;
        let result = match handler_for(from).handle(&ctx, state.clone(), message).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(session = %session_id, phase = %from, "turn aborted: {err:#}");
                return Ok(persistence_failed(state));
            }
        };

        if let Err(err) = self
            .collaborators
            .states
            .save_state(session_id, &result.state)
            .await
        {
            tracing::error!(session = %session_id, "failed to persist state: {err:#}");
            return Ok(persistence_failed(state));
        }

        if result.state.phase != from {
            tracing::info!(
                session = %session_id,
                from = %from,
                to = %result.state.phase,
                section = ?result.state.current_section_id.map(|id| id.to_string()),
                "phase transition"
            );
        }

        Ok(finish(result))
    }

    async fn load_turn_inputs(
        &self,
        session_id: &str,
    ) -> Result<Option<(Guide, IntakeData, OrchestratorState)>> {
        let sessions = &self.collaborators.sessions;
        let Some(guide) = sessions
            .guide(session_id)
            .await
            .context("failed to load session guide")?
        else {
            return Ok(None);
        };
        let intake = sessions
            .intake(session_id)
            .await
            .context("failed to load intake data")?;
        let state = self.load_state(session_id).await?;
        Ok(Some((guide, intake, state)))
    }

    async fn force_complete_intake(&self, state: OrchestratorState) -> Result<TurnOutcome> {
        if state.phase != Phase::Intake {
            return Ok(finish(PhaseResult {
                message: prompts::FORCE_IGNORED.to_string(),
                state,
                metadata: TurnMetadata::default(),
            }));
        }

        let next = OrchestratorState {
            phase: Phase::Planning,
            current_section_id: None,
            ..state.clone()
        };
        if let Err(err) = self
            .collaborators
            .states
            .save_state(&state.session_id, &next)
            .await
        {
            tracing::error!(session = %state.session_id, "failed to persist state: {err:#}");
            return Ok(persistence_failed(state));
        }

        tracing::info!(session = %next.session_id, "intake force-completed");
        Ok(finish(PhaseResult {
            message: prompts::FORCE_HANDOFF.to_string(),
            state: next,
            metadata: TurnMetadata::default(),
        }))
    }

    async fn load_state(&self, session_id: &str) -> Result<OrchestratorState> {
        let raw = self
            .collaborators
            .states
            .load_state(session_id)
            .await
            .context("failed to load orchestrator state")?;

        let Some(raw) = raw else {
            return Ok(OrchestratorState::fresh(session_id));
        };

        match serde_json::from_str::<OrchestratorState>(&raw) {
            Ok(state) if state.session_id == session_id && state.is_consistent() => Ok(state),
            Ok(state) => {
                tracing::warn!(
                    session = %session_id,
                    stored_session = %state.session_id,
                    phase = %state.phase,
                    "stored state is inconsistent; restarting at intake"
                );
                Ok(OrchestratorState::fresh(session_id))
            }
            Err(err) => {
                tracing::warn!(
                    session = %session_id,
                    "stored state is unreadable ({err}); restarting at intake"
                );
                Ok(OrchestratorState::fresh(session_id))
            }
        }
    }

    /// Marks a section saved outside the chat loop. `None` when the section
    /// has no ledger record.
    pub async fn save_section(
        &self,
        session_id: &str,
        id: SectionId,
    ) -> Result<Option<SectionRecord>> {
        let ledger = &self.collaborators.ledger;
        if !ledger.mark_saved(session_id, id).await? {
            tracing::warn!(session = %session_id, section = %id, "save for unknown section");
            return Ok(None);
        }
        ledger.record(session_id, id).await
    }

    /// Sets one intake field directly. A session still in Intake moves to
    /// Planning once it has a title. `None` for an unknown session.
    pub async fn update_intake(
        &self,
        session_id: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<IntakeUpdated>> {
        let sessions = &self.collaborators.sessions;
        if sessions.guide(session_id).await?.is_none() {
            return Ok(None);
        }

        let field = field.trim().to_ascii_lowercase();
        sessions
            .record_intake_field(session_id, &field, value.trim())
            .await
            .with_context(|| format!("failed to record intake field {field}"))?;
        let intake = sessions.intake(session_id).await?;

        let mut state = self.load_state(session_id).await?;
        if state.phase == Phase::Intake && intake.has_title() {
            state.phase = Phase::Planning;
            state.current_section_id = None;
            self.collaborators
                .states
                .save_state(session_id, &state)
                .await
                .context("failed to persist state after intake update")?;
            tracing::info!(session = %session_id, "intake completed by direct update");
        }

        Ok(Some(IntakeUpdated {
            intake_done: intake_done(&state, &intake),
            intake,
        }))
    }

    pub async fn sections(&self, session_id: &str) -> Result<Vec<SectionRecord>> {
        self.collaborators.ledger.records(session_id).await
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let sessions = &self.collaborators.sessions;
        let Some(guide) = sessions.guide(session_id).await? else {
            return Ok(None);
        };
        let intake = sessions.intake(session_id).await?;
        let state = self.load_state(session_id).await?;
        let sections_status: BTreeMap<String, SectionStatus> = self
            .sections(session_id)
            .await?
            .into_iter()
            .map(|record| (record.id().to_string(), record.status))
            .collect();

        Ok(Some(SessionSnapshot {
            session_id: session_id.to_string(),
            guide,
            intake_done: intake_done(&state, &intake),
            intake,
            phase: state.phase,
            current_section_id: state.current_section_id,
            sections_status,
            created_at: sessions.created_at(session_id).await?,
        }))
    }
}

fn finish(result: PhaseResult) -> TurnOutcome {
    let mut metadata = result.metadata;
    metadata.phase = Some(result.state.phase);
    metadata.current_section_id = result.state.current_section_id;
    TurnOutcome {
        message: result.message,
        metadata,
        state: result.state,
    }
}

/// Drops the current section and returns to Planning so the next turn
/// picks a section from the ledger.
fn reselect(mut state: OrchestratorState) -> PhaseResult {
    state.phase = Phase::Planning;
    state.current_section_id = None;
    PhaseResult {
        message: prompts::SECTION_RESELECT.to_string(),
        state,
        metadata: TurnMetadata::default(),
    }
}

fn intake_done(state: &OrchestratorState, intake: &IntakeData) -> bool {
    state.phase != Phase::Intake || intake.has_title()
}

fn apology(state: OrchestratorState, message: &str, error: &str) -> TurnOutcome {
    finish(PhaseResult {
        message: message.to_string(),
        state,
        metadata: TurnMetadata {
            error: Some(error.to_string()),
            ..TurnMetadata::default()
        },
    })
}

fn persistence_failed(previous: OrchestratorState) -> TurnOutcome {
    apology(previous, prompts::PERSISTENCE_FAILED, ERROR_PERSISTENCE_FAILED)
}

impl TurnContext<'_> {
    /// Appends to memory; failures are logged and otherwise ignored.
    async fn remember(&self, role: Role, content: &str, tags: Vec<String>) {
        if let Err(err) = self
            .collaborators
            .memory
            .append(self.session_id, role, content, &tags)
            .await
        {
            tracing::warn!(session = %self.session_id, "memory append failed: {err:#}");
        }
    }

    async fn recall(&self, query: MemoryQuery) -> Vec<crate::memory::MemoryEntry> {
        match self.collaborators.memory.query(self.session_id, &query).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(session = %self.session_id, "memory query failed: {err:#}");
                vec![]
            }
        }
    }

    /// Calls the generator, treating errors and output with neither text
    /// nor metadata as `None`.
    async fn generate(&self, request: GenerationRequest) -> Option<Generated> {
        match self.collaborators.generator.generate(request).await {
            Ok(generated)
                if !generated.text.trim().is_empty() || !generated.metadata.is_empty() =>
            {
                Some(generated)
            }
            Ok(_) => {
                tracing::warn!(session = %self.session_id, "generator returned empty text");
                None
            }
            Err(err) => {
                tracing::warn!(session = %self.session_id, "generation failed: {err:#}");
                None
            }
        }
    }

    /// Saved sections with content, in guide order, for style continuity.
    async fn saved_sections(&self) -> Vec<SavedSection> {
        let records = match self.collaborators.ledger.records(self.session_id).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(session = %self.session_id, "ledger read failed: {err:#}");
                return vec![];
            }
        };
        records
            .into_iter()
            .filter(|record| record.status == SectionStatus::Saved)
            .filter_map(|record| {
                let content = record.draft_content.clone()?;
                let descriptor = self.guide.section_descriptor(&record.id());
                Some(SavedSection {
                    title: descriptor.section_title,
                    content,
                })
            })
            .collect()
    }

    async fn remaining_sections(&self) -> Option<usize> {
        match self.collaborators.ledger.pending_count(self.session_id).await {
            Ok(count) => Some(count),
            Err(err) => {
                tracing::warn!(session = %self.session_id, "ledger count failed: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests;
