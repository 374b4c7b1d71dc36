use anyhow::{Context, Result};
use async_trait::async_trait;

use super::prompts::{self, TEMPERATURE};
use super::{PhaseHandler, PhaseResult, TurnContext};
use crate::llm::{ChatTurn, GenerationRequest, Role};
use crate::memory::TAG_REFLECTION;
use crate::models::{OrchestratorState, Phase, TurnMetadata};

pub(super) struct ReflectionHandler;

#[async_trait]
impl PhaseHandler for ReflectionHandler {
    async fn handle(
        &self,
        ctx: &TurnContext<'_>,
        mut state: OrchestratorState,
        message: &str,
    ) -> Result<PhaseResult> {
        let Some(id) = state.current_section_id else {
            tracing::warn!(session = %ctx.session_id, "reflection without a section; back to planning");
            return Ok(super::reselect(state));
        };
        let descriptor = ctx.guide.section_descriptor(&id);
        if descriptor.is_placeholder {
            tracing::warn!(session = %ctx.session_id, section = %id, "section not in guide; back to planning");
            return Ok(super::reselect(state));
        }

        let ledger = &ctx.collaborators.ledger;
        let saved = ledger
            .mark_saved(ctx.session_id, id)
            .await
            .with_context(|| format!("failed to save section {id}"))?;
        if !saved {
            tracing::warn!(session = %ctx.session_id, section = %id, "saved section missing from ledger");
        }

        let section_tag = id.to_string();
        ctx.remember(
            Role::User,
            message.trim(),
            vec![TAG_REFLECTION.to_string(), section_tag.clone()],
        )
        .await;

        let draft = match ledger.record(ctx.session_id, id).await {
            Ok(record) => record.and_then(|r| r.draft_content).unwrap_or_default(),
            Err(err) => {
                tracing::warn!(session = %ctx.session_id, section = %id, "draft lookup failed: {err:#}");
                String::new()
            }
        };

        let reply = ctx
            .generate(GenerationRequest {
                system: prompts::reflection_system(&descriptor, &draft),
                history: vec![ChatTurn::user(message.trim())],
                max_tokens: ctx.tokens.reflection_tokens,
                temperature: TEMPERATURE,
            })
            .await
            .map(|generated| generated.text)
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| prompts::REFLECTION_FALLBACK.to_string());

        let remaining = ctx.remaining_sections().await;
        let message = format!("{reply}\n\n{}", prompts::reflection_closing(remaining));

        ctx.remember(
            Role::Assistant,
            &message,
            vec![TAG_REFLECTION.to_string(), section_tag],
        )
        .await;

        state.phase = Phase::Planning;
        state.current_section_id = None;

        Ok(PhaseResult {
            message,
            state,
            metadata: TurnMetadata {
                section_completed: true,
                remaining_sections: remaining,
                all_sections_complete: remaining == Some(0),
                ..TurnMetadata::default()
            },
        })
    }
}
