use anyhow::{Context, Result};
use async_trait::async_trait;

use super::bullets::extract_bullets;
use super::prompts::{self, TEMPERATURE};
use super::{PhaseHandler, PhaseResult, TurnContext};
use crate::llm::{ChatTurn, GenerationRequest, Role};
use crate::memory::{TAG_BULLET_POINTS, TAG_PLANNING};
use crate::models::{OrchestratorState, Phase, SectionId, TurnMetadata};

pub(super) struct PlanningHandler;

#[async_trait]
impl PhaseHandler for PlanningHandler {
    async fn handle(
        &self,
        ctx: &TurnContext<'_>,
        state: OrchestratorState,
        message: &str,
    ) -> Result<PhaseResult> {
        match state.current_section_id {
            None => select_next_section(ctx, state, message).await,
            Some(id) => capture_bullets(ctx, state, id, message).await,
        }
    }
}

async fn select_next_section(
    ctx: &TurnContext<'_>,
    mut state: OrchestratorState,
    message: &str,
) -> Result<PhaseResult> {
    let next = ctx
        .collaborators
        .ledger
        .next_pending(ctx.session_id)
        .await
        .context("failed to read section ledger")?;

    let Some(record) = next else {
        return Ok(PhaseResult {
            message: prompts::ALL_SECTIONS_COMPLETE.to_string(),
            state,
            metadata: TurnMetadata {
                all_sections_complete: true,
                remaining_sections: Some(0),
                ..TurnMetadata::default()
            },
        });
    };

    let id = record.id();
    state.current_section_id = Some(id);
    let descriptor = ctx.guide.section_descriptor(&id);
    let saved = ctx.saved_sections().await;
    let section_tag = id.to_string();

    if !message.trim().is_empty() {
        ctx.remember(
            Role::User,
            message.trim(),
            vec![TAG_PLANNING.to_string(), section_tag.clone()],
        )
        .await;
    }

    let reply = ctx
        .generate(GenerationRequest {
            system: prompts::planning_system(ctx.guide, ctx.intake, &descriptor, &saved),
            history: vec![ChatTurn::user(message.trim())],
            max_tokens: ctx.tokens.planning_tokens,
            temperature: TEMPERATURE,
        })
        .await
        .map(|generated| generated.text)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| prompts::planning_fallback(&descriptor));

    ctx.remember(
        Role::Assistant,
        &reply,
        vec![TAG_PLANNING.to_string(), section_tag],
    )
    .await;

    Ok(PhaseResult {
        message: reply,
        state,
        metadata: TurnMetadata {
            remaining_sections: ctx.remaining_sections().await,
            ..TurnMetadata::default()
        },
    })
}

async fn capture_bullets(
    ctx: &TurnContext<'_>,
    mut state: OrchestratorState,
    id: SectionId,
    message: &str,
) -> Result<PhaseResult> {
    let descriptor = ctx.guide.section_descriptor(&id);
    if descriptor.is_placeholder {
        tracing::warn!(session = %ctx.session_id, section = %id, "section not in guide; selecting again");
        return Ok(super::reselect(state));
    }
    let bullets = extract_bullets(message);
    let section_tag = id.to_string();

    ctx.remember(
        Role::User,
        message.trim(),
        vec![TAG_PLANNING.to_string(), section_tag.clone()],
    )
    .await;

    let payload = serde_json::json!({
        "section_id": section_tag,
        "bullet_points": bullets,
    });
    ctx.remember(
        Role::User,
        &payload.to_string(),
        vec![TAG_BULLET_POINTS.to_string(), section_tag],
    )
    .await;

    state.phase = Phase::Execution;

    Ok(PhaseResult {
        message: prompts::bullets_captured(&descriptor, bullets.len()),
        state,
        metadata: TurnMetadata {
            bullet_points: Some(bullets),
            ..TurnMetadata::default()
        },
    })
}
