use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::prompts::{self, TEMPERATURE};
use super::{PhaseHandler, PhaseResult, TurnContext, ERROR_GENERATION_FAILED};
use crate::llm::{ChatTurn, GenerationRequest, Role};
use crate::memory::{MemoryQuery, TAG_BULLET_POINTS, TAG_DRAFT, TAG_EXECUTION};
use crate::models::{OrchestratorState, Phase, SectionDescriptor, SectionId, TurnMetadata};
use crate::references::Reference;

const REFERENCE_LIMIT: usize = 5;

pub(super) struct ExecutionHandler;

#[derive(Deserialize)]
struct StoredBullets {
    bullet_points: Vec<String>,
}

#[async_trait]
impl PhaseHandler for ExecutionHandler {
    async fn handle(
        &self,
        ctx: &TurnContext<'_>,
        mut state: OrchestratorState,
        _message: &str,
    ) -> Result<PhaseResult> {
        let Some(id) = state.current_section_id else {
            tracing::warn!(session = %ctx.session_id, "execution without a section; back to planning");
            return Ok(super::reselect(state));
        };

        let descriptor = ctx.guide.section_descriptor(&id);
        if descriptor.is_placeholder {
            tracing::warn!(session = %ctx.session_id, section = %id, "section not in guide; back to planning");
            return Ok(super::reselect(state));
        }
        let bullets = load_bullets(ctx, id).await;
        let saved = ctx.saved_sections().await;
        let references = find_references(ctx, &descriptor, &bullets).await;

        let draft = ctx
            .generate(GenerationRequest {
                system: prompts::draft_system(ctx.intake, &descriptor, &bullets, &saved, &references),
                history: vec![ChatTurn::user(prompts::draft_request(&descriptor))],
                max_tokens: ctx.tokens.draft_tokens,
                temperature: TEMPERATURE,
            })
            .await
            .map(|generated| generated.text)
            .filter(|text| !text.trim().is_empty());

        let Some(draft) = draft else {
            return Ok(PhaseResult {
                message: prompts::DRAFT_RETRY.to_string(),
                state,
                metadata: TurnMetadata {
                    error: Some(ERROR_GENERATION_FAILED.to_string()),
                    ..TurnMetadata::default()
                },
            });
        };

        let marked = ctx
            .collaborators
            .ledger
            .mark_drafted(ctx.session_id, id, &draft)
            .await
            .with_context(|| format!("failed to store draft for section {id}"))?;
        if !marked {
            tracing::warn!(session = %ctx.session_id, section = %id, "draft for section missing from ledger");
        }

        ctx.remember(
            Role::Assistant,
            &draft,
            vec![
                TAG_EXECUTION.to_string(),
                TAG_DRAFT.to_string(),
                id.to_string(),
            ],
        )
        .await;

        state.phase = Phase::Reflection;

        Ok(PhaseResult {
            message: prompts::draft_presented(&descriptor, &draft),
            state,
            metadata: TurnMetadata {
                draft_generated: true,
                ..TurnMetadata::default()
            },
        })
    }
}

/// Latest bullet points captured for the section; empty when none parse.
async fn load_bullets(ctx: &TurnContext<'_>, id: SectionId) -> Vec<String> {
    let section_tag = id.to_string();
    let latest = ctx
        .recall(MemoryQuery::tagged([TAG_BULLET_POINTS, section_tag.as_str()]).limit(1))
        .await
        .pop();

    let Some(entry) = latest else {
        return vec![];
    };
    match serde_json::from_str::<StoredBullets>(&entry.content) {
        Ok(stored) => stored.bullet_points,
        Err(err) => {
            tracing::warn!(session = %ctx.session_id, section = %id, "stored bullet points unreadable: {err}");
            vec![]
        }
    }
}

async fn find_references(
    ctx: &TurnContext<'_>,
    descriptor: &SectionDescriptor,
    bullets: &[String],
) -> Vec<Reference> {
    let mut query = format!(
        "{} {}",
        descriptor.section_title,
        descriptor.requirements.to_text()
    );
    for bullet in bullets {
        query.push(' ');
        query.push_str(bullet);
    }

    match ctx
        .collaborators
        .references
        .search(query.trim(), REFERENCE_LIMIT)
        .await
    {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!(session = %ctx.session_id, "reference search failed: {err:#}");
            vec![]
        }
    }
}
