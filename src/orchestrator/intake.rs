use anyhow::{Context, Result};
use async_trait::async_trait;

use super::fields::infer_field;
use super::prompts::{self, TEMPERATURE};
use super::{PhaseHandler, PhaseResult, TurnContext};
use crate::llm::{ChatTurn, GenerationRequest, Role, COMPLETE_INTAKE_FLAG};
use crate::memory::{tags, MemoryQuery, TAG_INTAKE};
use crate::models::{OrchestratorState, Phase, TurnMetadata};

const HISTORY_LIMIT: usize = 20;

pub(super) struct IntakeHandler;

#[async_trait]
impl PhaseHandler for IntakeHandler {
    async fn handle(
        &self,
        ctx: &TurnContext<'_>,
        mut state: OrchestratorState,
        message: &str,
    ) -> Result<PhaseResult> {
        let prior = ctx
            .recall(
                MemoryQuery::tagged([TAG_INTAKE])
                    .role(Role::Assistant)
                    .limit(1),
            )
            .await
            .pop()
            .map(|entry| entry.content);
        let field = infer_field(prior.as_deref());
        let answer = message.trim();

        ctx.collaborators
            .sessions
            .record_intake_field(ctx.session_id, field, answer)
            .await
            .with_context(|| format!("failed to record intake field {field}"))?;
        let mut intake = ctx.intake.clone();
        intake.insert(field, answer);

        ctx.remember(Role::User, answer, tags([TAG_INTAKE])).await;

        let mut history: Vec<ChatTurn> = ctx
            .recall(MemoryQuery::tagged([TAG_INTAKE]).limit(HISTORY_LIMIT))
            .await
            .iter()
            .map(|entry| entry.to_turn())
            .collect();
        if history.last().map(|turn| turn.content.as_str()) != Some(answer) {
            history.push(ChatTurn::user(answer));
        }

        let generated = ctx
            .generate(GenerationRequest {
                system: prompts::intake_system(ctx.guide, &intake),
                history,
                max_tokens: ctx.tokens.intake_tokens,
                temperature: TEMPERATURE,
            })
            .await;

        let model_complete = generated
            .as_ref()
            .is_some_and(|g| g.flag(COMPLETE_INTAKE_FLAG));
        let reply = match generated {
            Some(generated) => generated.text,
            None => prompts::INTAKE_FALLBACK.to_string(),
        };

        let reply = if model_complete {
            state.phase = Phase::Planning;
            state.current_section_id = None;
            if reply.is_empty() {
                prompts::INTAKE_HANDOFF.to_string()
            } else {
                reply
            }
        } else if intake.has_title() {
            state.phase = Phase::Planning;
            state.current_section_id = None;
            prompts::INTAKE_HANDOFF.to_string()
        } else {
            reply
        };

        ctx.remember(Role::Assistant, &reply, tags([TAG_INTAKE])).await;

        Ok(PhaseResult {
            message: reply,
            state,
            metadata: TurnMetadata {
                intake_field: Some(field.to_string()),
                ..TurnMetadata::default()
            },
        })
    }
}
