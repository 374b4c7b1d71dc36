use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::llm::{ChatTurn, Generated, GenerationRequest, ResponseGenerator, Role};

static FENCED_BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```$").expect("valid regex"));

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for ollama")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatTurn],
        num_predict: usize,
        temperature: f32,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            model: &'a str,
            messages: &'a [ChatTurn],
            stream: bool,
            options: ChatOptions,
        }

        #[derive(Serialize)]
        struct ChatOptions {
            num_predict: usize,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            message: ChatRespMessage,
        }

        #[derive(Deserialize)]
        struct ChatRespMessage {
            content: String,
        }

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ChatReq {
                model,
                messages,
                stream: false,
                options: ChatOptions {
                    num_predict,
                    temperature,
                },
            })
            .send()
            .await
            .context("failed to call ollama chat endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "ollama /api/chat returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<ChatResp>()
            .await
            .context("failed to decode ollama chat response")?;

        Ok(response.message.content.trim().to_string())
    }
}

/// [`ResponseGenerator`] backed by one Ollama model. All generators built
/// from the same semaphore share its permit budget.
#[derive(Clone)]
pub struct OllamaGenerator {
    client: OllamaClient,
    model: String,
    generation_limit: Arc<Semaphore>,
}

impl OllamaGenerator {
    pub fn new(
        client: OllamaClient,
        model: impl Into<String>,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            generation_limit,
        }
    }
}

#[async_trait]
impl ResponseGenerator for OllamaGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<Generated> {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        if !request.system.trim().is_empty() {
            messages.push(ChatTurn {
                role: Role::System,
                content: request.system,
            });
        }
        messages.extend(request.history);

        let _permit = self
            .generation_limit
            .acquire()
            .await
            .context("generation semaphore closed")?;

        tracing::debug!(model = %self.model, turns = messages.len(), "calling ollama chat");
        let raw = self
            .client
            .chat(
                &self.model,
                &messages,
                request.max_tokens,
                request.temperature,
            )
            .await?;

        Ok(Generated::from_text(&sanitize_model_output(raw)))
    }
}

fn sanitize_model_output(answer: String) -> String {
    let mut text = answer.trim().to_string();
    if text.starts_with("```") && !text.starts_with("```json") {
        if let Some(body) = FENCED_BODY.captures(&text).and_then(|caps| caps.get(1)) {
            text = body.as_str().trim().to_string();
        } else {
            text = text.replace("```", "").trim().to_string();
        }
    }
    text
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
