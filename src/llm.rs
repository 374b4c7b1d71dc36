use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Control tag the conversation model appends once it has gathered enough
/// requirements to leave intake.
pub const INTAKE_COMPLETE_TAG: &str = "[INTAKE_COMPLETE]";
pub const COMPLETE_INTAKE_FLAG: &str = "complete_intake";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub history: Vec<ChatTurn>,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generated {
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl Generated {
    /// Wraps raw model text, lifting the intake completion tag into metadata.
    pub fn from_text(raw: &str) -> Self {
        let mut metadata = Map::new();
        let text = if raw.contains(INTAKE_COMPLETE_TAG) {
            metadata.insert(COMPLETE_INTAKE_FLAG.to_string(), Value::Bool(true));
            raw.replace(INTAKE_COMPLETE_TAG, "")
        } else {
            raw.to_string()
        };
        Self {
            text: text.trim().to_string(),
            metadata,
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Text generation collaborator. Implementations own transport, timeouts and
/// concurrency limits.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generated>;
}
