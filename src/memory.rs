use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatTurn, Role};

pub const TAG_INTAKE: &str = "intake";
pub const TAG_PLANNING: &str = "planning";
pub const TAG_EXECUTION: &str = "execution";
pub const TAG_REFLECTION: &str = "reflection";
pub const TAG_BULLET_POINTS: &str = "bullet_points";
pub const TAG_DRAFT: &str = "draft";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn to_turn(&self) -> ChatTurn {
        ChatTurn {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Filter for [`ContextMemory::query`]. Every listed tag must be present;
/// `limit` keeps the most recent matches.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub tags: Vec<String>,
    pub role: Option<Role>,
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl MemoryQuery {
    pub fn tagged<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if self.role.is_some_and(|role| role != entry.role) {
            return false;
        }
        if !self.tags.iter().all(|tag| entry.has_tag(tag)) {
            return false;
        }
        match &self.text {
            Some(text) => entry
                .content
                .to_lowercase()
                .contains(&text.to_lowercase()),
            None => true,
        }
    }

    /// Filters chronologically ordered entries and applies the limit.
    pub fn select(&self, entries: impl IntoIterator<Item = MemoryEntry>) -> Vec<MemoryEntry> {
        let mut matched: Vec<MemoryEntry> =
            entries.into_iter().filter(|e| self.matches(e)).collect();
        if let Some(limit) = self.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}

/// Conversation memory: tagged per-session entries, returned in the order
/// they were appended.
#[async_trait]
pub trait ContextMemory: Send + Sync {
    async fn append(&self, session_id: &str, role: Role, content: &str, tags: &[String])
        -> Result<()>;

    async fn query(&self, session_id: &str, query: &MemoryQuery) -> Result<Vec<MemoryEntry>>;
}

pub fn tags<const N: usize>(values: [&str; N]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(role: Role, content: &str, tags: &[&str]) -> MemoryEntry {
        MemoryEntry {
            session_id: "s".to_string(),
            role,
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn select_requires_all_tags_and_keeps_latest() {
        let entries = vec![
            entry(Role::Assistant, "q1", &["intake"]),
            entry(Role::User, "a1", &["intake"]),
            entry(Role::Assistant, "q2", &["intake"]),
            entry(Role::Assistant, "plan", &["planning", "0.0"]),
        ];

        let latest = MemoryQuery::tagged([TAG_INTAKE])
            .role(Role::Assistant)
            .limit(1)
            .select(entries.clone());
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].content, "q2");

        let scoped = MemoryQuery::tagged(["planning", "0.1"]).select(entries);
        assert!(scoped.is_empty());
    }

    #[test]
    fn text_filter_is_case_insensitive() {
        let query = MemoryQuery {
            text: Some("DEADLINE".to_string()),
            ..MemoryQuery::default()
        };
        assert!(query.matches(&entry(Role::User, "the deadline is May", &[])));
    }
}
