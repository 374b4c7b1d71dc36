use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::llm::{Generated, GenerationRequest, ResponseGenerator, Role};
use crate::memory::{ContextMemory, MemoryEntry, MemoryQuery};
use crate::models::{SectionId, SectionRecord};
use crate::references::{Reference, ReferenceSearch};
use crate::store::{MemoryStore, SectionLedger};

pub enum Reply {
    Text(String),
    Error,
}

pub fn text(value: &str) -> Reply {
    Reply::Text(value.to_string())
}

/// Replays queued replies in order, then answers with the fallback text.
/// Every request is recorded for later inspection.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Option<String>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(vec![]),
        }
    }

    pub fn with_fallback(mut self, fallback: &str) -> Self {
        self.fallback = Some(fallback.to_string());
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<Generated> {
        self.requests.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Reply::Text(text)) => Ok(Generated::from_text(&text)),
            Some(Reply::Error) => anyhow::bail!("scripted generator failure"),
            None => match &self.fallback {
                Some(text) => Ok(Generated::from_text(text)),
                None => anyhow::bail!("scripted generator exhausted"),
            },
        }
    }
}

pub struct FixedReferences(pub Vec<Reference>);

#[async_trait]
impl ReferenceSearch for FixedReferences {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<Reference>> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }
}

pub struct FailingReferences;

#[async_trait]
impl ReferenceSearch for FailingReferences {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Reference>> {
        anyhow::bail!("reference index unavailable")
    }
}

pub struct FailingMemory;

#[async_trait]
impl ContextMemory for FailingMemory {
    async fn append(
        &self,
        _session_id: &str,
        _role: Role,
        _content: &str,
        _tags: &[String],
    ) -> Result<()> {
        anyhow::bail!("memory backend unavailable")
    }

    async fn query(&self, _session_id: &str, _query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        anyhow::bail!("memory backend unavailable")
    }
}

/// Reads go to the wrapped store; status writes fail.
pub struct ReadOnlyLedger(pub Arc<MemoryStore>);

#[async_trait]
impl SectionLedger for ReadOnlyLedger {
    async fn initialize(&self, session_id: &str, ids: &[SectionId]) -> Result<()> {
        self.0.initialize(session_id, ids).await
    }

    async fn record(&self, session_id: &str, id: SectionId) -> Result<Option<SectionRecord>> {
        self.0.record(session_id, id).await
    }

    async fn records(&self, session_id: &str) -> Result<Vec<SectionRecord>> {
        self.0.records(session_id).await
    }

    async fn next_pending(&self, session_id: &str) -> Result<Option<SectionRecord>> {
        self.0.next_pending(session_id).await
    }

    async fn pending_count(&self, session_id: &str) -> Result<usize> {
        self.0.pending_count(session_id).await
    }

    async fn mark_drafted(&self, _session_id: &str, _id: SectionId, _content: &str) -> Result<bool> {
        anyhow::bail!("ledger is read-only")
    }

    async fn mark_saved(&self, _session_id: &str, _id: SectionId) -> Result<bool> {
        anyhow::bail!("ledger is read-only")
    }
}
