use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::llm::Role;
use crate::memory::{ContextMemory, MemoryEntry, MemoryQuery};
use crate::models::{
    Guide, IntakeData, OrchestratorState, SectionId, SectionRecord, SectionStatus,
};

/// Sessions own the normalized guide and the intake answers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Stores the guide and creates one pending ledger record per section in
    /// the same write. Returns the new session id.
    async fn create_session(&self, guide: &Guide, source_hash: &str) -> Result<String>;
    async fn guide(&self, session_id: &str) -> Result<Option<Guide>>;
    async fn intake(&self, session_id: &str) -> Result<IntakeData>;
    async fn record_intake_field(&self, session_id: &str, field: &str, value: &str) -> Result<()>;
    async fn created_at(&self, session_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Per-section progress keyed by `(session, chapter_idx, section_idx)`.
///
/// Status only moves forward; `mark_*` return `false` when the record does
/// not exist.
#[async_trait]
pub trait SectionLedger: Send + Sync {
    async fn initialize(&self, session_id: &str, ids: &[SectionId]) -> Result<()>;
    async fn record(&self, session_id: &str, id: SectionId) -> Result<Option<SectionRecord>>;
    /// All records in chapter-then-section order.
    async fn records(&self, session_id: &str) -> Result<Vec<SectionRecord>>;
    async fn next_pending(&self, session_id: &str) -> Result<Option<SectionRecord>>;
    async fn pending_count(&self, session_id: &str) -> Result<usize>;
    async fn mark_drafted(&self, session_id: &str, id: SectionId, content: &str) -> Result<bool>;
    async fn mark_saved(&self, session_id: &str, id: SectionId) -> Result<bool>;
}

/// Orchestrator state persistence. `load_state` hands back the raw stored
/// value so the caller decides what counts as malformed.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self, session_id: &str) -> Result<Option<String>>;
    async fn save_state(&self, session_id: &str, state: &OrchestratorState) -> Result<()>;
}

pub(crate) fn apply_status(
    record: &mut SectionRecord,
    target: SectionStatus,
    content: Option<&str>,
    now: DateTime<Utc>,
) {
    let next = record.status.advance(target);
    if next == SectionStatus::Saved && record.saved_at.is_none() {
        record.saved_at = Some(now);
    }
    record.status = next;
    if let Some(content) = content {
        record.draft_content = Some(content.to_string());
    }
    record.updated_at = now;
}

struct SessionRow {
    guide: Guide,
    intake: IntakeData,
    state: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRow>,
    sections: BTreeMap<(String, SectionId), SectionRecord>,
    memory: Vec<MemoryEntry>,
}

/// In-process implementation of every storage seam, for tests and
/// ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored state with an arbitrary value.
    pub async fn put_raw_state(&self, session_id: &str, raw: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let row = inner
            .sessions
            .get_mut(session_id)
            .with_context(|| format!("unknown session {session_id}"))?;
        row.state = Some(raw.to_string());
        Ok(())
    }

    fn session_records<'a>(
        inner: &'a Inner,
        session_id: &'a str,
    ) -> impl Iterator<Item = &'a SectionRecord> + 'a {
        inner
            .sections
            .iter()
            .filter(move |((sid, _), _)| sid == session_id)
            .map(|(_, record)| record)
    }

    async fn update_status(
        &self,
        session_id: &str,
        id: SectionId,
        target: SectionStatus,
        content: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.sections.get_mut(&(session_id.to_string(), id)) else {
            return Ok(false);
        };
        apply_status(record, target, content, Utc::now());
        Ok(true)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, guide: &Guide, _source_hash: &str) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.write().await;
        inner.sessions.insert(
            session_id.clone(),
            SessionRow {
                guide: guide.clone(),
                intake: IntakeData::default(),
                state: None,
                created_at: Utc::now(),
            },
        );
        for id in guide.section_ids() {
            inner.sections.insert(
                (session_id.clone(), id),
                SectionRecord::pending(&session_id, id),
            );
        }
        Ok(session_id)
    }

    async fn guide(&self, session_id: &str) -> Result<Option<Guide>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(session_id).map(|row| row.guide.clone()))
    }

    async fn intake(&self, session_id: &str) -> Result<IntakeData> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .get(session_id)
            .map(|row| row.intake.clone())
            .unwrap_or_default())
    }

    async fn record_intake_field(&self, session_id: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let row = inner
            .sessions
            .get_mut(session_id)
            .with_context(|| format!("unknown session {session_id}"))?;
        row.intake.insert(field, value);
        Ok(())
    }

    async fn created_at(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(session_id).map(|row| row.created_at))
    }
}

#[async_trait]
impl SectionLedger for MemoryStore {
    async fn initialize(&self, session_id: &str, ids: &[SectionId]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for id in ids {
            inner
                .sections
                .entry((session_id.to_string(), *id))
                .or_insert_with(|| SectionRecord::pending(session_id, *id));
        }
        Ok(())
    }

    async fn record(&self, session_id: &str, id: SectionId) -> Result<Option<SectionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.sections.get(&(session_id.to_string(), id)).cloned())
    }

    async fn records(&self, session_id: &str) -> Result<Vec<SectionRecord>> {
        let inner = self.inner.read().await;
        Ok(Self::session_records(&inner, session_id).cloned().collect())
    }

    async fn next_pending(&self, session_id: &str) -> Result<Option<SectionRecord>> {
        let inner = self.inner.read().await;
        let next = Self::session_records(&inner, session_id)
            .find(|record| record.status == SectionStatus::Pending)
            .cloned();
        Ok(next)
    }

    async fn pending_count(&self, session_id: &str) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(Self::session_records(&inner, session_id)
            .filter(|record| record.status == SectionStatus::Pending)
            .count())
    }

    async fn mark_drafted(&self, session_id: &str, id: SectionId, content: &str) -> Result<bool> {
        self.update_status(session_id, id, SectionStatus::Drafted, Some(content))
            .await
    }

    async fn mark_saved(&self, session_id: &str, id: SectionId) -> Result<bool> {
        self.update_status(session_id, id, SectionStatus::Saved, None)
            .await
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_state(&self, session_id: &str) -> Result<Option<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .get(session_id)
            .and_then(|row| row.state.clone()))
    }

    async fn save_state(&self, session_id: &str, state: &OrchestratorState) -> Result<()> {
        let raw = serde_json::to_string(state).context("failed to serialize state")?;
        self.put_raw_state(session_id, &raw).await
    }
}

#[async_trait]
impl ContextMemory for MemoryStore {
    async fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tags: &[String],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.memory.push(MemoryEntry {
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            tags: tags.to_vec(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn query(&self, session_id: &str, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let inner = self.inner.read().await;
        Ok(query.select(
            inner
                .memory
                .iter()
                .filter(|entry| entry.session_id == session_id)
                .cloned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chapter, Section};

    fn guide_with_counts(counts: &[usize]) -> Guide {
        Guide {
            title: "G".to_string(),
            description: None,
            chapters: counts
                .iter()
                .enumerate()
                .map(|(c, n)| {
                    Chapter::new(
                        format!("C{c}"),
                        (0..*n).map(|s| Section::new(format!("S{s}"), "r")).collect(),
                    )
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn create_session_initializes_pending_ledger() {
        let store = MemoryStore::new();
        let session = store
            .create_session(&guide_with_counts(&[2, 1, 3]), "hash")
            .await
            .unwrap();

        let records = store.records(&session).await.unwrap();
        let keys: Vec<(usize, usize)> = records
            .iter()
            .map(|r| (r.chapter_idx, r.section_idx))
            .collect();
        assert_eq!(keys, [(0, 0), (0, 1), (1, 0), (2, 0), (2, 1), (2, 2)]);
        assert!(records.iter().all(|r| r.status == SectionStatus::Pending));
        assert_eq!(store.pending_count(&session).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn status_is_monotonic_but_content_refreshes() {
        let store = MemoryStore::new();
        let session = store
            .create_session(&guide_with_counts(&[1]), "hash")
            .await
            .unwrap();
        let id = SectionId::new(0, 0);

        assert!(store.mark_saved(&session, id).await.unwrap());
        assert!(store.mark_drafted(&session, id, "rewrite").await.unwrap());

        let record = store.record(&session, id).await.unwrap().unwrap();
        assert_eq!(record.status, SectionStatus::Saved);
        assert_eq!(record.draft_content.as_deref(), Some("rewrite"));
        assert!(record.saved_at.is_some());
        assert!(store.next_pending(&session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn marking_unknown_section_reports_false() {
        let store = MemoryStore::new();
        let session = store
            .create_session(&guide_with_counts(&[1]), "hash")
            .await
            .unwrap();
        assert!(!store
            .mark_drafted(&session, SectionId::new(5, 5), "x")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn memory_is_scoped_per_session() {
        let store = MemoryStore::new();
        store
            .append("a", Role::User, "hello", &["intake".to_string()])
            .await
            .unwrap();
        store
            .append("b", Role::User, "other", &["intake".to_string()])
            .await
            .unwrap();

        let entries = store
            .query("a", &MemoryQuery::tagged(["intake"]))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "hello");
    }
}
