use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::llm::Role;
use crate::memory::{ContextMemory, MemoryEntry, MemoryQuery};
use crate::models::{
    Guide, IntakeData, OrchestratorState, SectionId, SectionRecord, SectionStatus,
};
use crate::store::{apply_status, SectionLedger, SessionStore, StateStore};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.sqlite_dsn()).await
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite database {dsn}"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                guide_json TEXT NOT NULL,
                guide_sha256 TEXT NOT NULL,
                intake_json TEXT NOT NULL,
                state_json TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sections (
                session_id TEXT NOT NULL,
                chapter_idx INTEGER NOT NULL,
                section_idx INTEGER NOT NULL,
                status TEXT NOT NULL,
                draft_content TEXT,
                saved_at TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, chapter_idx, section_idx),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_status(
        &self,
        session_id: &str,
        id: SectionId,
        target: SectionStatus,
        content: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(mut record) = fetch_record_tx(&mut tx, session_id, id).await? else {
            return Ok(false);
        };

        apply_status(&mut record, target, content, Utc::now());
        sqlx::query(
            r#"
            UPDATE sections
            SET status = ?, draft_content = ?, saved_at = ?, updated_at = ?
            WHERE session_id = ? AND chapter_idx = ? AND section_idx = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.draft_content)
        .bind(record.saved_at.map(|ts| ts.to_rfc3339()))
        .bind(record.updated_at.to_rfc3339())
        .bind(session_id)
        .bind(id.chapter as i64)
        .bind(id.section as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn create_session(&self, guide: &Guide, source_hash: &str) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let guide_json = serde_json::to_string(guide).context("failed to serialize guide")?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sessions (id, guide_json, guide_sha256, intake_json, state_json, created_at)
            VALUES (?, ?, ?, '{}', NULL, ?)
            "#,
        )
        .bind(&session_id)
        .bind(&guide_json)
        .bind(source_hash)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_pending_tx(&mut tx, &session_id, &guide.section_ids()).await?;
        tx.commit().await?;

        Ok(session_id)
    }

    async fn guide(&self, session_id: &str) -> Result<Option<Guide>> {
        let row = sqlx::query("SELECT guide_json FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            serde_json::from_str::<Guide>(&r.get::<String, _>("guide_json"))
                .with_context(|| format!("stored guide for session {session_id} is invalid"))
        })
        .transpose()
    }

    async fn intake(&self, session_id: &str) -> Result<IntakeData> {
        let row = sqlx::query("SELECT intake_json FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => serde_json::from_str(&r.get::<String, _>("intake_json"))
                .with_context(|| format!("stored intake for session {session_id} is invalid")),
            None => Ok(IntakeData::default()),
        }
    }

    async fn record_intake_field(&self, session_id: &str, field: &str, value: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT intake_json FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("unknown session {session_id}"))?;

        let mut intake: IntakeData = serde_json::from_str(&row.get::<String, _>("intake_json"))
            .with_context(|| format!("stored intake for session {session_id} is invalid"))?;
        intake.insert(field, value);

        sqlx::query("UPDATE sessions SET intake_json = ? WHERE id = ?")
            .bind(serde_json::to_string(&intake)?)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn created_at(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT created_at FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| parse_ts(&r.get::<String, _>("created_at"))))
    }
}

#[async_trait]
impl SectionLedger for Database {
    async fn initialize(&self, session_id: &str, ids: &[SectionId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_pending_tx(&mut tx, session_id, ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record(&self, session_id: &str, id: SectionId) -> Result<Option<SectionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, chapter_idx, section_idx, status, draft_content, saved_at, updated_at
            FROM sections
            WHERE session_id = ? AND chapter_idx = ? AND section_idx = ?
            "#,
        )
        .bind(session_id)
        .bind(id.chapter as i64)
        .bind(id.section as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_record))
    }

    async fn records(&self, session_id: &str) -> Result<Vec<SectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, chapter_idx, section_idx, status, draft_content, saved_at, updated_at
            FROM sections
            WHERE session_id = ?
            ORDER BY chapter_idx ASC, section_idx ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_record).collect())
    }

    async fn next_pending(&self, session_id: &str) -> Result<Option<SectionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, chapter_idx, section_idx, status, draft_content, saved_at, updated_at
            FROM sections
            WHERE session_id = ? AND status = 'pending'
            ORDER BY chapter_idx ASC, section_idx ASC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_record))
    }

    async fn pending_count(&self, session_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sections WHERE session_id = ? AND status = 'pending'",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as usize)
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
impl StateStore for Database {
    async fn load_state(&self, session_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT state_json FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|r| r.get::<Option<String>, _>("state_json")))
    }

    async fn save_state(&self, session_id: &str, state: &OrchestratorState) -> Result<()> {
        let raw = serde_json::to_string(state).context("failed to serialize state")?;
        let result = sqlx::query("UPDATE sessions SET state_json = ? WHERE id = ?")
            .bind(raw)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("unknown session {session_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl ContextMemory for Database {
    async fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tags: &[String],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, tags_json, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(serde_json::to_string(tags)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, session_id: &str, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT session_id, role, content, tags_json, created_at FROM messages WHERE session_id = ",
        );
        qb.push_bind(session_id);

        if let Some(role) = query.role {
            qb.push(" AND role = ");
            qb.push_bind(role.as_str());
        }
        for tag in &query.tags {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(messages.tags_json) WHERE json_each.value = ");
            qb.push_bind(tag.as_str());
            qb.push(")");
        }

        // text matching stays in Rust, so the limit can only go to SQL without it
        qb.push(" ORDER BY id DESC");
        if let (Some(limit), None) = (query.limit, &query.text) {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut entries: Vec<MemoryEntry> = rows.into_iter().map(row_to_entry).collect();
        entries.reverse();

        Ok(query.select(entries))
    }
}

fn row_to_entry(row: SqliteRow) -> MemoryEntry {
    MemoryEntry {
        session_id: row.get("session_id"),
        role: Role::from_db(&row.get::<String, _>("role")),
        content: row.get("content"),
        tags: serde_json::from_str(&row.get::<String, _>("tags_json")).unwrap_or_default(),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
    }
}

async fn insert_pending_tx(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &str,
    ids: &[SectionId],
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    for id in ids {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sections (session_id, chapter_idx, section_idx, status, draft_content, saved_at, updated_at)
            VALUES (?, ?, ?, 'pending', NULL, NULL, ?)
            "#,
        )
        .bind(session_id)
        .bind(id.chapter as i64)
        .bind(id.section as i64)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn fetch_record_tx(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &str,
    id: SectionId,
) -> Result<Option<SectionRecord>> {
    let row = sqlx::query(
        r#"
        SELECT session_id, chapter_idx, section_idx, status, draft_content, saved_at, updated_at
        FROM sections
        WHERE session_id = ? AND chapter_idx = ? AND section_idx = ?
        "#,
    )
    .bind(session_id)
    .bind(id.chapter as i64)
    .bind(id.section as i64)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(row_to_record))
}

fn row_to_record(row: SqliteRow) -> SectionRecord {
    SectionRecord {
        session_id: row.get("session_id"),
        chapter_idx: row.get::<i64, _>("chapter_idx").max(0) as usize,
        section_idx: row.get::<i64, _>("section_idx").max(0) as usize,
        status: SectionStatus::from_db(&row.get::<String, _>("status")),
        draft_content: row.get("draft_content"),
        saved_at: row
            .get::<Option<String>, _>("saved_at")
            .map(|ts| parse_ts(&ts)),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")),
    }
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
