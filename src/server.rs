use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::guide::{GuideNormalizer, Normalized};
use crate::ingest::source_sha256;
use crate::models::{
    ChatRequest, IntakeUpdateRequest, IntakeUpdated, SaveSectionRequest, SectionId,
    SectionRecord, SessionCreated, SessionSnapshot,
};
use crate::orchestrator::{Orchestrator, ERROR_SESSION_NOT_FOUND, ERROR_STORAGE_UNAVAILABLE};

type SessionLock = Arc<tokio::sync::Mutex<()>>;

/// One async mutex per session so turns and saves for a session run one at
/// a time. Entries are dropped once no request holds or waits on them.
#[derive(Clone, Default)]
struct SessionLocks {
    inner: Arc<Mutex<HashMap<String, SessionLock>>>,
}

impl SessionLocks {
    fn acquire(&self, session_id: &str) -> Result<SessionLock, ApiError> {
        let mut locks = self
            .inner
            .lock()
            .map_err(|_| ApiError::from(anyhow::anyhow!("lock poisoned")))?;
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    fn release(&self, session_id: &str, lock: SessionLock) {
        let Ok(mut locks) = self.inner.lock() else {
            return;
        };
        // the map's copy plus ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

#[derive(Clone)]
struct AppState {
    normalizer: Arc<GuideNormalizer>,
    orchestrator: Arc<Orchestrator>,
    session_locks: SessionLocks,
}

pub async fn run_server(
    config: AppConfig,
    normalizer: GuideNormalizer,
    orchestrator: Orchestrator,
) -> Result<()> {
    let state = AppState {
        normalizer: Arc::new(normalizer),
        orchestrator: Arc::new(orchestrator),
        session_locks: SessionLocks::default(),
    };

    let app = Router::new()
        .route("/api/guide/normalize", post(normalize_guide))
        .route("/api/session", post(create_session))
        .route("/api/session/:session_id/state", get(session_state))
        .route("/api/session/:session_id/chat", post(chat_handler))
        .route("/api/session/:session_id/intake", post(update_intake))
        .route("/api/session/:session_id/sections", get(list_sections))
        .route("/api/session/:session_id/sections/save", post(save_section))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn normalize_guide(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Normalized>, ApiError> {
    Ok(Json(state.normalizer.normalize_with_tier(&body).await))
}

async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SessionCreated>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("guide upload is empty".to_string()));
    }

    let normalized = state.normalizer.normalize_with_tier(&body).await;
    let created = state
        .orchestrator
        .create_session(&normalized.guide, &source_sha256(&body))
        .await?;
    tracing::info!(
        session = %created.session_id,
        tier = normalized.tier.as_str(),
        "guide accepted"
    );
    Ok(Json(created))
}

async fn session_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    match state.orchestrator.snapshot(&session_id).await? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::not_found(format!(
            "session not found: {}",
            session_id
        ))),
    }
}

async fn chat_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let lock = state.session_locks.acquire(&session_id)?;
    let outcome = {
        let _guard = lock.lock().await;
        state
            .orchestrator
            .handle_turn(&session_id, &request.message)
            .await
    };
    state.session_locks.release(&session_id, lock);
    let outcome = outcome?;

    let status = match outcome.metadata.error.as_deref() {
        Some(ERROR_SESSION_NOT_FOUND) => StatusCode::NOT_FOUND,
        Some(ERROR_STORAGE_UNAVAILABLE) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn update_intake(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<IntakeUpdateRequest>,
) -> Result<Json<IntakeUpdated>, ApiError> {
    if request.field.trim().is_empty() {
        return Err(ApiError::bad_request("intake field name is empty".to_string()));
    }

    let lock = state.session_locks.acquire(&session_id)?;
    let updated = {
        let _guard = lock.lock().await;
        state
            .orchestrator
            .update_intake(&session_id, &request.field, &request.value)
            .await
    };
    state.session_locks.release(&session_id, lock);

    match updated? {
        Some(updated) => Ok(Json(updated)),
        None => Err(ApiError::not_found(format!(
            "session not found: {}",
            session_id
        ))),
    }
}

async fn list_sections(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<SectionRecord>>, ApiError> {
    let records = state.orchestrator.sections(&session_id).await?;
    if records.is_empty() && state.orchestrator.snapshot(&session_id).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "session not found: {}",
            session_id
        )));
    }
    Ok(Json(records))
}

async fn save_section(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SaveSectionRequest>,
) -> Result<Json<SectionRecord>, ApiError> {
    let id = SectionId::new(request.chapter_idx, request.section_idx);
    let lock = state.session_locks.acquire(&session_id)?;
    let saved = {
        let _guard = lock.lock().await;
        state.orchestrator.save_section(&session_id, id).await
    };
    state.session_locks.release(&session_id, lock);

    match saved? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::not_found(format!(
            "section {} not found in session {}",
            id, session_id
        ))),
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        tracing::error!("request failed: {value:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
