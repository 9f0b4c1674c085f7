//! Admin HTTP surface.
//!
//! Operator endpoints over the engine: trigger and inspect runs,
//! recover a stuck lock, and manage the entry queue. The run trigger
//! acquires the lock synchronously so contention answers `409
//! Conflict` immediately, then drains on a blocking worker and answers
//! `202 Accepted`; the drain's outcome lands in the logs and in
//! `GET /cron/status`, not in the response.
//!
//! Routes:
//!
//! - `GET  /cron/status`  — lock state, cursor, pending depth
//! - `POST /cron/run`     — trigger a drain (202, or 409 if running)
//! - `POST /cron/unlock`  — operator override for a stuck lock
//! - `GET  /queue`        — list entries (`processed`, `limit`, `offset`)
//! - `POST /queue`        — enqueue on a user's behalf
//! - `DELETE /queue/:id`  — remove a pending entry

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fmx_core::queue::{EntryId, EntryType, QueueEntry};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::engine::{EngineError, MatrixEngine};
use crate::store::{QueueFilter, StoreError};

/// Shared handler state.
pub type AppState = Arc<MatrixEngine>;

/// Builds the admin router.
#[must_use]
pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/cron/status", get(cron_status))
        .route("/cron/run", post(cron_run))
        .route("/cron/unlock", post(cron_unlock))
        .route("/queue", get(queue_list).post(queue_create))
        .route("/queue/:id", delete(queue_delete))
        .with_state(engine)
}

/// Error envelope for every non-2xx response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::AlreadyRunning(_) => StatusCode::CONFLICT,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Store(StoreError::UnknownUser { .. }) => StatusCode::NOT_FOUND,
            EngineError::Store(_) | EngineError::Structural { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::from(EngineError::Store(err))
    }
}

async fn cron_status(State(engine): State<AppState>) -> Result<Response, ApiError> {
    let status = engine.status()?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    status: &'static str,
}

async fn cron_run(State(engine): State<AppState>) -> Result<Response, ApiError> {
    // Acquire here so a concurrent run answers 409 instead of queueing
    // a drain that would immediately lose the race.
    engine.acquire()?;
    tokio::task::spawn_blocking(move || {
        if let Err(err) = engine.run_acquired() {
            error!(error = %err, "triggered run failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { status: "started" })).into_response())
}

async fn cron_unlock(State(engine): State<AppState>) -> Result<Response, ApiError> {
    engine.force_unlock()?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize, Default)]
struct ListParams {
    processed: Option<bool>,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

#[derive(Debug, Serialize)]
struct QueuePage {
    entries: Vec<QueueEntry>,
}

async fn queue_list(
    State(engine): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let entries = engine.store().list_entries(QueueFilter {
        processed: params.processed,
        limit: params.limit,
        offset: params.offset,
    })?;
    Ok(Json(QueuePage { entries }).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateEntryRequest {
    username: String,
    level: u32,
    /// Queue timestamp override; defaults to now.
    date: Option<DateTime<Utc>>,
    entry_type: Option<EntryType>,
    /// Sponsor username; defaults to the user's directory sponsor.
    sponsor: Option<String>,
}

async fn queue_create(
    State(engine): State<AppState>,
    Json(req): Json<CreateEntryRequest>,
) -> Result<Response, ApiError> {
    let entry = engine.create_queue_entry(
        &req.username,
        req.level,
        req.date,
        req.entry_type,
        req.sponsor.as_deref(),
    )?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn queue_delete(
    State(engine): State<AppState>,
    Path(id): Path<EntryId>,
) -> Result<Response, ApiError> {
    if engine.store().delete_entry(id)? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(ApiError::not_found(format!("no queue entry {id}")))
    }
}
