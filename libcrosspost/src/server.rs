//! HTTP surface: the dispatch trigger plus post ingestion
//!
//! An external scheduler (cron service, CI job, uptime pinger) calls
//! `/api/cron/dispatch` to run exactly one cycle. When a cron secret is
//! configured every `/api` route requires `Authorization: Bearer <secret>`.

use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::db::PostFilter;
use crate::dispatcher::{CycleReport, Dispatcher};
use crate::error::CrosspostError;
use crate::types::{NewPost, PlatformKind, PostStatus, ScheduledPost};

const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, cron_secret: Option<String>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            cron_secret: cron_secret.filter(|s| !s.is_empty()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/cron/dispatch", get(dispatch).post(dispatch))
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/{id}", get(get_post).delete(delete_post))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body with a status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid or missing bearer token")
    }
}

impl From<CrosspostError> for ApiError {
    fn from(error: CrosspostError) -> Self {
        let status = match &error {
            CrosspostError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CrosspostError::NotFound(_) => StatusCode::NOT_FOUND,
            CrosspostError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", error);
        }
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = &state.cron_secret else {
        return Ok(());
    };

    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) if token == secret.as_str() => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "crosspost",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Run one dispatch cycle
async fn dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CycleReport>, ApiError> {
    authorize(&state, &headers)?;

    tracing::info!("Dispatch cycle triggered over HTTP");
    let now = chrono::Utc::now().timestamp();
    let report = state.dispatcher.run_cycle(now).await?;
    Ok(Json(report))
}

async fn create_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewPost>, JsonRejection>,
) -> Result<(StatusCode, Json<ScheduledPost>), ApiError> {
    authorize(&state, &headers)?;

    let Json(request) =
        payload.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let now = chrono::Utc::now().timestamp();
    let post = state.dispatcher.database().create(request, now).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    platform: Option<String>,
    limit: Option<usize>,
}

async fn list_posts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ScheduledPost>>, ApiError> {
    authorize(&state, &headers)?;

    let filter = PostFilter {
        status: query
            .status
            .as_deref()
            .map(str::parse::<PostStatus>)
            .transpose()?,
        platform: query
            .platform
            .as_deref()
            .map(str::parse::<PlatformKind>)
            .transpose()?,
        limit: Some(query.limit.unwrap_or(50).clamp(1, MAX_LIST_LIMIT)),
    };

    let posts = state.dispatcher.database().list(&filter).await?;
    Ok(Json(posts))
}

async fn get_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ScheduledPost>, ApiError> {
    authorize(&state, &headers)?;

    state
        .dispatcher
        .database()
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("post {} not found", id)))
}

async fn delete_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;

    state.dispatcher.database().delete(&id).await?;
    tracing::info!(post_id = %id, "Deleted post over HTTP");
    Ok(StatusCode::NO_CONTENT)
}
