use crate::config::ApiConfig;
use crate::event::EventRecord;
use crate::event_store::{ClickHouseEventStore, EventQuery};
use crate::object_store::S3ObjectStore;
use crate::registry::PostgresDeviceRegistry;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 500;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub object_store: Arc<S3ObjectStore>,
    pub event_store: Arc<ClickHouseEventStore>,
    pub registry: Arc<PostgresDeviceRegistry>,
    pub presigned_url_expiry: Duration,
}

/// Query parameters for the event list
#[derive(Debug, Default, Deserialize)]
pub struct EventListQuery {
    pub camera_id: Option<String>,
    /// Start time (RFC 3339, inclusive)
    pub start_time: Option<DateTime<Utc>>,
    /// End time (RFC 3339, exclusive)
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
}

/// Narrows a lookup by event id to one device
#[derive(Debug, Default, Deserialize)]
pub struct CameraFilter {
    pub camera_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<EventRecord>,
    pub total_count: u64,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct ImageUrlResponse {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub event: EventRecord,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/events/:event_id", get(get_event))
        .route("/api/v1/events/:event_id/image-url", get(get_image_url))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "event-ingest"
    }))
}

/// Ready once both the registry and the analytics store answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let registry = sqlx::query("SELECT 1")
        .fetch_one(state.registry.pool())
        .await
        .map(|_| ())
        .map_err(|e| e.to_string());
    let analytics = state.event_store.ping().await.map_err(|e| e.to_string());

    let connection = |r: &Result<(), String>| {
        if r.is_ok() {
            "connected"
        } else {
            "disconnected"
        }
    };

    let ready = registry.is_ok() && analytics.is_ok();
    let body = serde_json::json!({
        "status": if ready { "ready" } else { "not_ready" },
        "registry": connection(&registry),
        "analytics": connection(&analytics),
        "errors": ([registry.err(), analytics.err()].into_iter().flatten().collect::<Vec<_>>()),
    });

    if ready {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// List events, newest first
#[instrument(skip(state))]
async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventListQuery>,
) -> Result<Json<EventListResponse>, ApiError> {
    let limit = clamp_limit(params.limit);
    let mut query = EventQuery {
        camera_id: params.camera_id,
        start_time: params.start_time,
        end_time: params.end_time,
        limit: Some(limit + 1), // Fetch one extra to check has_more
        offset: Some(params.offset),
        ..Default::default()
    };

    let mut events = state.event_store.query_events(&query).await.map_err(|e| {
        error!(error = %e, "Failed to query events");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to query events",
            "QUERY_ERROR",
        )
    })?;

    let has_more = events.len() as u64 > limit;
    events.truncate(limit as usize);

    query.limit = None;
    query.offset = None;
    let total_count = match state.event_store.count_events(&query).await {
        Ok(total) => total,
        Err(e) => {
            error!(error = %e, "Failed to count events");
            0
        }
    };

    Ok(Json(EventListResponse {
        events,
        total_count,
        has_more,
    }))
}

/// Records with the given event id
#[instrument(skip(state))]
async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Query(filter): Query<CameraFilter>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let events = find_events(&state, event_id, filter).await?;

    if events.is_empty() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "Event not found",
            "NOT_FOUND",
        ));
    }

    Ok(Json(events))
}

/// Presigned URL for an event's image
#[instrument(skip(state))]
async fn get_image_url(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Query(filter): Query<CameraFilter>,
) -> Result<Json<ImageUrlResponse>, ApiError> {
    let event = find_events(&state, event_id, filter)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Event not found", "NOT_FOUND"))?;

    let (url, expires_at) = state
        .object_store
        .presigned_get(&event.image_path, state.presigned_url_expiry)
        .await
        .map_err(|e| {
            error!(error = %e, image_path = %event.image_path, "Failed to generate presigned URL");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate presigned URL",
                "PRESIGN_ERROR",
            )
        })?;

    Ok(Json(ImageUrlResponse {
        url,
        expires_at,
        event,
    }))
}

async fn find_events(
    state: &AppState,
    event_id: String,
    filter: CameraFilter,
) -> Result<Vec<EventRecord>, ApiError> {
    let query = EventQuery {
        camera_id: filter.camera_id,
        event_id: Some(event_id),
        limit: Some(MAX_LIMIT),
        ..Default::default()
    };

    state.event_store.query_events(&query).await.map_err(|e| {
        error!(error = %e, "Failed to query event");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to query event",
            "QUERY_ERROR",
        )
    })
}

fn clamp_limit(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Serve the read-side API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting event API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
