use crate::config::ApiConfig;
use crate::metadata_store::{MetadataRecord, MetadataStore};
use crate::topology::Topology;
use album_pipeline::event::{EventKind, ImageEvent, Payload, COMMENT_TYPE, DESCRIPTION, UPDATE_TABLE};
use album_pipeline::producer::{EventPublisher, PublishSummary, StorageNotification};
use album_pipeline::queue::QueueStats;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<EventPublisher>,
    pub store: Arc<dyn MetadataStore>,
    pub topology: Arc<Topology>,
}

/// Body of an image metadata update
#[derive(Debug, Default, Deserialize)]
pub struct UpdateImageRequest {
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpdateAccepted {
    pub image_name: String,
    pub deliveries: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageAccepted {
    pub queue: String,
    pub message_id: Uuid,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
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
        .route("/api/v1/notifications/storage", post(ingest_notification))
        .route("/api/v1/images/:image_name", get(get_image).put(update_image))
        .route("/api/v1/queues", get(queue_stats))
        .route("/api/v1/queues/:queue/messages", post(inject_message))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "album-storage"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept a storage notification and publish its records
#[instrument(skip(state, notification), fields(records = notification.records.len()))]
async fn ingest_notification(
    State(state): State<AppState>,
    Json(notification): Json<StorageNotification>,
) -> (StatusCode, Json<PublishSummary>) {
    let summary = state.publisher.publish_notification(&notification).await;
    (StatusCode::ACCEPTED, Json(summary))
}

/// Publish a metadata update for an image
#[instrument(skip(state, request))]
async fn update_image(
    State(state): State<AppState>,
    Path(image_name): Path<String>,
    request: Option<Json<UpdateImageRequest>>,
) -> Result<(StatusCode, Json<UpdateAccepted>), ApiError> {
    if image_name.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Image name is empty",
            "INVALID_IMAGE_NAME",
        ));
    }

    let Json(request) = request.unwrap_or_default();

    let mut event =
        ImageEvent::new(EventKind::Updated, image_name.clone()).with_attribute(COMMENT_TYPE, UPDATE_TABLE);
    if let Some(description) = request.description {
        event = event.with_attribute(DESCRIPTION, description);
    }

    let reports = state.publisher.publish(&event).await;
    let deliveries = reports.iter().map(|r| r.delivered.len()).sum();

    Ok((
        StatusCode::ACCEPTED,
        Json(UpdateAccepted {
            image_name,
            deliveries,
        }),
    ))
}

#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(image_name): Path<String>,
) -> Result<Json<MetadataRecord>, ApiError> {
    let record = state.store.get(&image_name).await.map_err(|e| {
        error!(error = %e, "Failed to get image");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get image",
            "QUERY_ERROR",
        )
    })?;

    record
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Image not found", "NOT_FOUND"))
}

async fn queue_stats(State(state): State<AppState>) -> Json<Vec<QueueStats>> {
    Json(state.topology.stats())
}

/// Put an arbitrary message on an event queue
#[instrument(skip(state, body))]
async fn inject_message(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<MessageAccepted>), ApiError> {
    let target = state
        .topology
        .event_queue(&queue)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Queue not found", "NOT_FOUND"))?;

    let message_id = target.enqueue(Payload::from_value(body));

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageAccepted { queue, message_id }),
    ))
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
