use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error};

use crate::engine::{Engine, FilterCriteria};

pub struct AppState {
    pub engine: Arc<Engine>,
}

// Custom error type
pub enum AppError {
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("{} not found", what) })),
            )
                .into_response(),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("Error: {}", err) })),
            )
                .into_response(),
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError::Internal(err.into())
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/health", get(health))
        .route("/api/snapshot", get(snapshot))
        .route("/api/analytics", get(analytics))
        .route("/api/sentiment", get(sentiment))
        .route("/api/filter", get(filter))
        .route("/api/sources", get(sources))
        .route("/api/sources/:id", get(source))
        .route("/api/status", get(status))
        .route("/api/refresh", post(refresh))
        .route("/ws", get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// Route handlers
pub async fn health() -> impl IntoResponse {
    "OK"
}

pub async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.engine.get_snapshot().await;
    Json(snapshot.as_ref()).into_response()
}

pub async fn analytics(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.engine.get_snapshot().await;
    Json(&snapshot.analytics).into_response()
}

pub async fn sentiment(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.engine.get_snapshot().await;
    Json(&snapshot.analytics.sentiment).into_response()
}

pub async fn filter(
    State(state): State<Arc<AppState>>,
    Query(criteria): Query<FilterCriteria>,
) -> Response {
    let items = state.engine.filter(&criteria).await;
    Json(items.as_ref()).into_response()
}

pub async fn sources(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.sources().await)
}

pub async fn source(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let source = state
        .engine
        .source(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Source '{}'", id)))?;

    Ok(Json(source))
}

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.status().await)
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Don't wait for the cycle
    let started = state.engine.trigger_refresh().is_some();

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "refreshing", "started": started })),
    )
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| stream_snapshots(socket, engine))
}

/// Forward every snapshot pushed to this subscriber as one JSON text frame.
async fn stream_snapshots(mut socket: WebSocket, engine: Arc<Engine>) {
    let mut subscription = engine.subscribe().await;

    loop {
        tokio::select! {
            pushed = subscription.recv() => {
                let Some(snapshot) = pushed else {
                    debug!("Subscriber {} was dropped by the hub", subscription.id);
                    break;
                };
                let text = match serde_json::to_string(snapshot.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize snapshot: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    engine.unsubscribe(subscription.id).await;
}
