use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    connection::ws_handler,
    hub::HubHandle,
    settings::{HubSettings, SharedSettings},
};

pub struct AppState {
    pub hub: HubHandle,
    pub settings: SharedSettings,
    pub metrics: PrometheusHandle,
    pub subscriber_buffer: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/health", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/settings",
            get(get_settings).post(save_settings).put(save_settings),
        )
        .route("/ws/blocks", get(ws_handler))
        .route("/api/ws/blocks", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Some(stats) => Json(stats).into_response(),
        None => ApiError::Unavailable("hub is not running").into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<HubSettings> {
    Json(state.settings.snapshot())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsInput {
    node_url: Option<String>,
}

async fn save_settings(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SettingsInput>,
) -> Result<Json<HubSettings>, ApiError> {
    let node_url = input
        .node_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::BadRequest("nodeUrl is required".into()))?;

    let updated = state.settings.set_node_url(node_url);
    info!(node_url = %updated.node_url, "node URL updated; applies on next upstream session");
    Ok(Json(updated))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(&'static str),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                message.to_string(),
            ),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}
