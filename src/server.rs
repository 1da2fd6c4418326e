//! HTTP surface: `POST /parse-pdf/` and `GET /health`.
//!
//! The handler downloads the document to a temporary file, converts it with
//! a per-request [`Converter`] and always removes the file afterwards. The
//! loaded artifacts are shared through the router state; each request gets
//! its own clone, so one request's LLM service never leaks into another.

use crate::config::{ConversionOptions, RequestDefaults};
use crate::convert::Converter;
use crate::error::{ConvertError, ErrorClass};
use crate::pipeline::input;
use crate::pipeline::ArtifactBag;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// State shared by every request.
#[derive(Clone)]
pub struct ServerState {
    pub artifacts: ArtifactBag,
    pub defaults: Arc<RequestDefaults>,
    pub download_timeout_secs: u64,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            artifacts: ArtifactBag::with_default_models(),
            defaults: Arc::new(RequestDefaults::default()),
            download_timeout_secs: 60,
        }
    }
}

/// Body of `POST /parse-pdf/`.
#[derive(Debug, Deserialize)]
pub struct ParseRequest {
    pub file_url: String,
    #[serde(default)]
    pub optional_config: ConversionOptions,
}

/// A failed request: status plus a `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ConvertError> for ApiError {
    fn from(e: ConvertError) -> Self {
        let status = match e.class() {
            ErrorClass::Client => StatusCode::BAD_REQUEST,
            ErrorClass::Server => {
                error!("Conversion failed: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/parse-pdf/", post(parse_pdf))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: &str, state: ServerState) -> Result<(), std::io::Error> {
    info!("Starting docpipe server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state)).await
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn parse_pdf(
    State(state): State<ServerState>,
    Json(request): Json<ParseRequest>,
) -> Result<Json<Value>, ApiError> {
    if !input::is_url(&request.file_url) {
        return Err(ConvertError::config(format!(
            "file_url must be an http(s) URL, got '{}'",
            request.file_url
        ))
        .into());
    }

    let config = request.optional_config.into_config(&state.defaults)?;
    let converter = Converter::new(config, state.artifacts.clone())?;

    let mut file = input::download(&request.file_url, state.download_timeout_secs, true).await?;
    let result = converter.convert_input(&file).await;
    file.cleanup();

    let result = result?;
    serde_json::to_value(&result)
        .map(Json)
        .map_err(|e| {
            warn!("Could not serialise render result: {}", e);
            ConvertError::Internal(e.to_string()).into()
        })
}
