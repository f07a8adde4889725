use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Json, State},
    http::{header, Method, StatusCode},
    routing::{get, post},
    Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use quote_generator::QuoteGenerator;
use quote_pipeline::{PipelineError, QuoteOrchestrator, RunState};
use symbol_detector::{ImageReference, SymbolDetector};

type Orchestrator = QuoteOrchestrator<SymbolDetector, QuoteGenerator>;

/// Shared application state. The orchestrator is the single writer of the
/// run state; the watch receiver lets progress reads bypass the lock while
/// a run holds it.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Mutex<Orchestrator>>,
    progress: watch::Receiver<RunState>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

fn error_response(
    status: StatusCode,
    error: &str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct UploadImageRequest {
    /// Base64-encoded floor-plan image, with or without a data URI prefix
    image: String,
}

async fn upload_image_handler(
    State(state): State<AppState>,
    Json(payload): Json<UploadImageRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    info!("Received image upload request");

    let encoded = payload
        .image
        .rsplit_once("base64,")
        .map(|(_, rest)| rest)
        .unwrap_or(payload.image.as_str());

    let image_bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| {
            warn!("Failed to decode base64 image: {}", e);
            error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_IMAGE",
                format!("Failed to decode base64 image: {}", e),
            )
        })?;

    info!("Image decoded, size: {} bytes", image_bytes.len());

    let reference = ImageReference::from_image_bytes(&image_bytes).map_err(|e| {
        warn!("Rejected upload: {}", e);
        error_response(StatusCode::BAD_REQUEST, "INVALID_IMAGE", e.to_string())
    })?;

    let mut orchestrator = state.orchestrator.try_lock().map_err(|_| {
        error_response(
            StatusCode::CONFLICT,
            "RUN_IN_PROGRESS",
            "Please wait for the previous detection to complete",
        )
    })?;

    orchestrator.select_image(reference);

    Ok(Json(serde_json::json!({
        "size_bytes": image_bytes.len(),
        "state": orchestrator.state(),
    })))
}

async fn detect_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let mut orchestrator = state.orchestrator.try_lock().map_err(|_| {
        error_response(
            StatusCode::CONFLICT,
            "RUN_IN_PROGRESS",
            "A detection run is already in progress",
        )
    })?;

    let outcome = orchestrator.run().await;
    let notices = orchestrator.drain_notices();

    match outcome {
        Ok(()) => Ok(Json(serde_json::json!({
            "state": orchestrator.state(),
            "notices": notices,
            "tally": orchestrator.tally(),
            "quote": orchestrator.quote(),
        }))),
        Err(e) => {
            let (status, code) = match &e {
                PipelineError::NoImageSelected => (StatusCode::BAD_REQUEST, "NO_IMAGE"),
                PipelineError::RunInProgress => (StatusCode::CONFLICT, "RUN_IN_PROGRESS"),
                PipelineError::Detection(_) => (StatusCode::BAD_GATEWAY, "DETECTION_FAILED"),
                PipelineError::Quote(_) => (StatusCode::BAD_GATEWAY, "QUOTE_FAILED"),
            };
            Err(error_response(status, code, e.to_string()))
        }
    }
}

async fn progress_handler(State(state): State<AppState>) -> Json<RunState> {
    Json(state.progress.borrow().clone())
}

async fn results_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let orchestrator = state.orchestrator.try_lock().map_err(|_| {
        error_response(
            StatusCode::CONFLICT,
            "RUN_IN_PROGRESS",
            "A detection run is already in progress",
        )
    })?;

    // The annotated render is passed through exactly as the workflow
    // returned it; consumers treat an absent value as "nothing to show".
    let annotated_image = orchestrator.detection().and_then(|detection| {
        detection
            .outputs
            .first()
            .and_then(|output| output.output_image.as_ref())
            .and_then(|image| image.value.clone())
    });

    Ok(Json(serde_json::json!({
        "state": orchestrator.state(),
        "tally": orchestrator.tally(),
        "quote": orchestrator.quote(),
        "annotated_image": annotated_image,
    })))
}

fn create_app(state: AppState) -> Router {
    // Configure CORS from environment or use localhost for development
    let allowed_origins = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:8080,http://127.0.0.1:8080".to_string());

    let origins: Vec<_> = allowed_origins
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    let cors = if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/upload-image", post(upload_image_handler))
        .route("/detect", post(detect_handler))
        .route("/progress", get(progress_handler))
        .route("/results", get(results_handler))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10MB max for images
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Symbol Quotation Backend Server");

    let detector = match SymbolDetector::from_env() {
        Ok(detector) => detector,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let quoter = match QuoteGenerator::from_env() {
        Ok(quoter) => quoter,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let orchestrator = QuoteOrchestrator::new(detector, quoter);
    let progress = orchestrator.watch_progress();
    let state = AppState {
        orchestrator: Arc::new(Mutex::new(orchestrator)),
        progress,
    };

    let app = create_app(state);

    let addr = "0.0.0.0:3000";
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
