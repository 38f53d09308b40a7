use axum::{
    extract::{multipart::Multipart, DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::mqtt::{NotificationChannel, QoS};
use crate::processing::{decode_image, encode_png};
use crate::transport::http::IMAGE_FIELD;

/// Uploads larger than this are rejected before they reach the handler.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    message: String,
    bytes_published: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Shared state of the stub service.
pub struct StubState {
    channel: NotificationChannel,
    topic: String,
    engrave_requests: AtomicUsize,
}

impl StubState {
    /// `channel` must be connected before the first upload arrives.
    pub fn new(channel: NotificationChannel, topic: impl Into<String>) -> Self {
        Self {
            channel,
            topic: topic.into(),
            engrave_requests: AtomicUsize::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of `GET /engrave` calls served so far.
    pub fn engrave_requests(&self) -> usize {
        self.engrave_requests.load(Ordering::SeqCst)
    }
}

/// Routes: `POST /img`, `GET /engrave`, `GET /healthcheck`.
pub fn router(state: Arc<StubState>) -> Router {
    Router::new()
        .route("/img", post(process_image_handler))
        .route("/engrave", get(engrave_handler))
        .route("/healthcheck", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Serve the stub on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: Arc<StubState>) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("🌐 Engraver stub running on http://{}", addr);
    info!("📡 Publishing results on '{}'", state.topic());

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lasercraft-engraver-stub",
    }))
}

async fn engrave_handler(State(state): State<Arc<StubState>>) -> impl IntoResponse {
    let count = state.engrave_requests.fetch_add(1, Ordering::SeqCst) + 1;
    info!("🔥 Engrave requested (#{})", count);

    Json(serde_json::json!({
        "status": "engraving",
    }))
}

async fn process_image_handler(
    State(state): State<Arc<StubState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut image_data: Option<Vec<u8>> = None;
    let mut filename = String::from("imageCapture.png");

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Failed to read multipart data: {}", e),
        )
    })? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        if let Some(name) = field.file_name() {
            filename = name.to_string();
        }
        let data = field.bytes().await.map_err(|e| {
            api_error(
                StatusCode::BAD_REQUEST,
                format!("Failed to read image data: {}", e),
            )
        })?;
        image_data = Some(data.to_vec());
    }

    let image_data =
        image_data.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "No image provided"))?;

    info!("📤 Received image: {} ({} bytes)", filename, image_data.len());

    let png = tokio::task::spawn_blocking(move || {
        let image = decode_image(&image_data)?;
        encode_png(&image)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| {
        error!("❌ Uploaded image could not be decoded: {}", e);
        api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Invalid image: {}", e),
        )
    })?;

    let size = png.len();
    state
        .channel
        .publish(&state.topic, png, QoS::AtLeastOnce, false)
        .await
        .map_err(|e| {
            error!("❌ Failed to publish result: {}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to publish result: {}", e),
            )
        })?;

    info!("✅ Published {} byte result on '{}'", size, state.topic);

    Ok((
        StatusCode::OK,
        Json(UploadResponse {
            success: true,
            message: format!("Processed {}", filename),
            bytes_published: size,
        }),
    ))
}
