//! # Upload Coordinator
//!
//! Owns the lifecycle of one image upload:
//!
//! ```text
//! Idle ──process_*()──▶ Loading ──upload ok──▶ Success
//!                          └────── any failure ──▶ Error
//! ```
//!
//! ## Workflow
//!
//! 1. Claim the in-flight slot (a second call while one runs is rejected)
//! 2. Publish `Loading`
//! 3. On a blocking thread: decode if needed, rescale to the bounds, encode PNG
//! 4. Hand the [`ImagePayload`] to the transport
//! 5. Publish `Success` or `Error`, release the slot
//!
//! Decoding, resizing and the HTTP call share one failure path: whatever goes
//! wrong is logged and surfaces as `Error`. There is no automatic retry; the
//! caller starts a fresh attempt.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let coordinator = UploadCoordinator::new(transport, ImageBounds::default(), "imageCapture.png");
//! let mut state = coordinator.state();
//!
//! coordinator.process_file("photo.jpg")?;
//! state.wait_for(|s| s.is_terminal()).await?;
//! ```

use anyhow::Result;
use image::DynamicImage;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::config::ImageConfig;
use crate::processing::{decode_image, ImageBounds, ImagePayload};
use crate::transport::ImageTransport;

/// State of the current (or last) upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Loading,
    Success,
    Error,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Success | UploadState::Error)
    }
}

/// Reasons a `process_*` call is refused before anything starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("an upload is already in flight")]
    AlreadyInFlight,
    #[error("upload coordinator has been shut down")]
    ShutDown,
    #[error("uploads must be started from within a tokio runtime")]
    NoRuntime,
}

/// Where the image comes from.
enum Source {
    /// Camera capture, already decoded
    Image(DynamicImage),
    /// Gallery or share-intent bytes in any supported format
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Single-slot in-flight guard, released on drop.
struct InFlightToken(Arc<AtomicBool>);

impl InFlightToken {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives image uploads for one screen and publishes [`UploadState`].
pub struct UploadCoordinator {
    transport: Arc<dyn ImageTransport>,
    bounds: ImageBounds,
    file_name: String,
    state: Arc<watch::Sender<UploadState>>,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl UploadCoordinator {
    /// # Arguments
    ///
    /// * `transport` - Where payloads are sent
    /// * `bounds` - Bounding box the image is rescaled into
    /// * `file_name` - Name of the multipart file part
    pub fn new(
        transport: Arc<dyn ImageTransport>,
        bounds: ImageBounds,
        file_name: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(UploadState::Idle);
        Self {
            transport,
            bounds,
            file_name: file_name.into(),
            state: Arc::new(state),
            in_flight: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(transport: Arc<dyn ImageTransport>, config: &ImageConfig) -> Self {
        Self::new(
            transport,
            ImageBounds::from(config),
            config.upload_file_name.clone(),
        )
    }

    /// Tie this coordinator's work to an outer cancellation scope.
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn state(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> UploadState {
        *self.state.borrow()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Upload a camera capture.
    ///
    /// The returned handle resolves to the terminal state of this attempt.
    /// Called outside a tokio runtime it fails with [`UploadError::NoRuntime`]
    /// and leaves the state untouched.
    pub fn process_image(&self, image: DynamicImage) -> Result<JoinHandle<UploadState>, UploadError> {
        self.start(Source::Image(image))
    }

    /// Upload encoded image bytes (gallery or share intent). Undecodable bytes end in `Error`.
    pub fn process_bytes(&self, raw: Vec<u8>) -> Result<JoinHandle<UploadState>, UploadError> {
        self.start(Source::Bytes(raw))
    }

    /// Upload an image file from disk. Read or decode failures end in `Error`.
    pub fn process_file(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<JoinHandle<UploadState>, UploadError> {
        self.start(Source::File(path.into()))
    }

    /// Cancel the in-flight upload, if any, and refuse further work.
    ///
    /// A cancelled attempt keeps whatever state it had; nobody is left to observe it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn start(&self, source: Source) -> Result<JoinHandle<UploadState>, UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::ShutDown);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            warn!("⚠️  Upload rejected: no tokio runtime to run it on");
            UploadError::NoRuntime
        })?;

        let token = InFlightToken::acquire(&self.in_flight).ok_or_else(|| {
            warn!("⚠️  Upload rejected: another upload is still in flight");
            UploadError::AlreadyInFlight
        })?;

        self.state.send_replace(UploadState::Loading);

        let transport = self.transport.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let bounds = self.bounds;
        let file_name = self.file_name.clone();

        Ok(runtime.spawn(async move {
            let _token = token;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Upload cancelled");
                    return *state.borrow();
                }
                outcome = run_upload(transport.as_ref(), source, bounds, file_name) => outcome,
            };

            let next = match outcome {
                Ok(()) => {
                    info!("✅ Image sent for processing");
                    UploadState::Success
                }
                Err(e) => {
                    error!("❌ Error while sending the image: {:#}", e);
                    UploadState::Error
                }
            };
            state.send_replace(next);
            next
        }))
    }
}

impl Drop for UploadCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_upload(
    transport: &dyn ImageTransport,
    source: Source,
    bounds: ImageBounds,
    file_name: String,
) -> Result<()> {
    let payload =
        tokio::task::spawn_blocking(move || prepare_payload(source, bounds, file_name)).await??;
    transport.upload(payload).await?;
    Ok(())
}

fn prepare_payload(source: Source, bounds: ImageBounds, file_name: String) -> Result<ImagePayload> {
    let image = match source {
        Source::Image(image) => image,
        Source::Bytes(raw) => decode_image(&raw)?,
        Source::File(path) => {
            let raw = std::fs::read(&path)
                .map_err(|e| anyhow::anyhow!("Could not read {}: {}", path.display(), e))?;
            decode_image(&raw)?
        }
    };

    Ok(ImagePayload::from_image(&image, bounds, file_name)?)
}
