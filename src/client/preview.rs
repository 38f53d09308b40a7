//! # Result Correlator
//!
//! Correlates the processed image published on the broker with the screen that
//! asked for it, and triggers engraving once the user confirms.
//!
//! ```text
//! Loading ──valid image──▶ Success(image) ──engrave fails──▶ Error
//!    └──── bad payload / subscribe failure ──▶ Error
//! ```
//!
//! Only the first message decides the outcome; anything arriving after a
//! terminal state is ignored. A failed engrave overwrites the state with
//! `Error`, but the received image stays available through
//! [`ResultCorrelator::received_image`] so the engrave can be retried.
//!
//! The broker handler only queues payloads. They are decoded on a blocking
//! thread by a task the correlator owns, so the channel's reader never waits
//! on an image decode.

use image::{DynamicImage, GenericImageView};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::mqtt::{Message, MessageHandler, NotificationChannel, QoS, SubscriptionId};
use crate::processing::decode_image;
use crate::transport::{ImageTransport, TransportError};

/// What the preview screen shows.
#[derive(Debug, Clone)]
pub enum EngraverPreviewState {
    Loading,
    Error,
    Success(Arc<DynamicImage>),
}

impl EngraverPreviewState {
    pub fn is_loading(&self) -> bool {
        matches!(self, EngraverPreviewState::Loading)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_loading()
    }

    pub fn image(&self) -> Option<&Arc<DynamicImage>> {
        match self {
            EngraverPreviewState::Success(image) => Some(image),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("preview was shut down")]
    Cancelled,
}

/// State holder shared by the broker handler and the decode task.
struct PreviewSink {
    state: watch::Sender<EngraverPreviewState>,
    received: Mutex<Option<Arc<DynamicImage>>>,
}

impl PreviewSink {
    fn new() -> Self {
        let (state, _) = watch::channel(EngraverPreviewState::Loading);
        Self {
            state,
            received: Mutex::new(None),
        }
    }

    fn is_settled(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Apply a decode result unless something settled the preview first.
    fn settle(&self, decoded: anyhow::Result<DynamicImage>) {
        let next = match decoded {
            Ok(image) => {
                let (width, height) = image.dimensions();
                info!("✅ Preview image received ({}x{})", width, height);
                EngraverPreviewState::Success(Arc::new(image))
            }
            Err(e) => {
                warn!("❌ Error when parsing preview image: {:#}", e);
                EngraverPreviewState::Error
            }
        };

        let applied = self.state.send_if_modified(|state| {
            if !state.is_loading() {
                return false;
            }
            if let Some(image) = next.image() {
                *self.received() = Some(image.clone());
            }
            *state = next;
            true
        });
        if !applied {
            debug!("Preview already settled, dropping late result");
        }
    }

    fn fail(&self) {
        self.state.send_replace(EngraverPreviewState::Error);
    }

    fn received(&self) -> std::sync::MutexGuard<'_, Option<Arc<DynamicImage>>> {
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Broker handler that only queues the payload for [`decode_previews`].
fn preview_handler(
    sink: Arc<PreviewSink>,
    payloads: mpsc::UnboundedSender<Vec<u8>>,
) -> MessageHandler {
    Arc::new(move |message: &Message| {
        if sink.is_settled() {
            debug!(
                "Ignoring {} byte preview, result already settled",
                message.payload.len()
            );
            return;
        }
        if payloads.send(message.payload.clone()).is_err() {
            debug!("Preview decoder stopped, dropping {} bytes", message.payload.len());
        }
    })
}

/// Decode queued payloads in arrival order until cancelled or the handler is dropped.
async fn decode_previews(
    sink: Arc<PreviewSink>,
    mut payloads: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            payload = payloads.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
        };

        if sink.is_settled() {
            continue;
        }

        let decoded = tokio::task::spawn_blocking(move || decode_image(&payload))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|decoded| decoded.map_err(anyhow::Error::from));
        sink.settle(decoded);
    }
}

/// Listens for the processed image on the shared channel and drives [`EngraverPreviewState`].
pub struct ResultCorrelator {
    sink: Arc<PreviewSink>,
    channel: NotificationChannel,
    transport: Arc<dyn ImageTransport>,
    topic: String,
    subscription: Mutex<Option<SubscriptionId>>,
    cancel: CancellationToken,
}

impl ResultCorrelator {
    /// Subscribe to `topic` (QoS 1) and start in `Loading`.
    ///
    /// A failed subscription (including a disconnected channel) leaves the
    /// correlator in `Error` rather than failing construction.
    pub async fn start(
        channel: NotificationChannel,
        transport: Arc<dyn ImageTransport>,
        topic: impl Into<String>,
    ) -> Self {
        Self::start_with_token(channel, transport, topic.into(), CancellationToken::new()).await
    }

    /// Same as [`start`](Self::start), with decoding and engrave calls stopped when `parent` is.
    pub async fn start_scoped(
        channel: NotificationChannel,
        transport: Arc<dyn ImageTransport>,
        topic: impl Into<String>,
        parent: &CancellationToken,
    ) -> Self {
        Self::start_with_token(channel, transport, topic.into(), parent.child_token()).await
    }

    async fn start_with_token(
        channel: NotificationChannel,
        transport: Arc<dyn ImageTransport>,
        topic: String,
        cancel: CancellationToken,
    ) -> Self {
        let sink = Arc::new(PreviewSink::new());

        let (payloads, queued) = mpsc::unbounded_channel();
        tokio::spawn(decode_previews(sink.clone(), queued, cancel.clone()));
        let handler = preview_handler(sink.clone(), payloads);

        let subscription = match channel.subscribe(&topic, QoS::AtLeastOnce, handler).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("❌ Failed to subscribe to '{}': {}", topic, e);
                sink.fail();
                None
            }
        };

        Self {
            sink,
            channel,
            transport,
            topic,
            subscription: Mutex::new(subscription),
            cancel,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> watch::Receiver<EngraverPreviewState> {
        self.sink.state.subscribe()
    }

    pub fn current_state(&self) -> EngraverPreviewState {
        self.sink.state.borrow().clone()
    }

    /// The last image received, kept even if an engrave failure overwrote the state.
    pub fn received_image(&self) -> Option<Arc<DynamicImage>> {
        self.sink.received().clone()
    }

    /// Wait until the preview is `Success` or `Error`.
    pub async fn wait_for_result(&self) -> EngraverPreviewState {
        let mut state = self.state();
        let settled = state.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
        settled.unwrap_or_else(|_| self.current_state())
    }

    /// Ask the service to engrave the previewed image.
    ///
    /// # Errors
    ///
    /// On a transport failure the state becomes `Error` and the error is returned.
    pub async fn engrave_image(&self) -> Result<(), PreviewError> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PreviewError::Cancelled),
            result = self.transport.trigger_engrave() => result,
        };

        match result {
            Ok(()) => {
                info!("✅ Engrave started");
                Ok(())
            }
            Err(e) => {
                error!("❌ Engrave request failed: {}", e);
                self.sink.fail();
                Err(e.into())
            }
        }
    }

    /// Cancel outstanding work and drop the subscription from the channel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let subscription = self.take_subscription();
        if let Some(id) = subscription {
            if let Err(e) = self.channel.remove_subscription(id).await {
                warn!("⚠️  Could not unsubscribe from '{}': {}", self.topic, e);
            }
        }
    }

    fn take_subscription(&self) -> Option<SubscriptionId> {
        self.subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for ResultCorrelator {
    fn drop(&mut self) {
        self.cancel.cancel();

        if let Some(id) = self.take_subscription() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let channel = self.channel.clone();
                runtime.spawn(async move {
                    let _ = channel.remove_subscription(id).await;
                });
            }
        }
    }
}
