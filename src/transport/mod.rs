//! # Transport Client
//!
//! HTTP calls to the processing service: the multipart image upload, the
//! engrave trigger and a health probe.
//!
//! The [`ImageTransport`] trait is the seam the upload coordinator and the
//! result correlator depend on; [`HttpTransport`] is the `reqwest` implementation.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::processing::ImagePayload;

pub use http::HttpTransport;

/// Any failure of a transport call. Callers treat every variant as terminal for the attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection, I/O, timeout or request-building failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The service answered with a non-2xx status.
    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },
    #[error("invalid service url '{0}'")]
    InvalidUrl(String),
}

/// Calls into the remote processing service.
#[async_trait]
pub trait ImageTransport: Send + Sync {
    /// `POST /img` with the payload as the multipart field `image`.
    async fn upload(&self, payload: ImagePayload) -> Result<(), TransportError>;

    /// Ask the service to start engraving the last processed image.
    async fn trigger_engrave(&self) -> Result<(), TransportError>;

    /// `GET /healthcheck`.
    async fn healthcheck(&self) -> Result<(), TransportError>;
}
