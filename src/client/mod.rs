//! # Hand-off Components
//!
//! The two state machines a screen observes during an image hand-off:
//!
//! ## Upload Coordinator ([`upload`])
//! Rescales and encodes the captured or picked image, uploads it through the
//! transport and publishes Idle → Loading → {Success | Error}.
//!
//! ## Result Correlator ([`preview`])
//! Waits on the notification channel for the processed image, decodes it and
//! publishes Loading → {Success(image) | Error}; also triggers engraving.
//!
//! The two complete independently. Nothing orders the upload response
//! against the broker notification; a caller that needs both waits on both.

pub mod preview;
pub mod upload;

pub use preview::{EngraverPreviewState, PreviewError, ResultCorrelator};
pub use upload::{UploadCoordinator, UploadError, UploadState};
