pub mod client;
pub mod common;
pub mod mqtt;
pub mod processing;
pub mod service;
pub mod transport;

pub use client::{EngraverPreviewState, ResultCorrelator, UploadCoordinator, UploadState};
pub use common::config::AppConfig;
pub use mqtt::NotificationChannel;
