//! `reqwest`-backed [`ImageTransport`].

use async_trait::async_trait;
use log::{info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use std::time::Duration;

use super::{ImageTransport, TransportError};
use crate::common::config::ApiConfig;
use crate::processing::ImagePayload;

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

pub const UPLOAD_PATH: &str = "img";
pub const ENGRAVE_PATH: &str = "engrave";
pub const HEALTHCHECK_PATH: &str = "healthcheck";

/// HTTP client for the processing service.
///
/// No retries happen here; a failed call is reported once and the user decides
/// whether to try again.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    /// # Arguments
    ///
    /// * `base_url` - Service root, e.g. "http://127.0.0.1:8080"
    /// * `timeout` - Applied to every request
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        // A trailing slash makes `join` append instead of replacing the last segment
        let normalised = format!("{}/", base_url.trim_end_matches('/'));
        let base_url =
            Url::parse(&normalised).map_err(|_| TransportError::InvalidUrl(base_url.to_string()))?;

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, TransportError> {
        Self::new(
            &config.base_url,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|_| TransportError::InvalidUrl(format!("{}{}", self.base_url, path)))
    }
}

fn check_status(endpoint: &Url, response: Response) -> Result<(), TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        warn!("❌ {} answered {}", endpoint, status);
        Err(TransportError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl ImageTransport for HttpTransport {
    async fn upload(&self, payload: ImagePayload) -> Result<(), TransportError> {
        let url = self.endpoint(UPLOAD_PATH)?;
        info!(
            "📤 Uploading '{}' ({} bytes) to {}",
            payload.file_name,
            payload.len(),
            url
        );

        let part = Part::bytes(payload.bytes)
            .file_name(payload.file_name)
            .mime_str(ImagePayload::MIME_TYPE)?;
        let form = Form::new().part(IMAGE_FIELD, part);

        let response = self.client.post(url.clone()).multipart(form).send().await?;
        check_status(&url, response)
    }

    async fn trigger_engrave(&self) -> Result<(), TransportError> {
        let url = self.endpoint(ENGRAVE_PATH)?;
        info!("🔥 Requesting engrave at {}", url);

        let response = self.client.get(url.clone()).send().await?;
        check_status(&url, response)
    }

    async fn healthcheck(&self) -> Result<(), TransportError> {
        let url = self.endpoint(HEALTHCHECK_PATH)?;
        let response = self.client.get(url.clone()).send().await?;
        check_status(&url, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_append_to_base_path() {
        let transport = HttpTransport::new("http://10.0.0.2:8080/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.endpoint(UPLOAD_PATH).unwrap().as_str(),
            "http://10.0.0.2:8080/api/img"
        );

        let transport = HttpTransport::new("http://10.0.0.2:8080", Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.endpoint(ENGRAVE_PATH).unwrap().as_str(),
            "http://10.0.0.2:8080/engrave"
        );
    }

    #[test]
    fn test_rejects_garbage_url() {
        assert!(matches!(
            HttpTransport::new("not a url", Duration::from_secs(1)),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(&format!("http://{}", address), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            transport.trigger_engrave().await,
            Err(TransportError::Request(_))
        ));
    }
}
