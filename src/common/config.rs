//! # Configuration Utilities
//!
//! Configuration structures for the hand-off client and the stub service,
//! plus the TOML loader and environment overrides.
//!
//! Every field has a built-in default, so an empty TOML file (or no file at all)
//! yields a working local setup: API on `http://127.0.0.1:8080`, broker on
//! `tcp://127.0.0.1:1883`, receive topic `laser_engraver_img`.
//!
//! # Example TOML
//!
//! ```toml
//! [api]
//! base_url = "http://192.168.1.20:8080"
//!
//! [mqtt]
//! broker_url = "tcp://192.168.1.20:1883"
//! client_id_prefix = "lasercraft-"
//! receive_topic = "laser_engraver_img"
//!
//! [image]
//! max_width = 1280
//! max_height = 720
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

/// Environment variable overriding [`ApiConfig::base_url`].
pub const ENV_API_URL: &str = "LASERCRAFT_API_URL";
/// Environment variable overriding [`MqttConfig::broker_url`].
pub const ENV_MQTT_BROKER_URL: &str = "LASERCRAFT_MQTT_BROKER_URL";
/// Environment variable overriding [`MqttConfig::client_id_prefix`].
pub const ENV_MQTT_CLIENT_ID_PREFIX: &str = "LASERCRAFT_MQTT_CLIENT_ID_PREFIX";
/// Environment variable overriding [`MqttConfig::receive_topic`].
pub const ENV_MQTT_RECEIVE_TOPIC: &str = "LASERCRAFT_MQTT_RECEIVE_TOPIC";

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Arguments
/// - `path`: Path to the TOML configuration file
///
/// # Returns
/// - `Ok(T)`: Successfully loaded and parsed configuration
/// - `Err`: File I/O or parsing error
///
/// # Example
/// ```ignore
/// let config: AppConfig = load_config("config/client.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Complete configuration for the hand-off flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Processing service endpoints
    pub api: ApiConfig,
    /// Broker connection and topics
    pub mqtt: MqttConfig,
    /// Image normalisation before upload
    pub image: ImageConfig,
}

/// HTTP processing service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the processing service (e.g., "http://127.0.0.1:8080")
    pub base_url: String,
    /// Per-request timeout for upload and engrave calls (seconds)
    pub request_timeout_secs: u64,
    /// Address the stub service binds to
    pub stub_bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_secs: 30,
            stub_bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL: `tcp://host:port` or `mqtt://host:port`
    pub broker_url: String,
    /// Prefix for the generated client id (a UUID v4 is appended)
    pub client_id_prefix: String,
    /// Topic carrying the processed image bytes
    pub receive_topic: String,
    /// Keep-alive interval announced in CONNECT (seconds)
    pub keep_alive_secs: u16,
    /// Timeout for CONNACK/SUBACK/PUBACK round-trips (seconds)
    pub ack_timeout_secs: u64,
    /// Reconnect policy used after a dropped connection
    pub reconnect: ReconnectConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://127.0.0.1:1883".to_string(),
            client_id_prefix: "lasercraft-".to_string(),
            receive_topic: "laser_engraver_img".to_string(),
            keep_alive_secs: 60,
            ack_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Bounded exponential backoff for reconnecting to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt (milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Attempts per outage before giving up (0 = keep trying)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

/// Bounding box and naming used when preparing an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub max_width: u32,
    pub max_height: u32,
    /// File name sent in the multipart `image` part
    pub upload_file_name: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_width: 1280,
            max_height: 720,
            upload_file_name: "imageCapture.png".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the configuration from `path` if given, otherwise starts from defaults,
    /// then applies environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config::<AppConfig>(path)?,
            None => AppConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Overrides the endpoint settings from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overrides the endpoint settings using `lookup` as the variable source.
    ///
    /// Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get(ENV_API_URL) {
            self.api.base_url = url;
        }
        if let Some(url) = get(ENV_MQTT_BROKER_URL) {
            self.mqtt.broker_url = url;
        }
        if let Some(prefix) = get(ENV_MQTT_CLIENT_ID_PREFIX) {
            self.mqtt.client_id_prefix = prefix;
        }
        if let Some(topic) = get(ENV_MQTT_RECEIVE_TOPIC) {
            self.mqtt.receive_topic = topic;
        }
    }
}
