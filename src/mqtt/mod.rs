//! # Notification Channel (MQTT)
//!
//! The broker side of the hand-off: the processed image comes back as a
//! PUBLISH on a well-known topic, out of band from the HTTP upload.
//!
//! ## Modules
//!
//! - [`packet`]: MQTT 3.1.1 control packets and their wire encoding
//! - [`connection`]: TCP framing and broker URL parsing
//! - [`registry`]: topic-keyed handler registry with wildcard matching
//! - [`channel`]: the shared session (connect, subscribe, publish, dispatch)
//! - [`supervisor`]: reconnect with bounded exponential backoff
//! - [`error`]: error types

pub mod channel;
pub mod connection;
pub mod error;
pub mod packet;
pub mod registry;
pub mod supervisor;

pub use channel::{ChannelEvent, ConnectionState, MqttOptions, NotificationChannel};
pub use error::{MqttError, ProtocolError};
pub use packet::QoS;
pub use registry::{Message, MessageHandler, SubscriptionId};
pub use supervisor::{ReconnectPolicy, ReconnectSupervisor};
