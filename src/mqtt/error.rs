//! # Error Types
//!
//! Errors produced by the MQTT codec and the notification channel, from socket
//! failures to protocol violations and broker refusals.

use thiserror::Error;

/// The primary error enum for the notification channel.
#[derive(Debug, Error)]
pub enum MqttError {
    /// An error occurred on the underlying TCP socket.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// A packet violated the MQTT 3.1.1 wire format.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The broker answered CONNECT with a non-zero return code.
    #[error("connection refused by broker: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    /// The broker rejected a SUBSCRIBE (return code 0x80).
    #[error("subscription to '{0}' rejected by broker")]
    SubscribeRejected(String),
    /// The operation needs a live connection.
    #[error("not connected to broker")]
    NotConnected,
    /// Another `connect()` call is still running.
    #[error("a connect attempt is already in progress")]
    ConnectInProgress,
    /// The broker did not answer in time.
    #[error("timed out waiting for broker")]
    Timeout,
    /// The connection went away while an acknowledgement was pending.
    #[error("connection closed")]
    ConnectionClosed,
    /// The broker URL could not be parsed.
    #[error("invalid broker url '{0}'")]
    InvalidBrokerUrl(String),
}

/// Specific MQTT wire-format violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("malformed packet")]
    MalformedPacket,
    #[error("packet of {0} bytes exceeds the maximum size")]
    PacketTooLarge(usize),
    #[error("string is not valid UTF-8")]
    InvalidUtf8String,
    #[error("string or topic longer than 65535 bytes")]
    StringTooLong,
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolLevel(u8),
    #[error("unexpected packet from peer")]
    UnexpectedPacket,
}

/// CONNACK return codes (MQTT 3.1.1 §3.2.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
    Other(u8),
}

impl From<u8> for ConnectReturnCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            other => Self::Other(other),
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUserNameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Other(other) => other,
        }
    }
}
