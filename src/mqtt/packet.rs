//! # MQTT Packet Structures and Serialization
//!
//! MQTT 3.1.1 control packets used by the notification channel, with encoding
//! into owned byte buffers and decoding from complete frames.
//!
//! ## Wire Format
//!
//! Every packet is framed as:
//! ```text
//! [1 byte: type << 4 | flags] [1-4 bytes: remaining length] [N bytes: body]
//! ```
//!
//! The remaining length is a variable-byte integer: 7 bits per byte, high bit
//! set while more bytes follow.

use super::error::{ConnectReturnCode, ProtocolError};

/// Largest remaining length the variable-byte encoding can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Protocol level for MQTT 3.1.1.
const PROTOCOL_LEVEL: u8 = 4;

/// Quality of Service levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket),
        }
    }
}

/// SUBACK return code signalling a rejected subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

// --- CONNECT Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

// --- CONNACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

// --- PUBLISH Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present only when `qos` is above `AtMostOnce`
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

// --- SUBSCRIBE Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

// --- SUBACK Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One entry per requested filter: granted QoS, or [`SUBACK_FAILURE`]
    pub return_codes: Vec<u8>,
}

// --- UNSUBSCRIBE Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// An enumeration of all MQTT control packets the channel speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Serializes the packet into a complete frame (fixed header included).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();

        let header = match self {
            Packet::Connect(connect) => {
                write_utf8_string(&mut body, "MQTT")?;
                body.push(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if connect.clean_session {
                    flags |= 0x02;
                }
                if connect.password.is_some() {
                    flags |= 0x40;
                }
                if connect.username.is_some() {
                    flags |= 0x80;
                }
                body.push(flags);
                body.extend_from_slice(&connect.keep_alive.to_be_bytes());
                write_utf8_string(&mut body, &connect.client_id)?;
                if let Some(username) = &connect.username {
                    write_utf8_string(&mut body, username)?;
                }
                if let Some(password) = &connect.password {
                    write_utf8_string(&mut body, password)?;
                }
                0x10
            }
            Packet::ConnAck(ack) => {
                body.push(u8::from(ack.session_present));
                body.push(ack.return_code.into());
                0x20
            }
            Packet::Publish(publish) => {
                write_utf8_string(&mut body, &publish.topic)?;
                if publish.qos != QoS::AtMostOnce {
                    let id = publish.packet_id.ok_or(ProtocolError::MalformedPacket)?;
                    body.extend_from_slice(&id.to_be_bytes());
                }
                body.extend_from_slice(&publish.payload);

                let mut flags = (publish.qos as u8) << 1;
                if publish.dup {
                    flags |= 0x08;
                }
                if publish.retain {
                    flags |= 0x01;
                }
                0x30 | flags
            }
            Packet::PubAck(packet_id) => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                0x40
            }
            Packet::Subscribe(subscribe) => {
                body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
                for (topic, qos) in &subscribe.topics {
                    write_utf8_string(&mut body, topic)?;
                    body.push(*qos as u8);
                }
                // Reserved flag bits for SUBSCRIBE are 0b0010
                0x82
            }
            Packet::SubAck(ack) => {
                body.extend_from_slice(&ack.packet_id.to_be_bytes());
                body.extend_from_slice(&ack.return_codes);
                0x90
            }
            Packet::Unsubscribe(unsubscribe) => {
                body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
                for topic in &unsubscribe.topics {
                    write_utf8_string(&mut body, topic)?;
                }
                0xA2
            }
            Packet::UnsubAck(packet_id) => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(ProtocolError::PacketTooLarge(body.len()));
        }

        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.push(header);
        write_variable_byte_integer(&mut frame, body.len());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes a complete frame produced by [`Packet::encode`] or read off the wire.
    pub fn decode(frame: &[u8]) -> Result<Packet, ProtocolError> {
        let (&header, rest) = frame.split_first().ok_or(ProtocolError::MalformedPacket)?;
        let mut reader = Reader::new(rest);
        let remaining = reader.read_variable_byte_integer()?;
        let body = reader.take(remaining)?;
        if !reader.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Packet::from_parts(header, body)
    }

    /// Decodes a packet from its fixed-header byte and its body.
    pub fn from_parts(header: u8, body: &[u8]) -> Result<Packet, ProtocolError> {
        let packet_type = header >> 4;
        let flags = header & 0x0F;
        let mut reader = Reader::new(body);

        let packet = match packet_type {
            1 => {
                let protocol = reader.read_utf8_string()?;
                let level = reader.read_u8()?;
                if protocol != "MQTT" || level != PROTOCOL_LEVEL {
                    return Err(ProtocolError::UnsupportedProtocolLevel(level));
                }
                let connect_flags = reader.read_u8()?;
                let keep_alive = reader.read_u16()?;
                let client_id = reader.read_utf8_string()?;
                if connect_flags & 0x04 != 0 {
                    // Will topic and message are accepted but not kept
                    reader.read_utf8_string()?;
                    let len = reader.read_u16()? as usize;
                    reader.take(len)?;
                }
                let username = if connect_flags & 0x80 != 0 {
                    Some(reader.read_utf8_string()?)
                } else {
                    None
                };
                let password = if connect_flags & 0x40 != 0 {
                    Some(reader.read_utf8_string()?)
                } else {
                    None
                };
                Packet::Connect(Connect {
                    client_id,
                    keep_alive,
                    clean_session: connect_flags & 0x02 != 0,
                    username,
                    password,
                })
            }
            2 => {
                let ack_flags = reader.read_u8()?;
                let code = reader.read_u8()?;
                Packet::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    return_code: ConnectReturnCode::from(code),
                })
            }
            3 => {
                let qos = QoS::try_from((flags >> 1) & 0x03)?;
                let topic = reader.read_utf8_string()?;
                let packet_id = if qos != QoS::AtMostOnce {
                    Some(reader.read_u16()?)
                } else {
                    None
                };
                let payload = reader.rest().to_vec();
                return Ok(Packet::Publish(Publish {
                    topic,
                    qos,
                    retain: flags & 0x01 != 0,
                    dup: flags & 0x08 != 0,
                    packet_id,
                    payload,
                }));
            }
            4 => Packet::PubAck(reader.read_u16()?),
            8 => {
                let packet_id = reader.read_u16()?;
                let mut topics = Vec::new();
                while !reader.is_empty() {
                    let topic = reader.read_utf8_string()?;
                    let qos = QoS::try_from(reader.read_u8()? & 0x03)?;
                    topics.push((topic, qos));
                }
                if topics.is_empty() {
                    return Err(ProtocolError::MalformedPacket);
                }
                Packet::Subscribe(Subscribe { packet_id, topics })
            }
            9 => {
                let packet_id = reader.read_u16()?;
                let return_codes = reader.rest().to_vec();
                return Ok(Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                }));
            }
            10 => {
                let packet_id = reader.read_u16()?;
                let mut topics = Vec::new();
                while !reader.is_empty() {
                    topics.push(reader.read_utf8_string()?);
                }
                Packet::Unsubscribe(Unsubscribe { packet_id, topics })
            }
            11 => Packet::UnsubAck(reader.read_u16()?),
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => Packet::Disconnect,
            other => return Err(ProtocolError::InvalidPacketType(other)),
        };

        if !reader.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(packet)
    }
}

/// Appends a variable-byte integer (the MQTT remaining-length encoding).
pub fn write_variable_byte_integer(buf: &mut Vec<u8>, mut val: usize) {
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        buf.push(encoded_byte);
        if val == 0 {
            break;
        }
    }
}

/// Appends a UTF-8 string prefixed with its 2-byte big-endian length.
pub fn write_utf8_string(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::StringTooLong)?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::MalformedPacket)?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(ProtocolError::MalformedPacket)?;
        self.pos = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        slice
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_utf8_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8String)
    }

    fn read_variable_byte_integer(&mut self) -> Result<usize, ProtocolError> {
        let mut multiplier = 1;
        let mut value = 0;
        for _ in 0..4 {
            let encoded_byte = self.read_u8()?;
            value += (encoded_byte & 127) as usize * multiplier;
            if encoded_byte & 128 == 0 {
                return Ok(value);
            }
            multiplier *= 128;
        }
        Err(ProtocolError::MalformedPacket)
    }
}
