//! # TCP Connection Abstraction
//!
//! Wraps a TCP stream with MQTT packet framing.
//!
//! A frame is read in three steps: the fixed-header byte, the variable-byte
//! remaining length (1-4 bytes), then exactly that many body bytes. Frames
//! larger than [`MAX_PACKET_SIZE`] are rejected before the body is allocated,
//! since image payloads are the largest thing this channel carries.

use log::error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::error::{MqttError, ProtocolError};
use super::packet::Packet;

/// Maximum accepted packet body (32MB).
pub const MAX_PACKET_SIZE: usize = 32 * 1024 * 1024;

/// Default MQTT port when the broker URL carries none.
pub const DEFAULT_PORT: u16 = 1883;

/// TCP connection wrapper with MQTT framing support.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Create a new Connection from an established TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Open a TCP connection to `address` (`host:port`).
    pub async fn open(address: &str) -> Result<Self, MqttError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Read one packet.
    ///
    /// # Returns
    /// - `Ok(Some(Packet))`: a complete, well-formed packet
    /// - `Ok(None)`: the peer closed the connection between packets
    /// - `Err`: I/O failure, oversized or malformed frame
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, MqttError> {
        read_packet(&mut self.stream).await
    }

    /// Write one packet and flush.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), MqttError> {
        write_packet(&mut self.stream, packet).await
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (PacketReader, PacketWriter) {
        let (read, write) = self.stream.into_split();
        (PacketReader { half: read }, PacketWriter { half: write })
    }
}

/// Read half of a split [`Connection`].
pub struct PacketReader {
    half: OwnedReadHalf,
}

impl PacketReader {
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, MqttError> {
        read_packet(&mut self.half).await
    }
}

/// Write half of a split [`Connection`].
pub struct PacketWriter {
    half: OwnedWriteHalf,
}

impl PacketWriter {
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), MqttError> {
        write_packet(&mut self.half, packet).await
    }

    /// Shut down the write direction, signalling EOF to the broker.
    pub async fn shutdown(&mut self) -> Result<(), MqttError> {
        self.half.shutdown().await?;
        Ok(())
    }
}

async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, MqttError>
where
    R: AsyncRead + Unpin,
{
    let header = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut length = 0usize;
    let mut multiplier = 1usize;
    let mut terminated = false;
    for _ in 0..4 {
        let encoded_byte = reader.read_u8().await?;
        length += (encoded_byte & 127) as usize * multiplier;
        if encoded_byte & 128 == 0 {
            terminated = true;
            break;
        }
        multiplier *= 128;
    }
    if !terminated {
        return Err(ProtocolError::MalformedPacket.into());
    }

    if length > MAX_PACKET_SIZE {
        error!(
            "❌ Packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        );
        return Err(ProtocolError::PacketTooLarge(length).into());
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    Ok(Some(Packet::from_parts(header, &body)?))
}

async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), MqttError>
where
    W: AsyncWrite + Unpin,
{
    let frame = packet.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Turns a broker URL into a `host:port` socket address string.
///
/// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` and bare `host`.
/// TLS schemes are refused since the channel speaks plain TCP only.
pub fn parse_broker_url(url: &str) -> Result<String, MqttError> {
    let invalid = || MqttError::InvalidBrokerUrl(url.to_string());

    let rest = match url.split_once("://") {
        Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
        Some(_) => return Err(invalid()),
        None => url,
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || rest.contains('/') {
        return Err(invalid());
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port.parse().map_err(|_| invalid())?;
            Ok(format!("{}:{}", host, port))
        }
        Some(_) => Err(invalid()),
        None => Ok(format!("{}:{}", rest, DEFAULT_PORT)),
    }
}
