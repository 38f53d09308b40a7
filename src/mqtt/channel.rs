//! # Notification Channel
//!
//! A long-lived MQTT 3.1.1 session shared across the process.
//!
//! ## Responsibilities
//!
//! - Connect to the broker (at most one connect attempt outstanding)
//! - Subscribe/unsubscribe topic filters and route inbound messages to every
//!   matching handler through the [`HandlerRegistry`]
//! - Publish with QoS 0 or 1
//! - Answer QoS 1 deliveries with PUBACK and keep the session alive with PINGREQ
//! - Report a dropped connection as [`ChannelEvent::ConnectionLost`]
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──CONNACK──▶ Connected ──SUBACK──▶ Subscribed
//!      ▲                          │                       │                     │
//!      └──────── failure ─────────┴────── connection lost / disconnect() ───────┘
//! ```
//!
//! ## Tasks
//!
//! Each established connection owns two tasks: a reader that dispatches packets
//! and a keep-alive pinger. Both stop when the connection's cancellation token
//! fires, which happens on `disconnect()` or when the reader hits EOF or an error.
//! Handlers run on the reader task, so they must not block.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let channel = NotificationChannel::new(MqttOptions::from_config(&config.mqtt)?);
//! channel.connect().await?;
//!
//! let id = channel
//!     .subscribe("laser_engraver_img", QoS::AtLeastOnce, Arc::new(|msg: &Message| {
//!         println!("{} bytes on {}", msg.payload.len(), msg.topic);
//!     }))
//!     .await?;
//!
//! channel.publish("laser_engraver_img", b"png bytes".to_vec(), QoS::AtLeastOnce, false).await?;
//! channel.remove_subscription(id).await?;
//! channel.disconnect().await;
//! ```

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::connection::{parse_broker_url, Connection, PacketReader, PacketWriter};
use super::error::{ConnectReturnCode, MqttError, ProtocolError};
use super::packet::{Connect, Packet, Publish, QoS, Subscribe, Unsubscribe, SUBACK_FAILURE};
use super::registry::{HandlerRegistry, Message, MessageHandler, SubscriptionId};
use crate::common::config::MqttConfig;

/// Connection options for a [`NotificationChannel`].
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Broker socket address (`host:port`)
    pub broker_address: String,
    pub client_id: String,
    /// Interval between PINGREQs; zero disables keep-alive
    pub keep_alive: Duration,
    /// How long to wait for CONNACK, SUBACK, UNSUBACK and PUBACK
    pub ack_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttOptions {
    pub fn new(broker_address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
            username: None,
            password: None,
        }
    }

    /// Builds options from configuration.
    ///
    /// The client id is the configured prefix followed by a fresh UUID v4, so
    /// two processes never share a broker session.
    pub fn from_config(config: &MqttConfig) -> Result<Self, MqttError> {
        let broker_address = parse_broker_url(&config.broker_url)?;
        let client_id = format!("{}{}", config.client_id_prefix, uuid::Uuid::new_v4());
        let mut options = Self::new(broker_address, client_id);
        options.keep_alive = Duration::from_secs(config.keep_alive_secs as u64);
        options.ack_timeout = Duration::from_secs(config.ack_timeout_secs);
        Ok(options)
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}

/// Out-of-band notifications about the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection dropped without `disconnect()` being called.
    ConnectionLost(String),
}

/// Tasks belonging to one established connection.
struct Session {
    cancel: CancellationToken,
    generation: u64,
}

struct Inner {
    options: MqttOptions,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
    registry: Mutex<HandlerRegistry>,
    pending: Mutex<HashMap<u16, oneshot::Sender<Packet>>>,
    writer: tokio::sync::Mutex<Option<PacketWriter>>,
    session: Mutex<Option<Session>>,
    connecting: tokio::sync::Mutex<()>,
    next_packet_id: AtomicU16,
    generation: AtomicU64,
}

/// Cheaply clonable handle to the process-wide broker session.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<Inner>,
}

impl NotificationChannel {
    pub fn new(options: MqttOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(Inner {
                options,
                state,
                events,
                registry: Mutex::new(HandlerRegistry::new()),
                pending: Mutex::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(None),
                session: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                next_packet_id: AtomicU16::new(1),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.options.client_id
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    /// Receive [`ChannelEvent`]s emitted after this call.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Number of handlers currently registered.
    pub fn subscription_count(&self) -> usize {
        self.registry().len()
    }

    /// Connect to the broker.
    ///
    /// Succeeds immediately when already connected. A call made while another
    /// connect is running fails with [`MqttError::ConnectInProgress`].
    ///
    /// # Errors
    ///
    /// - [`MqttError::Io`] / [`MqttError::Timeout`]: the broker is unreachable
    /// - [`MqttError::ConnectionRefused`]: CONNACK carried a non-zero return code
    pub async fn connect(&self) -> Result<(), MqttError> {
        let _guard = self
            .inner
            .connecting
            .try_lock()
            .map_err(|_| MqttError::ConnectInProgress)?;

        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        info!(
            "🔌 Connecting to broker at {} as '{}'",
            self.inner.options.broker_address, self.inner.options.client_id
        );

        match self.establish().await {
            Ok(()) => {
                info!("✅ Connected to broker at {}", self.inner.options.broker_address);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(
                    "❌ Connection to broker at {} failed: {}",
                    self.inner.options.broker_address, e
                );
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(), MqttError> {
        let options = &self.inner.options;

        let mut conn = tokio::time::timeout(
            options.ack_timeout,
            Connection::open(&options.broker_address),
        )
        .await
        .map_err(|_| MqttError::Timeout)??;

        let keep_alive = u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        conn.write_packet(&Packet::Connect(Connect {
            client_id: options.client_id.clone(),
            keep_alive,
            clean_session: true,
            username: options.username.clone(),
            password: options.password.clone(),
        }))
        .await?;

        let reply = tokio::time::timeout(options.ack_timeout, conn.read_packet())
            .await
            .map_err(|_| MqttError::Timeout)??;

        match reply {
            Some(Packet::ConnAck(ack)) if ack.return_code == ConnectReturnCode::Accepted => {}
            Some(Packet::ConnAck(ack)) => return Err(MqttError::ConnectionRefused(ack.return_code)),
            Some(_) => return Err(ProtocolError::UnexpectedPacket.into()),
            None => return Err(MqttError::ConnectionClosed),
        }

        let (reader, writer) = conn.into_split();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        *self.inner.writer.lock().await = Some(writer);
        *self.session() = Some(Session {
            cancel: cancel.clone(),
            generation,
        });
        // Published before the reader starts so a loss it reports is never overwritten
        self.set_state(ConnectionState::Connected);

        tokio::spawn(read_loop(self.clone(), reader, cancel.clone(), generation));
        if !options.keep_alive.is_zero() {
            tokio::spawn(keep_alive_loop(self.clone(), cancel, options.keep_alive));
        }

        Ok(())
    }

    /// Subscribe `handler` to `topic` (a filter; `+` and `#` are allowed).
    ///
    /// QoS 2 is requested as QoS 1.
    ///
    /// The handler is registered before SUBSCRIBE goes out so no delivery that
    /// follows the SUBACK can be missed; it is removed again on failure.
    ///
    /// # Errors
    ///
    /// - [`MqttError::NotConnected`]: no live session
    /// - [`MqttError::SubscribeRejected`]: the broker answered 0x80
    /// - [`MqttError::Timeout`]: no SUBACK in time
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        // QoS 2 deliveries would need PUBREC/PUBREL, which this channel does not speak
        let qos = qos.min(QoS::AtLeastOnce);

        let id = self.registry().add(topic, qos, handler);

        match self.send_subscribe(topic, qos).await {
            Ok(()) => {
                self.mark_subscribed();
                info!("📥 Subscribed to '{}' ({})", topic, id);
                Ok(id)
            }
            Err(e) => {
                self.registry().remove(id);
                warn!("❌ Failed to subscribe to '{}': {}", topic, e);
                Err(e)
            }
        }
    }

    /// Remove one handler; UNSUBSCRIBE is sent only when it was the last on its filter.
    pub async fn remove_subscription(&self, id: SubscriptionId) -> Result<(), MqttError> {
        let removed = self.registry().remove(id);

        match removed {
            Some((filter, true)) if self.is_connected() => {
                self.send_unsubscribe(&filter).await?;
                self.mark_unsubscribed();
                info!("📤 Unsubscribed from '{}'", filter);
                Ok(())
            }
            Some((filter, _)) => {
                debug!("Removed handler {} from '{}'", id, filter);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Drop every handler for `topic` and unsubscribe from the broker.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let removed = self.registry().remove_topic(topic);
        debug!("Dropped {} handler(s) for '{}'", removed, topic);

        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        self.send_unsubscribe(topic).await?;
        self.mark_unsubscribed();
        info!("📤 Unsubscribed from '{}'", topic);
        Ok(())
    }

    /// Publish `payload` on `topic`.
    ///
    /// QoS 1 waits for the broker's PUBACK. QoS 2 is not supported and is sent as QoS 1.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retained: bool,
    ) -> Result<(), MqttError> {
        let qos = qos.min(QoS::AtLeastOnce);
        let size = payload.len();

        if qos == QoS::AtMostOnce {
            self.send_packet(&Packet::Publish(Publish {
                topic: topic.to_string(),
                qos,
                retain: retained,
                dup: false,
                packet_id: None,
                payload,
            }))
            .await?;
        } else {
            let packet_id = self.next_packet_id();
            let publish = Packet::Publish(Publish {
                topic: topic.to_string(),
                qos,
                retain: retained,
                dup: false,
                packet_id: Some(packet_id),
                payload,
            });
            match self.request(packet_id, &publish).await? {
                Packet::PubAck(_) => {}
                _ => return Err(ProtocolError::UnexpectedPacket.into()),
            }
        }

        debug!("Published {} bytes to '{}'", size, topic);
        Ok(())
    }

    /// Send DISCONNECT and close the socket. Does not emit `ConnectionLost`.
    pub async fn disconnect(&self) {
        if let Some(session) = self.session().take() {
            session.cancel.cancel();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.write_packet(&Packet::Disconnect).await {
                debug!("DISCONNECT not delivered: {}", e);
            }
            let _ = writer.shutdown().await;
        }

        self.pending().clear();
        self.set_state(ConnectionState::Disconnected);
        info!("👋 Disconnected from broker");
    }

    /// Re-issue SUBSCRIBE for every registered filter after a reconnect.
    ///
    /// Returns the number of filters restored, or the first error met.
    pub async fn resubscribe_all(&self) -> Result<usize, MqttError> {
        let filters = self.registry().filters();
        let mut restored = 0;
        let mut first_error = None;

        for (filter, qos) in filters {
            match self.send_subscribe(&filter, qos).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!("❌ Could not restore subscription to '{}': {}", filter, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if restored > 0 {
            self.mark_subscribed();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }

    async fn send_subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let packet_id = self.next_packet_id();
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            topics: vec![(topic.to_string(), qos)],
        });

        match self.request(packet_id, &subscribe).await? {
            Packet::SubAck(ack) => match ack.return_codes.first() {
                Some(&code) if code != SUBACK_FAILURE => Ok(()),
                _ => Err(MqttError::SubscribeRejected(topic.to_string())),
            },
            _ => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }

    async fn send_unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let packet_id = self.next_packet_id();
        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            topics: vec![topic.to_string()],
        });

        match self.request(packet_id, &unsubscribe).await? {
            Packet::UnsubAck(_) => Ok(()),
            _ => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }

    /// Send a packet and wait for the acknowledgement carrying `packet_id`.
    async fn request(&self, packet_id: u16, packet: &Packet) -> Result<Packet, MqttError> {
        let (tx, rx) = oneshot::channel();
        self.pending().insert(packet_id, tx);

        if let Err(e) = self.send_packet(packet).await {
            self.pending().remove(&packet_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.options.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            // Sender dropped: the connection went away
            Ok(Err(_)) => Err(MqttError::ConnectionClosed),
            Err(_) => {
                self.pending().remove(&packet_id);
                Err(MqttError::Timeout)
            }
        }
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), MqttError> {
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(MqttError::NotConnected)?;
        writer.write_packet(packet).await
    }

    async fn handle_incoming(&self, packet: Packet) {
        match packet {
            Packet::Publish(publish) => {
                if publish.qos != QoS::AtMostOnce {
                    if let Some(packet_id) = publish.packet_id {
                        if let Err(e) = self.send_packet(&Packet::PubAck(packet_id)).await {
                            warn!("⚠️  Failed to send PUBACK #{}: {}", packet_id, e);
                        }
                    }
                }
                self.dispatch(Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                });
            }
            Packet::PubAck(packet_id) => self.resolve(packet_id, Packet::PubAck(packet_id)),
            Packet::UnsubAck(packet_id) => self.resolve(packet_id, Packet::UnsubAck(packet_id)),
            Packet::SubAck(ack) => self.resolve(ack.packet_id, Packet::SubAck(ack)),
            Packet::PingResp => debug!("PINGRESP received"),
            other => warn!("⚠️  Unexpected packet from broker: {:?}", other),
        }
    }

    fn dispatch(&self, message: Message) {
        let handlers = self.registry().handlers_for(&message.topic);
        info!(
            "📨 Received {} bytes on '{}' ({} handler(s))",
            message.payload.len(),
            message.topic,
            handlers.len()
        );
        for handler in handlers {
            handler(&message);
        }
    }

    fn resolve(&self, packet_id: u16, packet: Packet) {
        match self.pending().remove(&packet_id) {
            Some(tx) => {
                let _ = tx.send(packet);
            }
            None => debug!("Acknowledgement #{} with no waiter", packet_id),
        }
    }

    async fn connection_lost(&self, generation: u64, cause: String) {
        let current = {
            let mut session = self.session();
            // Stale reader or deliberate disconnect
            if session.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
            session.take()
        };
        if let Some(current) = current {
            current.cancel.cancel();
        }

        self.inner.writer.lock().await.take();
        self.pending().clear();
        self.set_state(ConnectionState::Disconnected);

        warn!("⚠️  Connection to broker lost: {}", cause);
        let _ = self.inner.events.send(ChannelEvent::ConnectionLost(cause));
    }

    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    fn mark_subscribed(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Subscribed;
                true
            } else {
                false
            }
        });
    }

    fn mark_unsubscribed(&self) {
        if !self.registry().is_empty() {
            return;
        }
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Subscribed {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
    }

    fn registry(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u16, oneshot::Sender<Packet>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn read_loop(
    channel: NotificationChannel,
    mut reader: PacketReader,
    cancel: CancellationToken,
    generation: u64,
) {
    let cause = loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = reader.read_packet() => result,
        };

        match result {
            Ok(Some(packet)) => channel.handle_incoming(packet).await,
            Ok(None) => break "connection closed by broker".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    channel.connection_lost(generation, cause).await;
}

async fn keep_alive_loop(channel: NotificationChannel, cancel: CancellationToken, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Err(e) = channel.send_packet(&Packet::PingReq).await {
            debug!("PINGREQ not sent: {}", e);
            return;
        }
    }
}
