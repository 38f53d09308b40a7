//! In-process MQTT 3.1.1 broker for integration tests.
//!
//! Speaks just enough of the protocol for the notification channel: CONNECT,
//! SUBSCRIBE (with per-topic rejection), PUBLISH fan-out, UNSUBSCRIBE and
//! PINGREQ. Connections can be dropped on demand to exercise reconnects.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lasercraft::mqtt::connection::Connection;
use lasercraft::mqtt::error::ConnectReturnCode;
use lasercraft::mqtt::packet::{ConnAck, Packet, Publish, QoS, SubAck, SUBACK_FAILURE};
use lasercraft::mqtt::registry::topic_matches;

struct Session {
    filters: HashSet<String>,
    outbox: mpsc::UnboundedSender<Packet>,
    kill: CancellationToken,
}

#[derive(Default)]
struct BrokerState {
    sessions: Mutex<HashMap<u64, Session>>,
    rejected: Mutex<HashSet<String>>,
    requested: Mutex<HashMap<String, QoS>>,
    next_session: AtomicU64,
    next_packet_id: AtomicU16,
    connects: AtomicUsize,
}

impl BrokerState {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Session>> {
        self.sessions.lock().unwrap()
    }

    fn fan_out(&self, publish: &Publish) {
        let targets: Vec<_> = self
            .sessions()
            .values()
            .filter(|s| s.filters.iter().any(|f| topic_matches(f, &publish.topic)))
            .map(|s| s.outbox.clone())
            .collect();

        for outbox in targets {
            let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst).max(1);
            let _ = outbox.send(Packet::Publish(Publish {
                topic: publish.topic.clone(),
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: false,
                packet_id: Some(packet_id),
                payload: publish.payload.clone(),
            }));
        }
    }
}

pub struct TestBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
}

impl TestBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState {
            next_packet_id: AtomicU16::new(1),
            ..BrokerState::default()
        });
        let cancel = CancellationToken::new();

        let accept_state = state.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                };
                let session_id = accept_state.next_session.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_client(
                    Connection::new(stream),
                    session_id,
                    accept_state.clone(),
                    accept_cancel.child_token(),
                ));
            }
        });

        Self {
            addr,
            state,
            cancel,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Answer SUBSCRIBE for `filter` with 0x80 from now on.
    pub fn reject(&self, filter: &str) {
        self.state.rejected.lock().unwrap().insert(filter.to_string());
    }

    /// QoS the last SUBSCRIBE for `filter` asked for.
    pub fn requested_qos(&self, filter: &str) -> Option<QoS> {
        self.state.requested.lock().unwrap().get(filter).copied()
    }

    /// Number of CONNECT packets accepted so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of live sessions subscribed to exactly `filter`.
    pub fn subscriber_count(&self, filter: &str) -> usize {
        self.state
            .sessions()
            .values()
            .filter(|s| s.filters.contains(filter))
            .count()
    }

    /// Close every client socket without sending anything.
    pub fn drop_connections(&self) {
        for (_, session) in self.state.sessions().drain() {
            session.kill.cancel();
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_client(
    conn: Connection,
    session_id: u64,
    state: Arc<BrokerState>,
    kill: CancellationToken,
) {
    let (mut reader, mut writer) = conn.into_split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<Packet>();

    let writer_kill = kill.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let packet = tokio::select! {
                _ = writer_kill.cancelled() => return,
                packet = inbox.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            };
            if writer.write_packet(&packet).await.is_err() {
                return;
            }
        }
    });

    loop {
        let packet = tokio::select! {
            _ = kill.cancelled() => break,
            packet = reader.read_packet() => match packet {
                Ok(Some(packet)) => packet,
                _ => break,
            },
        };

        match packet {
            Packet::Connect(_) => {
                state.connects.fetch_add(1, Ordering::SeqCst);
                state.sessions().insert(
                    session_id,
                    Session {
                        filters: HashSet::new(),
                        outbox: outbox.clone(),
                        kill: kill.clone(),
                    },
                );
                let _ = outbox.send(Packet::ConnAck(ConnAck {
                    session_present: false,
                    return_code: ConnectReturnCode::Accepted,
                }));
            }
            Packet::Subscribe(subscribe) => {
                let rejected = state.rejected.lock().unwrap().clone();
                let mut return_codes = Vec::new();
                for (filter, qos) in subscribe.topics {
                    state.requested.lock().unwrap().insert(filter.clone(), qos);
                    if rejected.contains(&filter) {
                        return_codes.push(SUBACK_FAILURE);
                        continue;
                    }
                    if let Some(session) = state.sessions().get_mut(&session_id) {
                        session.filters.insert(filter);
                    }
                    return_codes.push(qos.min(QoS::AtLeastOnce) as u8);
                }
                let _ = outbox.send(Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes,
                }));
            }
            Packet::Unsubscribe(unsubscribe) => {
                if let Some(session) = state.sessions().get_mut(&session_id) {
                    for filter in &unsubscribe.topics {
                        session.filters.remove(filter);
                    }
                }
                let _ = outbox.send(Packet::UnsubAck(unsubscribe.packet_id));
            }
            Packet::Publish(publish) => {
                if let Some(packet_id) = publish.packet_id {
                    let _ = outbox.send(Packet::PubAck(packet_id));
                }
                state.fan_out(&publish);
            }
            Packet::PingReq => {
                let _ = outbox.send(Packet::PingResp);
            }
            Packet::Disconnect => break,
            // PUBACKs for our deliveries
            _ => {}
        }
    }

    state.sessions().remove(&session_id);
    kill.cancel();
    let _ = writer_task.await;
}

/// Broker that answers every CONNECT after `connack_delay` and then closes the socket.
pub struct HangupBroker {
    addr: SocketAddr,
    connects: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl HangupBroker {
    pub async fn start(connack_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connects = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let accept_connects = connects.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                };
                let connects = accept_connects.clone();
                tokio::spawn(async move {
                    let mut conn = Connection::new(stream);
                    if let Ok(Some(Packet::Connect(_))) = conn.read_packet().await {
                        connects.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(connack_delay).await;
                        let _ = conn
                            .write_packet(&Packet::ConnAck(ConnAck {
                                session_present: false,
                                return_code: ConnectReturnCode::Accepted,
                            }))
                            .await;
                    }
                    // Dropping the connection closes the socket
                });
            }
        });

        Self {
            addr,
            connects,
            cancel,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Drop for HangupBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future`, panicking if it takes longer than five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
