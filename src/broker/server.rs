//! Minimal MQTT 3.1.1 broker for LAN deployments.
//!
//! Just enough broker for a phone-plus-nodes setup on one network:
//! CONNECT/CONNACK, SUBSCRIBE with wildcard filters, PUBLISH at QoS 0/1
//! (QoS 1 inbound is acknowledged; outbound delivery is downgraded to
//! QoS 0), a retained-message store, and last-will delivery on unclean
//! close. Retained messages survive restarts through a JSON store in the
//! app's data directory. The wire codec is `rumqttc::mqttbytes`, the same
//! one the client side speaks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use rumqttc::mqttbytes::v4::{
    ConnAck, ConnectReturnCode, LastWill, Packet, PubAck, Publish, SubAck, SubscribeReasonCode,
    UnsubAck,
};
use rumqttc::mqttbytes::{self, QoS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mqtt::session::short_id;

const MAX_PACKET_SIZE: usize = 64 * 1024;
/// Raw PINGRESP frame.
const PINGRESP: [u8; 2] = [0xD0, 0x00];

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] mqttbytes::Error),
    #[error("first packet was not CONNECT")]
    NotConnect,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("keep-alive window expired")]
    KeepAliveExpired,
}

struct Subscriber {
    client_id: Arc<str>,
    filter: String,
    tx: mpsc::Sender<Publish>,
}

/// Broker state shared by all connections.
pub(crate) struct Shared {
    retained: Mutex<HashMap<String, Publish>>,
    subscribers: Mutex<Vec<Subscriber>>,
    store_path: Option<PathBuf>,
}

#[derive(Default, Serialize, Deserialize)]
struct RetainedStore {
    messages: Vec<StoredRetained>,
}

#[derive(Serialize, Deserialize)]
struct StoredRetained {
    topic: String,
    payload: String,
    qos: u8,
}

impl Shared {
    /// Creates broker state, loading any persisted retained messages.
    pub(crate) async fn load(store_path: Option<PathBuf>) -> Arc<Self> {
        let mut retained = HashMap::new();
        if let Some(path) = &store_path {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => match serde_json::from_str::<RetainedStore>(&contents) {
                    Ok(store) => {
                        for msg in store.messages {
                            let mut publish = Publish::new(
                                msg.topic.clone(),
                                if msg.qos == 1 {
                                    QoS::AtLeastOnce
                                } else {
                                    QoS::AtMostOnce
                                },
                                msg.payload.into_bytes(),
                            );
                            publish.retain = true;
                            retained.insert(msg.topic, publish);
                        }
                        debug!("loaded {} retained messages", retained.len());
                    }
                    Err(e) => warn!("ignoring corrupt retained store: {}", e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not read retained store: {}", e),
            }
        }
        Arc::new(Self {
            retained: Mutex::new(retained),
            subscribers: Mutex::new(Vec::new()),
            store_path,
        })
    }

    async fn apply_retained(&self, publish: &Publish) {
        {
            let mut retained = self.retained.lock();
            if publish.payload.is_empty() {
                retained.remove(&publish.topic);
            } else {
                let mut stored = publish.clone();
                stored.retain = true;
                stored.pkid = 0;
                stored.dup = false;
                retained.insert(publish.topic.clone(), stored);
            }
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let store = {
            let retained = self.retained.lock();
            RetainedStore {
                messages: retained
                    .values()
                    .map(|p| StoredRetained {
                        topic: p.topic.clone(),
                        payload: String::from_utf8_lossy(&p.payload).into_owned(),
                        qos: p.qos as u8,
                    })
                    .collect(),
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("could not create broker store dir: {}", e);
                return;
            }
        }
        match serde_json::to_vec_pretty(&store) {
            Ok(contents) => {
                if let Err(e) = tokio::fs::write(path, contents).await {
                    warn!("could not persist retained store: {}", e);
                }
            }
            Err(e) => warn!("could not serialize retained store: {}", e),
        }
    }

    fn retained_matches(&self, filter: &str) -> Vec<Publish> {
        let retained = self.retained.lock();
        retained
            .values()
            .filter(|p| topic_matches(filter, &p.topic))
            .cloned()
            .collect()
    }

    fn add_subscriber(&self, client_id: &Arc<str>, filter: &str, tx: mpsc::Sender<Publish>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !(s.client_id == *client_id && s.filter == filter));
        subscribers.push(Subscriber {
            client_id: client_id.clone(),
            filter: filter.to_string(),
            tx,
        });
    }

    fn remove_subscription(&self, client_id: &Arc<str>, filter: &str) {
        self.subscribers
            .lock()
            .retain(|s| !(s.client_id == *client_id && s.filter == filter));
    }

    fn remove_client(&self, client_id: &Arc<str>) {
        self.subscribers
            .lock()
            .retain(|s| s.client_id != *client_id);
    }

    /// Fans a publish out to every matching subscription. Uses try_send so
    /// one wedged client can only lose its own messages, never delay
    /// anyone else's.
    fn route(&self, publish: &Publish) {
        let targets: Vec<(Arc<str>, mpsc::Sender<Publish>)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|s| topic_matches(&s.filter, &publish.topic))
                .map(|s| (s.client_id.clone(), s.tx.clone()))
                .collect()
        };
        let mut live = publish.clone();
        live.retain = false;
        live.pkid = 0;
        live.dup = false;
        for (client_id, tx) in targets {
            if let Err(e) = tx.try_send(live.clone()) {
                debug!("dropping message for {}: {}", client_id, e);
            }
        }
    }

    async fn publish_will(&self, will: LastWill) {
        debug!("delivering last will on {}", will.topic);
        let mut publish = Publish::new(will.topic, will.qos, will.message);
        publish.retain = will.retain;
        if publish.retain {
            self.apply_retained(&publish).await;
        }
        self.route(&publish);
    }
}

/// MQTT 3.1.1 wildcard filter match (`+` one level, `#` rest).
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Accept loop. Lives until the supervisor cancels the token; every client
/// task observes the same token, so stop closes live connections too.
pub(crate) async fn run(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared, shutdown).await {
                            debug!("connection {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!("embedded broker listener closed");
}

enum CloseReason {
    /// Client sent DISCONNECT; will is discarded.
    Clean,
    /// Broker is shutting down; will is discarded.
    Shutdown,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<(), BrokerError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(4096);

    let connect = match read_packet(&mut reader, &mut read_buf).await? {
        Packet::Connect(connect) => connect,
        _ => return Err(BrokerError::NotConnect),
    };
    let client_id: Arc<str> = if connect.client_id.is_empty() {
        Arc::from(format!("anon-{}", short_id()))
    } else {
        Arc::from(connect.client_id.as_str())
    };
    let will = connect.last_will;
    // Reap silent clients at 1.5x their declared keep-alive, the
    // protocol's window. A dead node (power loss) would otherwise hold
    // its connection until the OS TCP timeout and its will - the thing
    // that flips the retained status to "offline" - would never fire.
    // keep_alive 0 disables the window.
    let keep_alive = (connect.keep_alive != 0)
        .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));

    send(&mut writer, |buf| {
        ConnAck::new(ConnectReturnCode::Success, false).write(buf)
    })
    .await?;
    info!("client {} connected from {}", client_id, addr);

    let (tx, rx) = mpsc::channel::<Publish>(64);
    let close = client_loop(
        &client_id, &shared, &shutdown, &mut reader, &mut writer, read_buf, keep_alive, tx, rx,
    )
    .await;

    shared.remove_client(&client_id);
    if close.is_err() {
        // Unclean close: the broker publishes the will on the client's
        // behalf.
        if let Some(will) = will {
            shared.publish_will(will).await;
        }
    }
    info!("client {} disconnected", client_id);
    close.map(|_| ())
}

#[allow(clippy::too_many_arguments)]
async fn client_loop(
    client_id: &Arc<str>,
    shared: &Arc<Shared>,
    shutdown: &CancellationToken,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    mut read_buf: BytesMut,
    keep_alive: Option<Duration>,
    tx: mpsc::Sender<Publish>,
    mut rx: mpsc::Receiver<Publish>,
) -> Result<CloseReason, BrokerError> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(CloseReason::Shutdown),
            outbound = rx.recv() => {
                let Some(mut publish) = outbound else {
                    return Ok(CloseReason::Shutdown);
                };
                publish.qos = QoS::AtMostOnce;
                publish.pkid = 0;
                send(writer, |buf| publish.write(buf)).await?;
            }
            inbound = read_with_deadline(reader, &mut read_buf, keep_alive) => match inbound? {
                Packet::Publish(publish) => {
                    match publish.qos {
                        QoS::AtLeastOnce => {
                            send(writer, |buf| PubAck::new(publish.pkid).write(buf)).await?;
                        }
                        QoS::ExactlyOnce => {
                            warn!("client {} sent qos2 publish, treating as qos0", client_id);
                        }
                        QoS::AtMostOnce => {}
                    }
                    if publish.retain {
                        shared.apply_retained(&publish).await;
                    }
                    shared.route(&publish);
                }
                Packet::Subscribe(subscribe) => {
                    let mut codes = Vec::with_capacity(subscribe.filters.len());
                    let mut retained = Vec::new();
                    for filter in &subscribe.filters {
                        debug!("client {} subscribed to {}", client_id, filter.path);
                        shared.add_subscriber(client_id, &filter.path, tx.clone());
                        retained.extend(shared.retained_matches(&filter.path));
                        codes.push(SubscribeReasonCode::Success(QoS::AtMostOnce));
                    }
                    send(writer, |buf| SubAck::new(subscribe.pkid, codes.clone()).write(buf)).await?;
                    // Retained delivery: first thing a new subscription sees.
                    for mut publish in retained {
                        publish.qos = QoS::AtMostOnce;
                        publish.pkid = 0;
                        send(writer, |buf| publish.write(buf)).await?;
                    }
                }
                Packet::Unsubscribe(unsubscribe) => {
                    for topic in &unsubscribe.topics {
                        shared.remove_subscription(client_id, topic);
                    }
                    send(writer, |buf| UnsubAck::new(unsubscribe.pkid).write(buf)).await?;
                }
                Packet::PingReq => {
                    writer.write_all(&PINGRESP).await?;
                }
                Packet::Disconnect => return Ok(CloseReason::Clean),
                other => debug!("client {} sent unhandled packet: {:?}", client_id, other),
            }
        }
    }
}

async fn read_with_deadline(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    keep_alive: Option<Duration>,
) -> Result<Packet, BrokerError> {
    match keep_alive {
        Some(window) => tokio::time::timeout(window, read_packet(reader, buf))
            .await
            .map_err(|_| BrokerError::KeepAliveExpired)?,
        None => read_packet(reader, buf).await,
    }
}

async fn read_packet(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Packet, BrokerError> {
    loop {
        match rumqttc::mqttbytes::v4::read(buf, MAX_PACKET_SIZE) {
            Ok(packet) => return Ok(packet),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {
                if reader.read_buf(buf).await? == 0 {
                    return Err(BrokerError::ConnectionClosed);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn send<F>(writer: &mut OwnedWriteHalf, encode: F) -> Result<(), BrokerError>
where
    F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
{
    let mut buf = BytesMut::new();
    encode(&mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}
