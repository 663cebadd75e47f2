//! Broker session lifecycle.
//!
//! One [`SessionClient`] is shared by the whole process and owns at most
//! one live broker connection. The transport event loop runs on its own
//! task; everything it learns flows out through the presence tracker, the
//! inbound router, and a connection-state watch channel. Nothing here
//! returns transport errors to callers: `publish` is fire-and-forget and
//! connect/disconnect surface failures purely as state transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, NetworkOptions, Packet, QoS,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionSettings;
use crate::model::DeviceType;

use super::presence::PresenceTracker;
use super::router::{InboundRouter, IncomingMessage};
use super::topics;

const KEEP_ALIVE: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT_SECS: u64 = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Bound on the graceful-disconnect wait before the event task is dropped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

struct ActiveSession {
    client: AsyncClient,
    client_id: String,
    host: String,
    port: u16,
    node_id: String,
    connected: Arc<AtomicBool>,
    event_task: JoinHandle<()>,
}

pub struct SessionClient {
    presence: Arc<PresenceTracker>,
    router: InboundRouter,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    current: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl SessionClient {
    pub fn new(presence: Arc<PresenceTracker>, router: InboundRouter) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            presence,
            router,
            state_tx: Arc::new(state_tx),
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens (or keeps) a session against the configured broker.
    ///
    /// A no-op when the current session targets the same broker and node
    /// and is connected; otherwise the old session is torn down
    /// best-effort and a fresh one is opened with a new random client id.
    /// Returns as soon as the transport handshake is initiated; completion
    /// is observable through [`Self::watch_state`].
    pub async fn connect(&self, settings: &ConnectionSettings) {
        let node_id = topics::normalize_node(&settings.default_node).to_string();
        let mut current = self.current.lock().await;

        if let Some(session) = current.as_ref() {
            if session.host == settings.broker_host
                && session.port == settings.broker_port
                && session.node_id == node_id
                && session.connected.load(Ordering::SeqCst)
            {
                debug!(
                    "connect: already connected to {}:{} for {}",
                    session.host, session.port, node_id
                );
                return;
            }
        }
        if let Some(old) = current.take() {
            Self::teardown(old).await;
        }

        self.presence.reset_node(&node_id);
        self.state_tx.send_replace(ConnectionState::Connecting);

        let client_id = format!("app-{}", short_id());
        let mut options = MqttOptions::new(&client_id, &settings.broker_host, settings.broker_port);
        options
            .set_clean_session(true)
            .set_keep_alive(KEEP_ALIVE)
            .set_last_will(LastWill::new(
                format!("iot/app/{client_id}/lwt"),
                "offline",
                QoS::AtLeastOnce,
                true,
            ));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(CONNECT_TIMEOUT_SECS);
        eventloop.set_network_options(network_options);

        info!(
            "connecting to {}:{} as {} (node {})",
            settings.broker_host, settings.broker_port, client_id, node_id
        );

        let connected = Arc::new(AtomicBool::new(false));
        let event_task = tokio::spawn(drive_session(
            eventloop,
            client.clone(),
            node_id.clone(),
            connected.clone(),
            self.presence.clone(),
            self.router.clone(),
            self.state_tx.clone(),
        ));

        *current = Some(ActiveSession {
            client,
            client_id,
            host: settings.broker_host.clone(),
            port: settings.broker_port,
            node_id,
            connected,
            event_task,
        });
    }

    /// Publish with QoS 1, not retained. See [`Self::publish_with`].
    pub async fn publish(&self, topic: &str, payload: &str) {
        self.publish_with(topic, payload, QoS::AtLeastOnce, false)
            .await;
    }

    /// Fire-and-forget publish. Silently dropped (logged at warn) when no
    /// session exists or the session is not connected; commands are retried
    /// by the user pressing the button again, not by the transport.
    pub async fn publish_with(&self, topic: &str, payload: &str, qos: QoS, retain: bool) {
        let current = self.current.lock().await;
        let Some(session) = current.as_ref() else {
            warn!("publish skipped: no session, topic={}", topic);
            return;
        };
        if !session.connected.load(Ordering::SeqCst) {
            warn!("publish skipped: not connected, topic={}", topic);
            return;
        }
        match session
            .client
            .try_publish(topic, qos, retain, payload.to_owned())
        {
            Ok(()) => debug!("publish ok: topic={} payload={}", topic, payload),
            Err(e) => error!("publish failed: topic={}, cause={}", topic, e),
        }
    }

    /// Best-effort forced close. Bounded: a pending graceful disconnect is
    /// given [`DISCONNECT_GRACE`] before the event task is dropped anyway.
    pub async fn disconnect(&self) {
        let mut current = self.current.lock().await;
        if let Some(session) = current.take() {
            let node_id = session.node_id.clone();
            Self::teardown(session).await;
            self.presence.set_online(&node_id, false);
            self.state_tx.send_replace(ConnectionState::Disconnected);
            info!("session disconnected");
        }
    }

    async fn teardown(session: ActiveSession) {
        session.connected.store(false, Ordering::SeqCst);
        let disconnect = session.client.disconnect();
        if tokio::time::timeout(DISCONNECT_GRACE, disconnect)
            .await
            .is_err()
        {
            debug!("graceful disconnect timed out, dropping session");
        }
        // Also cancels any in-flight reconnect attempt.
        session.event_task.abort();
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn router(&self) -> &InboundRouter {
        &self.router
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Client identifier of the live session, if any. Diagnostic; a fresh
    /// id per connect is part of the session contract.
    pub async fn current_client_id(&self) -> Option<String> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|s| s.client_id.clone())
    }
}

/// Transport event pump. Runs until the session is torn down; the rumqttc
/// event loop reconnects on its own after errors, so every ConnAck (first
/// connect and every reconnect) re-subscribes — the broker forgets
/// clean-session subscriptions, and losing them would silently break
/// presence tracking.
async fn drive_session(
    mut eventloop: EventLoop,
    client: AsyncClient,
    node_id: String,
    connected: Arc<AtomicBool>,
    presence: Arc<PresenceTracker>,
    router: InboundRouter,
    state_tx: Arc<watch::Sender<ConnectionState>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let reconnect = connected.swap(true, Ordering::SeqCst);
                info!("broker session established (reconnect={})", reconnect);
                state_tx.send_replace(ConnectionState::Connected);
                presence.reset_node(&node_id);
                subscribe_all(&client, &node_id).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!(
                    "msg: t={} retained={} p={}",
                    publish.topic, publish.retain, payload
                );
                if let Some(node) = topics::parse_status_node(&publish.topic) {
                    presence.set_online(node, payload.eq_ignore_ascii_case("online"));
                }
                router.dispatch(IncomingMessage::new(
                    publish.topic,
                    payload,
                    publish.retain,
                ));
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = connected.swap(false, Ordering::SeqCst);
                if was_connected {
                    warn!("connection lost: {}", e);
                    state_tx.send_replace(ConnectionState::Reconnecting);
                } else {
                    warn!("connect failed: {}", e);
                    state_tx.send_replace(ConnectionState::Failed);
                }
                presence.set_online(&node_id, false);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Status topic plus every device's state topic, QoS 1.
async fn subscribe_all(client: &AsyncClient, node_id: &str) {
    let mut filters = vec![topics::node_status(node_id)];
    filters.extend(
        DeviceType::ALL
            .iter()
            .map(|device| topics::state_topic(node_id, device.as_str())),
    );
    for filter in filters {
        match client.subscribe(&filter, QoS::AtLeastOnce).await {
            Ok(()) => debug!("sub ok: {}", filter),
            Err(e) => error!("sub failed: {}: {}", filter, e),
        }
    }
}

pub(crate) fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_session_is_dropped_silently() {
        let client = SessionClient::new(Arc::new(PresenceTracker::new()), InboundRouter::new());
        // no session exists; must neither panic nor touch any transport
        client.publish("iot/nodes/esp-1/commands", "{}").await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.current_client_id().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_when_never_connected_is_a_no_op() {
        let client = SessionClient::new(Arc::new(PresenceTracker::new()), InboundRouter::new());
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn client_ids_are_short_and_unique() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
