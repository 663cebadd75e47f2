//! Retained-state reconciler.
//!
//! Retained messages outlive the client that published them. If a session
//! dies without its last will firing (broker restart, app-initiated
//! reconfiguration), a stale retained "online" on the node's status topic
//! would mislead every future subscriber. This module forcibly overwrites
//! it: a short-lived connection under its own client id publishes a
//! retained "offline" and goes away. Best-effort hygiene only — every
//! failure is logged and swallowed, and nothing waits on it.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS};
use tracing::{debug, info, warn};

use super::session::short_id;
use super::topics;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const KEEP_ALIVE: Duration = Duration::from_secs(10);
const ACK_WAIT: Duration = Duration::from_secs(5);
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Overwrites the retained status of `node_id` on the given broker with
/// "offline" (QoS 1, retained). Synchronous-blocking within its own task:
/// bounded at roughly connect 5s + ack 5s + close 1s.
pub async fn reset_node_status(broker_host: &str, broker_port: u16, node_id: &str) {
    let status_topic = topics::node_status(node_id);
    let client_id = format!("cleaner-{}", short_id());
    let mut options = MqttOptions::new(&client_id, broker_host, broker_port);
    options
        .set_clean_session(true)
        .set_keep_alive(KEEP_ALIVE);

    let (client, mut eventloop) = AsyncClient::new(options, 8);
    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(CONNECT_TIMEOUT_SECS);
    eventloop.set_network_options(network_options);

    debug!(
        "reconciler {}: resetting {} on {}:{}",
        client_id, status_topic, broker_host, broker_port
    );

    match tokio::time::timeout(ACK_WAIT, wait_for_connack(&mut eventloop)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("failed to reset retained status: connect: {}", e);
            return;
        }
        Err(_) => {
            warn!("failed to reset retained status: connect timed out");
            return;
        }
    }

    if let Err(e) = client.try_publish(&status_topic, QoS::AtLeastOnce, true, "offline") {
        warn!("failed to reset retained status: publish: {}", e);
    } else {
        match tokio::time::timeout(ACK_WAIT, wait_for_puback(&mut eventloop)).await {
            Ok(Ok(())) => info!("retained status of {} reset to offline", status_topic),
            Ok(Err(e)) => warn!("failed to reset retained status: ack: {}", e),
            Err(_) => warn!("failed to reset retained status: ack timed out"),
        }
    }

    // Forced close regardless of publish outcome; drain briefly so the
    // DISCONNECT actually reaches the wire.
    let _ = client.try_disconnect();
    let _ = tokio::time::timeout(CLOSE_WAIT, async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(_)) => return Ok(()),
            _ => continue,
        }
    }
}

async fn wait_for_puback(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::PubAck(_)) => return Ok(()),
            _ => continue,
        }
    }
}
