//! End-to-end tests running real sessions against the embedded broker on
//! loopback. Every wait is bounded so a regression fails fast instead of
//! hanging the suite.

use std::sync::Arc;
use std::time::Duration;

use irlink::broker::BrokerSupervisor;
use irlink::config::ConnectionSettings;
use irlink::mqtt::{reconciler, topics, ConnectionState, InboundRouter, PresenceTracker, SessionClient};
use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{Connect, LastWill};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn settings(port: u16, node: &str) -> ConnectionSettings {
    ConnectionSettings {
        broker_host: "127.0.0.1".to_string(),
        broker_port: port,
        default_node: node.to_string(),
    }
}

/// Publishes one retained message and disconnects.
async fn publish_retained(port: u16, topic: &str, payload: &str) {
    let mut options = MqttOptions::new("test-publisher", "127.0.0.1", port);
    options.set_clean_session(true);
    let (client, mut eventloop) = AsyncClient::new(options, 8);

    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await.unwrap() {
            break;
        }
    }
    client
        .publish(topic, QoS::AtLeastOnce, true, payload)
        .await
        .unwrap();
    loop {
        if let Event::Incoming(Packet::PubAck(_)) = eventloop.poll().await.unwrap() {
            break;
        }
    }
    client.disconnect().await.unwrap();
    let _ = timeout(Duration::from_millis(200), async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;
}

#[tokio::test]
async fn supervisor_only_runs_for_local_hosts() {
    let port = free_port();
    let supervisor = BrokerSupervisor::in_memory();

    supervisor.ensure("127.0.0.1", port).await;
    assert!(supervisor.is_active().await);
    assert_eq!(supervisor.port().await, Some(port));
    // listener is actually accepting
    let stream = timeout(WAIT, tokio::net::TcpStream::connect(("127.0.0.1", port))).await;
    assert!(stream.unwrap().is_ok());

    // same target again is a no-op
    supervisor.ensure("127.0.0.1", port).await;
    assert!(supervisor.is_active().await);

    // a remote target stops the broker
    supervisor.ensure("8.8.8.8", port).await;
    assert!(!supervisor.is_active().await);

    supervisor.stop().await;
}

#[tokio::test]
async fn reconciler_overwrites_retained_status() {
    let port = free_port();
    let supervisor = BrokerSupervisor::in_memory();
    supervisor.ensure("127.0.0.1", port).await;

    let status_topic = topics::node_status("esp-9");
    publish_retained(port, &status_topic, "online").await;

    reconciler::reset_node_status("127.0.0.1", port, "esp-9").await;

    // a fresh subscriber must see retained "offline" first
    let mut options = MqttOptions::new("test-subscriber", "127.0.0.1", port);
    options.set_clean_session(true);
    let (client, mut eventloop) = AsyncClient::new(options, 8);
    let received = timeout(WAIT, async {
        loop {
            match eventloop.poll().await.unwrap() {
                Event::Incoming(Packet::ConnAck(_)) => {
                    client
                        .subscribe(&status_topic, QoS::AtLeastOnce)
                        .await
                        .unwrap();
                }
                Event::Incoming(Packet::Publish(publish)) => return publish,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(received.topic, status_topic);
    assert_eq!(&received.payload[..], b"offline");
    assert!(received.retain);

    supervisor.stop().await;
}

#[tokio::test]
async fn silent_client_is_reaped_and_its_will_published() {
    let port = free_port();
    let supervisor = BrokerSupervisor::in_memory();
    supervisor.ensure("127.0.0.1", port).await;

    let will_topic = topics::node_status("esp-silent");

    // watcher on the will topic
    let mut options = MqttOptions::new("will-watcher", "127.0.0.1", port);
    options.set_clean_session(true);
    let (client, mut eventloop) = AsyncClient::new(options, 8);

    // hand-rolled CONNECT with keep_alive=1 and a retained "offline"
    // will, then silence: the broker must reap the client at 1.5x the
    // keep-alive and publish the will on its behalf
    let mut connect = Connect::new("silent-node");
    connect.keep_alive = 1;
    connect.last_will = Some(LastWill::new(
        will_topic.clone(),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    let mut frame = BytesMut::new();
    connect.write(&mut frame).unwrap();
    let mut silent = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    silent.write_all(&frame).await.unwrap();
    let mut connack = [0u8; 4];
    silent.read_exact(&mut connack).await.unwrap();

    let received = timeout(WAIT, async {
        loop {
            match eventloop.poll().await.unwrap() {
                Event::Incoming(Packet::ConnAck(_)) => {
                    client
                        .subscribe(&will_topic, QoS::AtLeastOnce)
                        .await
                        .unwrap();
                }
                Event::Incoming(Packet::Publish(publish)) => return publish,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(received.topic, will_topic);
    assert_eq!(&received.payload[..], b"offline");
    drop(silent);

    supervisor.stop().await;
}

#[tokio::test]
async fn session_tracks_presence_and_broker_loss() {
    let port = free_port();
    let supervisor = BrokerSupervisor::in_memory();
    supervisor.ensure("127.0.0.1", port).await;

    let presence = Arc::new(PresenceTracker::new());
    let session = SessionClient::new(presence.clone(), InboundRouter::new());
    session.connect(&settings(port, "esp-1")).await;

    let mut state = session.watch_state();
    timeout(WAIT, async {
        while *state.borrow() != ConnectionState::Connected {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    // node comes online via its retained status topic
    publish_retained(port, &topics::node_status("esp-1"), "online").await;
    let mut nodes = presence.watch_nodes();
    timeout(WAIT, async {
        while nodes.borrow().get("esp-1") != Some(&true) {
            nodes.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(presence.any_online());

    // broker goes away: the configured node flips offline
    supervisor.stop().await;
    timeout(WAIT, async {
        while nodes.borrow().get("esp-1") != Some(&false) {
            nodes.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(!presence.any_online());

    session.disconnect().await;
}

#[tokio::test]
async fn connect_to_same_target_keeps_the_session() {
    let port = free_port();
    let supervisor = BrokerSupervisor::in_memory();
    supervisor.ensure("127.0.0.1", port).await;

    let session = SessionClient::new(Arc::new(PresenceTracker::new()), InboundRouter::new());
    session.connect(&settings(port, "esp-1")).await;

    let mut state = session.watch_state();
    timeout(WAIT, async {
        while *state.borrow() != ConnectionState::Connected {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let first = session.current_client_id().await.unwrap();
    session.connect(&settings(port, "esp-1")).await;
    assert_eq!(session.current_client_id().await.unwrap(), first);

    // a different node is a new session under a new client id
    session.connect(&settings(port, "esp-2")).await;
    assert_ne!(session.current_client_id().await.unwrap(), first);

    session.disconnect().await;
    supervisor.stop().await;
}
