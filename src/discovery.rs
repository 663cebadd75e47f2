//! LAN discovery responder.
//!
//! Nodes that boot without a configured broker blind-broadcast a probe on
//! UDP 4210. When the embedded broker is active, this responder answers
//! each probe with the broker's address so nodes can self-configure. It
//! only ever runs alongside the embedded broker; against an external
//! broker the nodes are expected to be provisioned out of band.

use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net;

/// Well-known discovery port, matched by node firmware.
pub const DISCOVERY_PORT: u16 = 4210;
const PROBE: &str = "DISCOVER_IOT_MQTT";

struct RunningResponder {
    host: String,
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DiscoveryResponder {
    inner: Mutex<Option<RunningResponder>>,
}

impl DiscoveryResponder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Starts or stops the responder to match the broker target, like
    /// [`crate::broker::BrokerSupervisor::ensure`]. `port` is the broker
    /// port to advertise, not the discovery port.
    pub async fn ensure(&self, host: &str, port: u16) {
        let mut inner = self.inner.lock().await;

        if !net::is_local_host(host) {
            if let Some(running) = inner.take() {
                Self::shutdown(running).await;
            }
            return;
        }
        // The advertised address derives from the host, so a host change
        // restarts the responder even on an unchanged port.
        let host = host.trim().to_string();
        if let Some(running) = inner.as_ref() {
            if running.host == host && running.port == port {
                return;
            }
        }
        if let Some(running) = inner.take() {
            Self::shutdown(running).await;
        }

        // Advertise a concrete LAN-reachable address. A loopback or blank
        // host in the settings means "this machine", so fall back to the
        // interface address; if none is found, replies are skipped rather
        // than sending nodes somewhere unreachable.
        let advertised = advertised_host(&host);
        let socket = match UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("discovery responder could not bind udp {}: {}", DISCOVERY_PORT, e);
                return;
            }
        };
        info!("discovery responder active on udp {}", DISCOVERY_PORT);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(respond_loop(socket, advertised, port, shutdown.clone()));
        *inner = Some(RunningResponder {
            host,
            port,
            shutdown,
            task,
        });
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(running) = inner.take() {
            Self::shutdown(running).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn shutdown(running: RunningResponder) {
        running.shutdown.cancel();
        let _ = running.task.await;
        info!("discovery responder stopped");
    }
}

impl Default for DiscoveryResponder {
    fn default() -> Self {
        Self::new()
    }
}

fn advertised_host(configured: &str) -> Option<IpAddr> {
    if let Ok(ip) = configured.trim().parse::<IpAddr>() {
        if !ip.is_loopback() && !ip.is_unspecified() {
            return Some(ip);
        }
    }
    net::lan_ip()
}

async fn respond_loop(
    socket: UdpSocket,
    advertised: Option<IpAddr>,
    broker_port: u16,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; 256];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer): (usize, SocketAddr) = match received {
            Ok(pair) => pair,
            Err(e) => {
                warn!("discovery recv failed: {}", e);
                continue;
            }
        };
        let probe = String::from_utf8_lossy(&buf[..len]);
        if probe.trim() != PROBE {
            debug!("ignoring unknown probe from {}: {:?}", peer, probe);
            continue;
        }
        let Some(host) = advertised else {
            warn!("discovery probe from {} but no advertisable address", peer);
            continue;
        };
        let reply = format!("MQTT://{}:{}", host, broker_port);
        match socket.send_to(reply.as_bytes(), peer).await {
            Ok(_) => info!("answered discovery probe from {} with {}", peer, reply),
            Err(e) => warn!("discovery reply to {} failed: {}", peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responder_ignores_remote_broker_hosts() {
        let responder = DiscoveryResponder::new();
        responder.ensure("203.0.113.7", 1883).await;
        assert!(!responder.is_active().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let responder = DiscoveryResponder::new();
        responder.stop().await;
        assert!(!responder.is_active().await);
    }

    #[tokio::test]
    async fn host_change_restarts_with_the_new_advertised_address() {
        let responder = DiscoveryResponder::new();
        responder.ensure("192.168.1.5", 1883).await;
        if !responder.is_active().await {
            // udp/4210 not bindable here; nothing to observe
            return;
        }
        responder.ensure("192.168.1.9", 1883).await;
        assert!(responder.is_active().await);

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe
            .send_to(PROBE.as_bytes(), ("127.0.0.1", DISCOVERY_PORT))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            probe.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..len], b"MQTT://192.168.1.9:1883");

        responder.stop().await;
    }

    #[test]
    fn concrete_lan_host_is_advertised_verbatim() {
        assert_eq!(
            advertised_host("192.168.1.20"),
            Some("192.168.1.20".parse().unwrap())
        );
    }
}
