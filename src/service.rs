//! Gateway service.
//!
//! The long-running piece that keeps everything consistent with the
//! current settings: embedded broker up or down, discovery responder in
//! step with it, one broker session connected for the configured node, and
//! stale retained status scrubbed whenever the target moves. UI layers
//! talk to the session and presence tracker directly; this service only
//! reacts to settings changes and process lifecycle.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::BrokerSupervisor;
use crate::config::ConnectionSettings;
use crate::discovery::DiscoveryResponder;
use crate::mqtt::{reconciler, topics, SessionClient};

struct RunningService {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct GatewayService {
    session: Arc<SessionClient>,
    broker: Arc<BrokerSupervisor>,
    discovery: Arc<DiscoveryResponder>,
    settings_rx: watch::Receiver<ConnectionSettings>,
    running: Mutex<Option<RunningService>>,
}

impl GatewayService {
    pub fn new(
        session: Arc<SessionClient>,
        broker: Arc<BrokerSupervisor>,
        discovery: Arc<DiscoveryResponder>,
        settings_rx: watch::Receiver<ConnectionSettings>,
    ) -> Self {
        Self {
            session,
            broker,
            discovery,
            settings_rx,
            running: Mutex::new(None),
        }
    }

    /// Brings the service up against the current settings and keeps it
    /// tracking every subsequent change. Idempotent.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("gateway service already running");
            return;
        }
        info!("gateway service starting");
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.session.clone(),
            self.broker.clone(),
            self.discovery.clone(),
            self.settings_rx.clone(),
            shutdown.clone(),
        ));
        *running = Some(RunningService { shutdown, task });
    }

    /// Tears everything down in dependency order: session first so its
    /// DISCONNECT reaches the broker, then discovery, then the broker.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(service) = running.take() else {
            return;
        };
        service.shutdown.cancel();
        let _ = service.task.await;
        self.session.disconnect().await;
        self.discovery.stop().await;
        self.broker.stop().await;
        info!("gateway service stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

async fn run_loop(
    session: Arc<SessionClient>,
    broker: Arc<BrokerSupervisor>,
    discovery: Arc<DiscoveryResponder>,
    mut settings_rx: watch::Receiver<ConnectionSettings>,
    shutdown: CancellationToken,
) {
    let mut last_target: Option<(String, u16, String)> = None;
    loop {
        let settings = settings_rx.borrow_and_update().clone();
        let node_id = topics::normalize_node(&settings.default_node).to_string();
        let target = (
            settings.broker_host.clone(),
            settings.broker_port,
            node_id.clone(),
        );

        if last_target.as_ref() != Some(&target) {
            // The old node's retained "online" would outlive the move and
            // mislead anyone still subscribed there.
            if let Some((old_host, old_port, old_node)) = last_target.take() {
                reconciler::reset_node_status(&old_host, old_port, &old_node).await;
            }
            broker.ensure(&settings.broker_host, settings.broker_port).await;
            discovery
                .ensure(&settings.broker_host, settings.broker_port)
                .await;
            session.connect(&settings).await;
            last_target = Some(target);
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
