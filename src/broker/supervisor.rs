//! Embedded broker lifecycle.
//!
//! The broker runs only while the configured broker host resolves to this
//! machine; pointing the app at an external broker stops it. `ensure` is
//! idempotent and ordering-safe: callers hand it every settings change and
//! the supervisor works out whether anything has to happen.

use std::path::PathBuf;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::net;

use super::server::{self, Shared};

struct RunningBroker {
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct BrokerSupervisor {
    store_path: Option<PathBuf>,
    inner: Mutex<Option<RunningBroker>>,
}

impl BrokerSupervisor {
    /// Supervisor with retained messages persisted under the user's data
    /// directory.
    pub fn new() -> Self {
        let store_path = dirs::data_dir().map(|dir| dir.join("irlink").join("retained.json"));
        Self {
            store_path,
            inner: Mutex::new(None),
        }
    }

    /// Supervisor without retained persistence. Used by tests so parallel
    /// brokers never share a store file.
    pub fn in_memory() -> Self {
        Self {
            store_path: None,
            inner: Mutex::new(None),
        }
    }

    /// Reconciles the broker with the configured target. Starts a listener
    /// on `0.0.0.0:port` when `host` points at this machine, stops any
    /// running listener when it does not, and leaves a matching listener
    /// alone. A bind failure logs and leaves the broker stopped; the
    /// session layer will surface the connect failure on its own.
    pub async fn ensure(&self, host: &str, port: u16) {
        let mut inner = self.inner.lock().await;

        if !net::is_local_host(host) {
            if let Some(running) = inner.take() {
                info!("broker target {} is remote, stopping embedded broker", host);
                Self::shutdown(running).await;
            }
            return;
        }

        if let Some(running) = inner.as_ref() {
            if running.port == port {
                return;
            }
        }
        if let Some(running) = inner.take() {
            Self::shutdown(running).await;
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("embedded broker could not bind port {}: {}", port, e);
                return;
            }
        };
        info!("embedded broker listening on 0.0.0.0:{}", port);

        let shared = Shared::load(self.store_path.clone()).await;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server::run(listener, shared, shutdown.clone()));
        *inner = Some(RunningBroker {
            port,
            shutdown,
            task,
        });
    }

    /// Stops the listener and drops live client connections. Safe to call
    /// when nothing is running.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(running) = inner.take() {
            Self::shutdown(running).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<u16> {
        self.inner.lock().await.as_ref().map(|r| r.port)
    }

    async fn shutdown(running: RunningBroker) {
        running.shutdown.cancel();
        let _ = running.task.await;
        info!("embedded broker stopped");
    }
}

impl Default for BrokerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
