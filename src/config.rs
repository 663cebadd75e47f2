//! Connection settings with on-disk persistence.
//!
//! Settings live in a small TOML file under the platform config directory
//! and are exposed through a watch channel, so the gateway service can
//! react to every change without polling. Missing or corrupt files fall
//! back to defaults; first write recreates them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default broker target: the embedded broker on this machine.
pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
pub const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub broker_host: String,
    pub broker_port: u16,
    /// Node the app tracks and targets by default.
    pub default_node: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            default_node: crate::mqtt::topics::DEFAULT_NODE_ID.to_string(),
        }
    }
}

impl ConnectionSettings {
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }
}

pub struct SettingsStore {
    path: PathBuf,
    tx: watch::Sender<ConnectionSettings>,
}

impl SettingsStore {
    /// Opens the store at the platform config location
    /// (`<config_dir>/irlink/settings.toml`).
    pub fn open() -> Self {
        let path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("irlink")
            .join("settings.toml");
        Self::open_at(path)
    }

    /// Opens the store at an explicit path. Tests use this to stay out of
    /// the real config directory.
    pub fn open_at(path: PathBuf) -> Self {
        let settings = Self::load(&path);
        let (tx, _) = watch::channel(settings);
        Self { path, tx }
    }

    fn load(path: &Path) -> ConnectionSettings {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    debug!("loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("corrupt settings file, using defaults: {}", e);
                    ConnectionSettings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConnectionSettings::default(),
            Err(e) => {
                warn!("could not read settings, using defaults: {}", e);
                ConnectionSettings::default()
            }
        }
    }

    pub fn current(&self) -> ConnectionSettings {
        self.tx.borrow().clone()
    }

    /// Receiver positioned at the current value.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSettings> {
        self.tx.subscribe()
    }

    /// Persists new settings and notifies watchers. No notification when
    /// the value is unchanged.
    pub fn update(&self, settings: ConnectionSettings) -> Result<(), SettingsError> {
        if settings == self.current() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(&settings)?;
        std::fs::write(&self.path, contents)?;
        info!("settings updated: broker {}", settings.broker_address());
        self.tx.send_replace(settings);
        Ok(())
    }
}
