//! # Embedded Broker
//!
//! A self-contained MQTT 3.1.1 broker so the app works on networks with no
//! infrastructure: the phone hosts the broker, the nodes connect to it.
//!
//! ```text
//! broker/
//! ├── server.rs     - wire protocol, routing, retained store, last will
//! └── supervisor.rs - start/stop keyed on whether the target host is local
//! ```

mod server;
mod supervisor;

pub use server::BrokerError;
pub use supervisor::BrokerSupervisor;
