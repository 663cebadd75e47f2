//! # irlink
//!
//! MQTT connection and presence-management core for IR-blaster network nodes.
//!
//! irlink turns ESP32-class nodes with IR emitters into controllable
//! appliances (AC, TV, fan, set-top box, DVD, projector) over MQTT. This
//! crate is the transport core: it owns the broker session, tracks node
//! online/offline presence from retained status messages, fans inbound
//! traffic out to typed observers, and keeps retained broker state honest
//! when sessions are abandoned.
//!
//! ## Module Architecture
//!
//! ```text
//! irlink/
//! ├── config      - connection settings store (toml, watch stream)
//! ├── model       - device kinds and typed device states
//! ├── mqtt        - session client, presence, routing, reconciler
//! ├── broker      - embedded MQTT broker and its supervisor
//! ├── discovery   - LAN discovery responder (udp/4210)
//! ├── profiles    - saved remote-control profiles
//! ├── service     - gateway service wiring settings to the subsystems
//! └── net         - local-address classification helpers
//! ```
//!
//! ## Design Philosophy
//!
//! - **One session at a time**: exactly one broker connection is live;
//!   reconfiguring tears the old one down and scrubs its retained state.
//! - **State over exceptions**: transport failures never propagate to
//!   callers. They surface as presence transitions and connection-state
//!   changes observable through watch channels.
//! - **Snapshot reads**: presence is published as immutable snapshots so
//!   UI-side readers never observe a half-applied update.

pub mod broker;
pub mod config;
pub mod discovery;
pub mod model;
pub mod mqtt;
pub mod net;
pub mod profiles;
pub mod service;
