//! # MQTT Core
//!
//! The connection and presence-management layer: everything between the
//! broker socket and the typed observers the UI consumes.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── topics.rs     - canonical topic strings for the node namespace
//! ├── session.rs    - session client: connect/reconnect, publish, LWT
//! ├── presence.rs   - node online/offline map with snapshot reads
//! ├── router.rs     - broadcast fan-out of every inbound message
//! ├── decode.rs     - typed device-state and learn-event observers
//! └── reconciler.rs - retained-status scrubbing via throwaway sessions
//! ```
//!
//! ## Threading Model
//!
//! The session's transport events arrive on a dedicated event-loop task.
//! All shared state it touches (presence map, router stream, connection
//! state) is published through watch/broadcast channels, so arbitrarily
//! many UI-side readers can observe it without locks and without ever
//! seeing a partial update.

pub mod decode;
pub mod presence;
pub mod reconciler;
pub mod router;
pub mod session;
pub mod topics;

pub use presence::{PresenceSnapshot, PresenceTracker};
pub use router::{InboundRouter, IncomingMessage};
pub use session::{ConnectionState, SessionClient};
