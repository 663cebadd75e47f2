//! Node presence tracking.
//!
//! Presence is derived from two event sources: retained status messages on
//! `iot/nodes/<node>/status` and session-level connectivity loss. Entries
//! are created lazily and never expire; a silent node keeps its last-known
//! state until a status message or a disconnect says otherwise.
//!
//! Readers get copy-on-write snapshots through watch channels: every update
//! publishes a fresh `Arc<HashMap>` and readers hold on to whichever
//! snapshot they borrowed, so there is no reader-side locking and no torn
//! reads from transport callback tasks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Immutable view of node id -> online.
pub type PresenceSnapshot = Arc<HashMap<String, bool>>;

pub struct PresenceTracker {
    inner: Mutex<HashMap<String, bool>>,
    nodes_tx: watch::Sender<PresenceSnapshot>,
    any_tx: watch::Sender<bool>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (nodes_tx, _) = watch::channel(PresenceSnapshot::default());
        let (any_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(HashMap::new()),
            nodes_tx,
            any_tx,
        }
    }

    /// Records a status observation. Duplicate deliveries are idempotent:
    /// an unchanged value publishes no new snapshot and wakes no watcher.
    pub fn set_online(&self, node_id: &str, online: bool) {
        let mut map = self.inner.lock();
        if map.get(node_id) == Some(&online) {
            return;
        }
        map.insert(node_id.to_string(), online);
        debug!("presence: {} -> {}", node_id, online);
        self.publish(&map);
    }

    /// Ensures an entry exists for `node_id`, defaulting to offline, and
    /// forces it offline if it was online. Called when a session (re)binds
    /// to a node; other nodes' last-known state is left untouched.
    pub fn reset_node(&self, node_id: &str) {
        let mut map = self.inner.lock();
        if map.get(node_id) == Some(&false) {
            return;
        }
        map.insert(node_id.to_string(), false);
        self.publish(&map);
    }

    fn publish(&self, map: &HashMap<String, bool>) {
        let snapshot: PresenceSnapshot = Arc::new(map.clone());
        let any = map.values().any(|v| *v);
        self.nodes_tx.send_replace(snapshot);
        self.any_tx.send_if_modified(|current| {
            if *current == any {
                false
            } else {
                *current = any;
                true
            }
        });
    }

    /// Current snapshot of all known nodes.
    pub fn snapshot(&self) -> PresenceSnapshot {
        self.nodes_tx.borrow().clone()
    }

    /// True when at least one known node is online.
    pub fn any_online(&self) -> bool {
        *self.any_tx.borrow()
    }

    /// Watch the per-node map, for per-node UI.
    pub fn watch_nodes(&self) -> watch::Receiver<PresenceSnapshot> {
        self.nodes_tx.subscribe()
    }

    /// Watch the any-node-online reduction, for a global banner.
    pub fn watch_any_online(&self) -> watch::Receiver<bool> {
        self.any_tx.subscribe()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
