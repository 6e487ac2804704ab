/// Presence — process-local directory of currently-connected clients.
///
/// Holds one snapshot per client id, refreshed on connect, disconnect,
/// metadata update, and room change.
use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// Point-in-time view of a connected client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub id: String,
    pub transport: String,
    pub metadata: Map<String, Value>,
    pub connected_at: u64,
    pub rooms: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PresenceStore {
    snapshots: HashMap<String, ClientSnapshot>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, snapshot: ClientSnapshot) {
        self.snapshots.insert(snapshot.id.clone(), snapshot);
    }

    pub fn disconnect(&mut self, id: &str) {
        self.snapshots.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<ClientSnapshot> {
        self.snapshots.get(id).cloned()
    }

    pub fn list(&self) -> Vec<ClientSnapshot> {
        self.snapshots.values().cloned().collect()
    }

    /// Shallow-merge metadata into an existing snapshot. Unknown ids are
    /// ignored — an update must never recreate a departed client.
    pub fn update(&mut self, id: &str, metadata: Map<String, Value>) {
        if let Some(snapshot) = self.snapshots.get_mut(id) {
            for (key, value) in metadata {
                snapshot.metadata.insert(key, value);
            }
        }
    }

    /// Replace the rooms list of a snapshot.
    pub fn sync_rooms(&mut self, id: &str, rooms: Vec<String>) {
        if let Some(snapshot) = self.snapshots.get_mut(id) {
            snapshot.rooms = rooms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(id: &str) -> ClientSnapshot {
        ClientSnapshot {
            id: id.into(),
            transport: "websocket".into(),
            metadata: Map::new(),
            connected_at: 1_000,
            rooms: Vec::new(),
        }
    }

    #[test]
    fn connect_then_get() {
        let mut store = PresenceStore::new();
        store.connect(snapshot("a"));
        assert_eq!(store.get("a").unwrap().transport, "websocket");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn disconnect_removes() {
        let mut store = PresenceStore::new();
        store.connect(snapshot("a"));
        store.disconnect("a");
        assert!(store.get("a").is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn update_shallow_merges() {
        let mut store = PresenceStore::new();
        let mut snap = snapshot("a");
        snap.metadata.insert("name".into(), json!("old"));
        snap.metadata.insert("color".into(), json!("teal"));
        store.connect(snap);

        let mut patch = Map::new();
        patch.insert("name".into(), json!("new"));
        store.update("a", patch);

        let got = store.get("a").unwrap();
        assert_eq!(got.metadata["name"], "new");
        assert_eq!(got.metadata["color"], "teal");
    }

    #[test]
    fn update_unknown_id_does_not_create() {
        let mut store = PresenceStore::new();
        let mut patch = Map::new();
        patch.insert("name".into(), json!("ghost"));
        store.update("gone", patch);
        assert!(store.get("gone").is_none());
    }

    #[test]
    fn sync_rooms_replaces() {
        let mut store = PresenceStore::new();
        store.connect(snapshot("a"));
        store.sync_rooms("a", vec!["lobby".into()]);
        assert_eq!(store.get("a").unwrap().rooms, vec!["lobby"]);
        store.sync_rooms("a", vec![]);
        assert!(store.get("a").unwrap().rooms.is_empty());
    }
}
