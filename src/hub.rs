/// Connection hub — authoritative client registry, room membership,
/// presence, and outbound fan-out.
///
/// All registry/room/presence mutations take the single write lock, so
/// every state change is serialized. Transports read their sockets in
/// parallel and hand decoded messages in through [`Hub::receive`]; the
/// kernel consumes the resulting events from one channel.
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::message::{now_millis, Message};
use crate::presence::{ClientSnapshot, PresenceStore};
use crate::rooms::RoomManager;

/// Commands delivered to the task that owns a client's socket.
#[derive(Debug)]
pub enum ClientCommand {
    /// Write a message to the wire.
    Deliver(Message),
    /// Close the connection, optionally with a reason.
    Close(Option<String>),
}

/// A connected endpoint — a user WebSocket or a synthetic mesh peer.
#[derive(Debug)]
pub struct ClientContext {
    pub id: String,
    /// Tag identifying the owning transport (`"websocket"`, `"mesh"`, …).
    pub transport: String,
    pub metadata: Map<String, Value>,
    pub connected_at: u64,
    /// Rooms the client currently belongs to; kept in sync by the hub.
    pub rooms: Vec<String>,
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientContext {
    pub fn new(
        id: impl Into<String>,
        transport: impl Into<String>,
        metadata: Map<String, Value>,
        tx: mpsc::UnboundedSender<ClientCommand>,
    ) -> Self {
        Self {
            id: id.into(),
            transport: transport.into(),
            metadata,
            connected_at: now_millis(),
            rooms: Vec::new(),
            tx,
        }
    }

    fn deliver(&self, message: Message) -> bool {
        self.tx.send(ClientCommand::Deliver(message)).is_ok()
    }

    fn close(&self, reason: Option<String>) {
        let _ = self.tx.send(ClientCommand::Close(reason));
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id.clone(),
            transport: self.transport.clone(),
            metadata: self.metadata.clone(),
            connected_at: self.connected_at,
            rooms: self.rooms.clone(),
        }
    }
}

/// Events emitted by the hub, consumed by the kernel's dispatch worker.
#[derive(Debug)]
pub enum HubEvent {
    Connected {
        id: String,
    },
    Disconnected {
        id: String,
        reason: Option<String>,
    },
    Message {
        message: Message,
        client_id: String,
    },
}

#[derive(Debug, Default)]
struct HubState {
    clients: HashMap<String, ClientContext>,
    rooms: RoomManager,
    presence: PresenceStore,
}

#[derive(Debug)]
pub struct Hub {
    state: RwLock<HubState>,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    /// Create a hub and the event stream its kernel will consume.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            state: RwLock::new(HubState::default()),
            events,
        });
        (hub, rx)
    }

    /// Register a freshly-accepted client: insert into the registry, take
    /// the initial presence snapshot, and emit `Connected`.
    pub async fn register_client(&self, client: ClientContext) {
        let id = client.id.clone();
        {
            let mut st = self.state.write().await;
            st.presence.connect(client.snapshot());
            st.rooms.ensure(&id);
            st.clients.insert(id.clone(), client);
        }
        debug!(client = %id, "client registered");
        let _ = self.events.send(HubEvent::Connected { id });
    }

    /// Tear a client down. No-op for unknown ids; otherwise the client
    /// leaves every room while its presence entry is still consistent, then
    /// registry and presence entries are removed and `Disconnected` fires.
    pub async fn unregister_client(&self, id: &str, reason: Option<String>) {
        {
            let mut st = self.state.write().await;
            if !st.clients.contains_key(id) {
                return;
            }
            st.rooms.leave_all(id);
            st.presence.disconnect(id);
            st.clients.remove(id);
        }
        debug!(client = %id, ?reason, "client unregistered");
        let _ = self.events.send(HubEvent::Disconnected {
            id: id.to_owned(),
            reason,
        });
    }

    /// Push an inbound message from a transport. Messages from unknown
    /// clients are dropped silently — they may have just disconnected.
    pub async fn receive(&self, message: Message, client_id: &str) {
        let known = self.state.read().await.clients.contains_key(client_id);
        if !known {
            debug!(client = %client_id, kind = %message.kind, "dropping message from unknown client");
            return;
        }
        let _ = self.events.send(HubEvent::Message {
            message,
            client_id: client_id.to_owned(),
        });
    }

    /// Join a client to a room, refreshing its `rooms` field and presence.
    pub async fn join_room(&self, client_id: &str, room: &str) {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        if !st.clients.contains_key(client_id) {
            return;
        }
        st.rooms.join(room, client_id);
        let rooms = st.rooms.rooms_for(client_id);
        if let Some(client) = st.clients.get_mut(client_id) {
            client.rooms = rooms.clone();
        }
        st.presence.sync_rooms(client_id, rooms);
    }

    /// Remove a client from a room, refreshing its `rooms` field and presence.
    pub async fn leave_room(&self, client_id: &str, room: &str) {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        if !st.clients.contains_key(client_id) {
            return;
        }
        st.rooms.leave(room, client_id);
        let rooms = st.rooms.rooms_for(client_id);
        if let Some(client) = st.clients.get_mut(client_id) {
            client.rooms = rooms.clone();
        }
        st.presence.sync_rooms(client_id, rooms);
    }

    /// Stamp and deliver a message to one client. Returns whether delivery
    /// was attempted (the client was known and its channel open).
    pub async fn send(&self, client_id: &str, mut message: Message) -> bool {
        message.timestamp = Some(now_millis());
        let st = self.state.read().await;
        match st.clients.get(client_id) {
            Some(client) => client.deliver(message),
            None => false,
        }
    }

    /// Stamp once and deliver to every target: room members when a room is
    /// given, the whole registry otherwise, minus `except`. Enumeration
    /// order is unspecified. Returns the number of deliveries attempted.
    pub async fn broadcast(
        &self,
        mut message: Message,
        room: Option<&str>,
        except: &[String],
    ) -> usize {
        message.timestamp = Some(now_millis());
        let st = self.state.read().await;
        let target_ids: Vec<String> = match room {
            Some(room) => st.rooms.list(room),
            None => st.clients.keys().cloned().collect(),
        };
        let mut delivered = 0;
        for id in target_ids {
            if except.contains(&id) {
                continue;
            }
            if let Some(client) = st.clients.get(&id) {
                if client.deliver(message.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Ask a client's owning transport to close the connection.
    pub async fn close_client(&self, client_id: &str, reason: Option<String>) {
        let st = self.state.read().await;
        if let Some(client) = st.clients.get(client_id) {
            client.close(reason);
        }
    }

    /// Shallow-merge metadata into a client's presence snapshot.
    pub async fn update_presence(&self, client_id: &str, metadata: Map<String, Value>) {
        self.state.write().await.presence.update(client_id, metadata);
    }

    pub async fn presence_get(&self, client_id: &str) -> Option<ClientSnapshot> {
        self.state.read().await.presence.get(client_id)
    }

    pub async fn presence_list(&self) -> Vec<ClientSnapshot> {
        self.state.read().await.presence.list()
    }

    pub async fn room_members(&self, room: &str) -> Vec<String> {
        self.state.read().await.rooms.list(room)
    }

    pub async fn rooms_for(&self, client_id: &str) -> Vec<String> {
        self.state.read().await.rooms.rooms_for(client_id)
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.state.read().await.rooms.room_names()
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }
}
