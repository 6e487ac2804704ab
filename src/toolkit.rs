/// Per-invocation handler toolkit.
///
/// A small value object bound to the originating client: it carries a
/// back-pointer to the hub and the client id rather than capturing the
/// kernel in a closure, which keeps handler signatures uniform.
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::hub::Hub;
use crate::message::Message;
use crate::presence::ClientSnapshot;

#[derive(Clone)]
pub struct Toolkit {
    hub: Arc<Hub>,
    client_id: String,
    /// Room of the message being dispatched, used as the room-broadcast
    /// fallback.
    origin_room: Option<String>,
}

/// Options for a room-scoped broadcast.
#[derive(Debug, Default, Clone)]
pub struct RoomBroadcast {
    /// Exclude the originating client.
    pub except_self: bool,
    /// Additional client ids to exclude.
    pub except: Vec<String>,
}

impl Toolkit {
    pub(crate) fn new(hub: Arc<Hub>, client_id: String, origin_room: Option<String>) -> Self {
        Self {
            hub,
            client_id,
            origin_room,
        }
    }

    /// Id of the client whose message is being dispatched.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send a message back to the originating client, as-is.
    pub async fn reply(&self, message: Message) -> bool {
        self.hub.send(&self.client_id, message).await
    }

    /// Send a plain-text `system:reply` back to the originating client.
    pub async fn reply_text(&self, text: &str) -> bool {
        self.reply(Message::reply_text(text)).await
    }

    /// Direct unicast to any client.
    pub async fn send(&self, target_id: &str, message: Message) -> bool {
        self.hub.send(target_id, message).await
    }

    /// Broadcast to every registered client, no room scope.
    pub async fn broadcast(&self, message: Message) -> usize {
        self.hub.broadcast(message, None, &[]).await
    }

    /// Broadcast to every client whose presence snapshot matches the filter.
    pub async fn broadcast_filtered<F>(&self, message: Message, filter: F) -> usize
    where
        F: Fn(&ClientSnapshot) -> bool,
    {
        let mut delivered = 0;
        for snapshot in self.hub.presence_list().await {
            if filter(&snapshot) && self.hub.send(&snapshot.id, message.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Room operations bound to the originating client.
    pub fn rooms(&self) -> RoomsToolkit<'_> {
        RoomsToolkit { tk: self }
    }

    /// Presence operations bound to the originating client.
    pub fn presence(&self) -> PresenceToolkit<'_> {
        PresenceToolkit { tk: self }
    }

    /// Debug log scoped to the originating client.
    pub fn log(&self, text: &str) {
        debug!(client = %self.client_id, "{text}");
    }
}

pub struct RoomsToolkit<'a> {
    tk: &'a Toolkit,
}

impl RoomsToolkit<'_> {
    /// Join the originating client to a room.
    pub async fn join(&self, room: &str) {
        self.tk.hub.join_room(&self.tk.client_id, room).await;
    }

    /// Remove the originating client from a room.
    pub async fn leave(&self, room: &str) {
        self.tk.hub.leave_room(&self.tk.client_id, room).await;
    }

    /// Members of a room.
    pub async fn list(&self, room: &str) -> Vec<String> {
        self.tk.hub.room_members(room).await
    }

    /// Broadcast to a room, defaulting to the dispatched message's room.
    /// When neither resolves, the call is a silent no-op.
    pub async fn broadcast(
        &self,
        room: Option<&str>,
        message: Message,
        opts: RoomBroadcast,
    ) -> usize {
        let room = match room.or(self.tk.origin_room.as_deref()) {
            Some(room) => room,
            None => return 0,
        };
        let mut except = opts.except;
        if opts.except_self {
            except.push(self.tk.client_id.clone());
        }
        self.tk.hub.broadcast(message, Some(room), &except).await
    }
}

pub struct PresenceToolkit<'a> {
    tk: &'a Toolkit,
}

impl PresenceToolkit<'_> {
    pub async fn list(&self) -> Vec<ClientSnapshot> {
        self.tk.hub.presence_list().await
    }

    pub async fn get(&self, client_id: &str) -> Option<ClientSnapshot> {
        self.tk.hub.presence_get(client_id).await
    }

    /// Shallow-merge metadata into the originating client's snapshot.
    pub async fn update(&self, metadata: Map<String, Value>) {
        self.tk.hub.update_presence(&self.tk.client_id, metadata).await;
    }
}
