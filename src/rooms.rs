/// Room membership — bidirectional map between rooms and client ids.
///
/// Room names are case-insensitive; the lowercased form is canonical.
/// Empty rooms are dropped entirely. A registered client always has a
/// membership entry (possibly empty) until it is removed with `leave_all`.
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct RoomManager {
    /// room → member client ids.
    members: HashMap<String, HashSet<String>>,
    /// client id → rooms the client is in.
    memberships: HashMap<String, HashSet<String>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a membership entry exists for a client. Called on register.
    pub fn ensure(&mut self, client_id: &str) {
        self.memberships.entry(client_id.to_owned()).or_default();
    }

    /// Add a client to a room. No-op on an empty room name.
    pub fn join(&mut self, room: &str, client_id: &str) {
        if room.is_empty() {
            return;
        }
        let room = room.to_lowercase();
        self.members
            .entry(room.clone())
            .or_default()
            .insert(client_id.to_owned());
        self.memberships
            .entry(client_id.to_owned())
            .or_default()
            .insert(room);
    }

    /// Remove a client from a room, dropping the room once empty.
    pub fn leave(&mut self, room: &str, client_id: &str) {
        let room = room.to_lowercase();
        if let Some(members) = self.members.get_mut(&room) {
            members.remove(client_id);
            if members.is_empty() {
                self.members.remove(&room);
            }
        }
        if let Some(rooms) = self.memberships.get_mut(client_id) {
            rooms.remove(&room);
        }
    }

    /// Remove a client from every room it belongs to and drop its entry.
    pub fn leave_all(&mut self, client_id: &str) {
        let rooms = self
            .memberships
            .remove(client_id)
            .unwrap_or_default();
        for room in rooms {
            if let Some(members) = self.members.get_mut(&room) {
                members.remove(client_id);
                if members.is_empty() {
                    self.members.remove(&room);
                }
            }
        }
    }

    /// Client ids in a room. Empty for unknown rooms. Order unspecified.
    pub fn list(&self, room: &str) -> Vec<String> {
        self.members
            .get(&room.to_lowercase())
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a client is in. Order unspecified.
    pub fn rooms_for(&self, client_id: &str) -> Vec<String> {
        self.memberships
            .get(client_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All room names with at least one member.
    pub fn room_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_list() {
        let mut rooms = RoomManager::new();
        rooms.join("lobby", "a");
        rooms.join("lobby", "b");
        let mut members = rooms.list("lobby");
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
    }

    #[test]
    fn join_empty_room_is_noop() {
        let mut rooms = RoomManager::new();
        rooms.join("", "a");
        assert!(rooms.room_names().is_empty());
        assert!(rooms.rooms_for("a").is_empty());
    }

    #[test]
    fn room_names_are_case_insensitive() {
        let mut rooms = RoomManager::new();
        rooms.join("Lobby", "a");
        rooms.join("LOBBY", "b");
        assert_eq!(rooms.list("lobby").len(), 2);
        assert_eq!(rooms.list("lObBy").len(), 2);
        assert_eq!(rooms.room_names(), vec!["lobby"]);
        assert_eq!(rooms.rooms_for("a"), vec!["lobby"]);
    }

    #[test]
    fn leave_drops_empty_room() {
        let mut rooms = RoomManager::new();
        rooms.join("lobby", "a");
        rooms.leave("lobby", "a");
        assert!(rooms.room_names().is_empty());
        assert!(rooms.list("lobby").is_empty());
    }

    #[test]
    fn leave_keeps_populated_room() {
        let mut rooms = RoomManager::new();
        rooms.join("lobby", "a");
        rooms.join("lobby", "b");
        rooms.leave("lobby", "a");
        assert_eq!(rooms.list("lobby"), vec!["b"]);
    }

    #[test]
    fn leave_all_clears_every_membership() {
        let mut rooms = RoomManager::new();
        rooms.join("lobby", "a");
        rooms.join("games", "a");
        rooms.join("games", "b");
        rooms.leave_all("a");
        assert!(rooms.rooms_for("a").is_empty());
        assert!(rooms.list("lobby").is_empty());
        assert_eq!(rooms.list("games"), vec!["b"]);
    }

    #[test]
    fn ensure_creates_empty_membership() {
        let mut rooms = RoomManager::new();
        rooms.ensure("a");
        assert!(rooms.rooms_for("a").is_empty());
        assert!(rooms.room_names().is_empty());
    }

    /// `c ∈ list(r) ⇔ r ∈ rooms_for(c)` must hold after any sequence of
    /// joins and leaves, and no empty room may remain registered.
    #[test]
    fn randomized_joins_and_leaves_stay_inverse() {
        use rand::prelude::*;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let clients = ["a", "b", "c", "d", "e"];
        let names = ["lobby", "games", "dev", "ops"];
        let mut rooms = RoomManager::new();

        for _ in 0..2_000 {
            let client = clients.choose(&mut rng).unwrap();
            let room = names.choose(&mut rng).unwrap();
            match rng.gen_range(0..3) {
                0 => rooms.join(room, client),
                1 => rooms.leave(room, client),
                _ => rooms.leave_all(client),
            }

            for c in &clients {
                for r in rooms.rooms_for(c) {
                    assert!(
                        rooms.list(&r).contains(&c.to_string()),
                        "{c} claims membership of {r} but is not listed"
                    );
                }
            }
            for r in rooms.room_names() {
                let members = rooms.list(&r);
                assert!(!members.is_empty(), "empty room {r} survived");
                for m in members {
                    assert!(
                        rooms.rooms_for(&m).contains(&r),
                        "{m} listed in {r} but does not claim it"
                    );
                }
            }
        }
    }
}
