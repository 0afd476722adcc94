// src/rooms.rs
//
// Live-delivery subscriptions: which connection listens to which project room.
// Nothing here is persisted and nothing here owns messages.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One WebSocket session. A user with three tabs open has three of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection-to-room relation, indexed both ways.
///
/// Callers authorize before calling `join`; the registry trusts them.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    members: HashMap<String, HashSet<ConnectionId>>,
    rooms_by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the connection was already in the room.
    pub fn join(&mut self, connection: ConnectionId, project_id: &str) -> bool {
        let added = self
            .members
            .entry(project_id.to_string())
            .or_default()
            .insert(connection);
        self.rooms_by_connection
            .entry(connection)
            .or_default()
            .insert(project_id.to_string());
        added
    }

    /// Returns false when the connection was not in the room.
    pub fn leave(&mut self, connection: ConnectionId, project_id: &str) -> bool {
        let removed = match self.members.get_mut(project_id) {
            Some(set) => {
                let removed = set.remove(&connection);
                if set.is_empty() {
                    self.members.remove(project_id);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = self.rooms_by_connection.get_mut(&connection) {
            rooms.remove(project_id);
            if rooms.is_empty() {
                self.rooms_by_connection.remove(&connection);
            }
        }
        removed
    }

    /// Drops every membership of a connection. Returns the rooms it was in.
    pub fn leave_all(&mut self, connection: ConnectionId) -> Vec<String> {
        let rooms: Vec<String> = self
            .rooms_by_connection
            .remove(&connection)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for project_id in &rooms {
            if let Some(set) = self.members.get_mut(project_id) {
                set.remove(&connection);
                if set.is_empty() {
                    self.members.remove(project_id);
                }
            }
        }
        rooms
    }

    pub fn members_of(&self, project_id: &str) -> HashSet<ConnectionId> {
        self.members.get(project_id).cloned().unwrap_or_default()
    }

    pub fn is_member(&self, connection: ConnectionId, project_id: &str) -> bool {
        self.members
            .get(project_id)
            .map_or(false, |set| set.contains(&connection))
    }

    pub fn rooms_of(&self, connection: ConnectionId) -> HashSet<String> {
        self.rooms_by_connection
            .get(&connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_idempotent() {
        let mut registry = RoomRegistry::new();
        let c = ConnectionId::new();
        assert!(registry.join(c, "p1"));
        assert!(!registry.join(c, "p1"));
        assert_eq!(registry.members_of("p1").len(), 1);
    }

    #[test]
    fn test_connection_in_several_rooms() {
        let mut registry = RoomRegistry::new();
        let c = ConnectionId::new();
        let d = ConnectionId::new();
        registry.join(c, "p1");
        registry.join(c, "p2");
        registry.join(d, "p2");

        assert!(registry.is_member(c, "p1"));
        assert!(registry.is_member(c, "p2"));
        assert_eq!(registry.members_of("p2"), HashSet::from([c, d]));
        assert_eq!(registry.rooms_of(c).len(), 2);

        assert!(registry.leave(c, "p2"));
        assert!(!registry.leave(c, "p2"));
        assert!(registry.is_member(c, "p1"));
        assert_eq!(registry.members_of("p2"), HashSet::from([d]));
    }

    #[test]
    fn test_leave_all_cleans_up_empty_rooms() {
        let mut registry = RoomRegistry::new();
        let c = ConnectionId::new();
        let d = ConnectionId::new();
        registry.join(c, "p1");
        registry.join(c, "p2");
        registry.join(d, "p1");

        let mut left = registry.leave_all(c);
        left.sort();
        assert_eq!(left, ["p1", "p2"]);
        assert!(registry.members_of("p2").is_empty());
        assert_eq!(registry.members_of("p1"), HashSet::from([d]));
        assert_eq!(registry.room_count(), 1);
        assert!(registry.rooms_of(c).is_empty());
        assert!(registry.leave_all(c).is_empty());
    }
}
