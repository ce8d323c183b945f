//! Room manager
//!
//! Rooms are logical broadcast scopes: one per conversation, one per class
//! section, plus tenant-wide and role-wide channels. The manager is the only
//! writer of room membership; everything else reads snapshots through
//! `members_of`.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ClasswireError, Result};

/// Kind of broadcast scope a room represents
///
/// The kind is encoded in the room id prefix so that ids stay self-describing
/// across process boundaries: `conv:<id>`, `class:<id>`, `tenant:<tenant>`,
/// `role:<tenant>:<role>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomKind {
    Conversation,
    ClassSection,
    TenantBroadcast,
    RoleBroadcast,
}

impl RoomKind {
    /// Parse the kind from a room id prefix. Unknown prefixes are rejected
    /// rather than defaulted, so a malformed id can never create a room.
    pub fn parse(room_id: &str) -> Option<Self> {
        match room_id.split_once(':').map(|(prefix, _)| prefix) {
            Some("conv") => Some(Self::Conversation),
            Some("class") => Some(Self::ClassSection),
            Some("tenant") => Some(Self::TenantBroadcast),
            Some("role") => Some(Self::RoleBroadcast),
            _ => None,
        }
    }
}

struct RoomEntry {
    kind: RoomKind,
    members: HashSet<String>,
}

/// Tracks which connections belong to which rooms
///
/// Rooms are created lazily on first join and garbage-collected when the last
/// member leaves. Join and leave are idempotent; membership is a set.
pub struct RoomManager {
    rooms: DashMap<String, RoomEntry>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a connection to a room.
    ///
    /// The authorization decision is supplied by the caller (the policy
    /// collaborator is consulted upstream); this method only enforces that a
    /// negative decision results in a `ForbiddenRoom` rejection and never a
    /// membership change.
    pub fn join(
        &self,
        user_id: &str,
        conn_id: &str,
        room_id: &str,
        kind: RoomKind,
        authorized: bool,
    ) -> Result<()> {
        if !authorized {
            return Err(ClasswireError::forbidden_room(user_id, room_id));
        }

        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomEntry {
                kind,
                members: HashSet::new(),
            })
            .members
            .insert(conn_id.to_string());
        Ok(())
    }

    /// Remove a connection from a room; deletes the room if it becomes empty.
    /// No-op for non-members and unknown rooms.
    pub fn leave(&self, conn_id: &str, room_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.members.remove(conn_id);
            if room.members.is_empty() {
                drop(room);
                self.rooms
                    .remove_if(room_id, |_, entry| entry.members.is_empty());
            }
        }
    }

    /// Remove a connection from every room it belongs to.
    ///
    /// Called by the registry on deregister; scans the manager's own state so
    /// callers never have to enumerate rooms.
    pub fn leave_all(&self, conn_id: &str) {
        let joined: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.members.contains(conn_id))
            .map(|entry| entry.key().clone())
            .collect();

        for room_id in joined {
            self.leave(conn_id, &room_id);
        }
    }

    /// Snapshot of a room's member connection ids.
    ///
    /// Cloned under the room's shard lock, so a concurrent join/leave is
    /// either fully visible or not at all.
    pub fn members_of(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: &str, conn_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|entry| entry.members.contains(conn_id))
            .unwrap_or(false)
    }

    pub fn kind_of(&self, room_id: &str) -> Option<RoomKind> {
        self.rooms.get(room_id).map(|entry| entry.kind)
    }

    /// Number of rooms with at least one member
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_kind_parse() {
        assert_eq!(RoomKind::parse("conv:7"), Some(RoomKind::Conversation));
        assert_eq!(RoomKind::parse("class:5a"), Some(RoomKind::ClassSection));
        assert_eq!(RoomKind::parse("tenant:acme"), Some(RoomKind::TenantBroadcast));
        assert_eq!(RoomKind::parse("role:acme:teacher"), Some(RoomKind::RoleBroadcast));
        assert_eq!(RoomKind::parse("lobby"), None);
        assert_eq!(RoomKind::parse("dm:1"), None);
    }

    #[test]
    fn test_join_is_idempotent() {
        let rooms = RoomManager::new();
        rooms
            .join("user-1", "conn-1", "conv:7", RoomKind::Conversation, true)
            .unwrap();
        rooms
            .join("user-1", "conn-1", "conv:7", RoomKind::Conversation, true)
            .unwrap();

        assert_eq!(rooms.members_of("conv:7"), vec!["conn-1".to_string()]);
    }

    #[test]
    fn test_unauthorized_join_is_rejected() {
        let rooms = RoomManager::new();
        let err = rooms
            .join("user-1", "conn-1", "conv:7", RoomKind::Conversation, false)
            .unwrap_err();

        assert!(matches!(err, ClasswireError::ForbiddenRoom { .. }));
        assert!(rooms.members_of("conv:7").is_empty());
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_leave_non_member_is_noop() {
        let rooms = RoomManager::new();
        rooms
            .join("user-1", "conn-1", "conv:7", RoomKind::Conversation, true)
            .unwrap();

        rooms.leave("conn-2", "conv:7");
        rooms.leave("conn-1", "conv:999");

        assert_eq!(rooms.members_of("conv:7"), vec!["conn-1".to_string()]);
    }

    #[test]
    fn test_empty_room_is_garbage_collected() {
        let rooms = RoomManager::new();
        rooms
            .join("user-1", "conn-1", "conv:7", RoomKind::Conversation, true)
            .unwrap();
        assert_eq!(rooms.room_count(), 1);

        rooms.leave("conn-1", "conv:7");
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.kind_of("conv:7"), None);
    }

    #[test]
    fn test_leave_all_clears_every_room() {
        let rooms = RoomManager::new();
        rooms
            .join("user-1", "conn-1", "conv:7", RoomKind::Conversation, true)
            .unwrap();
        rooms
            .join("user-1", "conn-1", "class:5a", RoomKind::ClassSection, true)
            .unwrap();
        rooms
            .join("user-2", "conn-2", "conv:7", RoomKind::Conversation, true)
            .unwrap();

        rooms.leave_all("conn-1");

        assert_eq!(rooms.members_of("conv:7"), vec!["conn-2".to_string()]);
        assert!(rooms.members_of("class:5a").is_empty());
        assert_eq!(rooms.room_count(), 1);
    }

    #[test]
    fn test_room_keeps_creation_kind() {
        let rooms = RoomManager::new();
        rooms
            .join("user-1", "conn-1", "conv:7", RoomKind::Conversation, true)
            .unwrap();
        assert_eq!(rooms.kind_of("conv:7"), Some(RoomKind::Conversation));
    }
}
