use std::collections::HashMap;

use crate::protocol::{ConnId, EmoteState, Participant, Pose, TrialId};

#[derive(Default)]
struct Room {
    participants: HashMap<ConnId, Participant>,
}

/// Authoritative membership index: trial -> connection -> participant.
/// Rooms appear on first join and are dropped as soon as they empty.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<TrialId, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the participant entry. Returns the room's full
    /// participant snapshot, the new entry included.
    pub fn join(&mut self, trial_id: &str, participant: Participant) -> Vec<Participant> {
        let room = self.rooms.entry(trial_id.to_owned()).or_default();
        room.participants
            .insert(participant.connection_id.clone(), participant);
        room.participants.values().cloned().collect()
    }

    pub fn participant(&self, trial_id: &str, conn_id: &str) -> Option<&Participant> {
        self.rooms.get(trial_id)?.participants.get(conn_id)
    }

    pub fn participant_mut(&mut self, trial_id: &str, conn_id: &str) -> Option<&mut Participant> {
        self.rooms.get_mut(trial_id)?.participants.get_mut(conn_id)
    }

    /// Store the caller's latest pose. Returns false for non-members, which
    /// happens when an in-flight update races a disconnect.
    pub fn update_pose(&mut self, trial_id: &str, conn_id: &str, pose: Pose) -> bool {
        match self.participant_mut(trial_id, conn_id) {
            Some(p) => {
                p.pose = Some(pose);
                true
            }
            None => false,
        }
    }

    pub fn update_emote(&mut self, trial_id: &str, conn_id: &str, emote: EmoteState) -> bool {
        match self.participant_mut(trial_id, conn_id) {
            Some(p) => {
                p.emote = Some(emote);
                true
            }
            None => false,
        }
    }

    /// Remove the participant. `Some(true)` means the room emptied and was
    /// dropped; `None` means the connection was not a member.
    pub fn leave(&mut self, trial_id: &str, conn_id: &str) -> Option<bool> {
        let room = self.rooms.get_mut(trial_id)?;
        room.participants.remove(conn_id)?;
        let now_empty = room.participants.is_empty();
        if now_empty {
            self.rooms.remove(trial_id);
        }
        Some(now_empty)
    }

    /// The canonical presence snapshot: everyone in the room but the caller.
    pub fn list_others(&self, trial_id: &str, conn_id: &str) -> Vec<Participant> {
        match self.rooms.get(trial_id) {
            Some(room) => room
                .participants
                .values()
                .filter(|p| p.connection_id != conn_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn member_ids(&self, trial_id: &str) -> Vec<ConnId> {
        match self.rooms.get(trial_id) {
            Some(room) => room.participants.keys().cloned().collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;

    fn participant(conn_id: &str, role: Role) -> Participant {
        Participant {
            connection_id: conn_id.to_owned(),
            name: format!("{} name", conn_id),
            role,
            pose: None,
            emote: None,
            seat_key: None,
        }
    }

    #[test]
    fn join_returns_the_full_snapshot() {
        let mut registry = RoomRegistry::new();
        let snapshot = registry.join("t1", participant("a", Role::Judge));
        assert_eq!(snapshot.len(), 1);

        let snapshot = registry.join("t1", participant("b", Role::Audience));
        assert_eq!(snapshot.len(), 2);

        // Re-join replaces rather than duplicates.
        let snapshot = registry.join("t1", participant("b", Role::Accused));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.participant("t1", "b").unwrap().role, Role::Accused);
    }

    #[test]
    fn list_others_excludes_the_caller() {
        let mut registry = RoomRegistry::new();
        registry.join("t1", participant("a", Role::Judge));
        registry.join("t1", participant("b", Role::Audience));

        let others = registry.list_others("t1", "b");
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].connection_id, "a");

        assert!(registry.list_others("t1", "missing").len() == 2);
        assert!(registry.list_others("nowhere", "a").is_empty());
    }

    #[test]
    fn pose_updates_only_touch_members() {
        let mut registry = RoomRegistry::new();
        registry.join("t1", participant("a", Role::Audience));

        let pose = Pose { x: 1.0, y: 0.0, z: -2.0, ry: 0.5 };
        assert!(registry.update_pose("t1", "a", pose));
        assert_eq!(registry.participant("t1", "a").unwrap().pose, Some(pose));

        // Late update after a disconnect is ignored, not an error.
        assert!(!registry.update_pose("t1", "gone", pose));
        assert!(!registry.update_pose("t2", "a", pose));
    }

    #[test]
    fn leave_signals_when_the_room_empties() {
        let mut registry = RoomRegistry::new();
        registry.join("t1", participant("a", Role::Judge));
        registry.join("t1", participant("b", Role::Audience));

        assert_eq!(registry.leave("t1", "a"), Some(false));
        assert_eq!(registry.leave("t1", "a"), None);
        assert_eq!(registry.leave("t1", "b"), Some(true));

        // The emptied room is gone entirely, not lingering with zero members.
        assert!(registry.member_ids("t1").is_empty());
        assert!(registry.rooms.is_empty());
    }
}
