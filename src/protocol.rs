use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TrialId = String;
pub type ConnId = String;

/// Chat text is clipped to this many characters before fan-out.
pub const MAX_CHAT_LEN: usize = 500;

// ============================================
// Shared wire types
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    Judge,
    Accused,
    #[default]
    Audience,
}

/// Avatar transform on the courtroom floor. `ry` is the yaw in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub ry: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Client request to play an emote for a while.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotePayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Stored emote state. Expiry is advisory and enforced client-side; the
/// registry keeps it so late joiners can render the current emote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmoteState {
    #[serde(rename = "type")]
    pub kind: String,
    pub expires_at: DateTime<Utc>,
}

/// A fixed point in a room's gallery layout. The key is derived from the
/// tier and rounded coordinates so regenerating the layout yields the same
/// identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    #[serde(rename = "seatKey")]
    pub key: String,
    pub tier: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeatHint {
    pub x: f32,
    pub z: f32,
}

/// One live connection's identity and mutable state within a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: ConnId,
    pub name: String,
    pub role: Role,
    pub pose: Option<Pose>,
    pub emote: Option<EmoteState>,
    pub seat_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub text: String,
    #[serde(default)]
    pub position: Option<Vec3>,
}

/// A chat message as broadcast to the room, stamped server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
    pub position: Vec3,
}

// ============================================
// Client -> server messages
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Enter a trial room under a role and display name.
    #[serde(rename = "room:join")]
    RoomJoin {
        trial_id: TrialId,
        #[serde(default)]
        role: Role,
        #[serde(default = "default_display_name")]
        name: String,
    },
    /// Leave the room without closing the connection.
    #[serde(rename = "room:leave")]
    RoomLeave { trial_id: TrialId },
    /// Ask for the nearest free seat to the hint (origin when absent).
    #[serde(rename = "seat:request")]
    SeatRequest {
        trial_id: TrialId,
        #[serde(default)]
        hint: Option<SeatHint>,
    },
    #[serde(rename = "seat:release")]
    SeatRelease { trial_id: TrialId },
    #[serde(rename = "pose:update")]
    PoseUpdate { trial_id: TrialId, pose: Pose },
    #[serde(rename = "emote:update")]
    EmoteUpdate { trial_id: TrialId, emote: EmotePayload },
    #[serde(rename = "chat:msg")]
    ChatMsg { trial_id: TrialId, payload: ChatPayload },
    #[serde(rename = "judge:action")]
    JudgeAction { trial_id: TrialId, action: String },
}

fn default_display_name() -> String {
    "User".to_owned()
}

// ============================================
// Server -> client messages
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Join acknowledgement. `participants` is everyone already in the room,
    /// excluding the joiner, so a new client never misses pre-existing members.
    #[serde(rename = "room:joined")]
    RoomJoined {
        ok: bool,
        #[serde(rename = "self")]
        myself: Participant,
        participants: Vec<Participant>,
    },
    #[serde(rename = "presence:joined")]
    PresenceJoined { participant: Participant },
    #[serde(rename = "presence:left")]
    PresenceLeft { connection_id: ConnId },
    /// Reply to a seat request: success carries the seat, failure a reason.
    #[serde(rename = "seat:assigned")]
    SeatAssigned {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seat: Option<Seat>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "seat:occupied")]
    SeatOccupied { connection_id: ConnId, seat: Seat },
    #[serde(rename = "seat:freed")]
    SeatFreed { seat_key: String },
    #[serde(rename = "pose:broadcast")]
    PoseBroadcast { connection_id: ConnId, pose: Pose },
    #[serde(rename = "emote:update")]
    EmoteBroadcast { connection_id: ConnId, emote: EmoteState },
    #[serde(rename = "chat:msg")]
    Chat(ChatMessage),
    #[serde(rename = "court:banner")]
    CourtBanner { text: String, at: DateTime<Utc> },
    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_join_fills_defaults() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"room:join","trialId":"t1"}"#).unwrap();
        match msg {
            ClientMessage::RoomJoin { trial_id, role, name } => {
                assert_eq!(trial_id, "t1");
                assert_eq!(role, Role::Audience);
                assert_eq!(name, "User");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn seat_request_hint_is_optional() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"seat:request","trialId":"t1"}"#).unwrap();
        match msg {
            ClientMessage::SeatRequest { hint, .. } => assert!(hint.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"seat:request","trialId":"t1","hint":{"x":3.0,"z":-1.5}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SeatRequest { hint, .. } => {
                assert_eq!(hint, Some(SeatHint { x: 3.0, z: -1.5 }));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let parsed = serde_json::from_str::<ClientMessage>(r#"{"type":"pose:set","trialId":"t1"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn failed_seat_assignment_omits_seat() {
        let msg = ServerMessage::SeatAssigned {
            ok: false,
            seat: None,
            reason: Some("no_seats".to_owned()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"seat:assigned","ok":false,"reason":"no_seats"}"#);
    }
}
