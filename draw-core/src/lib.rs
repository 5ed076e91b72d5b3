use serde::{Deserialize, Serialize};

pub mod address;
pub mod assign;
pub mod lifecycle;
pub mod session;

pub use address::RoomLink;
pub use assign::{assign, assign_with_rng, AssignError, Pairing, MAX_ATTEMPTS, MIN_PARTICIPANTS};
pub use lifecycle::{format_remaining, remaining_ms, ExpiryTracker, Tick};
pub use session::{
    name_taken, Cleanup, CloseReason, Notice, Phase, Role, SessionState, ValidationError, View,
};

pub type RoomId = String;
pub type ParticipantId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub host_token: String,
    /// Unix milliseconds.
    pub created_at: u64,
    pub drawn: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub room_id: RoomId,
    pub name: String,
    pub is_host: bool,
    pub recipient: Option<String>,
    /// Unix milliseconds.
    pub joined_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type", content = "record")]
pub enum Entity {
    Room(Room),
    Participant(Participant),
}

/// One committed mutation as reported by a room's change feed. Delete events
/// carry the last known version of the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity: Entity,
}

impl ChangeEvent {
    pub fn room(kind: ChangeKind, room: Room) -> Self {
        Self {
            kind,
            entity: Entity::Room(room),
        }
    }

    pub fn participant(kind: ChangeKind, participant: Participant) -> Self {
        Self {
            kind,
            entity: Entity::Participant(participant),
        }
    }

    pub fn room_id(&self) -> &str {
        match &self.entity {
            Entity::Room(room) => &room.id,
            Entity::Participant(p) => &p.room_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_event_round_trips_as_tagged_json() {
        let event = ChangeEvent::room(
            ChangeKind::Update,
            Room {
                id: "r1".into(),
                host_token: "t".into(),
                created_at: 10,
                drawn: true,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "update");
        assert_eq!(json["entity"]["type"], "room");
        assert_eq!(json["entity"]["record"]["drawn"], true);

        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.room_id(), "r1");
    }
}
