//! Client-side view of one room, driven by change events.
//!
//! The feed gives no ordering or delivery guarantee, so every transition here
//! has to be safe to replay and safe to skip: inserts and updates are upserts,
//! deletes of unknown records are ignored, `drawn` only ever moves from
//! false to true, and a recipient once seen is never dropped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assign::MIN_PARTICIPANTS;
use crate::{ChangeEvent, ChangeKind, Entity, Participant, ParticipantId, Room, RoomId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    /// Host privilege is nothing more than presenting the room's token.
    pub fn resolve(room: &Room, host_token: Option<&str>) -> Self {
        match host_token {
            Some(token) if token == room.host_token => Role::Host,
            _ => Role::Guest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    RoomDeleted,
    Expired,
    Left,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    AwaitingIdentity,
    Joined,
    Closed(CloseReason),
}

/// Transient messages for the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Notice {
    PeerJoined { name: String },
    PeerLeft { name: String },
    ResultArrived { recipient: String },
    DrawCompleted,
    ExpiringSoon { remaining_ms: u64 },
    Expired,
    RoomClosed,
    LeftRoom,
    RoomEnded,
    NavigateHome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum View {
    Loading,
    AwaitingName,
    AwaitingDraw,
    Revealed { recipient: String },
    AwaitingResult,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name required")]
    BlankName,
    #[error("name already taken: {0}")]
    DuplicateName(String),
    #[error("at least {required} participants are needed, got {actual}")]
    TooFewParticipants { required: usize, actual: usize },
    #[error("only the host can do that")]
    NotHost,
    #[error("the host cannot leave, end the room instead")]
    HostCannotLeave,
    #[error("room already drawn")]
    AlreadyDrawn,
    #[error("a draw was already started from this session")]
    DrawInProgress,
    #[error("already joined")]
    AlreadyJoined,
    #[error("not joined")]
    NotJoined,
    #[error("room not loaded")]
    NotLoaded,
    #[error("room closed")]
    RoomClosed,
}

/// Best-effort cleanup a session owes the store when it goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    DeleteRoom(RoomId),
    DeleteParticipant(ParticipantId),
}

#[derive(Debug, Clone)]
pub struct SessionState {
    phase: Phase,
    role: Role,
    room: Option<Room>,
    roster: Vec<Participant>,
    me: Option<ParticipantId>,
    revealed: bool,
    drawing: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Loading,
            role: Role::Guest,
            room: None,
            roster: Vec::new(),
            me: None,
            revealed: false,
            drawing: false,
        }
    }

    pub fn loaded(&mut self, room: Room, host_token: Option<&str>, roster: Vec<Participant>) {
        self.role = Role::resolve(&room, host_token);
        self.room = Some(room);
        self.set_roster(roster);
        match self.role {
            Role::Host => {
                self.me = self.roster.iter().find(|p| p.is_host).map(|p| p.id.clone());
                self.phase = Phase::Joined;
            }
            Role::Guest => self.phase = Phase::AwaitingIdentity,
        }
        // A result already on record at load time is shown, not announced.
        self.revealed = self.my_recipient().is_some();
    }

    /// Replaces room and roster with a fresh read after the feed lost events.
    pub fn resync(&mut self, room: Option<Room>, roster: Vec<Participant>) -> Vec<Notice> {
        if !self.is_live() {
            return Vec::new();
        }
        let Some(room) = room else {
            return self.room_deleted();
        };
        self.merge_room(room);
        self.set_roster(roster);
        self.check_reveal().into_iter().collect()
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> Vec<Notice> {
        if !self.is_live() {
            return Vec::new();
        }
        let Some(room_id) = self.room.as_ref().map(|r| r.id.clone()) else {
            return Vec::new();
        };
        if event.room_id() != room_id {
            return Vec::new();
        }

        let mut notices = Vec::new();
        match (&event.entity, event.kind) {
            (Entity::Room(_), ChangeKind::Delete) => notices.extend(self.room_deleted()),
            (Entity::Room(room), _) => self.merge_room(room.clone()),
            (Entity::Participant(p), ChangeKind::Delete) => {
                if let Some(pos) = self.roster.iter().position(|r| r.id == p.id) {
                    let gone = self.roster.remove(pos);
                    if !self.is_me(&gone.id) {
                        notices.push(Notice::PeerLeft { name: gone.name });
                    }
                }
            }
            (Entity::Participant(p), kind) => {
                let is_new = self.upsert(p.clone());
                if is_new && kind == ChangeKind::Insert && !self.is_me(&p.id) {
                    notices.push(Notice::PeerJoined {
                        name: p.name.clone(),
                    });
                }
            }
        }
        notices.extend(self.check_reveal());
        notices
    }

    /// Trims `name` and checks it against the current roster.
    pub fn check_name(&self, name: &str) -> Result<String, ValidationError> {
        match self.phase {
            Phase::AwaitingIdentity => {}
            Phase::Joined => return Err(ValidationError::AlreadyJoined),
            Phase::Closed(_) => return Err(ValidationError::RoomClosed),
            Phase::Loading => return Err(ValidationError::NotLoaded),
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::BlankName);
        }
        if name_taken(&self.roster, name) {
            return Err(ValidationError::DuplicateName(name.to_string()));
        }
        Ok(name.to_string())
    }

    pub fn joined(&mut self, participant: Participant) {
        self.me = Some(participant.id.clone());
        self.upsert(participant);
        self.phase = Phase::Joined;
    }

    /// The roster to feed the assignment engine, in join order.
    pub fn check_draw(&self) -> Result<Vec<Participant>, ValidationError> {
        self.require_live()?;
        if self.role != Role::Host {
            return Err(ValidationError::NotHost);
        }
        if self.room.as_ref().is_some_and(|r| r.drawn) {
            return Err(ValidationError::AlreadyDrawn);
        }
        if self.drawing {
            return Err(ValidationError::DrawInProgress);
        }
        if self.roster.len() < MIN_PARTICIPANTS {
            return Err(ValidationError::TooFewParticipants {
                required: MIN_PARTICIPANTS,
                actual: self.roster.len(),
            });
        }
        Ok(self.roster.clone())
    }

    /// Like `check_draw`, but also claims the draw so a second caller is
    /// turned away until `draw_aborted`.
    pub fn begin_draw(&mut self) -> Result<Vec<Participant>, ValidationError> {
        let roster = self.check_draw()?;
        self.drawing = true;
        Ok(roster)
    }

    /// Releases the claim taken by `begin_draw` after a draw that wrote nothing.
    pub fn draw_aborted(&mut self) {
        self.drawing = false;
    }

    /// `Ok(None)` means there is nothing left to delete.
    pub fn check_leave(&self) -> Result<Option<ParticipantId>, ValidationError> {
        if self.role == Role::Host {
            return Err(ValidationError::HostCannotLeave);
        }
        match self.phase {
            Phase::Closed(_) => Ok(None),
            _ => Ok(self.me.clone()),
        }
    }

    pub fn check_end(&self) -> Result<RoomId, ValidationError> {
        self.require_live()?;
        if self.role != Role::Host {
            return Err(ValidationError::NotHost);
        }
        self.room
            .as_ref()
            .map(|r| r.id.clone())
            .ok_or(ValidationError::NotLoaded)
    }

    pub fn close(&mut self, reason: CloseReason) {
        self.phase = Phase::Closed(reason);
        if reason == CloseReason::Left {
            self.me = None;
        }
    }

    pub fn cleanup(&self) -> Option<Cleanup> {
        if !self.is_live() {
            return None;
        }
        match self.role {
            Role::Host => self.room.as_ref().map(|r| Cleanup::DeleteRoom(r.id.clone())),
            Role::Guest => self.me.clone().map(Cleanup::DeleteParticipant),
        }
    }

    pub fn view(&self) -> View {
        match self.phase {
            Phase::Loading => View::Loading,
            Phase::Closed(_) => View::Closed,
            Phase::AwaitingIdentity => View::AwaitingName,
            Phase::Joined => match self.my_recipient() {
                Some(recipient) => View::Revealed {
                    recipient: recipient.to_string(),
                },
                None if self.room.as_ref().is_some_and(|r| r.drawn) => View::AwaitingResult,
                None => View::AwaitingDraw,
            },
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn me(&self) -> Option<&Participant> {
        let me = self.me.as_ref()?;
        self.roster.iter().find(|p| &p.id == me)
    }

    pub fn my_recipient(&self) -> Option<&str> {
        self.me().and_then(|p| p.recipient.as_deref())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed(_))
    }

    fn is_live(&self) -> bool {
        matches!(self.phase, Phase::AwaitingIdentity | Phase::Joined)
    }

    fn require_live(&self) -> Result<(), ValidationError> {
        match self.phase {
            Phase::Joined => Ok(()),
            Phase::AwaitingIdentity => Err(ValidationError::NotJoined),
            Phase::Closed(_) => Err(ValidationError::RoomClosed),
            Phase::Loading => Err(ValidationError::NotLoaded),
        }
    }

    fn is_me(&self, id: &str) -> bool {
        self.me.as_deref() == Some(id)
    }

    fn room_deleted(&mut self) -> Vec<Notice> {
        self.phase = Phase::Closed(CloseReason::RoomDeleted);
        match self.role {
            Role::Guest => vec![Notice::RoomClosed],
            Role::Host => Vec::new(),
        }
    }

    fn merge_room(&mut self, mut room: Room) {
        if let Some(current) = &self.room {
            room.drawn |= current.drawn;
        }
        self.room = Some(room);
    }

    fn set_roster(&mut self, mut roster: Vec<Participant>) {
        for incoming in roster.iter_mut() {
            if let Some(known) = self.roster.iter().find(|p| p.id == incoming.id) {
                keep_recipient(incoming, known);
            }
        }
        roster.sort_by_key(|p| p.joined_at);
        self.roster = roster;
    }

    /// Returns true when `participant` was not on the roster yet.
    fn upsert(&mut self, mut participant: Participant) -> bool {
        if let Some(existing) = self.roster.iter_mut().find(|p| p.id == participant.id) {
            keep_recipient(&mut participant, existing);
            *existing = participant;
            return false;
        }
        let pos = self
            .roster
            .partition_point(|p| p.joined_at <= participant.joined_at);
        self.roster.insert(pos, participant);
        true
    }

    fn check_reveal(&mut self) -> Option<Notice> {
        if self.revealed {
            return None;
        }
        let recipient = self.my_recipient()?.to_string();
        self.revealed = true;
        Some(Notice::ResultArrived { recipient })
    }
}

/// Recipients are set once: a stale copy of the record cannot clear or
/// replace one already seen.
fn keep_recipient(incoming: &mut Participant, known: &Participant) {
    if known.recipient.is_some() {
        incoming.recipient = known.recipient.clone();
    }
}

/// Case-insensitive name clash check shared with the gateway.
pub fn name_taken(roster: &[Participant], name: &str) -> bool {
    let wanted = name.trim().to_lowercase();
    roster.iter().any(|p| p.name.to_lowercase() == wanted)
}
