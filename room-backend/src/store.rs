//! The room store: row-level CRUD over rooms and participants plus a
//! per-room change feed. There are no cross-record transactions and no
//! server-side expiry; callers coordinate through the feed.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use draw_core::{ChangeEvent, ChangeKind, Participant, ParticipantId, Room, RoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomPatch {
    pub drawn: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantPatch {
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Change(ChangeEvent),
    /// The receiver fell behind and this many events were dropped.
    Gap(u64),
}

/// Subscription to one room's changes. Ends once the room is deleted.
pub struct ChangeFeed {
    room_id: RoomId,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(room_id: impl Into<RoomId>, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            room_id: room_id.into(),
            rx,
        }
    }

    pub async fn next(&mut self) -> Option<FeedItem> {
        match self.rx.recv().await {
            Ok(event) => Some(FeedItem::Change(event)),
            Err(RecvError::Lagged(missed)) => {
                log::warn!("feed for room {} lagged, {missed} events lost", self.room_id);
                Some(FeedItem::Gap(missed))
            }
            Err(RecvError::Closed) => None,
        }
    }
}

pub trait RoomStore: Clone + Send + Sync + 'static {
    fn create_room(&self, host_token: &str) -> impl Future<Output = StoreResult<Room>> + Send;

    fn get_room(&self, id: &str) -> impl Future<Output = StoreResult<Option<Room>>> + Send;

    fn update_room(
        &self,
        id: &str,
        patch: RoomPatch,
    ) -> impl Future<Output = StoreResult<Room>> + Send;

    /// Also removes the room's participants. Deleting an absent room succeeds.
    fn delete_room(&self, id: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Participants of `room_id` in ascending `joined_at` order.
    fn list_participants(
        &self,
        room_id: &str,
    ) -> impl Future<Output = StoreResult<Vec<Participant>>> + Send;

    fn insert_participant(
        &self,
        room_id: &str,
        name: &str,
        is_host: bool,
    ) -> impl Future<Output = StoreResult<Participant>> + Send;

    fn update_participant(
        &self,
        id: &str,
        patch: ParticipantPatch,
    ) -> impl Future<Output = StoreResult<Participant>> + Send;

    /// Deleting an absent participant succeeds.
    fn delete_participant(&self, id: &str) -> impl Future<Output = StoreResult<()>> + Send;

    fn subscribe(&self, room_id: &str) -> impl Future<Output = ChangeFeed> + Send;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    rooms: HashMap<RoomId, Room>,
    participants: HashMap<ParticipantId, Participant>,
    last_stamp: u64,
}

impl Tables {
    /// Join stamps are strictly increasing so the roster order is total.
    fn stamp(&mut self, now_ms: u64) -> u64 {
        let stamp = now_ms.max(self.last_stamp + 1);
        self.last_stamp = stamp;
        stamp
    }

    fn roster(&self, room_id: &str) -> Vec<Participant> {
        let mut roster: Vec<Participant> = self
            .participants
            .values()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect();
        roster.sort_by_key(|p| p.joined_at);
        roster
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    channels: Arc<RwLock<HashMap<RoomId, broadcast::Sender<ChangeEvent>>>>,
    clock: Arc<dyn Clock>,
    feed_capacity: usize,
    persist_path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            clock,
            feed_capacity: 32,
            persist_path: None,
        }
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    /// Loads a snapshot from `path` if one exists and rewrites it after
    /// every mutation.
    pub async fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.persist_path = Some(path.clone());
        if let Ok(bytes) = tokio::fs::read(&path).await {
            match serde_json::from_slice::<Tables>(&bytes) {
                Ok(saved) => {
                    {
                        let mut channels = self.channels.write().await;
                        for room_id in saved.rooms.keys() {
                            let (tx, _) = broadcast::channel(self.feed_capacity);
                            channels.insert(room_id.clone(), tx);
                        }
                    }
                    log::info!(
                        "loaded {} rooms from {}",
                        saved.rooms.len(),
                        path.display()
                    );
                    *self.tables.write().await = saved;
                }
                Err(err) => log::warn!("ignoring unreadable snapshot {}: {err}", path.display()),
            }
        }
        self
    }

    async fn persist(&self) {
        if let Some(path) = &self.persist_path {
            let snapshot = {
                let tables = self.tables.read().await;
                tables.clone()
            };
            match serde_json::to_vec_pretty(&snapshot) {
                Ok(json) => {
                    if let Err(err) = tokio::fs::write(path, json).await {
                        log::error!("persist error: {err}");
                    }
                }
                Err(err) => log::error!("snapshot encode error: {err}"),
            }
        }
    }

    async fn publish(&self, event: ChangeEvent) {
        if let Some(tx) = self.channels.read().await.get(event.room_id()) {
            // No receivers is not an error.
            let _ = tx.send(event);
        }
    }
}

impl RoomStore for MemoryStore {
    async fn create_room(&self, host_token: &str) -> StoreResult<Room> {
        let room = Room {
            id: Uuid::new_v4().to_string(),
            host_token: host_token.to_string(),
            created_at: self.clock.now_ms(),
            drawn: false,
        };
        {
            let mut tables = self.tables.write().await;
            tables.rooms.insert(room.id.clone(), room.clone());
            let (tx, _) = broadcast::channel(self.feed_capacity);
            self.channels.write().await.insert(room.id.clone(), tx);
        }
        log::debug!("room {} created", room.id);
        self.persist().await;
        Ok(room)
    }

    async fn get_room(&self, id: &str) -> StoreResult<Option<Room>> {
        Ok(self.tables.read().await.rooms.get(id).cloned())
    }

    async fn update_room(&self, id: &str, patch: RoomPatch) -> StoreResult<Room> {
        let room = {
            let mut tables = self.tables.write().await;
            let room = tables.rooms.get_mut(id).ok_or_else(|| StoreError::NotFound {
                entity: "room",
                id: id.to_string(),
            })?;
            if let Some(drawn) = patch.drawn {
                room.drawn = drawn;
            }
            let room = room.clone();
            self.publish(ChangeEvent::room(ChangeKind::Update, room.clone()))
                .await;
            room
        };
        log::debug!("room {id} updated, drawn={}", room.drawn);
        self.persist().await;
        Ok(room)
    }

    async fn delete_room(&self, id: &str) -> StoreResult<()> {
        {
            let mut tables = self.tables.write().await;
            let Some(room) = tables.rooms.remove(id) else {
                return Ok(());
            };
            tables.participants.retain(|_, p| p.room_id != id);
            // Send the deletion, then drop the sender so every feed ends.
            if let Some(tx) = self.channels.write().await.remove(id) {
                let _ = tx.send(ChangeEvent::room(ChangeKind::Delete, room));
            }
        }
        log::debug!("room {id} deleted");
        self.persist().await;
        Ok(())
    }

    async fn list_participants(&self, room_id: &str) -> StoreResult<Vec<Participant>> {
        Ok(self.tables.read().await.roster(room_id))
    }

    async fn insert_participant(
        &self,
        room_id: &str,
        name: &str,
        is_host: bool,
    ) -> StoreResult<Participant> {
        let participant = {
            let mut tables = self.tables.write().await;
            if !tables.rooms.contains_key(room_id) {
                return Err(StoreError::NotFound {
                    entity: "room",
                    id: room_id.to_string(),
                });
            }
            let joined_at = tables.stamp(self.clock.now_ms());
            let participant = Participant {
                id: Uuid::new_v4().to_string(),
                room_id: room_id.to_string(),
                name: name.to_string(),
                is_host,
                recipient: None,
                joined_at,
            };
            tables
                .participants
                .insert(participant.id.clone(), participant.clone());
            self.publish(ChangeEvent::participant(
                ChangeKind::Insert,
                participant.clone(),
            ))
            .await;
            participant
        };
        log::debug!("participant {} joined room {room_id}", participant.id);
        self.persist().await;
        Ok(participant)
    }

    async fn update_participant(
        &self,
        id: &str,
        patch: ParticipantPatch,
    ) -> StoreResult<Participant> {
        let participant = {
            let mut tables = self.tables.write().await;
            let participant =
                tables
                    .participants
                    .get_mut(id)
                    .ok_or_else(|| StoreError::NotFound {
                        entity: "participant",
                        id: id.to_string(),
                    })?;
            if let Some(recipient) = patch.recipient {
                participant.recipient = Some(recipient);
            }
            let participant = participant.clone();
            self.publish(ChangeEvent::participant(
                ChangeKind::Update,
                participant.clone(),
            ))
            .await;
            participant
        };
        self.persist().await;
        Ok(participant)
    }

    async fn delete_participant(&self, id: &str) -> StoreResult<()> {
        {
            let mut tables = self.tables.write().await;
            let Some(participant) = tables.participants.remove(id) else {
                return Ok(());
            };
            self.publish(ChangeEvent::participant(ChangeKind::Delete, participant))
                .await;
        }
        log::debug!("participant {id} deleted");
        self.persist().await;
        Ok(())
    }

    async fn subscribe(&self, room_id: &str) -> ChangeFeed {
        let tables = self.tables.read().await;
        if !tables.rooms.contains_key(room_id) {
            // Already gone: hand back a feed that is closed from the start.
            let (_, rx) = broadcast::channel(1);
            return ChangeFeed::new(room_id, rx);
        }
        let rx = self
            .channels
            .write()
            .await
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(self.feed_capacity).0)
            .subscribe();
        ChangeFeed::new(room_id, rx)
    }
}
