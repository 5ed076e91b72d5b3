//! One client's live attachment to a room.
//!
//! A `RoomSession` owns its background work: the feed pump, the host's
//! lifecycle timer and any pending navigation. All of it is aborted when the
//! session is closed or dropped, and teardown makes a single best-effort
//! cleanup call against the store.

use std::sync::{Arc, Mutex};

use draw_core::session::Cleanup;
use draw_core::{
    assign_with_rng, format_remaining, lifecycle, AssignError, ChangeEvent, ChangeKind,
    CloseReason, Notice, Participant, Role, Room, RoomId, RoomLink, SessionState,
    ValidationError, View,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::store::{ChangeFeed, FeedItem, ParticipantPatch, RoomPatch, RoomStore, StoreError};
use crate::timer;

pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Assignment(#[from] AssignError),
    #[error("join failed: {0}")]
    JoinFailed(#[source] StoreError),
    #[error("draw stopped after {written} of {total} writes: {source}")]
    PartialDraw {
        written: usize,
        total: usize,
        #[source]
        source: StoreError,
    },
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
}

/// What the creator of a room walks away with.
#[derive(Debug, Clone)]
pub struct HostedRoom {
    pub room: Room,
    pub host: Participant,
    pub link: RoomLink,
}

/// Creates a room with a fresh host token and seats `host_name` as its host.
pub async fn host_room<S: RoomStore>(
    store: &S,
    host_name: &str,
) -> Result<HostedRoom, SessionError> {
    let name = host_name.trim();
    if name.is_empty() {
        return Err(ValidationError::BlankName.into());
    }
    let host_token = Uuid::new_v4().to_string();
    let room = store.create_room(&host_token).await?;
    let host = store.insert_participant(&room.id, name, true).await?;
    log::info!("room {} opened by {}", room.id, host.name);
    let link = RoomLink::host(room.id.clone(), host_token);
    Ok(HostedRoom { room, host, link })
}

pub(crate) struct Shared<S: RoomStore> {
    pub(crate) store: S,
    pub(crate) room_id: RoomId,
    pub(crate) state: RwLock<SessionState>,
    pub(crate) config: SessionConfig,
    pub(crate) clock: Arc<dyn Clock>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl<S: RoomStore> Shared<S> {
    pub(crate) fn notify(&self, notice: Notice) {
        log::debug!("room {}: {notice:?}", self.room_id);
        // The presentation side may already be gone.
        let _ = self.notices.send(notice);
    }

    fn notify_all(&self, notices: Vec<Notice>) {
        for notice in notices {
            self.notify(notice);
        }
    }

    pub(crate) async fn navigate_home_after(&self, grace: std::time::Duration) {
        tokio::time::sleep(grace).await;
        self.notify(Notice::NavigateHome);
    }

    async fn resync(&self) -> Vec<Notice> {
        let room = self.store.get_room(&self.room_id).await;
        let roster = self.store.list_participants(&self.room_id).await;
        match (room, roster) {
            (Ok(room), Ok(roster)) => self.state.write().await.resync(room, roster),
            (Err(err), _) | (_, Err(err)) => {
                log::warn!("resync of room {} failed: {err}", self.room_id);
                Vec::new()
            }
        }
    }
}

pub struct RoomSession<S: RoomStore> {
    shared: Arc<Shared<S>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    torn_down: bool,
}

impl<S: RoomStore> RoomSession<S> {
    /// Loads the room behind `link`, subscribes to its feed and, when the
    /// link carries the right host token, starts the lifecycle timer.
    pub async fn open(
        store: S,
        link: &RoomLink,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, NoticeReceiver), SessionError> {
        let room_id = link.room_id.clone();
        if store.get_room(&room_id).await?.is_none() {
            return Err(SessionError::RoomNotFound(room_id));
        }

        // Subscribe before reading the roster so nothing falls in between.
        let feed = store.subscribe(&room_id).await;
        let roster = store.list_participants(&room_id).await?;
        let Some(room) = store.get_room(&room_id).await? else {
            return Err(SessionError::RoomNotFound(room_id));
        };

        let mut state = SessionState::new();
        state.loaded(room, link.host_token.as_deref(), roster);
        let role = state.role();

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            store,
            room_id,
            state: RwLock::new(state),
            config,
            clock,
            notices: tx,
        });
        let session = Self {
            shared: shared.clone(),
            tasks: Mutex::new(Vec::new()),
            torn_down: false,
        };

        session.spawn(pump_feed(shared.clone(), feed));
        if role == Role::Host {
            session.spawn(timer::run_lifecycle(shared));
        }
        log::info!("session opened on {} as {role:?}", link.share());
        Ok((session, rx))
    }

    pub async fn join(&self, name: &str) -> Result<Participant, SessionError> {
        let name = self.shared.state.read().await.check_name(name)?;
        let participant = self
            .shared
            .store
            .insert_participant(&self.shared.room_id, &name, false)
            .await
            .map_err(SessionError::JoinFailed)?;
        self.shared.state.write().await.joined(participant.clone());
        log::info!("{} joined room {}", participant.name, self.shared.room_id);
        Ok(participant)
    }

    /// Draws and writes one recipient per participant, then marks the room
    /// drawn. The writes are independent: a failure part way leaves the
    /// earlier ones in place, and this session will not start another draw.
    pub async fn draw(&self) -> Result<(), SessionError> {
        let roster = self.shared.state.write().await.begin_draw()?;
        match self.write_draw(&roster).await {
            Ok(()) => {
                log::info!(
                    "room {} drawn among {} participants",
                    self.shared.room_id,
                    roster.len()
                );
                self.shared.notify(Notice::DrawCompleted);
                Ok(())
            }
            Err(err) => {
                if !matches!(err, SessionError::PartialDraw { .. }) {
                    self.shared.state.write().await.draw_aborted();
                }
                Err(err)
            }
        }
    }

    async fn write_draw(&self, roster: &[Participant]) -> Result<(), SessionError> {
        let mut rng = self
            .shared
            .config
            .draw_seed
            .map(ChaCha8Rng::seed_from_u64)
            .unwrap_or_else(ChaCha8Rng::from_entropy);
        let pairs = assign_with_rng(roster, &mut rng)?;

        let store = &self.shared.store;
        let total = pairs.len() + 1;
        for (written, pair) in pairs.iter().enumerate() {
            let patch = ParticipantPatch {
                recipient: Some(pair.recipient.clone()),
            };
            match store.update_participant(&pair.participant_id, patch).await {
                Ok(updated) => {
                    self.absorb(ChangeEvent::participant(ChangeKind::Update, updated))
                        .await
                }
                Err(source) => return Err(draw_failure(written, total, source)),
            }
        }
        match store
            .update_room(&self.shared.room_id, RoomPatch { drawn: Some(true) })
            .await
        {
            Ok(room) => {
                self.absorb(ChangeEvent::room(ChangeKind::Update, room)).await;
                Ok(())
            }
            Err(source) => Err(draw_failure(pairs.len(), total, source)),
        }
    }

    /// Removes this guest from the room. Calling it again is a no-op.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let Some(me) = self.shared.state.read().await.check_leave()? else {
            return Ok(());
        };
        self.shared.store.delete_participant(&me).await?;
        self.shared.state.write().await.close(CloseReason::Left);
        self.shared.notify(Notice::LeftRoom);
        self.schedule_navigate_home(self.shared.config.exit_grace);
        Ok(())
    }

    /// Host only: deletes the room for everyone.
    pub async fn end_room(&self) -> Result<(), SessionError> {
        let room_id = self.shared.state.read().await.check_end()?;
        self.shared.store.delete_room(&room_id).await?;
        self.shared.state.write().await.close(CloseReason::Ended);
        log::info!("room {room_id} ended by host");
        self.shared.notify(Notice::RoomEnded);
        self.schedule_navigate_home(self.shared.config.exit_grace);
        Ok(())
    }

    /// Tears the session down: one cleanup attempt, then all tasks stop.
    pub async fn close(mut self) {
        self.torn_down = true;
        let cleanup = self.shared.state.read().await.cleanup();
        self.abort_tasks();
        if let Some(cleanup) = cleanup {
            run_cleanup(&self.shared.store, cleanup).await;
        }
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    pub async fn role(&self) -> Role {
        self.shared.state.read().await.role()
    }

    pub async fn view(&self) -> View {
        self.shared.state.read().await.view()
    }

    pub async fn roster(&self) -> Vec<Participant> {
        self.shared.state.read().await.roster().to_vec()
    }

    pub async fn me(&self) -> Option<Participant> {
        self.shared.state.read().await.me().cloned()
    }

    /// Time left before the room expires; only the host keeps a countdown.
    pub async fn remaining_ms(&self) -> Option<u64> {
        let state = self.shared.state.read().await;
        if !state.is_host() || state.is_closed() {
            return None;
        }
        state
            .room()
            .map(|room| lifecycle::remaining_ms(room, self.shared.clock.now_ms()))
    }

    pub async fn countdown(&self) -> Option<String> {
        self.remaining_ms().await.map(format_remaining)
    }

    async fn absorb(&self, event: ChangeEvent) {
        let notices = self.shared.state.write().await.apply(&event);
        self.shared.notify_all(notices);
    }

    fn schedule_navigate_home(&self, grace: std::time::Duration) {
        let shared = self.shared.clone();
        self.spawn(async move { shared.navigate_home_after(grace).await });
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    fn abort_tasks(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl<S: RoomStore> Drop for RoomSession<S> {
    fn drop(&mut self) {
        self.abort_tasks();
        if self.torn_down {
            return;
        }
        let cleanup = self
            .shared
            .state
            .try_read()
            .ok()
            .and_then(|state| state.cleanup());
        if let (Some(cleanup), Ok(handle)) = (cleanup, tokio::runtime::Handle::try_current()) {
            let store = self.shared.store.clone();
            handle.spawn(async move { run_cleanup(&store, cleanup).await });
        }
    }
}

fn draw_failure(written: usize, total: usize, source: StoreError) -> SessionError {
    if written == 0 {
        SessionError::Store(source)
    } else {
        log::error!("draw interrupted after {written} of {total} writes: {source}");
        SessionError::PartialDraw {
            written,
            total,
            source,
        }
    }
}

async fn run_cleanup<S: RoomStore>(store: &S, cleanup: Cleanup) {
    let result = match &cleanup {
        Cleanup::DeleteRoom(id) => store.delete_room(id).await,
        Cleanup::DeleteParticipant(id) => store.delete_participant(id).await,
    };
    if let Err(err) = result {
        log::warn!("cleanup {cleanup:?} failed: {err}");
    }
}

async fn pump_feed<S: RoomStore>(shared: Arc<Shared<S>>, mut feed: ChangeFeed) {
    loop {
        let (notices, feed_ended) = match feed.next().await {
            Some(FeedItem::Change(event)) => (shared.state.write().await.apply(&event), false),
            Some(FeedItem::Gap(_)) => (shared.resync().await, false),
            // The feed ended without saying why; ask the store once.
            None => (shared.resync().await, true),
        };
        let room_closed = notices.contains(&Notice::RoomClosed);
        shared.notify_all(notices);
        if room_closed {
            log::info!("room {} closed under this session", shared.room_id);
            shared.navigate_home_after(shared.config.closed_grace).await;
            return;
        }
        if feed_ended || shared.state.read().await.is_closed() {
            return;
        }
    }
}
