use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use draw_core::{lifecycle, name_taken, ChangeEvent, Entity, Participant, Room, ValidationError};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod config;
pub mod session;
pub mod store;
mod timer;

use clock::{Clock, SystemClock};
use config::Config;
use session::{host_room, SessionError};
use store::{FeedItem, MemoryStore, ParticipantPatch, RoomPatch, RoomStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    store: MemoryStore,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(MemoryStore::default(), Config::default())
    }
}

impl AppState {
    pub fn new(store: MemoryStore, config: Config) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        }
    }

    /// Builds the store described by `config`, loading any snapshot on disk.
    pub async fn from_config(config: Config) -> Self {
        let mut store = MemoryStore::default().with_feed_capacity(config.feed_capacity);
        if let Some(path) = &config.persist_path {
            store = store.with_persistence(path.clone()).await;
        }
        Self::new(store, config)
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/room", post(create_room))
        .route(
            "/room/:id",
            get(get_room).patch(update_room).delete(delete_room),
        )
        .route(
            "/room/:id/participants",
            get(list_participants).post(join_room),
        )
        .route(
            "/participant/:id",
            patch(update_participant).delete(delete_participant),
        )
        .route("/ws/:id", get(ws_handler))
        .with_state(state)
}

/// A room as shown to clients: the host token stays server-side.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RoomView {
    id: String,
    created_at: u64,
    drawn: bool,
    remaining_ms: u64,
}

impl RoomView {
    fn new(room: &Room, now_ms: u64) -> Self {
        Self {
            id: room.id.clone(),
            created_at: room.created_at,
            drawn: room.drawn,
            remaining_ms: lifecycle::remaining_ms(room, now_ms),
        }
    }
}

#[derive(Deserialize)]
struct CreateRoomRequest {
    host_name: String,
}

#[derive(Serialize)]
struct CreateRoomResponse {
    room: RoomView,
    host: Participant,
    host_link: String,
    share_link: String,
}

#[derive(Deserialize)]
struct JoinRequest {
    name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Snapshot {
        room: RoomView,
        participants: Vec<Participant>,
    },
    Change(ChangeEvent),
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound { entity, .. } => {
            (StatusCode::NOT_FOUND, format!("{entity} not found")).into_response()
        }
        StoreError::Unavailable(msg) => {
            log::error!("store unavailable: {msg}");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

fn redact(mut event: ChangeEvent) -> ChangeEvent {
    if let Entity::Room(room) = &mut event.entity {
        room.host_token.clear();
    }
    event
}

async fn create_room(
    State(state): State<AppState>,
    Json(payload): Json<CreateRoomRequest>,
) -> impl IntoResponse {
    match host_room(&state.store, &payload.host_name).await {
        Ok(hosted) => {
            let base = &state.config.public_base_url;
            let response = CreateRoomResponse {
                room: RoomView::new(&hosted.room, state.clock.now_ms()),
                host_link: hosted.link.url(base),
                share_link: hosted.link.share().url(base),
                host: hosted.host,
            };
            (StatusCode::CREATED, Json(response)).into_response()
        }
        Err(SessionError::Validation(ValidationError::BlankName)) => {
            (StatusCode::BAD_REQUEST, "host_name required").into_response()
        }
        Err(SessionError::Store(err)) => store_error(err),
        Err(err) => {
            log::error!("create room failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "create room failed").into_response()
        }
    }
}

async fn get_room(State(state): State<AppState>, Path(room_id): Path<String>) -> impl IntoResponse {
    match state.store.get_room(&room_id).await {
        Ok(Some(room)) => Json(RoomView::new(&room, state.clock.now_ms())).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "room not found").into_response(),
        Err(err) => store_error(err),
    }
}

async fn update_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(patch): Json<RoomPatch>,
) -> impl IntoResponse {
    match state.store.update_room(&room_id, patch).await {
        Ok(room) => Json(RoomView::new(&room, state.clock.now_ms())).into_response(),
        Err(err) => store_error(err),
    }
}

async fn delete_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_room(&room_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn list_participants(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_room(&room_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "room not found").into_response(),
        Err(err) => return store_error(err),
    }
    match state.store.list_participants(&room_id).await {
        Ok(participants) => Json(participants).into_response(),
        Err(err) => store_error(err),
    }
}

async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(payload): Json<JoinRequest>,
) -> impl IntoResponse {
    let name = payload.name.trim();
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "name required").into_response();
    }

    let roster = match state.store.get_room(&room_id).await {
        Ok(Some(_)) => match state.store.list_participants(&room_id).await {
            Ok(roster) => roster,
            Err(err) => return store_error(err),
        },
        Ok(None) => return (StatusCode::NOT_FOUND, "room not found").into_response(),
        Err(err) => return store_error(err),
    };
    // Same check a session makes; two racing joins can still both pass.
    if name_taken(&roster, name) {
        return (StatusCode::CONFLICT, "name taken").into_response();
    }

    match state.store.insert_participant(&room_id, name, false).await {
        Ok(participant) => (StatusCode::CREATED, Json(participant)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn update_participant(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
    Json(patch): Json<ParticipantPatch>,
) -> impl IntoResponse {
    match state.store.update_participant(&participant_id, patch).await {
        Ok(participant) => Json(participant).into_response(),
        Err(err) => store_error(err),
    }
}

async fn delete_participant(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_participant(&participant_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id))
}

async fn handle_socket(stream: WebSocket, state: AppState, room_id: String) {
    let (mut sender, mut receiver) = stream.split();

    let feed_room = room_id.clone();
    let mut send_task = tokio::spawn(async move {
        stream_room(&mut sender, &state, &feed_room).await;
    });

    // Clients only listen; drain their frames until they hang up.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    log::debug!("feed socket for room {room_id} closed");
}

async fn snapshot(state: &AppState, room_id: &str) -> Option<ServerMessage> {
    match (
        state.store.get_room(room_id).await,
        state.store.list_participants(room_id).await,
    ) {
        (Ok(Some(room)), Ok(participants)) => Some(ServerMessage::Snapshot {
            room: RoomView::new(&room, state.clock.now_ms()),
            participants,
        }),
        (Err(err), _) | (_, Err(err)) => {
            log::warn!("snapshot of room {room_id} failed: {err}");
            None
        }
        _ => None,
    }
}

async fn send_json<W>(sink: &mut W, msg: &ServerMessage) -> bool
where
    W: Sink<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            log::error!("message encode error: {err}");
            false
        }
    }
}

/// Sends a snapshot of the room, then every change until the room goes away
/// or the sink closes. After a gap in the feed the client gets a fresh
/// snapshot to replace what it holds.
async fn stream_room<W>(sink: &mut W, state: &AppState, room_id: &str)
where
    W: Sink<Message> + Unpin,
{
    // Subscribe first, then snapshot, so no change slips between the two.
    let mut feed = state.store.subscribe(room_id).await;
    let Some(first) = snapshot(state, room_id).await else {
        let _ = sink.send(Message::Text("unknown room".into())).await;
        return;
    };
    if !send_json(sink, &first).await {
        return;
    }

    while let Some(item) = feed.next().await {
        let msg = match item {
            FeedItem::Change(event) => ServerMessage::Change(redact(event)),
            FeedItem::Gap(missed) => {
                log::info!("resending room {room_id} after {missed} dropped events");
                match snapshot(state, room_id).await {
                    Some(msg) => msg,
                    None => break,
                }
            }
        };
        if !send_json(sink, &msg).await {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use futures::channel::mpsc::{unbounded, UnboundedReceiver};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    async fn json_body(res: axum::response::Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn test_app() -> (Router, AppState) {
        let state = AppState::default();
        (app(state.clone()), state)
    }

    fn json_request(method: Method, uri: impl AsRef<str>, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri.as_ref())
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: Method, uri: impl AsRef<str>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri.as_ref())
            .body(Body::empty())
            .unwrap()
    }

    async fn create(app: &Router, host_name: &str) -> serde_json::Value {
        let res = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/room",
                json!({ "host_name": host_name }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        json_body(res).await
    }

    #[tokio::test]
    async fn create_room_returns_links_without_exposing_token() {
        let (app, state) = test_app();
        let created = create(&app, "Host").await;
        let room_id = created["room"]["id"].as_str().unwrap();

        assert_eq!(created["host"]["name"], "Host");
        assert_eq!(created["host"]["is_host"], true);
        assert!(created["room"].get("host_token").is_none());
        assert_eq!(created["room"]["drawn"], false);

        let room = state.store().get_room(room_id).await.unwrap().unwrap();
        assert_eq!(
            created["host_link"],
            format!("http://localhost:3000/room/{room_id}?host={}", room.host_token)
        );
        assert_eq!(
            created["share_link"],
            format!("http://localhost:3000/room/{room_id}")
        );

        let res = app
            .clone()
            .oneshot(empty_request(Method::GET, format!("/room/{room_id}")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert!(body.get("host_token").is_none());
        assert!(body["remaining_ms"].as_u64().unwrap() > 3_500_000);
    }

    #[tokio::test]
    async fn create_room_requires_name() {
        let (app, _) = test_app();
        let res = app
            .clone()
            .oneshot(json_request(Method::POST, "/room", json!({ "host_name": "  " })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn join_success_and_duplicate_name_rejected() {
        let (app, _) = test_app();
        let created = create(&app, "Host").await;
        let room_id = created["room"]["id"].as_str().unwrap();

        let res = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                format!("/room/{room_id}/participants"),
                json!({ "name": " alice " }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let joined = json_body(res).await;
        assert_eq!(joined["name"], "alice");
        assert_eq!(joined["is_host"], false);

        for (name, status) in [
            ("ALICE", StatusCode::CONFLICT),
            ("host", StatusCode::CONFLICT),
            ("", StatusCode::BAD_REQUEST),
        ] {
            let res = app
                .clone()
                .oneshot(json_request(
                    Method::POST,
                    format!("/room/{room_id}/participants"),
                    json!({ "name": name }),
                ))
                .await
                .unwrap();
            assert_eq!(res.status(), status, "joining as {name:?}");
        }

        let res = app
            .clone()
            .oneshot(empty_request(
                Method::GET,
                format!("/room/{room_id}/participants"),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let roster = json_body(res).await;
        let names: Vec<_> = roster
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["Host", "alice"]);

        for uri in ["/room/unknown", "/room/unknown/participants"] {
            let res = app
                .clone()
                .oneshot(empty_request(Method::GET, uri))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::NOT_FOUND);
        }
        let res = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/room/unknown/participants",
                json!({ "name": "bob" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn record_updates_and_deletes() {
        let (app, state) = test_app();
        let created = create(&app, "Host").await;
        let room_id = created["room"]["id"].as_str().unwrap();
        let host_id = created["host"]["id"].as_str().unwrap();

        let res = app
            .clone()
            .oneshot(json_request(
                Method::PATCH,
                format!("/participant/{host_id}"),
                json!({ "recipient": "alice" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["recipient"], "alice");

        let res = app
            .clone()
            .oneshot(json_request(
                Method::PATCH,
                format!("/room/{room_id}"),
                json!({ "drawn": true }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let room = json_body(res).await;
        assert_eq!(room["drawn"], true);
        assert!(room["remaining_ms"].as_u64().unwrap() <= 300_000);

        let res = app
            .clone()
            .oneshot(json_request(
                Method::PATCH,
                "/participant/unknown",
                json!({ "recipient": "x" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        // Deletes succeed whether or not the record is still there.
        for _ in 0..2 {
            let res = app
                .clone()
                .oneshot(empty_request(
                    Method::DELETE,
                    format!("/participant/{host_id}"),
                ))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::NO_CONTENT);
        }
        let res = app
            .clone()
            .oneshot(empty_request(Method::DELETE, format!("/room/{room_id}")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(state.store().get_room(room_id).await.unwrap().is_none());
    }

    #[test]
    fn redaction_strips_host_token_only_from_rooms() {
        let event = ChangeEvent::room(
            draw_core::ChangeKind::Update,
            Room {
                id: "r1".into(),
                host_token: "secret".into(),
                created_at: 0,
                drawn: true,
            },
        );
        let Entity::Room(room) = redact(event).entity else {
            panic!("expected room");
        };
        assert!(room.host_token.is_empty());
        assert!(room.drawn);
    }

    async fn next_message(rx: &mut UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
    }

    async fn next_json(rx: &mut UnboundedReceiver<Message>) -> serde_json::Value {
        match next_message(rx).await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    fn spawn_stream(state: &AppState, room_id: &str) -> UnboundedReceiver<Message> {
        let (mut tx, rx) = unbounded();
        let state = state.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move { stream_room(&mut tx, &state, &room_id).await });
        rx
    }

    #[tokio::test]
    async fn room_stream_sends_snapshot_then_redacted_changes() {
        let state = AppState::default();
        let hosted = host_room(state.store(), "Host").await.unwrap();
        let room_id = hosted.room.id.clone();
        let mut rx = spawn_stream(&state, &room_id);

        let first = next_json(&mut rx).await;
        assert_eq!(first["type"], "snapshot");
        assert!(first["room"].get("host_token").is_none());
        assert_eq!(first["participants"][0]["name"], "Host");

        let store = state.store();
        store.insert_participant(&room_id, "Ana", false).await.unwrap();
        store
            .update_room(&room_id, RoomPatch { drawn: Some(true) })
            .await
            .unwrap();
        store.delete_room(&room_id).await.unwrap();

        let joined = next_json(&mut rx).await;
        assert_eq!(joined["type"], "change");
        assert_eq!(joined["kind"], "insert");
        assert_eq!(joined["entity"]["record"]["name"], "Ana");

        let drawn = next_json(&mut rx).await;
        assert_eq!(drawn["kind"], "update");
        assert_eq!(drawn["entity"]["type"], "room");
        assert_eq!(drawn["entity"]["record"]["drawn"], true);
        assert_eq!(drawn["entity"]["record"]["host_token"], "");

        let deleted = next_json(&mut rx).await;
        assert_eq!(deleted["kind"], "delete");
        assert_eq!(deleted["entity"]["record"]["host_token"], "");

        assert!(matches!(next_message(&mut rx).await, Message::Close(None)));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn room_stream_resends_snapshot_after_gap() {
        let state = AppState::new(
            MemoryStore::default().with_feed_capacity(1),
            Config::default(),
        );
        let hosted = host_room(state.store(), "Host").await.unwrap();
        let room_id = hosted.room.id.clone();
        let mut rx = spawn_stream(&state, &room_id);
        assert_eq!(next_json(&mut rx).await["participants"].as_array().unwrap().len(), 1);

        // The stream task cannot run in between, so the feed overflows.
        for name in ["Ana", "Bia", "Caio"] {
            state
                .store()
                .insert_participant(&room_id, name, false)
                .await
                .unwrap();
        }

        let resent = next_json(&mut rx).await;
        assert_eq!(resent["type"], "snapshot");
        assert_eq!(resent["participants"].as_array().unwrap().len(), 4);
        let last = next_json(&mut rx).await;
        assert_eq!(last["kind"], "insert");
        assert_eq!(last["entity"]["record"]["name"], "Caio");
    }

    #[tokio::test]
    async fn room_stream_reports_unknown_room() {
        let state = AppState::default();
        let mut rx = spawn_stream(&state, "missing");
        assert!(matches!(
            next_message(&mut rx).await,
            Message::Text(text) if text == "unknown room"
        ));
        assert!(rx.next().await.is_none());
    }
}
