//! Shared harness: an in-process stand-in for the collaborator server plus
//! a recording platform and event-wait helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
        Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use openchat_client::model::{Message, MessageKind, Room, RoomId, User, UserId};
use openchat_client::platform::Platform;
use openchat_client::sync::SyncEvent;
use openchat_client::{ChatSync, Config, Role};

type AppState = State<Arc<ServerState>>;

#[derive(Default)]
pub struct ServerState {
    next_user: AtomicI64,
    next_room: AtomicI64,
    next_message: AtomicI64,
    users: Mutex<HashMap<UserId, User>>,
    sessions: Mutex<HashMap<String, UserId>>,
    ws_tokens: Mutex<HashMap<String, UserId>>,
    rooms: Mutex<Vec<Room>>,
    members: Mutex<HashMap<RoomId, Vec<UserId>>>,
    messages: Mutex<HashMap<RoomId, Vec<Message>>>,
    invites: Mutex<HashMap<String, RoomId>>,
    channels: Mutex<HashMap<RoomId, broadcast::Sender<String>>>,
    /// Every join call that reached the server, successful or redundant.
    join_calls: Mutex<Vec<(UserId, RoomId)>>,
    /// Fixed unread count reported by the joined-room feed.
    server_unread: Mutex<HashMap<RoomId, u32>>,
    fail_userspaces: AtomicBool,
}

impl ServerState {
    /// Create a user directly, bypassing the session endpoint. Used for
    /// "someone else posts" scenarios.
    pub fn seed_user(&self, name: &str) -> User {
        let user = User {
            id: self.next_user.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.to_string(),
            role: Role::User,
        };
        self.users.lock().insert(user.id, user.clone());
        user
    }

    pub fn seed_room(&self, name: &str, is_community: bool, owner: &User) -> Room {
        let room = Room {
            id: self.next_room.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.to_string(),
            is_public: true,
            is_community,
            owner_id: owner.id,
            active_users: None,
            unread_count: None,
        };
        self.rooms.lock().push(room.clone());
        self.members.lock().entry(room.id).or_default().push(owner.id);
        room
    }

    pub fn add_member(&self, room_id: RoomId, user: &User) {
        let mut members = self.members.lock();
        let list = members.entry(room_id).or_default();
        if !list.contains(&user.id) {
            list.push(user.id);
        }
    }

    pub fn seed_invite(&self, room_id: RoomId) -> String {
        let token = Uuid::new_v4().to_string();
        self.invites.lock().insert(token.clone(), room_id);
        token
    }

    pub fn set_server_unread(&self, room_id: RoomId, count: u32) {
        self.server_unread.lock().insert(room_id, count);
    }

    pub fn set_fail_userspaces(&self, fail: bool) {
        self.fail_userspaces.store(fail, Ordering::SeqCst);
    }

    pub fn join_calls(&self) -> Vec<(UserId, RoomId)> {
        self.join_calls.lock().clone()
    }

    pub fn stored_messages(&self, room_id: RoomId) -> Vec<Message> {
        self.messages.lock().get(&room_id).cloned().unwrap_or_default()
    }

    /// Append a message to a room's history and push it to live listeners.
    pub fn post_message(
        &self,
        room_id: RoomId,
        author: &User,
        content: &str,
        file_url: Option<String>,
    ) -> Message {
        let msg = Message {
            id: self.next_message.fetch_add(1, Ordering::SeqCst) + 1,
            room_id,
            author: author.clone(),
            content: content.to_string(),
            kind: if file_url.is_some() {
                MessageKind::File
            } else {
                MessageKind::Text
            },
            file_url,
            created_at: OffsetDateTime::now_utc(),
        };
        self.messages
            .lock()
            .entry(room_id)
            .or_default()
            .push(msg.clone());
        self.broadcast(&msg);
        msg
    }

    /// Push an already-delivered message to live listeners again.
    pub fn rebroadcast(&self, msg: &Message) {
        self.broadcast(msg);
    }

    fn broadcast(&self, msg: &Message) {
        if let Some(tx) = self.channels.lock().get(&msg.room_id) {
            let _ = tx.send(serde_json::to_string(msg).unwrap());
        }
    }

    fn channel(&self, room_id: RoomId) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn session_user(&self, headers: &HeaderMap) -> Option<User> {
        let cookie = headers.get(header::COOKIE)?.to_str().ok()?;
        let sid = cookie
            .split(';')
            .find_map(|p| p.trim().strip_prefix("session="))?;
        let uid = *self.sessions.lock().get(sid)?;
        self.users.lock().get(&uid).cloned()
    }

    fn room(&self, id: RoomId) -> Option<Room> {
        self.rooms.lock().iter().find(|r| r.id == id).cloned()
    }

    fn is_member(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.members
            .lock()
            .get(&room_id)
            .map(|m| m.contains(&user_id))
            .unwrap_or(false)
    }
}

fn err(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

fn unauthorized() -> Response {
    err(StatusCode::UNAUTHORIZED, "Not authenticated")
}

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

#[derive(Deserialize)]
struct RoomBody {
    name: String,
    is_public: bool,
}

async fn session_start(State(st): AppState, Json(body): Json<NameBody>) -> Response {
    let user = st.seed_user(&body.name);
    let sid = Uuid::new_v4().to_string();
    st.sessions.lock().insert(sid.clone(), user.id);
    (
        AppendHeaders([(header::SET_COOKIE, format!("session={sid}; Path=/"))]),
        Json(user),
    )
        .into_response()
}

async fn session_me(State(st): AppState, headers: HeaderMap) -> Response {
    match st.session_user(&headers) {
        Some(user) => Json(user).into_response(),
        None => unauthorized(),
    }
}

async fn session_token(State(st): AppState, headers: HeaderMap) -> Response {
    let Some(user) = st.session_user(&headers) else {
        return unauthorized();
    };
    let token = Uuid::new_v4().to_string();
    st.ws_tokens.lock().insert(token.clone(), user.id);
    Json(json!({ "token": token })).into_response()
}

async fn rooms_create(
    State(st): AppState,
    headers: HeaderMap,
    Json(body): Json<RoomBody>,
) -> Response {
    let Some(user) = st.session_user(&headers) else {
        return unauthorized();
    };
    let mut room = st.seed_room(&body.name, false, &user);
    room.is_public = body.is_public;
    if let Some(stored) = st.rooms.lock().iter_mut().find(|r| r.id == room.id) {
        stored.is_public = body.is_public;
    }
    Json(room).into_response()
}

async fn rooms_community(State(st): AppState) -> Response {
    let rooms: Vec<Room> = st
        .rooms
        .lock()
        .iter()
        .filter(|r| r.is_community)
        .cloned()
        .collect();
    Json(rooms).into_response()
}

async fn rooms_userspaces(State(st): AppState) -> Response {
    if st.fail_userspaces.load(Ordering::SeqCst) {
        return err(StatusCode::INTERNAL_SERVER_ERROR, "boom");
    }
    let rooms: Vec<Room> = st
        .rooms
        .lock()
        .iter()
        .filter(|r| !r.is_community && r.is_public)
        .cloned()
        .collect();
    Json(rooms).into_response()
}

async fn rooms_my(State(st): AppState, headers: HeaderMap) -> Response {
    let Some(user) = st.session_user(&headers) else {
        return unauthorized();
    };
    let unread = st.server_unread.lock().clone();
    let members = st.members.lock().clone();
    let rooms: Vec<Room> = st
        .rooms
        .lock()
        .iter()
        .filter(|r| members.get(&r.id).map(|m| m.contains(&user.id)).unwrap_or(false))
        .map(|r| {
            let mut r = r.clone();
            r.unread_count = Some(unread.get(&r.id).copied().unwrap_or(0));
            r.active_users = Some(members.get(&r.id).map(|m| m.len() as u32).unwrap_or(0));
            r
        })
        .collect();
    Json(rooms).into_response()
}

async fn room_delete(State(st): AppState, headers: HeaderMap, Path(id): Path<RoomId>) -> Response {
    let Some(user) = st.session_user(&headers) else {
        return unauthorized();
    };
    let Some(room) = st.room(id) else {
        return err(StatusCode::NOT_FOUND, "Room not found");
    };
    if room.owner_id != user.id {
        return err(StatusCode::FORBIDDEN, "Only the owner can delete a room");
    }
    st.rooms.lock().retain(|r| r.id != id);
    st.members.lock().remove(&id);
    st.messages.lock().remove(&id);
    StatusCode::NO_CONTENT.into_response()
}

async fn room_join(State(st): AppState, headers: HeaderMap, Path(id): Path<RoomId>) -> Response {
    let Some(user) = st.session_user(&headers) else {
        return unauthorized();
    };
    if st.room(id).is_none() {
        return err(StatusCode::NOT_FOUND, "Room not found");
    }
    st.join_calls.lock().push((user.id, id));
    if st.is_member(id, user.id) {
        return err(
            StatusCode::CONFLICT,
            "User is already a member of this room",
        );
    }
    st.add_member(id, &user);
    StatusCode::NO_CONTENT.into_response()
}

async fn room_leave(State(st): AppState, headers: HeaderMap, Path(id): Path<RoomId>) -> Response {
    let Some(user) = st.session_user(&headers) else {
        return unauthorized();
    };
    if let Some(list) = st.members.lock().get_mut(&id) {
        list.retain(|&u| u != user.id);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn room_members(State(st): AppState, Path(id): Path<RoomId>) -> Response {
    let ids = st.members.lock().get(&id).cloned().unwrap_or_default();
    let users = st.users.lock();
    let list: Vec<User> = ids.iter().filter_map(|u| users.get(u).cloned()).collect();
    Json(list).into_response()
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn room_messages(
    State(st): AppState,
    Path(id): Path<RoomId>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    // newest first, like the real feed
    let mut msgs: Vec<Message> = st
        .messages
        .lock()
        .get(&id)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .rev()
        .collect();
    if let Some(limit) = q.limit {
        msgs.truncate(limit);
    }
    Json(msgs).into_response()
}

async fn invite_create(State(st): AppState, headers: HeaderMap, Path(id): Path<RoomId>) -> Response {
    let Some(user) = st.session_user(&headers) else {
        return unauthorized();
    };
    if !st.is_member(id, user.id) {
        return err(StatusCode::FORBIDDEN, "Not a member of this room");
    }
    let token = st.seed_invite(id);
    Json(json!({ "token": token })).into_response()
}

async fn invite_resolve(State(st): AppState, Path(token): Path<String>) -> Response {
    let room_id = st.invites.lock().get(&token).copied();
    match room_id.and_then(|id| st.room(id)) {
        Some(room) => Json(room).into_response(),
        None => err(StatusCode::NOT_FOUND, "Invalid invite"),
    }
}

async fn upload_file(State(_st): AppState, mut multipart: Multipart) -> Response {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or("upload.bin").to_string();
            let data = match field.bytes().await {
                Ok(b) => b,
                Err(_) => return err(StatusCode::BAD_REQUEST, "Broken upload"),
            };
            if data.is_empty() {
                return err(StatusCode::BAD_REQUEST, "Empty upload");
            }
            return Json(json!({ "file_url": format!("/files/{name}") })).into_response();
        }
    }
    err(StatusCode::BAD_REQUEST, "Missing file field")
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_connect(
    State(st): AppState,
    Path(room_id): Path<RoomId>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = q
        .token
        .and_then(|t| st.ws_tokens.lock().get(&t).copied())
        .and_then(|uid| st.users.lock().get(&uid).cloned());
    let Some(user) = user else {
        return unauthorized();
    };
    ws.on_upgrade(move |socket| ws_session(st, room_id, user, socket))
}

async fn ws_session(st: Arc<ServerState>, room_id: RoomId, user: User, socket: WebSocket) {
    let mut rx = st.channel(room_id).subscribe();
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Ok(text) => {
                    if sink.send(WsFrame::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsFrame::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) {
                        let content = frame
                            .get("content")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let file_url = frame
                            .get("file_url")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string());
                        st.post_message(room_id, &user, &content, file_url);
                    }
                }
                Some(Ok(WsFrame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/v1/session/start", post(session_start))
        .route("/api/v1/session/me", get(session_me))
        .route("/api/v1/session/token", get(session_token))
        .route("/api/v1/rooms", post(rooms_create))
        .route("/api/v1/rooms/community", get(rooms_community))
        .route("/api/v1/rooms/userspaces", get(rooms_userspaces))
        .route("/api/v1/rooms/my", get(rooms_my))
        .route("/api/v1/rooms/:id", delete(room_delete))
        .route("/api/v1/rooms/:id/join", post(room_join))
        .route("/api/v1/rooms/:id/leave", post(room_leave))
        .route("/api/v1/rooms/:id/members", get(room_members))
        .route("/api/v1/rooms/:id/messages", get(room_messages))
        .route("/api/v1/rooms/:id/invite", post(invite_create))
        .route("/api/v1/invite/:token", get(invite_resolve))
        .route("/api/v1/upload-file", post(upload_file))
        .route("/api/v1/ws/:room_id", get(ws_connect))
        .with_state(state)
}

pub struct TestServer {
    pub api_base: String,
    pub state: Arc<ServerState>,
    _handle: JoinHandle<()>,
}

impl TestServer {
    pub fn client(&self) -> ChatSync {
        self.client_with(Arc::new(openchat_client::NullPlatform))
    }

    pub fn client_with(&self, platform: Arc<dyn Platform>) -> ChatSync {
        let config = Config::new(&self.api_base).unwrap();
        ChatSync::new(config, platform).unwrap()
    }
}

pub async fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let state = Arc::new(ServerState::default());
    let app = router(state.clone());
    let handle = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    TestServer {
        api_base: format!("http://{addr}/api/v1"),
        state,
        _handle: handle,
    }
}

/// A platform whose focus state and notification log tests can inspect.
#[derive(Default)]
pub struct RecordingPlatform {
    pub focused: AtomicBool,
    pub notifications: Mutex<Vec<(String, String, String)>>,
    pub clipboard: Mutex<Vec<String>>,
}

impl RecordingPlatform {
    pub fn focused(start: bool) -> Arc<Self> {
        let p = Self::default();
        p.focused.store(start, Ordering::SeqCst);
        Arc::new(p)
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.lock().len()
    }
}

impl Platform for RecordingPlatform {
    fn notify(&self, room_name: &str, author: &str, body: &str) {
        self.notifications
            .lock()
            .push((room_name.into(), author.into(), body.into()));
    }

    fn has_focus(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    fn clipboard_write(&self, text: &str) -> bool {
        self.clipboard.lock().push(text.into());
        true
    }
}

/// Poll a condition until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait for a matching event, failing the test after five seconds.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SyncEvent>, pred: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
