use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::invite;
use crate::model::{Message, MessageId, OutboundFrame, Room, RoomId, User};
use crate::platform::Platform;
use crate::poll;
use crate::transport::{ConnState, LiveConnection, TransportEvent};

/// How many recent messages per room the notification sweep inspects.
const NOTIFY_FETCH_LIMIT: u32 = 20;

/// Stage of the selected-room pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// No room selected.
    Idle,
    /// Membership check or join call in flight.
    Joining,
    /// History and member list fetch in flight.
    LoadingHistory,
    /// Transport token fetched, waiting for the open event.
    Connecting,
    /// Connection open; messages flow both ways.
    Live,
}

/// Change notifications broadcast to observers. Consumers read the new
/// state through the snapshot getters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SessionChanged,
    DiscoveryChanged,
    MyRoomsChanged,
    Phase(RoomPhase),
    MessagesChanged,
    MembersChanged,
    UnreadChanged(RoomId),
    ConnectionLost,
    Notice(String),
}

struct SyncState {
    user: Option<User>,
    community: Vec<Room>,
    userspaces: Vec<Room>,
    my_rooms: Vec<Room>,
    selected: Option<Room>,
    phase: RoomPhase,
    messages: Vec<Message>,
    seen_ids: HashSet<MessageId>,
    members: Vec<User>,
    unread: HashMap<RoomId, u32>,
    /// Message ids that already raised (or were suppressed from raising) a
    /// notification; process-wide so no message notifies twice.
    notified: HashSet<MessageId>,
    /// Message ids already counted toward a non-selected room's unread
    /// counter, so redundant deliveries cannot double-count.
    counted: HashSet<MessageId>,
    /// Rooms the notification sweep has scanned at least once. The first
    /// scan of a room only primes `notified`; history that predates it
    /// never notifies.
    swept: HashSet<RoomId>,
    /// Bumped on every selection change; completions from a superseded
    /// selection compare against it and drop their results.
    generation: u64,
    conn: Option<LiveConnection>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            user: None,
            community: Vec::new(),
            userspaces: Vec::new(),
            my_rooms: Vec::new(),
            selected: None,
            phase: RoomPhase::Idle,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            members: Vec::new(),
            unread: HashMap::new(),
            notified: HashSet::new(),
            counted: HashSet::new(),
            swept: HashSet::new(),
            generation: 0,
            conn: None,
        }
    }
}

struct Inner {
    api: ApiClient,
    config: Config,
    platform: Arc<dyn Platform>,
    state: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: CancellationToken,
}

/// The session and room synchronizer: one instance per active session,
/// exclusive owner of the live transport handle and of the selected room's
/// message and member collections.
#[derive(Clone)]
pub struct ChatSync {
    inner: Arc<Inner>,
}

impl ChatSync {
    /// Create a synchronizer. Background pollers start with [`start`].
    ///
    /// [`start`]: ChatSync::start
    pub fn new(config: Config, platform: Arc<dyn Platform>) -> Result<Self> {
        let api = ApiClient::new(config.api_base.clone())?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(Inner {
                api,
                config,
                platform,
                state: Mutex::new(SyncState::default()),
                events,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Spawn the discovery and notification pollers.
    pub fn start(&self) {
        poll::spawn_discovery(self.clone());
        poll::spawn_notifications(self.clone());
    }

    /// Tear the instance down: stop pollers, close the live connection and
    /// clear all session state.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.logout();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    // --- session -----------------------------------------------------------

    /// Ask the API whether a valid session exists. Any failure, including
    /// 401 and network errors, means "not authenticated"; discovery keeps
    /// working either way.
    pub async fn restore_session(&self) -> Option<User> {
        match self.inner.api.current_session().await {
            Ok(user) => {
                self.inner.state.lock().user = Some(user.clone());
                self.emit(SyncEvent::SessionChanged);
                if let Err(e) = self.refresh_my_rooms().await {
                    tracing::debug!(error = %e, "initial membership refresh failed");
                }
                Some(user)
            }
            Err(e) => {
                tracing::debug!(error = %e, "no restorable session");
                None
            }
        }
    }

    /// Start a session for a display name. The name must be non-empty after
    /// trimming; uniqueness is the server's concern.
    pub async fn start_session(&self, display_name: &str) -> Result<User> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("display name required".into()));
        }
        let user = self.inner.api.start_session(name).await?;
        self.inner.state.lock().user = Some(user.clone());
        self.emit(SyncEvent::SessionChanged);
        if let Err(e) = self.refresh_my_rooms().await {
            tracing::debug!(error = %e, "membership refresh after login failed");
        }
        Ok(user)
    }

    /// Clear all session-derived local state. The server-side cookie is
    /// invalidated by the collaborator, not here.
    pub fn logout(&self) {
        {
            let mut s = self.inner.state.lock();
            s.generation += 1;
            s.conn = None;
            s.user = None;
            s.selected = None;
            s.phase = RoomPhase::Idle;
            s.my_rooms.clear();
            s.messages.clear();
            s.seen_ids.clear();
            s.members.clear();
            s.unread.clear();
            s.counted.clear();
            s.swept.clear();
        }
        self.emit(SyncEvent::SessionChanged);
        self.emit(SyncEvent::Phase(RoomPhase::Idle));
        self.emit(SyncEvent::MyRoomsChanged);
    }

    // --- discovery & membership -------------------------------------------

    /// Refresh both public room lists together. On partial failure the
    /// failed list keeps its previous value.
    pub async fn refresh_discovery(&self) {
        let (community, userspaces) = tokio::join!(
            self.inner.api.community_rooms(),
            self.inner.api.userspace_rooms()
        );
        let mut changed = false;
        {
            let mut s = self.inner.state.lock();
            match community {
                Ok(rooms) => {
                    s.community = rooms;
                    changed = true;
                }
                Err(e) => tracing::debug!(error = %e, "community list refresh failed"),
            }
            match userspaces {
                Ok(rooms) => {
                    s.userspaces = rooms;
                    changed = true;
                }
                Err(e) => tracing::debug!(error = %e, "userspace list refresh failed"),
            }
        }
        if changed {
            self.emit(SyncEvent::DiscoveryChanged);
        }
    }

    /// Refresh the joined-room list. A no-op without a session. Server
    /// unread counts merge into the local counters (max wins); the selected
    /// room stays at zero.
    pub async fn refresh_my_rooms(&self) -> Result<Vec<Room>> {
        {
            let s = self.inner.state.lock();
            if s.user.is_none() {
                return Ok(s.my_rooms.clone());
            }
        }
        let rooms = self.inner.api.my_rooms().await?;
        {
            let mut s = self.inner.state.lock();
            let selected_id = s.selected.as_ref().map(|r| r.id);
            for room in &rooms {
                let local = s.unread.get(&room.id).copied().unwrap_or(0);
                let server = room.unread_count.unwrap_or(0);
                let value = if Some(room.id) == selected_id {
                    0
                } else {
                    local.max(server)
                };
                s.unread.insert(room.id, value);
            }
            s.my_rooms = rooms.clone();
        }
        self.emit(SyncEvent::MyRoomsChanged);
        Ok(rooms)
    }

    /// Create a room. The creator is a member immediately; no separate join
    /// call is made.
    pub async fn create_room(&self, name: &str, is_public: bool) -> Result<Room> {
        self.require_user()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("room name required".into()));
        }
        let room = self.inner.api.create_room(name, is_public).await?;
        {
            let mut s = self.inner.state.lock();
            if !s.my_rooms.iter().any(|r| r.id == room.id) {
                s.my_rooms.push(room.clone());
            }
            s.unread.insert(room.id, 0);
        }
        self.emit(SyncEvent::MyRoomsChanged);
        Ok(room)
    }

    /// Join a room without selecting it. A redundant join is success.
    pub async fn join_room(&self, room: &Room) -> Result<()> {
        self.require_user()?;
        self.inner.api.join_room(room.id).await?;
        self.refresh_my_rooms().await?;
        Ok(())
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<()> {
        self.deselect_if(room_id);
        self.inner.api.leave_room(room_id).await?;
        self.drop_membership(room_id);
        if let Err(e) = self.refresh_my_rooms().await {
            tracing::debug!(error = %e, "membership refresh after leave failed");
        }
        Ok(())
    }

    pub async fn delete_room(&self, room_id: RoomId) -> Result<()> {
        self.deselect_if(room_id);
        self.inner.api.delete_room(room_id).await?;
        self.drop_membership(room_id);
        self.refresh_discovery().await;
        if let Err(e) = self.refresh_my_rooms().await {
            tracing::debug!(error = %e, "membership refresh after delete failed");
        }
        Ok(())
    }

    fn drop_membership(&self, room_id: RoomId) {
        {
            let mut s = self.inner.state.lock();
            s.my_rooms.retain(|r| r.id != room_id);
            s.unread.remove(&room_id);
            s.swept.remove(&room_id);
        }
        self.emit(SyncEvent::MyRoomsChanged);
    }

    // --- invites & uploads -------------------------------------------------

    /// Create an invite link for a room. The server enforces membership;
    /// its rejection message is surfaced verbatim.
    pub async fn create_invite(&self, room_id: RoomId) -> Result<String> {
        let token = self.inner.api.create_invite(room_id).await?;
        Ok(invite::invite_url(&self.inner.config.link_origin, &token))
    }

    /// Create an invite link and try to place it on the clipboard. Returns
    /// the link and whether the copy succeeded, so callers can fall back to
    /// a manual prompt.
    pub async fn copy_invite_link(&self, room_id: RoomId) -> Result<(String, bool)> {
        let url = self.create_invite(room_id).await?;
        let copied = self.inner.platform.clipboard_write(&url);
        if copied {
            self.emit(SyncEvent::Notice("Link copied".into()));
        }
        Ok((url, copied))
    }

    /// Resolve a pasted invite link or bare token to a room. Every lookup
    /// failure collapses to [`ChatError::InvalidInvite`].
    pub async fn resolve_invite(&self, input: &str) -> Result<Room> {
        let token = invite::extract_token(input)
            .ok_or_else(|| ChatError::Validation("invite link required".into()))?;
        self.inner.api.room_by_invite(&token).await.map_err(|e| {
            tracing::debug!(error = %e, "invite lookup failed");
            ChatError::InvalidInvite
        })
    }

    /// Upload a file and return its URL. No message is created on failure.
    pub async fn upload_attachment(&self, file_name: &str, data: Bytes) -> Result<String> {
        self.inner
            .api
            .upload_file(file_name, data)
            .await
            .map_err(|e| match e {
                ChatError::Api { message, .. } => ChatError::UploadFailed(message),
                ChatError::Http(e) => ChatError::UploadFailed(e.to_string()),
                other => other,
            })
    }

    /// Upload a file and send it as an attachment-only message.
    pub async fn send_attachment(&self, file_name: &str, data: Bytes) -> Result<()> {
        let url = self.upload_attachment(file_name, data).await?;
        self.send_message(None, Some(&url)).await
    }

    // --- selected room -----------------------------------------------------

    /// Select a room: join it if needed, load history and members, then
    /// open the live transport. Any previous selection is superseded and
    /// its connection closed; its in-flight completions are dropped.
    pub async fn select_room(&self, room: Room) -> Result<()> {
        let gen = {
            let mut s = self.inner.state.lock();
            if s.user.is_none() {
                return Err(ChatError::AuthRequired);
            }
            s.generation += 1;
            s.conn = None;
            s.selected = Some(room.clone());
            s.phase = RoomPhase::Joining;
            s.messages.clear();
            s.seen_ids.clear();
            s.members.clear();
            s.unread.insert(room.id, 0);
            s.generation
        };
        self.emit(SyncEvent::Phase(RoomPhase::Joining));
        self.emit(SyncEvent::MessagesChanged);
        self.emit(SyncEvent::MembersChanged);
        self.emit(SyncEvent::UnreadChanged(room.id));

        let already_member = {
            let s = self.inner.state.lock();
            s.my_rooms.iter().any(|r| r.id == room.id)
        };
        if !already_member {
            if let Err(e) = self.inner.api.join_room(room.id).await {
                return self.fail_selection(gen, e);
            }
            if !self.is_current(gen) {
                return Ok(());
            }
            if let Err(e) = self.refresh_my_rooms().await {
                tracing::debug!(error = %e, "membership refresh after join failed");
            }
            if !self.is_current(gen) {
                return Ok(());
            }
        }

        self.set_phase(gen, RoomPhase::LoadingHistory);
        let (history, members) = tokio::join!(
            self.inner
                .api
                .room_messages(room.id, self.inner.config.history_limit),
            self.inner.api.room_members(room.id)
        );
        let (mut history, members) = match (history, members) {
            (Ok(h), Ok(m)) => (h, m),
            (Err(e), _) | (_, Err(e)) => return self.fail_selection(gen, e),
        };
        // API serves newest-first; display order is chronological
        history.reverse();
        {
            let mut s = self.inner.state.lock();
            if s.generation != gen {
                return Ok(());
            }
            s.seen_ids = history.iter().map(|m| m.id).collect();
            s.messages = history;
            s.members = members;
        }
        self.emit(SyncEvent::MessagesChanged);
        self.emit(SyncEvent::MembersChanged);

        self.connect_live(gen, room.id).await
    }

    /// Drop the selection and close the live connection.
    pub fn deselect_room(&self) {
        {
            let mut s = self.inner.state.lock();
            s.generation += 1;
            s.conn = None;
            s.selected = None;
            s.phase = RoomPhase::Idle;
            s.messages.clear();
            s.seen_ids.clear();
            s.members.clear();
        }
        self.emit(SyncEvent::Phase(RoomPhase::Idle));
        self.emit(SyncEvent::MessagesChanged);
        self.emit(SyncEvent::MembersChanged);
    }

    fn deselect_if(&self, room_id: RoomId) {
        let clear =
            { self.inner.state.lock().selected.as_ref().map(|r| r.id) == Some(room_id) };
        if clear {
            self.deselect_room();
        }
    }

    /// Re-run the connecting stage for the current selection, keeping the
    /// loaded history and member list.
    pub async fn reconnect(&self) -> Result<()> {
        let (gen, room_id) = {
            let mut s = self.inner.state.lock();
            let Some(room) = s.selected.as_ref() else {
                return Ok(());
            };
            let id = room.id;
            s.generation += 1;
            s.conn = None;
            (s.generation, id)
        };
        self.connect_live(gen, room_id).await
    }

    async fn connect_live(&self, gen: u64, room_id: RoomId) -> Result<()> {
        self.set_phase(gen, RoomPhase::Connecting);
        let token = match self.inner.api.session_token().await {
            Ok(t) => t,
            Err(e) => return self.fail_selection(gen, e),
        };
        if !self.is_current(gen) {
            return Ok(());
        }
        let (conn, events) = LiveConnection::open(&self.inner.config.ws_base, room_id, &token);
        {
            let mut s = self.inner.state.lock();
            if s.generation != gen {
                conn.close();
                return Ok(());
            }
            s.conn = Some(conn);
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_connection(gen, events).await });
        Ok(())
    }

    async fn run_connection(&self, gen: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(ev) = events.recv().await {
            if !self.is_current(gen) {
                break;
            }
            match ev {
                TransportEvent::Opened => self.set_phase(gen, RoomPhase::Live),
                TransportEvent::Inbound(msg) => self.handle_incoming(gen, msg),
                TransportEvent::Closed(reason) => {
                    tracing::info!(
                        reason = reason.as_deref().unwrap_or("closed"),
                        "live connection closed"
                    );
                    self.emit(SyncEvent::ConnectionLost);
                    break;
                }
            }
        }
    }

    fn handle_incoming(&self, gen: u64, msg: Message) {
        let mut appended = false;
        let mut unread_room = None;
        let mut notify_room = None;
        {
            let mut s = self.inner.state.lock();
            if s.generation != gen {
                return;
            }
            let from_me = s.user.as_ref().map(|u| u.id) == Some(msg.author.id);
            let selected_id = s.selected.as_ref().map(|r| r.id);
            if selected_id == Some(msg.room_id) {
                if !s.seen_ids.insert(msg.id) {
                    return; // duplicate identity, discard
                }
                s.messages.push(msg.clone());
                appended = true;
                if from_me || self.inner.platform.has_focus() {
                    s.notified.insert(msg.id);
                } else {
                    *s.unread.entry(msg.room_id).or_default() += 1;
                    unread_room = Some(msg.room_id);
                    if s.notified.insert(msg.id) {
                        notify_room = s.selected.as_ref().map(|r| r.name.clone());
                    }
                }
            } else if !from_me && s.counted.insert(msg.id) {
                // another room's event: never shown here, still counted once
                *s.unread.entry(msg.room_id).or_default() += 1;
                unread_room = Some(msg.room_id);
            }
        }
        if appended {
            self.emit(SyncEvent::MessagesChanged);
        }
        if let Some(room_id) = unread_room {
            self.emit(SyncEvent::UnreadChanged(room_id));
        }
        if let Some(room_name) = notify_room {
            self.inner
                .platform
                .notify(&room_name, &msg.author.name, msg.display_body());
        }
    }

    /// Send a message over the live connection. At least one of content or
    /// attachment must be present; validation happens before any transport
    /// call, so the caller's draft is never consumed on failure. A dead
    /// transport schedules a reconnect instead of requiring a room switch.
    pub async fn send_message(&self, content: Option<&str>, file_url: Option<&str>) -> Result<()> {
        let content = content.unwrap_or("").trim();
        if content.is_empty() && file_url.is_none() {
            return Err(ChatError::Validation("message is empty".into()));
        }
        let frame = match file_url {
            Some(url) => OutboundFrame::file(content, url),
            None => OutboundFrame::text(content),
        };
        let (sent, reconnect) = {
            let s = self.inner.state.lock();
            if s.selected.is_none() {
                return Err(ChatError::NotConnected);
            }
            match &s.conn {
                Some(conn) if conn.is_open() => (conn.send(frame), false),
                // a pending connection is left to finish on its own
                Some(conn) => (
                    Err(ChatError::NotConnected),
                    conn.state() == ConnState::Closed,
                ),
                None => (Err(ChatError::NotConnected), true),
            }
        };
        if reconnect {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.reconnect().await {
                    tracing::debug!(error = %e, "reconnect failed");
                }
            });
        }
        sent
    }

    // --- background sweeps -------------------------------------------------

    /// One notification sweep: refresh membership, then scan recent messages
    /// of every joined room for posts by others that have not been notified
    /// yet. Only runs with a session and non-empty membership.
    pub(crate) async fn notification_sweep(&self) -> anyhow::Result<()> {
        let active = {
            let s = self.inner.state.lock();
            s.user.is_some() && !s.my_rooms.is_empty()
        };
        if !active {
            return Ok(());
        }
        self.refresh_my_rooms().await?;
        let rooms: Vec<(RoomId, String)> = {
            let s = self.inner.state.lock();
            s.my_rooms.iter().map(|r| (r.id, r.name.clone())).collect()
        };
        for (room_id, room_name) in rooms {
            let msgs = match self
                .inner
                .api
                .room_messages(room_id, Some(NOTIFY_FETCH_LIMIT))
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(room = room_id, error = %e, "notification fetch failed");
                    continue;
                }
            };
            {
                // a room's first scan only primes the notified set, so a
                // fresh join or restart never replays its backlog
                let mut s = self.inner.state.lock();
                if s.swept.insert(room_id) {
                    s.notified.extend(msgs.iter().map(|m| m.id));
                    continue;
                }
            }
            for msg in msgs {
                let should_notify = {
                    let mut s = self.inner.state.lock();
                    let from_me = s.user.as_ref().map(|u| u.id) == Some(msg.author.id);
                    let selected =
                        s.selected.as_ref().map(|r| r.id) == Some(msg.room_id);
                    if from_me || (selected && self.inner.platform.has_focus()) {
                        // suppress forever; reading it later must not notify
                        s.notified.insert(msg.id);
                        false
                    } else {
                        s.notified.insert(msg.id)
                    }
                };
                if should_notify {
                    self.inner
                        .platform
                        .notify(&room_name, &msg.author.name, msg.display_body());
                }
            }
        }
        Ok(())
    }

    // --- snapshots ---------------------------------------------------------

    pub fn current_user(&self) -> Option<User> {
        self.inner.state.lock().user.clone()
    }

    pub fn phase(&self) -> RoomPhase {
        self.inner.state.lock().phase
    }

    pub fn selected_room(&self) -> Option<Room> {
        self.inner.state.lock().selected.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().messages.clone()
    }

    pub fn members(&self) -> Vec<User> {
        self.inner.state.lock().members.clone()
    }

    pub fn my_rooms(&self) -> Vec<Room> {
        self.inner.state.lock().my_rooms.clone()
    }

    pub fn community_rooms(&self) -> Vec<Room> {
        self.inner.state.lock().community.clone()
    }

    pub fn userspace_rooms(&self) -> Vec<Room> {
        self.inner.state.lock().userspaces.clone()
    }

    pub fn unread_count(&self, room_id: RoomId) -> u32 {
        self.inner
            .state
            .lock()
            .unread
            .get(&room_id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether the live transport for the selected room is open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .conn
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    // --- internals ---------------------------------------------------------

    fn require_user(&self) -> Result<()> {
        if self.inner.state.lock().user.is_none() {
            return Err(ChatError::AuthRequired);
        }
        Ok(())
    }

    fn is_current(&self, gen: u64) -> bool {
        self.inner.state.lock().generation == gen
    }

    fn set_phase(&self, gen: u64, phase: RoomPhase) {
        {
            let mut s = self.inner.state.lock();
            if s.generation != gen {
                return;
            }
            s.phase = phase;
        }
        self.emit(SyncEvent::Phase(phase));
    }

    /// Abandon the current selection after a stage failure, unless a newer
    /// selection already superseded it.
    fn fail_selection(&self, gen: u64, err: ChatError) -> Result<()> {
        {
            let mut s = self.inner.state.lock();
            if s.generation != gen {
                return Ok(());
            }
            s.generation += 1;
            s.selected = None;
            s.phase = RoomPhase::Idle;
            s.conn = None;
            s.messages.clear();
            s.seen_ids.clear();
            s.members.clear();
        }
        self.emit(SyncEvent::Phase(RoomPhase::Idle));
        Err(err)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.events.send(event);
    }
}
