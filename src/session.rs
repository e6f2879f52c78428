//! Live room session.
//!
//! A [`SessionView`] is the pure state of one joined room: the REST snapshot,
//! the message log and the voice roster, patched by the events arriving on
//! the room's push channel. [`RoomSession`] drives a view from a
//! [`SessionChannel`] and issues chat actions over REST. Chat mutations never
//! touch local state directly; the channel echo does.
//!
//! ```text
//! Connecting ──► AwaitingSnapshot ──► Active ──► Closed(reason)
//!      └──────────────┴──────────────────┴──────────► Closed(reason)
//! ```

use std::future::Future;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::api::SessionApi;
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::model::{Message, MessageForm, Room, UserRef, VoiceUser};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// We left, locally or from another tab.
    Left,
    ChannelError(String),
    Kicked,
    Banned,
    RoomDeleted,
    /// The room was renamed; carries the new title.
    Retitled(String),
    SnapshotFailed(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Left => write!(f, "left the room"),
            CloseReason::ChannelError(e) => write!(f, "channel failed: {e}"),
            CloseReason::Kicked => write!(f, "You have been kicked."),
            CloseReason::Banned => write!(f, "You have been banned."),
            CloseReason::RoomDeleted => write!(f, "The room has been deleted."),
            CloseReason::Retitled(t) => write!(f, "The room was renamed to «{t}»."),
            CloseReason::SnapshotFailed(e) => write!(f, "could not load the room: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingSnapshot,
    Active,
    Closed(CloseReason),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Connecting => 0,
            SessionState::AwaitingSnapshot => 1,
            SessionState::Active => 2,
            SessionState::Closed(_) => 3,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            SessionState::Closed(reason) => Some(reason),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire events
// ---------------------------------------------------------------------------

/// Frames pushed by the server on the room channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    MessageSend {
        message: Message,
    },
    #[serde(alias = "message_edited")]
    MessageEdit {
        id: u64,
        message: Message,
    },
    MessageDelete {
        id: u64,
    },
    RoomConnect {
        #[serde(default)]
        voice_chat_users: Vec<VoiceUser>,
    },
    RoomDisconnect {
        #[serde(default)]
        voice_chat_users: Vec<VoiceUser>,
    },
    RoomUpdate {
        /// Current title of the room.
        room: String,
        #[serde(default)]
        user: Option<u64>,
        #[serde(default)]
        voice_chat_users: Option<Vec<VoiceUser>>,
    },
    RoomDelete,
    UserKick {
        user: u64,
    },
    Ban,
    VoiceChatConnect {
        #[serde(default)]
        voice_chat_users: Vec<VoiceUser>,
    },
    VoiceChatDisconnect {
        user: u64,
        #[serde(default)]
        voice_chat_users: Vec<VoiceUser>,
    },
    VoiceChatToggleMic {
        user: u64,
        is_muted: bool,
    },
    VoiceChatToggleSpeaking {
        user: u64,
        is_speaking: bool,
    },
    VoiceChatSignal {
        from: u64,
        to: u64,
        #[serde(default)]
        offer: Option<Value>,
        #[serde(default)]
        answer: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl RoomEvent {
    /// `None` for frames that are not JSON objects with a known shape.
    pub fn parse(frame: &str) -> Option<Self> {
        match serde_json::from_str(frame) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "dropping malformed room frame");
                None
            }
        }
    }
}

/// Frames the client sends on the room channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outgoing {
    UserKick {
        user: u64,
    },
    VoiceChatConnect {
        user: VoiceUser,
    },
    VoiceChatToggleMic {
        user: u64,
        is_muted: bool,
    },
    VoiceChatToggleSpeaking {
        user: u64,
        is_speaking: bool,
    },
    VoiceChatDisconnect {
        user: u64,
    },
    VoiceChatSignal {
        from: u64,
        to: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        offer: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        answer: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Offer(Value),
    Answer(Value),
}

/// Voice negotiation message addressed to us, for an external media layer.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSignal {
    pub from: u64,
    pub payload: SignalPayload,
}

/// What applying one event asks of the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Nothing changed.
    Ignored,
    /// Local state was patched in place.
    Updated,
    /// Replace the named parts from REST.
    Refetch { room: bool, messages: bool, profile: bool },
    Signal(VoiceSignal),
    Close(CloseReason),
    /// Banned: the session is closed and authentication must be reloaded.
    ReloadAuth,
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionView {
    me: UserRef,
    title: String,
    room: Option<Room>,
    messages: Vec<Message>,
    voice: Vec<VoiceUser>,
    state: SessionState,
}

impl SessionView {
    pub fn new(me: UserRef, title: impl Into<String>) -> Self {
        Self {
            me,
            title: title.into(),
            room: None,
            messages: Vec::new(),
            voice: Vec::new(),
            state: SessionState::Connecting,
        }
    }

    pub fn me(&self) -> &UserRef {
        &self.me
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn voice_roster(&self) -> &[VoiceUser] {
        &self.voice
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn in_voice(&self) -> bool {
        self.voice.iter().any(|u| u.id == self.me.id)
    }

    pub fn is_host(&self) -> bool {
        self.room.as_ref().is_some_and(|r| r.host.id == self.me.id)
    }

    /// Move forward; backward transitions are ignored.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next.rank() > self.state.rank() {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn close(&mut self, reason: CloseReason) -> Effect {
        if self.advance(SessionState::Closed(reason.clone())) {
            Effect::Close(reason)
        } else {
            Effect::Ignored
        }
    }

    pub fn replace_room(&mut self, room: Room) {
        self.title = room.title.clone();
        self.room = Some(room);
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Apply one pushed event. Pure: no I/O, refetches are requested through
    /// the returned [`Effect`].
    pub fn apply(&mut self, event: RoomEvent) -> Effect {
        if self.state.is_closed() {
            return Effect::Ignored;
        }
        match event {
            RoomEvent::MessageSend { message } => {
                if self.messages.iter().any(|m| m.id == message.id) {
                    return Effect::Ignored;
                }
                self.messages.push(message);
                Effect::Updated
            }
            RoomEvent::MessageEdit { id, message } => {
                let Some(slot) = self.messages.iter_mut().find(|m| m.id == id) else {
                    return Effect::Ignored;
                };
                *slot = message;
                // reply previews are denormalized on the quoting messages
                if self.messages.iter().any(|m| m.replies_to(id)) {
                    Effect::Refetch { room: false, messages: true, profile: false }
                } else {
                    Effect::Updated
                }
            }
            RoomEvent::MessageDelete { id } => {
                let before = self.messages.len();
                self.messages.retain(|m| m.id != id && !m.replies_to(id));
                if self.messages.len() == before {
                    Effect::Ignored
                } else {
                    Effect::Updated
                }
            }
            RoomEvent::RoomConnect { voice_chat_users } => {
                let keep_speaking = self.in_voice();
                self.voice = voice_chat_users;
                if !keep_speaking {
                    self.clear_speaking();
                }
                Effect::Refetch { room: true, messages: true, profile: false }
            }
            RoomEvent::RoomDisconnect { voice_chat_users } => {
                self.voice = voice_chat_users;
                Effect::Refetch { room: true, messages: false, profile: false }
            }
            RoomEvent::RoomUpdate { room, user, voice_chat_users } => {
                if room != self.title {
                    return self.close(CloseReason::Retitled(room));
                }
                if let Some(voice) = voice_chat_users {
                    self.voice = voice;
                }
                Effect::Refetch { room: true, messages: true, profile: user == Some(self.me.id) }
            }
            RoomEvent::RoomDelete => self.close(CloseReason::RoomDeleted),
            RoomEvent::UserKick { user } if user == self.me.id => self.close(CloseReason::Kicked),
            RoomEvent::UserKick { .. } => Effect::Ignored,
            RoomEvent::Ban => {
                self.close(CloseReason::Banned);
                Effect::ReloadAuth
            }
            RoomEvent::VoiceChatConnect { voice_chat_users } => {
                self.voice = voice_chat_users;
                Effect::Updated
            }
            RoomEvent::VoiceChatDisconnect { user, voice_chat_users } => {
                self.voice = voice_chat_users;
                if user == self.me.id {
                    self.clear_speaking();
                }
                Effect::Updated
            }
            RoomEvent::VoiceChatToggleMic { user, is_muted } => {
                match self.voice.iter_mut().find(|u| u.id == user) {
                    Some(entry) => {
                        entry.is_muted = is_muted;
                        Effect::Updated
                    }
                    None => Effect::Ignored,
                }
            }
            RoomEvent::VoiceChatToggleSpeaking { user, is_speaking } => {
                if !self.in_voice() {
                    return Effect::Ignored;
                }
                match self.voice.iter_mut().find(|u| u.id == user) {
                    Some(entry) => {
                        entry.is_speaking = is_speaking;
                        Effect::Updated
                    }
                    None => Effect::Ignored,
                }
            }
            RoomEvent::VoiceChatSignal { from, to, offer, answer } => {
                if to != self.me.id {
                    return Effect::Ignored;
                }
                let payload = match (answer, offer) {
                    (Some(answer), _) => SignalPayload::Answer(answer),
                    (None, Some(offer)) => SignalPayload::Offer(offer),
                    (None, None) => return Effect::Ignored,
                };
                Effect::Signal(VoiceSignal { from, payload })
            }
            RoomEvent::Unknown => Effect::Ignored,
        }
    }

    fn clear_speaking(&mut self) {
        for user in &mut self.voice {
            user.is_speaking = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Bidirectional room push channel.
pub trait SessionChannel: Send {
    fn send(&mut self, frame: &Outgoing) -> impl Future<Output = Result<()>> + Send;
    /// Next text frame; `None` once the peer closed the channel.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String>>> + Send;
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens room channels.
pub trait ChannelConnector: Send + Sync {
    type Channel: SessionChannel + 'static;

    fn open(&self, title: &str, key: Option<&str>) -> impl Future<Output = Result<Self::Channel>> + Send;
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SessionChannel for WsChannel {
    async fn send(&mut self, frame: &Outgoing) -> Result<()> {
        let text = serde_json::to_string(frame).map_err(|e| SyncError::Channel(e.to_string()))?;
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    config: ClientConfig,
}

impl WsConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl ChannelConnector for WsConnector {
    type Channel = WsChannel;

    async fn open(&self, title: &str, key: Option<&str>) -> Result<WsChannel> {
        let mut url = self.config.room_channel(title);
        if let Some(key) = key {
            url.push_str("?key=");
            url.push_str(&urlencoding::encode(key));
        }
        let (stream, _resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Channel(format!("room «{title}»: {e}")))?;
        Ok(WsChannel { stream })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct RoomSession<A, C> {
    api: Arc<A>,
    channel: C,
    view: SessionView,
}

impl<A: SessionApi, C: SessionChannel> RoomSession<A, C> {
    /// Wrap an already opened channel.
    pub fn new(api: Arc<A>, channel: C, title: impl Into<String>, me: UserRef) -> Self {
        let mut view = SessionView::new(me, title);
        view.advance(SessionState::AwaitingSnapshot);
        Self { api, channel, view }
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub fn title(&self) -> &str {
        self.view.title()
    }

    pub fn state(&self) -> &SessionState {
        self.view.state()
    }

    /// Fetch room and message log. This is the authorization gate: failure
    /// closes the session.
    pub async fn load_snapshot(&mut self) -> Result<()> {
        let title = self.view.title().to_string();
        let fetched = tokio::try_join!(self.api.get_room(&title), self.api.list_messages(&title));
        match fetched {
            Ok((room, messages)) => {
                self.view.replace_room(room);
                self.view.replace_messages(messages);
                self.view.advance(SessionState::Active);
                info!(room = %title, messages = self.view.messages().len(), "session active");
                Ok(())
            }
            Err(e) => {
                warn!(room = %title, error = %e, "snapshot failed");
                self.view.close(CloseReason::SnapshotFailed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait for the next frame and apply it, running any refetch it asks
    /// for. Returns `None` once the session is closed.
    pub async fn next_event(&mut self) -> Option<Effect> {
        if self.view.state().is_closed() {
            return None;
        }
        let frame = match self.channel.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Some(self.view.close(CloseReason::ChannelError(e.to_string()))),
            None => {
                return Some(self.view.close(CloseReason::ChannelError("channel closed".into())))
            }
        };
        let Some(event) = RoomEvent::parse(&frame) else {
            return Some(Effect::Ignored);
        };
        let disconnect = matches!(event, RoomEvent::RoomDisconnect { .. });
        let effect = self.view.apply(event);

        if let Effect::Refetch { room, messages, .. } = effect {
            self.refetch(room, messages).await;
            if disconnect && self.view.room().is_some_and(|r| !r.has_participant(self.view.me().id)) {
                // presence was dropped elsewhere, e.g. another tab left
                return Some(self.view.close(CloseReason::Left));
            }
        }
        Some(effect)
    }

    /// Drain events until the session closes. `on_effect` sees every effect
    /// together with the view it produced.
    pub async fn run_until_closed(&mut self, mut on_effect: impl FnMut(&Effect, &SessionView)) -> CloseReason {
        while let Some(effect) = self.next_event().await {
            on_effect(&effect, &self.view);
        }
        self.view
            .state()
            .close_reason()
            .cloned()
            .unwrap_or(CloseReason::Left)
    }

    async fn refetch(&mut self, room: bool, messages: bool) {
        let title = self.view.title().to_string();
        if room {
            match self.api.get_room(&title).await {
                Ok(fresh) => self.view.replace_room(fresh),
                Err(e) => warn!(room = %title, error = %e, "room refetch failed"),
            }
        }
        if messages {
            match self.api.list_messages(&title).await {
                Ok(fresh) => self.view.replace_messages(fresh),
                Err(e) => warn!(room = %title, error = %e, "message refetch failed"),
            }
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.view.state() {
            SessionState::Active => Ok(()),
            other => Err(SyncError::Channel(format!("session is not active ({other:?})"))),
        }
    }

    pub async fn send_message(&self, form: &MessageForm) -> Result<Message> {
        self.ensure_active()?;
        form.validate()?;
        self.api.send_message(self.view.title(), form).await
    }

    /// `Ok(None)` when the trimmed text is unchanged; nothing is sent then.
    pub async fn edit_message(&self, id: u64, text: &str) -> Result<Option<Message>> {
        self.ensure_active()?;
        let current = self
            .view
            .messages()
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| SyncError::not_found(format!("message {id}")))?;
        if current.text.trim() == text.trim() {
            return Ok(None);
        }
        MessageForm::new(text).validate()?;
        self.api.edit_message(self.view.title(), id, text).await.map(Some)
    }

    pub async fn delete_message(&self, id: u64) -> Result<()> {
        self.ensure_active()?;
        self.api.delete_message(self.view.title(), id).await
    }

    pub async fn join_voice(&mut self) -> Result<()> {
        self.ensure_active()?;
        let user = VoiceUser::from_user(self.view.me());
        self.channel.send(&Outgoing::VoiceChatConnect { user }).await
    }

    pub async fn toggle_mic(&mut self, is_muted: bool) -> Result<()> {
        self.ensure_active()?;
        let user = self.view.me().id;
        self.channel.send(&Outgoing::VoiceChatToggleMic { user, is_muted }).await
    }

    pub async fn set_speaking(&mut self, is_speaking: bool) -> Result<()> {
        self.ensure_active()?;
        let user = self.view.me().id;
        self.channel.send(&Outgoing::VoiceChatToggleSpeaking { user, is_speaking }).await
    }

    pub async fn send_signal(&mut self, to: u64, payload: SignalPayload) -> Result<()> {
        self.ensure_active()?;
        let from = self.view.me().id;
        let (offer, answer) = match payload {
            SignalPayload::Offer(v) => (Some(v), None),
            SignalPayload::Answer(v) => (None, Some(v)),
        };
        self.channel.send(&Outgoing::VoiceChatSignal { from, to, offer, answer }).await
    }

    pub async fn leave_voice(&mut self) -> Result<()> {
        self.ensure_active()?;
        let user = self.view.me().id;
        self.channel.send(&Outgoing::VoiceChatDisconnect { user }).await
    }

    /// Host only.
    pub async fn kick(&mut self, user: u64) -> Result<()> {
        self.ensure_active()?;
        if !self.view.is_host() {
            return Err(SyncError::rejected("Only the host can kick participants."));
        }
        if user == self.view.me().id {
            return Err(SyncError::rejected("The host cannot kick themselves."));
        }
        self.channel.send(&Outgoing::UserKick { user }).await
    }

    /// Close the channel and mark the session closed with `reason`.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.view.in_voice() && self.view.state().is_active() {
            let user = self.view.me().id;
            if let Err(e) = self.channel.send(&Outgoing::VoiceChatDisconnect { user }).await {
                debug!(room = %self.view.title(), error = %e, "voice leave on close failed");
            }
        }
        self.view.close(reason);
        if let Err(e) = self.channel.close().await {
            debug!(room = %self.view.title(), error = %e, "channel close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{message, room, user};
    use crate::model::ReplyPreview;
    use serde_json::json;

    fn active_view() -> SessionView {
        let me = user(2, "bob");
        let mut r = room(1, "lobby", user(1, "admin"));
        r.participants = vec![user(1, "admin"), me.clone()];
        let mut view = SessionView::new(me, "lobby");
        view.replace_room(r);
        view.replace_messages(vec![message(1, user(1, "admin"), "hello"), message(2, user(2, "bob"), "hi")]);
        view.advance(SessionState::AwaitingSnapshot);
        view.advance(SessionState::Active);
        view
    }

    fn event(v: serde_json::Value) -> RoomEvent {
        serde_json::from_value(v).unwrap()
    }

    fn voice(id: u64, name: &str, speaking: bool) -> serde_json::Value {
        json!({"id": id, "username": name, "is_muted": false, "is_speaking": speaking})
    }

    fn msg_json(id: u64, text: &str) -> serde_json::Value {
        serde_json::to_value(message(id, user(1, "admin"), text)).unwrap()
    }

    #[test]
    fn state_only_moves_forward() {
        let mut view = SessionView::new(user(1, "a"), "lobby");
        assert!(view.advance(SessionState::Active));
        assert!(!view.advance(SessionState::AwaitingSnapshot));
        assert!(view.advance(SessionState::Closed(CloseReason::Left)));
        assert!(!view.advance(SessionState::Closed(CloseReason::Kicked)));
        assert_eq!(view.state().close_reason(), Some(&CloseReason::Left));
    }

    #[test]
    fn unknown_and_malformed_frames() {
        assert_eq!(RoomEvent::parse(r#"{"type":"brand_new"}"#), Some(RoomEvent::Unknown));
        assert_eq!(RoomEvent::parse("garbage"), None);
        let mut view = active_view();
        assert_eq!(view.apply(RoomEvent::Unknown), Effect::Ignored);
    }

    #[test]
    fn message_send_appends_once() {
        let mut view = active_view();
        let e = event(json!({"type": "message_send", "message": msg_json(3, "new")}));
        assert_eq!(view.apply(e.clone()), Effect::Updated);
        assert_eq!(view.apply(e), Effect::Ignored);
        assert_eq!(view.messages().len(), 3);
    }

    #[test]
    fn message_edited_alias_for_unknown_id_is_noop() {
        let mut view = active_view();
        let before = view.messages().to_vec();
        let e = event(json!({"type": "message_edited", "id": 99, "message": msg_json(99, "x")}));
        assert_eq!(view.apply(e), Effect::Ignored);
        assert_eq!(view.messages(), &before[..]);
    }

    #[test]
    fn message_edit_replaces_in_place() {
        let mut view = active_view();
        let e = event(json!({"type": "message_edit", "id": 1, "message": msg_json(1, "edited")}));
        assert_eq!(view.apply(e), Effect::Updated);
        assert_eq!(view.messages()[0].text, "edited");
        assert_eq!(view.messages().len(), 2);
    }

    #[test]
    fn message_edit_quoted_asks_for_refetch() {
        let mut view = active_view();
        let mut reply = message(3, user(2, "bob"), "re");
        reply.reply_to = Some(ReplyPreview { id: 1, short_message: "hello".into() });
        let mut log = view.messages().to_vec();
        log.push(reply);
        view.replace_messages(log);
        let e = event(json!({"type": "message_edit", "id": 1, "message": msg_json(1, "edited")}));
        assert_eq!(view.apply(e), Effect::Refetch { room: false, messages: true, profile: false });
    }

    #[test]
    fn message_delete_removes_replies() {
        let mut view = active_view();
        let mut reply = message(3, user(2, "bob"), "re");
        reply.reply_to = Some(ReplyPreview { id: 1, short_message: "hello".into() });
        let mut log = view.messages().to_vec();
        log.push(reply);
        view.replace_messages(log);
        assert_eq!(view.apply(event(json!({"type": "message_delete", "id": 1}))), Effect::Updated);
        let ids: Vec<u64> = view.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(view.apply(event(json!({"type": "message_delete", "id": 1}))), Effect::Ignored);
    }

    #[test]
    fn room_connect_clears_speaking_unless_in_voice() {
        let mut view = active_view();
        let e = event(json!({"type": "room_connect", "voice_chat_users": [voice(1, "admin", true)]}));
        assert_eq!(view.apply(e), Effect::Refetch { room: true, messages: true, profile: false });
        assert!(!view.voice_roster()[0].is_speaking);

        let e = event(json!({"type": "room_connect",
            "voice_chat_users": [voice(1, "admin", true), voice(2, "bob", false)]}));
        view.apply(e.clone());
        view.apply(e);
        assert!(view.voice_roster()[0].is_speaking);
    }

    #[test]
    fn room_update_retitle_closes() {
        let mut view = active_view();
        let e = event(json!({"type": "room_update", "room": "renamed"}));
        assert_eq!(view.apply(e), Effect::Close(CloseReason::Retitled("renamed".into())));
        assert!(view.state().is_closed());
    }

    #[test]
    fn room_update_about_me_reloads_profile() {
        let mut view = active_view();
        let e = event(json!({"type": "room_update", "room": "lobby", "user": 2}));
        assert_eq!(view.apply(e), Effect::Refetch { room: true, messages: true, profile: true });
        let e = event(json!({"type": "room_update", "room": "lobby"}));
        assert_eq!(view.apply(e), Effect::Refetch { room: true, messages: true, profile: false });
    }

    #[test]
    fn kick_ban_delete_close() {
        let mut view = active_view();
        assert_eq!(view.apply(event(json!({"type": "user_kick", "user": 1}))), Effect::Ignored);
        assert_eq!(
            view.apply(event(json!({"type": "user_kick", "user": 2}))),
            Effect::Close(CloseReason::Kicked)
        );
        assert_eq!(view.apply(event(json!({"type": "room_delete"}))), Effect::Ignored);

        let mut view = active_view();
        assert_eq!(view.apply(event(json!({"type": "ban"}))), Effect::ReloadAuth);
        assert_eq!(view.state().close_reason(), Some(&CloseReason::Banned));

        let mut view = active_view();
        assert_eq!(
            view.apply(event(json!({"type": "room_delete", "room": "lobby"}))),
            Effect::Close(CloseReason::RoomDeleted)
        );
    }

    #[test]
    fn speaking_toggle_needs_us_in_voice() {
        let mut view = active_view();
        view.apply(event(json!({"type": "voice_chat_connect", "voice_chat_users": [voice(1, "admin", false)]})));
        let toggle = event(json!({"type": "voice_chat_toggle_speaking", "user": 1, "is_speaking": true}));
        assert_eq!(view.apply(toggle.clone()), Effect::Ignored);

        view.apply(event(json!({"type": "voice_chat_connect",
            "voice_chat_users": [voice(1, "admin", false), voice(2, "bob", false)]})));
        assert_eq!(view.apply(toggle), Effect::Updated);
        assert!(view.voice_roster()[0].is_speaking);

        let mute = event(json!({"type": "voice_chat_toggle_mic", "user": 1, "is_muted": true}));
        assert_eq!(view.apply(mute), Effect::Updated);
        assert!(view.voice_roster()[0].is_muted);
    }

    #[test]
    fn own_voice_disconnect_clears_speaking() {
        let mut view = active_view();
        let e = event(json!({"type": "voice_chat_disconnect", "user": 2,
            "voice_chat_users": [voice(1, "admin", true)]}));
        view.apply(e);
        assert_eq!(view.voice_roster().len(), 1);
        assert!(!view.voice_roster()[0].is_speaking);
    }

    #[test]
    fn signals_addressed_to_us_surface() {
        let mut view = active_view();
        let other = event(json!({"type": "voice_chat_signal", "from": 1, "to": 3, "offer": {"sdp": "x"}}));
        assert_eq!(view.apply(other), Effect::Ignored);
        let offer = event(json!({"type": "voice_chat_signal", "from": 1, "to": 2, "offer": {"sdp": "x"}}));
        assert_eq!(
            view.apply(offer),
            Effect::Signal(VoiceSignal { from: 1, payload: SignalPayload::Offer(json!({"sdp": "x"})) })
        );
    }

    #[test]
    fn closed_view_ignores_everything() {
        let mut view = active_view();
        view.apply(event(json!({"type": "room_delete"})));
        let e = event(json!({"type": "message_send", "message": msg_json(5, "late")}));
        assert_eq!(view.apply(e), Effect::Ignored);
    }

    #[test]
    fn outgoing_frames_use_backend_names() {
        let frame = serde_json::to_value(Outgoing::VoiceChatToggleMic { user: 2, is_muted: false }).unwrap();
        assert_eq!(frame, json!({"type": "voice_chat_toggle_mic", "user": 2, "is_muted": false}));
        let frame = serde_json::to_value(Outgoing::VoiceChatSignal {
            from: 1,
            to: 2,
            offer: None,
            answer: Some(json!("a")),
        })
        .unwrap();
        assert_eq!(frame, json!({"type": "voice_chat_signal", "from": 1, "to": 2, "answer": "a"}));
    }
}
