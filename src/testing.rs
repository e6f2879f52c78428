//! In-memory stand-ins for the backend and the room channel.
//!
//! [`FakeBackend`] implements every REST trait against plain collections,
//! records each call it receives and can be told to delay or fail specific
//! requests. [`FakeConnector`] hands out [`FakeChannel`]s whose far end is a
//! [`ChannelHandle`] the test drives.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::access::{compute_digest, verify, KEY_MISMATCH};
use crate::api::{ConnectApi, MessageApi, NotificationApi, Ordering, RoomApi, RoomQuery, TagApi};
use crate::error::{Result, SyncError};
use crate::model::{
    Choices, Language, Message, MessageForm, NewTag, Notification, NotificationKind, ReplyPreview,
    Room, RoomForm, RoomPage, RoomPatch, Tag, Topic, UserRef,
};
use crate::session::{ChannelConnector, Outgoing, SessionChannel};
use crate::tags::MAX_TAGS_PER_ROOM;

pub const FAKE_PAGE_SIZE: usize = 5;

/// One request as the fake backend saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListRooms(RoomQuery),
    GetRoom(String),
    CreateRoom(String),
    UpdateRoom(String),
    DeleteRoom(String),
    RoomOptions,
    ListTopics,
    ListTags { room: Option<u64>, unique: bool },
    CreateTag { room: u64, name: String },
    DeleteTag(u64),
    Connect { title: String, key: Option<String> },
    Disconnect(String),
    ListMessages(String),
    SendMessage(String),
    EditMessage(String, u64),
    DeleteMessage(String, u64),
    ListNotifications,
    SetViewed(u64, bool),
}

#[derive(Debug)]
struct FakeState {
    user: UserRef,
    next_id: u64,
    clock: i64,
    topics: Vec<Topic>,
    rooms: Vec<Room>,
    tags: Vec<Tag>,
    messages: Vec<(u64, Message)>,
    notifications: Vec<Notification>,
    search_delays: HashMap<String, Duration>,
    failing_tags: HashSet<String>,
    failing_viewed: HashSet<u64>,
    tag_listing_down: bool,
    notification_delay: Option<Duration>,
}

impl FakeState {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn now(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        DateTime::<Utc>::from_timestamp(1_700_000_000 + self.clock, 0).unwrap_or_default()
    }

    fn room_index(&self, title: &str) -> Result<usize> {
        self.rooms
            .iter()
            .position(|r| r.title == title)
            .ok_or_else(|| SyncError::not_found(format!("room «{title}»")))
    }

    /// Room with its tags attached, as the backend serializes it.
    fn render(&self, room: &Room) -> Room {
        let mut out = room.clone();
        out.tags = self.tags.iter().filter(|t| t.room == room.id).cloned().collect();
        out
    }

    fn matches(&self, room: &Room, q: &RoomQuery) -> bool {
        if let Some(s) = q.search.as_ref().filter(|s| !s.is_empty()) {
            if !room.title.to_lowercase().contains(&s.to_lowercase()) {
                return false;
            }
        }
        if q.host.as_ref().is_some_and(|h| *h != room.host.username)
            || q.topic.as_ref().is_some_and(|t| *t != room.topic.title)
            || q.language.as_ref().is_some_and(|l| !l.eq_ignore_ascii_case(room.language.label()))
            || q.is_open.is_some_and(|open| open != room.is_open())
            || q.is_available.is_some_and(|avail| avail == room.is_full())
        {
            return false;
        }
        let names: BTreeSet<&str> = self
            .tags
            .iter()
            .filter(|t| t.room == room.id)
            .map(|t| t.name.as_str())
            .collect();
        q.tags.iter().all(|t| names.contains(t.as_str()))
    }
}

#[derive(Debug)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<Call>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeBackend {
    /// Backend whose requests are made by `user`.
    pub fn new(user: UserRef) -> Self {
        let state = FakeState {
            user,
            next_id: 100,
            clock: 0,
            topics: vec![Topic { id: 1, title: "Chatting".into(), description: None }],
            rooms: Vec::new(),
            tags: Vec::new(),
            messages: Vec::new(),
            notifications: Vec::new(),
            search_delays: HashMap::new(),
            failing_tags: HashSet::new(),
            failing_viewed: HashSet::new(),
            tag_listing_down: false,
            notification_delay: None,
        };
        Self { state: Mutex::new(state), calls: Mutex::new(Vec::new()) }
    }

    pub fn acting_as(&self, user: UserRef) {
        lock(&self.state).user = user;
    }

    pub fn add_topic(&self, title: &str) -> Topic {
        let mut st = lock(&self.state);
        let topic = Topic { id: st.id(), title: title.to_string(), description: None };
        st.topics.push(topic.clone());
        topic
    }

    /// Insert a room directly. `key` is the plaintext key, empty for open.
    pub fn seed_room(&self, title: &str, host: UserRef, capacity: u8, key: &str, tags: &[&str]) -> Room {
        let mut st = lock(&self.state);
        let id = st.id();
        let created_at = st.now();
        let room = Room {
            id,
            title: title.to_string(),
            host,
            topic: st.topics[0].clone(),
            language: Language::English,
            number_of_participants: capacity,
            participants: Vec::new(),
            tags: Vec::new(),
            key: if key.is_empty() { String::new() } else { compute_digest(key).into_string() },
            created_at,
        };
        st.rooms.push(room.clone());
        for name in tags {
            let tag = Tag { id: st.id(), room: id, name: name.to_string() };
            st.tags.push(tag);
        }
        st.render(&room)
    }

    pub fn add_participant(&self, title: &str, user: UserRef) {
        let mut st = lock(&self.state);
        if let Ok(i) = st.room_index(title) {
            if !st.rooms[i].has_participant(user.id) {
                st.rooms[i].participants.push(user);
            }
        }
    }

    pub fn remove_participant(&self, title: &str, user_id: u64) {
        let mut st = lock(&self.state);
        if let Ok(i) = st.room_index(title) {
            st.rooms[i].participants.retain(|p| p.id != user_id);
        }
    }

    pub fn seed_message(&self, title: &str, author: UserRef, text: &str, reply_to: Option<u64>) -> Message {
        let mut st = lock(&self.state);
        let room_id = st.room_index(title).map(|i| st.rooms[i].id).unwrap_or_default();
        let reply_to = reply_to.and_then(|id| {
            st.messages.iter().find(|(_, m)| m.id == id).map(|(_, m)| ReplyPreview::of(m))
        });
        let message = Message {
            id: st.id(),
            author,
            text: text.to_string(),
            reply_to,
            created_at: st.now(),
            updated_at: None,
        };
        st.messages.push((room_id, message.clone()));
        message
    }

    pub fn seed_notification(&self, kind: NotificationKind, is_viewed: bool) -> Notification {
        let mut st = lock(&self.state);
        let n = Notification {
            id: st.id(),
            notification_type: kind,
            content: Value::Null,
            is_viewed,
            created_at: st.now(),
        };
        st.notifications.push(n.clone());
        n
    }

    /// Hold list requests whose `search` equals `search` for `delay`.
    pub fn delay_search(&self, search: &str, delay: Duration) {
        lock(&self.state).search_delays.insert(search.to_string(), delay);
    }

    /// Make creating a tag called `name` fail.
    pub fn fail_tag(&self, name: &str) {
        lock(&self.state).failing_tags.insert(name.to_string());
    }

    pub fn fail_viewed(&self, id: u64) {
        lock(&self.state).failing_viewed.insert(id);
    }

    /// Make every tag listing fail with a transport error.
    pub fn fail_tag_listing(&self) {
        lock(&self.state).tag_listing_down = true;
    }

    /// The next notification listing snapshots the inbox at once but
    /// answers only after `delay`.
    pub fn delay_next_notifications(&self, delay: Duration) {
        lock(&self.state).notification_delay = Some(delay);
    }

    pub fn room(&self, title: &str) -> Option<Room> {
        let st = lock(&self.state);
        st.rooms.iter().find(|r| r.title == title).map(|r| st.render(r))
    }

    pub fn tag_names(&self, room: u64) -> BTreeSet<String> {
        lock(&self.state)
            .tags
            .iter()
            .filter(|t| t.room == room)
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.state).notifications.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }
}

impl RoomApi for FakeBackend {
    async fn list_rooms(&self, query: &RoomQuery) -> Result<RoomPage> {
        self.record(Call::ListRooms(query.clone()));
        let delay = query
            .search
            .as_ref()
            .and_then(|s| lock(&self.state).search_delays.get(s).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let st = lock(&self.state);
        let mut rooms: Vec<Room> = st
            .rooms
            .iter()
            .filter(|r| st.matches(r, query))
            .map(|r| st.render(r))
            .collect();
        match query.ordering.unwrap_or(Ordering::CreatedDesc) {
            Ordering::CreatedAsc => rooms.sort_by_key(|r| r.created_at),
            Ordering::CreatedDesc => rooms.sort_by_key(|r| std::cmp::Reverse(r.created_at)),
            Ordering::ParticipantsAsc => rooms.sort_by_key(|r| r.participants.len()),
            Ordering::ParticipantsDesc => rooms.sort_by_key(|r| std::cmp::Reverse(r.participants.len())),
        }

        let count = rooms.len();
        let page = query.page.unwrap_or(1).max(1) as usize;
        let pages = count.div_ceil(FAKE_PAGE_SIZE).max(1);
        if page > pages {
            return Err(SyncError::not_found("page"));
        }
        let results: Vec<Room> = rooms.into_iter().skip((page - 1) * FAKE_PAGE_SIZE).take(FAKE_PAGE_SIZE).collect();
        Ok(RoomPage {
            count,
            next: (page < pages).then(|| format!("?page={}", page + 1)),
            previous: (page > 1).then(|| format!("?page={}", page - 1)),
            results,
        })
    }

    async fn get_room(&self, title: &str) -> Result<Room> {
        self.record(Call::GetRoom(title.to_string()));
        let st = lock(&self.state);
        let i = st.room_index(title)?;
        Ok(st.render(&st.rooms[i]))
    }

    async fn create_room(&self, form: &RoomForm) -> Result<Room> {
        self.record(Call::CreateRoom(form.title.clone()));
        let mut st = lock(&self.state);
        if st.rooms.iter().any(|r| r.title == form.title) {
            return Err(SyncError::field("title", "Room with this title already exists."));
        }
        let topic = st
            .topics
            .iter()
            .find(|t| t.id == form.topic)
            .cloned()
            .ok_or_else(|| SyncError::field("topic", "Invalid pk - object does not exist."))?;
        let room = Room {
            id: st.id(),
            title: form.title.clone(),
            host: st.user.clone(),
            topic,
            language: form.language,
            number_of_participants: form.number_of_participants,
            participants: Vec::new(),
            tags: Vec::new(),
            key: if form.key.is_empty() { String::new() } else { compute_digest(&form.key).into_string() },
            created_at: st.now(),
        };
        st.rooms.push(room.clone());
        Ok(room)
    }

    async fn update_room(&self, title: &str, patch: &RoomPatch) -> Result<Room> {
        self.record(Call::UpdateRoom(title.to_string()));
        let mut st = lock(&self.state);
        let i = st.room_index(title)?;
        if st.rooms[i].host.id != st.user.id {
            return Err(SyncError::rejected("You do not have permission to perform this action."));
        }
        if let Some(new_title) = &patch.title {
            if new_title != title && st.rooms.iter().any(|r| &r.title == new_title) {
                return Err(SyncError::field("title", "Room with this title already exists."));
            }
        }
        let topic = match patch.topic {
            Some(id) => Some(
                st.topics
                    .iter()
                    .find(|t| t.id == id)
                    .cloned()
                    .ok_or_else(|| SyncError::field("topic", "Invalid pk - object does not exist."))?,
            ),
            None => None,
        };
        let room = &mut st.rooms[i];
        if let Some(t) = &patch.title {
            room.title = t.clone();
        }
        if let Some(t) = topic {
            room.topic = t;
        }
        if let Some(l) = patch.language {
            room.language = l;
        }
        if let Some(n) = patch.number_of_participants {
            room.number_of_participants = n;
        }
        if let Some(k) = &patch.key {
            room.key = if k.is_empty() { String::new() } else { compute_digest(k).into_string() };
        }
        let room = room.clone();
        Ok(st.render(&room))
    }

    async fn delete_room(&self, title: &str) -> Result<()> {
        self.record(Call::DeleteRoom(title.to_string()));
        let mut st = lock(&self.state);
        let i = st.room_index(title)?;
        if st.rooms[i].host.id != st.user.id {
            return Err(SyncError::rejected("You do not have permission to perform this action."));
        }
        let room = st.rooms.remove(i);
        st.tags.retain(|t| t.room != room.id);
        st.messages.retain(|(r, _)| *r != room.id);
        Ok(())
    }

    async fn room_options(&self) -> Result<Choices> {
        self.record(Call::RoomOptions);
        let choices: Vec<Value> = Language::ALL
            .iter()
            .map(|l| json!({"value": l.code(), "display_name": l.label()}))
            .collect();
        Ok(Choices(json!({"actions": {"POST": {"language": {"choices": choices}}}})))
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        self.record(Call::ListTopics);
        Ok(lock(&self.state).topics.clone())
    }
}

impl TagApi for FakeBackend {
    async fn list_tags(&self, room: Option<u64>, unique: bool) -> Result<Vec<Tag>> {
        self.record(Call::ListTags { room, unique });
        let st = lock(&self.state);
        if st.tag_listing_down {
            return Err(SyncError::Transport { url: "/api/tags/".into(), detail: "connection reset".into() });
        }
        let mut seen = HashSet::new();
        Ok(st
            .tags
            .iter()
            .filter(|t| room.map_or(true, |r| t.room == r))
            .filter(|t| !unique || seen.insert(t.name.clone()))
            .cloned()
            .collect())
    }

    async fn create_tag(&self, tag: &NewTag) -> Result<Tag> {
        self.record(Call::CreateTag { room: tag.room, name: tag.name.clone() });
        let mut st = lock(&self.state);
        if st.failing_tags.contains(&tag.name) {
            return Err(SyncError::Transport { url: "/api/tags/".into(), detail: "HTTP 500".into() });
        }
        if !st.rooms.iter().any(|r| r.id == tag.room) {
            return Err(SyncError::field("room", "Invalid pk - object does not exist."));
        }
        let existing: Vec<&Tag> = st.tags.iter().filter(|t| t.room == tag.room).collect();
        if existing.iter().any(|t| t.name == tag.name) {
            return Err(SyncError::rejected("The fields room, name must make a unique set."));
        }
        if existing.len() >= MAX_TAGS_PER_ROOM {
            return Err(SyncError::rejected("Room cannot have more than 5 tags."));
        }
        let created = Tag { id: st.id(), room: tag.room, name: tag.name.clone() };
        st.tags.push(created.clone());
        Ok(created)
    }

    async fn delete_tag(&self, id: u64) -> Result<()> {
        self.record(Call::DeleteTag(id));
        let mut st = lock(&self.state);
        let before = st.tags.len();
        st.tags.retain(|t| t.id != id);
        if st.tags.len() == before {
            return Err(SyncError::not_found(format!("tag {id}")));
        }
        Ok(())
    }
}

impl ConnectApi for FakeBackend {
    async fn connect(&self, title: &str, key: Option<&str>) -> Result<()> {
        self.record(Call::Connect { title: title.to_string(), key: key.map(str::to_string) });
        let mut st = lock(&self.state);
        let i = st.room_index(title)?;
        let user = st.user.clone();
        if st.rooms[i].has_participant(user.id) {
            return Ok(());
        }
        if st.rooms.iter().any(|r| r.has_participant(user.id)) {
            return Err(SyncError::rejected("You are already in another room."));
        }
        let room = &mut st.rooms[i];
        if !room.is_open() && room.host.id != user.id && !key.is_some_and(|k| verify(k, &room.key)) {
            return Err(SyncError::rejected(KEY_MISMATCH));
        }
        if room.is_full() {
            return Err(SyncError::rejected("Room is full."));
        }
        room.participants.push(user);
        Ok(())
    }

    async fn disconnect(&self, title: &str) -> Result<()> {
        self.record(Call::Disconnect(title.to_string()));
        let mut st = lock(&self.state);
        let i = st.room_index(title)?;
        let user_id = st.user.id;
        let room = &mut st.rooms[i];
        if !room.has_participant(user_id) {
            return Err(SyncError::rejected("You are not in this room."));
        }
        room.participants.retain(|p| p.id != user_id);
        Ok(())
    }
}

impl MessageApi for FakeBackend {
    async fn list_messages(&self, title: &str) -> Result<Vec<Message>> {
        self.record(Call::ListMessages(title.to_string()));
        let st = lock(&self.state);
        let room_id = st.rooms[st.room_index(title)?].id;
        Ok(st.messages.iter().filter(|(r, _)| *r == room_id).map(|(_, m)| m.clone()).collect())
    }

    async fn send_message(&self, title: &str, form: &MessageForm) -> Result<Message> {
        self.record(Call::SendMessage(title.to_string()));
        form.validate()?;
        let mut st = lock(&self.state);
        let room_id = st.rooms[st.room_index(title)?].id;
        let reply_to = match form.reply_to {
            Some(id) => Some(
                st.messages
                    .iter()
                    .find(|(r, m)| *r == room_id && m.id == id)
                    .map(|(_, m)| ReplyPreview::of(m))
                    .ok_or_else(|| SyncError::field("reply_to", "Invalid pk - object does not exist."))?,
            ),
            None => None,
        };
        let message = Message {
            id: st.id(),
            author: st.user.clone(),
            text: form.text.clone(),
            reply_to,
            created_at: st.now(),
            updated_at: None,
        };
        st.messages.push((room_id, message.clone()));
        Ok(message)
    }

    async fn edit_message(&self, title: &str, id: u64, text: &str) -> Result<Message> {
        self.record(Call::EditMessage(title.to_string(), id));
        let mut st = lock(&self.state);
        let room_id = st.rooms[st.room_index(title)?].id;
        let user_id = st.user.id;
        let now = st.now();
        let (_, message) = st
            .messages
            .iter_mut()
            .find(|(r, m)| *r == room_id && m.id == id)
            .ok_or_else(|| SyncError::not_found(format!("message {id}")))?;
        if message.author.id != user_id {
            return Err(SyncError::rejected("You do not have permission to perform this action."));
        }
        message.text = text.to_string();
        message.updated_at = Some(now);
        Ok(message.clone())
    }

    async fn delete_message(&self, title: &str, id: u64) -> Result<()> {
        self.record(Call::DeleteMessage(title.to_string(), id));
        let mut st = lock(&self.state);
        let room_id = st.rooms[st.room_index(title)?].id;
        let user_id = st.user.id;
        let message = st
            .messages
            .iter()
            .find(|(r, m)| *r == room_id && m.id == id)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| SyncError::not_found(format!("message {id}")))?;
        if message.author.id != user_id {
            return Err(SyncError::rejected("You do not have permission to perform this action."));
        }
        st.messages.retain(|(_, m)| m.id != id && !m.replies_to(id));
        Ok(())
    }
}

impl NotificationApi for FakeBackend {
    async fn list_notifications(&self) -> Result<Vec<Notification>> {
        self.record(Call::ListNotifications);
        let (snapshot, delay) = {
            let mut st = lock(&self.state);
            (st.notifications.clone(), st.notification_delay.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn set_viewed(&self, id: u64, viewed: bool) -> Result<Notification> {
        self.record(Call::SetViewed(id, viewed));
        let mut st = lock(&self.state);
        if st.failing_viewed.contains(&id) {
            return Err(SyncError::Transport {
                url: format!("/api/notification/{id}/"),
                detail: "HTTP 502".into(),
            });
        }
        let n = st
            .notifications
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| SyncError::not_found(format!("notification {id}")))?;
        n.is_viewed = viewed;
        Ok(n.clone())
    }
}

// ---------------------------------------------------------------------------
// Room channel
// ---------------------------------------------------------------------------

type Inbound = Option<Result<String>>;

/// Client end of a fake room channel.
pub struct FakeChannel {
    incoming: mpsc::UnboundedReceiver<Inbound>,
    sent: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicBool>,
}

impl SessionChannel for FakeChannel {
    async fn send(&mut self, frame: &Outgoing) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(SyncError::Channel("channel closed".into()));
        }
        let value = serde_json::to_value(frame).map_err(|e| SyncError::Channel(e.to_string()))?;
        lock(&self.sent).push(value);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.incoming.recv().await.flatten()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
    }
}

/// Server end of a fake room channel.
#[derive(Clone)]
pub struct ChannelHandle {
    pub title: String,
    pub key: Option<String>,
    tx: mpsc::UnboundedSender<Inbound>,
    sent: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicBool>,
}

impl ChannelHandle {
    pub fn push(&self, event: Value) {
        let _ = self.tx.send(Some(Ok(event.to_string())));
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.tx.send(Some(Ok(frame.to_string())));
    }

    pub fn fail(&self, detail: &str) {
        let _ = self.tx.send(Some(Err(SyncError::Channel(detail.to_string()))));
    }

    pub fn hang_up(&self) {
        let _ = self.tx.send(None);
    }

    /// Frames the client sent, oldest first.
    pub fn sent(&self) -> Vec<Value> {
        lock(&self.sent).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }
}

/// Pair a channel with its handle, for driving a session directly.
pub fn channel_pair(title: &str, key: Option<&str>) -> (FakeChannel, ChannelHandle) {
    let (tx, incoming) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let channel = FakeChannel { incoming, sent: Arc::clone(&sent), closed: Arc::clone(&closed) };
    let handle = ChannelHandle {
        title: title.to_string(),
        key: key.map(str::to_string),
        tx,
        sent,
        closed,
    };
    (channel, handle)
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    opened: Arc<Mutex<Vec<ChannelHandle>>>,
    refuse: Arc<Mutex<Option<String>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `open` with a channel error.
    pub fn refuse_next(&self, detail: &str) {
        *lock(&self.refuse) = Some(detail.to_string());
    }

    pub fn opened(&self) -> Vec<ChannelHandle> {
        lock(&self.opened).clone()
    }

    pub fn last(&self) -> Option<ChannelHandle> {
        lock(&self.opened).last().cloned()
    }
}

impl ChannelConnector for FakeConnector {
    type Channel = FakeChannel;

    async fn open(&self, title: &str, key: Option<&str>) -> Result<FakeChannel> {
        if let Some(detail) = lock(&self.refuse).take() {
            return Err(SyncError::Channel(detail));
        }
        let (channel, handle) = channel_pair(title, key);
        lock(&self.opened).push(handle);
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::user;

    #[tokio::test]
    async fn connect_enforces_capacity_and_key() {
        let fake = FakeBackend::new(user(2, "bob"));
        fake.seed_room("vault", user(1, "admin"), 2, "secret", &[]);
        fake.add_participant("vault", user(3, "carol"));
        fake.add_participant("vault", user(4, "dave"));

        assert_eq!(fake.connect("vault", Some("nope")).await.unwrap_err().to_string(), KEY_MISMATCH);
        assert_eq!(fake.connect("vault", Some("secret")).await.unwrap_err().to_string(), "Room is full.");
        fake.remove_participant("vault", 4);
        fake.connect("vault", Some("secret")).await.unwrap();
        assert!(fake.room("vault").unwrap().has_participant(2));
        assert!(matches!(fake.connect("ghost", None).await, Err(SyncError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_rooms_paginates_newest_first() {
        let fake = FakeBackend::new(user(1, "admin"));
        for i in 0..7 {
            fake.seed_room(&format!("room{i}"), user(1, "admin"), 4, "", &[]);
        }
        let first = fake.list_rooms(&RoomQuery::default()).await.unwrap();
        assert_eq!(first.count, 7);
        assert_eq!(first.results.len(), 5);
        assert_eq!(first.results[0].title, "room6");
        let second = fake.list_rooms(&RoomQuery::default().page(2)).await.unwrap();
        assert_eq!(second.results.len(), 2);
        assert!(fake.list_rooms(&RoomQuery::default().page(3)).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_tag_is_rejected() {
        let fake = FakeBackend::new(user(1, "admin"));
        let room = fake.seed_room("lobby", user(1, "admin"), 4, "", &["a"]);
        let err = fake.create_tag(&NewTag { room: room.id, name: "a".into() }).await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected { .. }));
    }

    #[tokio::test]
    async fn channel_pair_records_and_closes() {
        let (mut channel, handle) = channel_pair("lobby", None);
        channel.send(&Outgoing::UserKick { user: 3 }).await.unwrap();
        handle.push(json!({"type": "room_delete"}));
        assert_eq!(channel.recv().await.unwrap().unwrap(), r#"{"type":"room_delete"}"#);
        handle.hang_up();
        assert!(channel.recv().await.is_none());
        assert_eq!(handle.sent(), vec![json!({"type": "user_kick", "user": 3})]);
        drop(channel);
        assert!(handle.is_closed());
    }
}
