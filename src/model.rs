//! Wire types shared by the REST snapshot, the session channel and the views.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Smallest and largest room capacity the backend accepts.
pub const MIN_PARTICIPANTS: u8 = 2;
pub const MAX_PARTICIPANTS: u8 = 10;

pub const MAX_TITLE_CHARS: usize = 64;
/// Plaintext key length limit on the room form.
pub const MAX_KEY_CHARS: usize = 16;
pub const MAX_MESSAGE_CHARS: usize = 512;

/// A user as embedded in rooms, messages and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: u64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Entry of the fixed topic vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: u64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Language {
    #[default]
    International,
    English,
    Ukrainian,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::International, Language::English, Language::Ukrainian];

    pub fn code(self) -> u8 {
        match self {
            Language::International => 0,
            Language::English => 1,
            Language::Ukrainian => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.code() == code)
    }

    /// Display name, which is also what the `language` list filter expects.
    pub fn label(self) -> &'static str {
        match self {
            Language::International => "International",
            Language::English => "English",
            Language::Ukrainian => "Ukrainian",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.label().eq_ignore_ascii_case(label))
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for Language {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Language {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let code = u8::deserialize(d)?;
        Language::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown language code {code}")))
    }
}

/// A tag, owned by exactly one room. Names are unique per room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    pub room: u64,
    pub name: String,
}

/// Body of a tag-create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTag {
    pub room: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: u64,
    pub title: String,
    pub host: UserRef,
    pub topic: Topic,
    #[serde(default)]
    pub language: Language,
    /// Capacity, 2..=10.
    pub number_of_participants: u8,
    #[serde(default)]
    pub participants: Vec<UserRef>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// SHA-256 hex digest of the room key, or empty for a public room.
    #[serde(default)]
    pub key: String,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_open(&self) -> bool {
        self.key.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= usize::from(self.number_of_participants)
    }

    pub fn tag_names(&self) -> BTreeSet<String> {
        self.tags.iter().map(|t| t.name.clone()).collect()
    }

    pub fn has_participant(&self, user_id: u64) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

/// One page of the room list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoomPage {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub results: Vec<Room>,
}

impl RoomPage {
    pub fn page_count(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        self.count.div_ceil(page_size)
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Room-create form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomForm {
    pub title: String,
    /// Topic id.
    pub topic: u64,
    pub language: Language,
    pub number_of_participants: u8,
    /// Plaintext key; the backend stores only its digest.
    #[serde(default)]
    pub key: String,
    #[serde(skip)]
    pub tags: Vec<String>,
}

impl RoomForm {
    pub const FIELDS: &'static [&'static str] =
        &["title", "topic", "language", "number_of_participants", "key", "tags"];

    pub fn validate(&self) -> Result<()> {
        validate_title(&self.title)?;
        validate_capacity(self.number_of_participants)?;
        validate_key(&self.key)?;
        crate::tags::validate_tags(&self.tags)
    }
}

/// Partial room update; only present fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_participants: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Desired tag names; `None` leaves the tags alone.
    #[serde(skip)]
    pub tags: Option<Vec<String>>,
}

impl RoomPatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(n) = self.number_of_participants {
            validate_capacity(n)?;
        }
        if let Some(key) = &self.key {
            validate_key(key)?;
        }
        if let Some(tags) = &self.tags {
            crate::tags::validate_tags(tags)?;
        }
        Ok(())
    }

    /// True when nothing at all would change.
    pub fn is_empty(&self) -> bool {
        self.is_tags_only() && self.tags.is_none()
    }

    /// True when nothing but tags would change.
    pub fn is_tags_only(&self) -> bool {
        self.title.is_none()
            && self.topic.is_none()
            && self.language.is_none()
            && self.number_of_participants.is_none()
            && self.key.is_none()
    }
}

fn validate_title(title: &str) -> Result<()> {
    let len = title.trim().chars().count();
    if len == 0 {
        return Err(SyncError::field("title", "This field may not be blank."));
    }
    if len > MAX_TITLE_CHARS {
        return Err(SyncError::field(
            "title",
            format!("Ensure this field has no more than {MAX_TITLE_CHARS} characters."),
        ));
    }
    Ok(())
}

fn validate_capacity(n: u8) -> Result<()> {
    if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&n) {
        return Err(SyncError::field(
            "number_of_participants",
            format!("Capacity must be between {MIN_PARTICIPANTS} and {MAX_PARTICIPANTS}."),
        ));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.chars().count() > MAX_KEY_CHARS {
        return Err(SyncError::field(
            "key",
            format!("Ensure this field has no more than {MAX_KEY_CHARS} characters."),
        ));
    }
    Ok(())
}

/// Denormalized preview of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: u64,
    #[serde(default)]
    pub short_message: String,
}

pub const SHORT_MESSAGE_CHARS: usize = 32;

impl ReplyPreview {
    /// Preview of `message` as the backend renders it: at most 32
    /// characters, the last one an ellipsis when truncated.
    pub fn of(message: &Message) -> Self {
        let text = &message.text;
        let short_message = if text.chars().count() > SHORT_MESSAGE_CHARS {
            let mut s: String = text.chars().take(SHORT_MESSAGE_CHARS - 1).collect();
            s.push('…');
            s
        } else {
            text.clone()
        };
        Self { id: message.id, short_message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub author: UserRef,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_edited(&self) -> bool {
        self.updated_at.is_some()
    }

    pub fn replies_to(&self, id: u64) -> bool {
        self.reply_to.as_ref().is_some_and(|r| r.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageForm {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
}

impl MessageForm {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), reply_to: None }
    }

    pub fn replying_to(mut self, id: u64) -> Self {
        self.reply_to = Some(id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(SyncError::field("text", "This field may not be blank."));
        }
        if self.text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(SyncError::field(
                "text",
                format!("Ensure this field has no more than {MAX_MESSAGE_CHARS} characters."),
            ));
        }
        Ok(())
    }
}

/// Voice roster entry. Independent of text-chat presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceUser {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_muted")]
    pub is_muted: bool,
    #[serde(default)]
    pub is_speaking: bool,
}

fn default_muted() -> bool {
    true
}

impl VoiceUser {
    pub fn from_user(user: &UserRef) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            image: user.image.clone(),
            is_muted: true,
            is_speaking: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Mention,
    /// A report the user filed was reviewed.
    ReportResolved,
    /// The user received a warning after being reported.
    ReportReceived,
    MessageReply,
    /// Promotion to / demotion from moderator.
    StatusChange,
}

impl NotificationKind {
    pub fn code(self) -> u8 {
        match self {
            NotificationKind::Mention => 0,
            NotificationKind::ReportResolved => 1,
            NotificationKind::ReportReceived => 2,
            NotificationKind::MessageReply => 3,
            NotificationKind::StatusChange => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(NotificationKind::Mention),
            1 => Some(NotificationKind::ReportResolved),
            2 => Some(NotificationKind::ReportReceived),
            3 => Some(NotificationKind::MessageReply),
            4 => Some(NotificationKind::StatusChange),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationKind::Mention => "mention",
            NotificationKind::ReportResolved => "report resolved",
            NotificationKind::ReportReceived => "warning",
            NotificationKind::MessageReply => "reply",
            NotificationKind::StatusChange => "status change",
        };
        write!(f, "{s}")
    }
}

impl Serialize for NotificationKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for NotificationKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let code = u8::deserialize(d)?;
        NotificationKind::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown notification type {code}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub notification_type: NotificationKind,
    /// Type-specific payload; `null` when the referenced objects are gone.
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub is_viewed: bool,
    pub created_at: DateTime<Utc>,
}

/// Opaque choice sets from `OPTIONS /api/rooms/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Choices(pub serde_json::Value);

impl Choices {
    /// `(value, display_name)` pairs of the `language` field, if the schema
    /// carries them.
    pub fn language_choices(&self) -> Vec<(serde_json::Value, String)> {
        self.0
            .pointer("/actions/POST/language/choices")
            .and_then(|c| c.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get("display_name")?.as_str()?.to_string();
                        Some((item.get("value")?.clone(), name))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn user(id: u64, name: &str) -> UserRef {
        UserRef { id, username: name.to_string(), image: None }
    }

    pub fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    pub fn room(id: u64, title: &str, host: UserRef) -> Room {
        Room {
            id,
            title: title.to_string(),
            host,
            topic: Topic { id: 1, title: "Chatting".into(), description: None },
            language: Language::English,
            number_of_participants: 4,
            participants: Vec::new(),
            tags: Vec::new(),
            key: String::new(),
            created_at: ts(0),
        }
    }

    pub fn message(id: u64, author: UserRef, text: &str) -> Message {
        Message {
            id,
            author,
            text: text.to_string(),
            reply_to: None,
            created_at: ts(id as i64),
            updated_at: None,
        }
    }
}
