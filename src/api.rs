//! REST boundary.
//!
//! One trait per backend collection. Components are generic over these so
//! tests can drive them against [`crate::testing::FakeBackend`]; the real
//! transport is [`crate::http::HttpApi`].

use std::future::Future;

use crate::error::Result;
use crate::model::{
    Choices, Message, MessageForm, NewTag, Notification, Room, RoomForm, RoomPage, RoomPatch, Tag,
    Topic,
};

/// Accepted values of the `ordering` list parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ordering {
    CreatedAsc,
    CreatedDesc,
    ParticipantsAsc,
    ParticipantsDesc,
}

impl Ordering {
    pub fn as_param(self) -> &'static str {
        match self {
            Ordering::CreatedAsc => "created_at",
            Ordering::CreatedDesc => "-created_at",
            Ordering::ParticipantsAsc => "count_of_participants",
            Ordering::ParticipantsDesc => "-count_of_participants",
        }
    }

    pub fn from_param(s: &str) -> Option<Self> {
        match s {
            "created_at" => Some(Ordering::CreatedAsc),
            "-created_at" => Some(Ordering::CreatedDesc),
            "count_of_participants" => Some(Ordering::ParticipantsAsc),
            "-count_of_participants" => Some(Ordering::ParticipantsDesc),
            _ => None,
        }
    }
}

/// Filters of the room list. Every field is optional; unset fields are not
/// sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomQuery {
    pub search: Option<String>,
    /// Username of the host (a user's "my rooms" page).
    pub host: Option<String>,
    /// Topic title.
    pub topic: Option<String>,
    /// Language display name.
    pub language: Option<String>,
    pub tags: Vec<String>,
    pub is_available: Option<bool>,
    pub is_open: Option<bool>,
    pub ordering: Option<Ordering>,
    pub page: Option<u32>,
}

impl RoomQuery {
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn topic(mut self, title: impl Into<String>) -> Self {
        self.topic = Some(title.into());
        self
    }

    pub fn tag(mut self, name: impl Into<String>) -> Self {
        self.tags.push(name.into());
        self
    }

    pub fn ordering(mut self, ordering: Ordering) -> Self {
        self.ordering = Some(ordering);
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(s) = self.search.as_ref().filter(|s| !s.is_empty()) {
            params.push(("search", s.clone()));
        }
        if let Some(h) = &self.host {
            params.push(("host", h.clone()));
        }
        if let Some(t) = &self.topic {
            params.push(("topic", t.clone()));
        }
        if let Some(l) = &self.language {
            params.push(("language", l.clone()));
        }
        if !self.tags.is_empty() {
            params.push(("tags", self.tags.join(",")));
        }
        if let Some(a) = self.is_available {
            params.push(("is_available", a.to_string()));
        }
        if let Some(o) = self.is_open {
            params.push(("is_open", o.to_string()));
        }
        if let Some(o) = self.ordering {
            params.push(("ordering", o.as_param().to_string()));
        }
        if let Some(p) = self.page {
            params.push(("page", p.to_string()));
        }
        params
    }
}

pub trait RoomApi: Send + Sync {
    fn list_rooms(&self, query: &RoomQuery) -> impl Future<Output = Result<RoomPage>> + Send;
    fn get_room(&self, title: &str) -> impl Future<Output = Result<Room>> + Send;
    fn create_room(&self, form: &RoomForm) -> impl Future<Output = Result<Room>> + Send;
    fn update_room(&self, title: &str, patch: &RoomPatch) -> impl Future<Output = Result<Room>> + Send;
    fn delete_room(&self, title: &str) -> impl Future<Output = Result<()>> + Send;
    /// `OPTIONS` on the room collection.
    fn room_options(&self) -> impl Future<Output = Result<Choices>> + Send;
    fn list_topics(&self) -> impl Future<Output = Result<Vec<Topic>>> + Send;
}

pub trait TagApi: Send + Sync {
    /// `room = None` lists every tag; `unique` collapses equal names.
    fn list_tags(&self, room: Option<u64>, unique: bool) -> impl Future<Output = Result<Vec<Tag>>> + Send;
    fn create_tag(&self, tag: &NewTag) -> impl Future<Output = Result<Tag>> + Send;
    fn delete_tag(&self, id: u64) -> impl Future<Output = Result<()>> + Send;
}

/// Stateful join / leave, addressed by room title.
pub trait ConnectApi: Send + Sync {
    fn connect(&self, title: &str, key: Option<&str>) -> impl Future<Output = Result<()>> + Send;
    fn disconnect(&self, title: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Chat actions. These travel over REST, never over the push channel.
pub trait MessageApi: Send + Sync {
    fn list_messages(&self, title: &str) -> impl Future<Output = Result<Vec<Message>>> + Send;
    fn send_message(&self, title: &str, form: &MessageForm) -> impl Future<Output = Result<Message>> + Send;
    fn edit_message(&self, title: &str, id: u64, text: &str) -> impl Future<Output = Result<Message>> + Send;
    fn delete_message(&self, title: &str, id: u64) -> impl Future<Output = Result<()>> + Send;
}

pub trait NotificationApi: Send + Sync {
    fn list_notifications(&self) -> impl Future<Output = Result<Vec<Notification>>> + Send;
    fn set_viewed(&self, id: u64, viewed: bool) -> impl Future<Output = Result<Notification>> + Send;
}

/// Everything a room session needs from the backend.
pub trait SessionApi: RoomApi + ConnectApi + MessageApi {}

impl<T: RoomApi + ConnectApi + MessageApi> SessionApi for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_query_has_no_params() {
        assert!(RoomQuery::default().to_params().is_empty());
    }

    #[test]
    fn empty_search_is_not_sent() {
        let q = RoomQuery::default().search("");
        assert!(q.to_params().is_empty());
    }

    #[test]
    fn query_params_in_backend_names() {
        let q = RoomQuery {
            search: Some("jazz".into()),
            topic: Some("Music".into()),
            language: Some("English".into()),
            tags: vec!["a".into(), "b".into()],
            is_available: Some(true),
            is_open: Some(false),
            ordering: Some(Ordering::ParticipantsDesc),
            page: Some(2),
            ..Default::default()
        };
        let params = q.to_params();
        assert!(params.contains(&("search", "jazz".to_string())));
        assert!(params.contains(&("topic", "Music".to_string())));
        assert!(params.contains(&("language", "English".to_string())));
        assert!(params.contains(&("tags", "a,b".to_string())));
        assert!(params.contains(&("is_available", "true".to_string())));
        assert!(params.contains(&("is_open", "false".to_string())));
        assert!(params.contains(&("ordering", "-count_of_participants".to_string())));
        assert!(params.contains(&("page", "2".to_string())));
    }

    #[rstest]
    #[case(Ordering::CreatedAsc, "created_at")]
    #[case(Ordering::CreatedDesc, "-created_at")]
    #[case(Ordering::ParticipantsAsc, "count_of_participants")]
    #[case(Ordering::ParticipantsDesc, "-count_of_participants")]
    fn ordering_param(#[case] ordering: Ordering, #[case] param: &str) {
        assert_eq!(ordering.as_param(), param);
        assert_eq!(Ordering::from_param(param), Some(ordering));
    }

    #[test]
    fn unknown_ordering_is_none() {
        assert_eq!(Ordering::from_param("title"), None);
    }
}
