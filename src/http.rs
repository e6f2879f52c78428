//! `reqwest` transport for the REST traits in [`crate::api`].

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{ConnectApi, MessageApi, NotificationApi, RoomApi, RoomQuery, TagApi};
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::model::{
    Choices, Message, MessageForm, NewTag, Notification, Room, RoomForm, RoomPage, RoomPatch, Tag,
    Topic,
};

const CSRF_HEADER: &str = "X-CSRFToken";

const MESSAGE_FIELDS: &[&str] = &["text", "reply_to"];
const TAG_FIELDS: &[&str] = &["name", "room"];

/// Collection endpoints answer either with a bare array or with a paginated
/// `{count, next, previous, results}` object depending on the view.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Page { results: Vec<T> },
    Plain(Vec<T>),
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Page { results } => results,
            Listing::Plain(items) => items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpApi {
    config: ClientConfig,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(config: ClientConfig) -> Self {
        // Client::builder only fails on broken TLS backends; fall back to the
        // default client rather than panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> (RequestBuilder, String) {
        let url = self.config.api_url(path);
        let unsafe_method = !matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);
        let mut req = self.client.request(method, &url);
        if let (true, Some(token)) = (unsafe_method, &self.config.csrf_token) {
            req = req.header(CSRF_HEADER, token);
        }
        (req, url)
    }

    /// Send and return the body of a 2xx response; anything else is mapped
    /// through [`SyncError::from_response`].
    async fn execute(
        &self,
        req: RequestBuilder,
        url: &str,
        what: &str,
        fields: &[&str],
    ) -> Result<String> {
        let resp = req.send().await.map_err(|e| SyncError::Transport {
            url: url.to_string(),
            detail: e.to_string(),
        })?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| SyncError::Transport {
            url: url.to_string(),
            detail: e.to_string(),
        })?;
        debug!(url, status = status.as_u16(), "response");
        if !status.is_success() {
            return Err(SyncError::from_response(status.as_u16(), &body, what, fields));
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let (req, url) = self.request(Method::GET, path);
        let body = self.execute(req, &url, what, &[]).await?;
        decode(&url, &body)
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        what: &str,
        fields: &[&str],
    ) -> Result<(String, String)> {
        let (req, url) = self.request(method, path);
        let body = self.execute(req.json(body), &url, what, fields).await?;
        Ok((url, body))
    }
}

fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| SyncError::Decode {
        url: url.to_string(),
        detail: e.to_string(),
    })
}

/// Accept both `T` and `{ "<key>": T, ... }`.
fn decode_wrapped<T: DeserializeOwned>(url: &str, body: &str, key: &str) -> Result<T> {
    if let Ok(value) = serde_json::from_str::<T>(body) {
        return Ok(value);
    }
    let mut outer: serde_json::Value = decode(url, body)?;
    let inner = outer.get_mut(key).map(serde_json::Value::take).ok_or_else(|| SyncError::Decode {
        url: url.to_string(),
        detail: format!("missing `{key}`"),
    })?;
    serde_json::from_value(inner).map_err(|e| SyncError::Decode {
        url: url.to_string(),
        detail: e.to_string(),
    })
}

fn room_path(title: &str) -> String {
    format!("room/{}/", urlencoding::encode(title))
}

fn room_what(title: &str) -> String {
    format!("room «{title}»")
}

impl RoomApi for HttpApi {
    async fn list_rooms(&self, query: &RoomQuery) -> Result<RoomPage> {
        let (req, url) = self.request(Method::GET, "rooms/");
        let body = self.execute(req.query(&query.to_params()), &url, "rooms", &[]).await?;
        // `no_pagination` views answer with a bare array
        if body.trim_start().starts_with('[') {
            let rooms: Vec<Room> = decode(&url, &body)?;
            return Ok(RoomPage { count: rooms.len(), next: None, previous: None, results: rooms });
        }
        decode(&url, &body)
    }

    async fn get_room(&self, title: &str) -> Result<Room> {
        self.get_json(&room_path(title), &room_what(title)).await
    }

    async fn create_room(&self, form: &RoomForm) -> Result<Room> {
        let (url, body) = self
            .send_json(Method::POST, "rooms/", form, "rooms", RoomForm::FIELDS)
            .await?;
        decode_wrapped(&url, &body, "room")
    }

    async fn update_room(&self, title: &str, patch: &RoomPatch) -> Result<Room> {
        let (url, body) = self
            .send_json(Method::PATCH, &room_path(title), patch, &room_what(title), RoomForm::FIELDS)
            .await?;
        decode_wrapped(&url, &body, "room")
    }

    async fn delete_room(&self, title: &str) -> Result<()> {
        let (req, url) = self.request(Method::DELETE, &room_path(title));
        self.execute(req, &url, &room_what(title), &[]).await?;
        Ok(())
    }

    async fn room_options(&self) -> Result<Choices> {
        let (req, url) = self.request(Method::OPTIONS, "rooms/");
        let body = self.execute(req, &url, "rooms", &[]).await?;
        decode(&url, &body)
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        let listing: Listing<Topic> = self.get_json("topics/", "topics").await?;
        Ok(listing.into_vec())
    }
}

impl TagApi for HttpApi {
    async fn list_tags(&self, room: Option<u64>, unique: bool) -> Result<Vec<Tag>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(id) = room {
            params.push(("room", id.to_string()));
        }
        if unique {
            params.push(("unique", "true".to_string()));
        }
        let (req, url) = self.request(Method::GET, "tags/");
        let body = self.execute(req.query(&params), &url, "tags", &[]).await?;
        let listing: Listing<Tag> = decode(&url, &body)?;
        Ok(listing.into_vec())
    }

    async fn create_tag(&self, tag: &NewTag) -> Result<Tag> {
        let what = format!("tag «{}»", tag.name);
        let (url, body) = self.send_json(Method::POST, "tags/", tag, &what, TAG_FIELDS).await?;
        decode(&url, &body)
    }

    async fn delete_tag(&self, id: u64) -> Result<()> {
        let (req, url) = self.request(Method::DELETE, &format!("tag/{id}/"));
        self.execute(req, &url, &format!("tag {id}"), &[]).await?;
        Ok(())
    }
}

impl ConnectApi for HttpApi {
    async fn connect(&self, title: &str, key: Option<&str>) -> Result<()> {
        let body = match key {
            Some(key) => serde_json::json!({ "key": key }),
            None => serde_json::json!({}),
        };
        let path = format!("connect/{}/", urlencoding::encode(title));
        self.send_json(Method::PATCH, &path, &body, &room_what(title), &["key"]).await?;
        Ok(())
    }

    async fn disconnect(&self, title: &str) -> Result<()> {
        let path = format!("disconnect/{}/", urlencoding::encode(title));
        self.send_json(Method::PATCH, &path, &serde_json::json!({}), &room_what(title), &[])
            .await?;
        Ok(())
    }
}

impl MessageApi for HttpApi {
    async fn list_messages(&self, title: &str) -> Result<Vec<Message>> {
        let path = format!("messages/{}/", urlencoding::encode(title));
        let listing: Listing<Message> = self.get_json(&path, &room_what(title)).await?;
        Ok(listing.into_vec())
    }

    async fn send_message(&self, title: &str, form: &MessageForm) -> Result<Message> {
        let path = format!("messages/{}/", urlencoding::encode(title));
        let (url, body) = self
            .send_json(Method::POST, &path, form, &room_what(title), MESSAGE_FIELDS)
            .await?;
        decode_wrapped(&url, &body, "message")
    }

    async fn edit_message(&self, title: &str, id: u64, text: &str) -> Result<Message> {
        let path = format!("message/{}/{id}/", urlencoding::encode(title));
        let body = serde_json::json!({ "text": text });
        let (url, body) = self
            .send_json(Method::PATCH, &path, &body, &format!("message {id}"), MESSAGE_FIELDS)
            .await?;
        decode_wrapped(&url, &body, "message")
    }

    async fn delete_message(&self, title: &str, id: u64) -> Result<()> {
        let path = format!("message/{}/{id}/", urlencoding::encode(title));
        let (req, url) = self.request(Method::DELETE, &path);
        self.execute(req, &url, &format!("message {id}"), &[]).await?;
        Ok(())
    }
}

impl NotificationApi for HttpApi {
    async fn list_notifications(&self) -> Result<Vec<Notification>> {
        let listing: Listing<Notification> =
            self.get_json("notifications/", "notifications").await?;
        Ok(listing.into_vec())
    }

    async fn set_viewed(&self, id: u64, viewed: bool) -> Result<Notification> {
        let body = serde_json::json!({ "is_viewed": viewed });
        let (url, body) = self
            .send_json(Method::PATCH, &format!("notification/{id}/"), &body, &format!("notification {id}"), &[])
            .await?;
        decode(&url, &body)
    }
}
