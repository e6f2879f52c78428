//! Client configuration.
//!
//! Defaults come from [`ClientConfig::new`]; a TOML file may override any of
//! them, and `ROOM_SYNC_*` environment variables override the file.
//!
//! ```toml
//! base_url = "https://chat.example.org"
//! ws_url = "wss://chat.example.org"
//! request_timeout_secs = 15
//! page_size = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::broadcast::BUS_CHANNEL_CAP;
use crate::error::{Result, SyncError};

pub const ENV_BASE_URL: &str = "ROOM_SYNC_BASE_URL";
pub const ENV_WS_URL: &str = "ROOM_SYNC_WS_URL";
pub const ENV_CSRF_TOKEN: &str = "ROOM_SYNC_CSRF_TOKEN";

/// Page size the backend paginates the room list with.
pub const DEFAULT_PAGE_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// REST origin, e.g. `http://127.0.0.1:8000`. Paths start with `/api/`.
    pub base_url: String,
    /// Websocket origin. Channel paths are `room-list/`, `room/{title}/`
    /// and `notification-list/{username}/` below it.
    pub ws_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub page_size: usize,
    /// Per-subscriber signal buffer.
    pub channel_capacity: usize,
    /// Sent as `X-CSRFToken` on unsafe methods when set.
    pub csrf_token: Option<String>,
}

impl ClientConfig {
    /// Defaults: 3 s connect timeout, 10 s request timeout, page size 5,
    /// 256 buffered signals.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = trim_slash(base_url.into());
        let ws_url = derive_ws_url(&base_url);
        Self {
            base_url,
            ws_url,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            page_size: DEFAULT_PAGE_SIZE,
            channel_capacity: BUS_CHANNEL_CAP,
            csrf_token: None,
        }
    }

    pub fn ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = trim_slash(url.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn csrf_token(mut self, token: impl Into<String>) -> Self {
        self.csrf_token = Some(token.into());
        self
    }

    /// Read `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        let mut config = match file.base_url {
            Some(url) => Self::new(url),
            None => Self::default(),
        };
        if let Some(ws) = file.ws_url {
            config.ws_url = trim_slash(ws);
        }
        if let Some(secs) = file.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = file.page_size {
            config.page_size = size;
        }
        if let Some(cap) = file.channel_capacity {
            config.channel_capacity = cap;
        }
        config.csrf_token = file.csrf_token.filter(|t| !t.is_empty());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally `std::env::var`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            let derived = derive_ws_url(&self.base_url) == self.ws_url;
            self.base_url = trim_slash(url);
            if derived {
                self.ws_url = derive_ws_url(&self.base_url);
            }
        }
        if let Some(url) = lookup(ENV_WS_URL).filter(|v| !v.is_empty()) {
            self.ws_url = trim_slash(url);
        }
        if let Some(token) = lookup(ENV_CSRF_TOKEN).filter(|v| !v.is_empty()) {
            self.csrf_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SyncError::Config(format!("base_url must be http(s): {}", self.base_url)));
        }
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(SyncError::Config(format!("ws_url must be ws(s): {}", self.ws_url)));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be positive".into()));
        }
        Ok(())
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn room_list_channel(&self) -> String {
        format!("{}/room-list/", self.ws_url)
    }

    pub fn room_channel(&self, title: &str) -> String {
        format!("{}/room/{}/", self.ws_url, urlencoding::encode(title))
    }

    pub fn notification_channel(&self, username: &str) -> String {
        format!("{}/notification-list/{}/", self.ws_url, urlencoding::encode(username))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:8000")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    base_url: Option<String>,
    ws_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    page_size: Option<usize>,
    channel_capacity: Option<usize>,
    csrf_token: Option<String>,
}

fn trim_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}
