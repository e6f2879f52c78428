//! Real-time synchronization layer of a chat-room client.
//!
//! REST is the source of truth. Push channels only carry invalidation
//! signals ("re-fetch the room list") or per-room events, and every mutation
//! goes through REST with the echo arriving over the channel.
//!
//! - [`directory::RoomDirectory`]: filtered, paginated room list, kept fresh
//!   by the room-list broadcast.
//! - [`lifecycle::ConnectionLifecycle`]: key gate, join handshake and the
//!   [`lifecycle::SessionGuard`] that deregisters on every exit path.
//! - [`session::RoomSession`]: one joined room's messages and voice roster.
//! - [`notifications::NotificationSync`]: the notification inbox.

pub mod access;
pub mod api;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod model;
pub mod notifications;
pub mod session;
pub mod tags;
pub mod testing;

pub use broadcast::{InvalidationBus, LocalBus, Signal, WsBus};
pub use config::ClientConfig;
pub use directory::RoomDirectory;
pub use error::{Result, SyncError};
pub use http::HttpApi;
pub use lifecycle::{ConnectionLifecycle, JoinFailure, SessionGuard};
pub use notifications::NotificationSync;
pub use session::{RoomSession, SessionState};
pub use tags::TagReconciler;
