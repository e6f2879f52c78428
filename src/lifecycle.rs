//! Join and leave handshake around a [`RoomSession`].
//!
//! [`ConnectionLifecycle::join`] runs the local key gate, opens the room
//! channel, registers presence with the backend and loads the snapshot. The
//! returned [`SessionGuard`] owns the session; leaving is either explicit
//! ([`SessionGuard::leave`], awaited) or implicit on drop, where a
//! disconnect is fired on the current runtime and never awaited.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::access::{self, Admission, KEY_MISMATCH, KEY_REQUIRED};
use crate::api::SessionApi;
use crate::error::{Result, SyncError};
use crate::model::{Room, UserRef};
use crate::session::{ChannelConnector, CloseReason, RoomSession, SessionChannel};

/// What the UI should do after a failed join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinFailure {
    /// Back to the directory with an explanatory message.
    RedirectToDirectory { message: String },
    /// Show the backend's own reason in place.
    ShowReason(String),
    RedirectToSignIn,
}

impl JoinFailure {
    pub fn from_error(title: &str, error: &SyncError) -> Self {
        match error {
            SyncError::NotFound { .. } => JoinFailure::RedirectToDirectory {
                message: format!("The «{title}» room does not exist."),
            },
            SyncError::Channel(_) | SyncError::Transport { .. } | SyncError::Decode { .. } => {
                JoinFailure::RedirectToDirectory { message: format!("Failed to join the «{title}» room.") }
            }
            SyncError::Unauthorized { .. } => JoinFailure::RedirectToSignIn,
            SyncError::Rejected { reason } => JoinFailure::ShowReason(reason.clone()),
            other => JoinFailure::ShowReason(other.to_string()),
        }
    }

    /// Text shown to the user.
    pub fn message(&self) -> &str {
        match self {
            JoinFailure::RedirectToDirectory { message } => message,
            JoinFailure::ShowReason(reason) => reason,
            JoinFailure::RedirectToSignIn => "Sign in required.",
        }
    }
}

pub struct ConnectionLifecycle<A, K> {
    api: Arc<A>,
    connector: K,
}

impl<A, K> ConnectionLifecycle<A, K>
where
    A: SessionApi + 'static,
    K: ChannelConnector,
{
    pub fn new(api: Arc<A>, connector: K) -> Self {
        Self { api, connector }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    /// Join `room` as `me`. `key` is the plaintext candidate, if any.
    pub async fn join(&self, room: &Room, me: &UserRef, key: Option<&str>) -> Result<SessionGuard<A, K::Channel>> {
        let title = room.title.as_str();
        let key_to_send = match access::check(room, me, key) {
            Admission::Open | Admission::HostBypass => None,
            Admission::Attempt => key,
            Admission::KeyRequired => return Err(SyncError::rejected(KEY_REQUIRED)),
            Admission::Reject => {
                debug!(room = %title, "local key check failed");
                return Err(SyncError::rejected(KEY_MISMATCH));
            }
        };

        let mut channel = self.connector.open(title, key_to_send).await?;

        if let Err(e) = self.api.connect(title, key_to_send).await {
            if let Err(close_err) = channel.close().await {
                debug!(room = %title, error = %close_err, "channel close after failed connect");
            }
            warn!(room = %title, error = %e, "connect rejected");
            return Err(e);
        }

        let mut session = RoomSession::new(Arc::clone(&self.api), channel, title, me.clone());
        if let Err(e) = session.load_snapshot().await {
            if let Err(leave_err) = self.api.disconnect(title).await {
                warn!(room = %title, error = %leave_err, "disconnect after failed snapshot");
            }
            // load_snapshot already closed the view; release the channel too.
            session.close(CloseReason::SnapshotFailed(e.to_string())).await;
            return Err(e);
        }

        info!(room = %title, user = %me.username, "joined");
        Ok(SessionGuard { session, api: Arc::clone(&self.api), left: false })
    }
}

/// Owns a joined session. Dropping it without [`SessionGuard::leave`]
/// fires a best-effort disconnect.
pub struct SessionGuard<A: SessionApi + 'static, C: SessionChannel> {
    session: RoomSession<A, C>,
    api: Arc<A>,
    left: bool,
}

impl<A: SessionApi + 'static, C: SessionChannel> SessionGuard<A, C> {
    pub fn session(&self) -> &RoomSession<A, C> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut RoomSession<A, C> {
        &mut self.session
    }

    /// Close the channel and deregister presence.
    pub async fn leave(mut self) -> Result<()> {
        self.left = true;
        let target = presence_title(&self.session);
        self.session.close(CloseReason::Left).await;
        match target {
            Some(title) => {
                self.api.disconnect(&title).await?;
                info!(room = %title, "left");
            }
            None => debug!(room = %self.session.title(), "server already removed us"),
        }
        Ok(())
    }
}

/// Title to disconnect from, or `None` when the server already dropped our
/// presence (kick, ban, deletion, or a participant update without us).
fn presence_title<A: SessionApi, C: SessionChannel>(session: &RoomSession<A, C>) -> Option<String> {
    match session.state().close_reason() {
        None | Some(CloseReason::ChannelError(_)) | Some(CloseReason::SnapshotFailed(_)) => {
            Some(session.title().to_string())
        }
        Some(CloseReason::Retitled(title)) => Some(title.clone()),
        Some(CloseReason::Left | CloseReason::Kicked | CloseReason::Banned | CloseReason::RoomDeleted) => None,
    }
}

impl<A: SessionApi + 'static, C: SessionChannel> Drop for SessionGuard<A, C> {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        let Some(title) = presence_title(&self.session) else {
            return;
        };
        // The channel closes with the session it belongs to.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let api = Arc::clone(&self.api);
                handle.spawn(async move {
                    if let Err(e) = api.disconnect(&title).await {
                        debug!(room = %title, error = %e, "best-effort disconnect failed");
                    }
                });
            }
            Err(_) => warn!(room = %title, "no runtime for disconnect, presence left to expire"),
        }
    }
}
