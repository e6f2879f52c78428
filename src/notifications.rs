//! Notification inbox.
//!
//! The inbox is a cached copy of the backend's notification list. Every
//! change goes through REST and is followed by a full re-fetch; signals on the
//! notification channel only say "re-fetch". Listings may overlap; each
//! takes a ticket and a response older than the one already applied is
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::api::NotificationApi;
use crate::broadcast::{Delivery, InvalidationBus, Signal, Subscription};
use crate::error::{Result, SyncError};
use crate::model::Notification;

const FAILURE_ESCALATION: u32 = 5;

/// What handling a signal amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The inbox was re-fetched.
    Refreshed,
    /// Not a notification signal.
    Ignored,
    /// The user was banned; authentication must be reloaded. The inbox is
    /// left untouched.
    ReloadAuth,
}

/// Partial failure of a bulk mark.
#[derive(Debug)]
pub struct MarkFailures {
    pub failed: Vec<(u64, SyncError)>,
}

#[derive(Debug, Default)]
struct Inbox {
    items: Vec<Notification>,
    applied: u64,
}

pub struct NotificationSync<A, B> {
    api: Arc<A>,
    bus: Arc<B>,
    inbox: Mutex<Inbox>,
    generation: AtomicU64,
}

impl<A: NotificationApi, B: InvalidationBus> NotificationSync<A, B> {
    pub fn new(api: Arc<A>, bus: Arc<B>) -> Self {
        Self { api, bus, inbox: Mutex::new(Inbox::default()), generation: AtomicU64::new(0) }
    }

    pub fn inbox(&self) -> Vec<Notification> {
        self.inbox.lock().map(|i| i.items.clone()).unwrap_or_default()
    }

    pub fn unread(&self) -> Vec<Notification> {
        self.inbox().into_iter().filter(|n| !n.is_viewed).collect()
    }

    pub fn unread_count(&self) -> usize {
        self.inbox
            .lock()
            .map(|i| i.items.iter().filter(|n| !n.is_viewed).count())
            .unwrap_or(0)
    }

    /// Fetch and replace the inbox. Returns the inbox as it stands
    /// afterwards, which is a newer listing's when this one came back late.
    pub async fn list(&self) -> Result<Vec<Notification>> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = self.api.list_notifications().await?;
        let Ok(mut inbox) = self.inbox.lock() else {
            return Ok(fresh);
        };
        if inbox.applied > ticket {
            debug!(ticket, applied = inbox.applied, "discarding stale inbox listing");
            return Ok(inbox.items.clone());
        }
        inbox.applied = ticket;
        inbox.items = fresh;
        debug!(count = inbox.items.len(), "inbox refreshed");
        Ok(inbox.items.clone())
    }

    pub async fn mark_viewed(&self, id: u64) -> Result<()> {
        self.api.set_viewed(id, true).await?;
        self.list().await?;
        Ok(())
    }

    /// Mark every id viewed concurrently, then re-fetch once. An empty slice
    /// sends nothing. Individual failures are returned after the re-fetch.
    pub async fn mark_all_viewed(&self, ids: &[u64]) -> Result<std::result::Result<(), MarkFailures>> {
        if ids.is_empty() {
            return Ok(Ok(()));
        }
        let results = join_all(ids.iter().map(|&id| async move { (id, self.api.set_viewed(id, true).await) })).await;
        let failed: Vec<(u64, SyncError)> = results
            .into_iter()
            .filter_map(|(id, r)| r.err().map(|e| (id, e)))
            .collect();
        for (id, e) in &failed {
            warn!(notification = id, error = %e, "mark viewed failed");
        }
        self.list().await?;
        if failed.is_empty() {
            Ok(Ok(()))
        } else {
            Ok(Err(MarkFailures { failed }))
        }
    }

    /// Mark everything currently unread.
    pub async fn mark_all_unread_viewed(&self) -> Result<std::result::Result<(), MarkFailures>> {
        let ids: Vec<u64> = self.unread().iter().map(|n| n.id).collect();
        self.mark_all_viewed(&ids).await
    }

    pub async fn handle(&self, signal: Signal) -> Result<SyncOutcome> {
        match signal {
            Signal::NotificationListUpdate => {
                self.list().await?;
                Ok(SyncOutcome::Refreshed)
            }
            Signal::Ban => {
                info!("ban received, authentication must be reloaded");
                Ok(SyncOutcome::ReloadAuth)
            }
            Signal::RoomListUpdate => Ok(SyncOutcome::Ignored),
        }
    }

    /// Consume the bus until it closes or a ban arrives. Returns
    /// `ReloadAuth` on a ban and `Ignored` when the bus closed.
    pub async fn watch(&self) -> SyncOutcome {
        let mut sub = Subscription::new(self.bus.subscribe());
        let mut consecutive_failures: u32 = 0;
        while let Some(delivery) = sub.next().await {
            let signal = match delivery {
                Delivery::Signal(signal) => signal,
                Delivery::Lagged(_) => Signal::NotificationListUpdate,
            };
            match self.handle(signal).await {
                Ok(SyncOutcome::ReloadAuth) => return SyncOutcome::ReloadAuth,
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures >= FAILURE_ESCALATION {
                        error!(error = %e, consecutive_failures, "inbox refresh failed repeatedly");
                    } else {
                        warn!(error = %e, "inbox refresh failed");
                    }
                }
            }
        }
        info!("notification channel closed");
        SyncOutcome::Ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBus;
    use crate::model::fixtures::user;
    use crate::model::NotificationKind;
    use crate::testing::{Call, FakeBackend};
    use std::time::Duration;

    fn setup() -> (Arc<FakeBackend>, Arc<LocalBus>, NotificationSync<FakeBackend, LocalBus>) {
        let api = Arc::new(FakeBackend::new(user(1, "bob")));
        let bus = Arc::new(LocalBus::new());
        let sync = NotificationSync::new(Arc::clone(&api), Arc::clone(&bus));
        (api, bus, sync)
    }

    #[tokio::test]
    async fn list_replaces_inbox() {
        let (api, _bus, sync) = setup();
        api.seed_notification(NotificationKind::Mention, false);
        api.seed_notification(NotificationKind::MessageReply, true);
        sync.list().await.unwrap();
        assert_eq!(sync.inbox().len(), 2);
        assert_eq!(sync.unread_count(), 1);
    }

    #[tokio::test]
    async fn mark_viewed_patches_then_refetches() {
        let (api, _bus, sync) = setup();
        let n = api.seed_notification(NotificationKind::Mention, false);
        sync.mark_viewed(n.id).await.unwrap();
        assert_eq!(api.calls(), vec![Call::SetViewed(n.id, true), Call::ListNotifications]);
        assert_eq!(sync.unread_count(), 0);
    }

    #[tokio::test]
    async fn late_listing_never_overwrites_newer_one() {
        let (api, _bus, sync) = setup();
        let n = api.seed_notification(NotificationKind::Mention, false);
        // first listing snapshots the unread inbox, then stalls
        api.delay_next_notifications(Duration::from_millis(80));

        let (stale, _) = tokio::join!(sync.list(), async {
            tokio::task::yield_now().await;
            sync.mark_viewed(n.id).await.unwrap();
        });

        assert_eq!(sync.unread_count(), 0);
        assert!(stale.unwrap().iter().all(|n| n.is_viewed));
        assert_eq!(api.count(|c| matches!(c, Call::ListNotifications)), 2);
    }

    #[tokio::test]
    async fn mark_all_with_empty_list_sends_nothing() {
        let (api, _bus, sync) = setup();
        let outcome = tokio_test::assert_ok!(sync.mark_all_viewed(&[]).await);
        assert!(outcome.is_ok());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn partial_failure_reported_after_refetch() {
        let (api, _bus, sync) = setup();
        let a = api.seed_notification(NotificationKind::Mention, false);
        let b = api.seed_notification(NotificationKind::Mention, false);
        api.fail_viewed(b.id);
        let failures = sync.mark_all_viewed(&[a.id, b.id]).await.unwrap().unwrap_err();
        assert_eq!(failures.failed.len(), 1);
        assert_eq!(failures.failed[0].0, b.id);
        assert_eq!(api.count(|c| matches!(c, Call::ListNotifications)), 1);
        assert_eq!(sync.unread_count(), 1);
    }

    #[tokio::test]
    async fn ban_does_not_touch_inbox() {
        let (api, _bus, sync) = setup();
        assert_eq!(sync.handle(Signal::Ban).await.unwrap(), SyncOutcome::ReloadAuth);
        assert_eq!(sync.handle(Signal::RoomListUpdate).await.unwrap(), SyncOutcome::Ignored);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn watch_stops_on_ban() {
        let (api, bus, sync) = setup();
        api.seed_notification(NotificationKind::StatusChange, false);
        let sync = Arc::new(sync);
        let task = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.watch().await })
        };
        tokio::task::yield_now().await;
        bus.inject(Signal::NotificationListUpdate);
        bus.inject(Signal::Ban);
        assert_eq!(task.await.unwrap(), SyncOutcome::ReloadAuth);
        assert_eq!(sync.unread_count(), 1);
    }
}
