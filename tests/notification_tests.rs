//! Inbox behaviour: bulk marking and reaction to pushed signals.

use std::sync::Arc;
use std::time::Duration;

use room_sync::broadcast::{LocalBus, Signal};
use room_sync::model::{NotificationKind, UserRef};
use room_sync::notifications::{NotificationSync, SyncOutcome};
use room_sync::testing::{Call, FakeBackend};

fn setup() -> (Arc<FakeBackend>, Arc<LocalBus>, NotificationSync<FakeBackend, LocalBus>) {
    let me = UserRef { id: 4, username: "dana".into(), image: None };
    let api = Arc::new(FakeBackend::new(me));
    let bus = Arc::new(LocalBus::new());
    let inbox = NotificationSync::new(Arc::clone(&api), Arc::clone(&bus));
    (api, bus, inbox)
}

#[tokio::test]
async fn mark_all_then_list_shows_everything_viewed() {
    let (api, _bus, inbox) = setup();
    let n1 = api.seed_notification(NotificationKind::Mention, false);
    let n2 = api.seed_notification(NotificationKind::MessageReply, false);

    assert!(inbox.mark_all_viewed(&[n1.id, n2.id]).await.unwrap().is_ok());
    let listed = inbox.list().await.unwrap();

    for id in [n1.id, n2.id] {
        let n = listed.iter().find(|n| n.id == id).unwrap();
        assert!(n.is_viewed, "notification {id} still unread");
    }
    assert_eq!(api.count(|c| matches!(c, Call::SetViewed(_, true))), 2);
}

#[tokio::test]
async fn mark_all_with_nothing_is_a_no_op() {
    let (api, _bus, inbox) = setup();
    api.seed_notification(NotificationKind::Mention, false);
    assert!(inbox.mark_all_viewed(&[]).await.unwrap().is_ok());
    assert!(api.calls().is_empty());
    assert_eq!(api.notifications().iter().filter(|n| !n.is_viewed).count(), 1);
}

#[tokio::test]
async fn mark_all_unread_uses_the_cached_inbox() {
    let (api, _bus, inbox) = setup();
    api.seed_notification(NotificationKind::Mention, false);
    api.seed_notification(NotificationKind::Mention, true);
    api.seed_notification(NotificationKind::MessageReply, false);
    inbox.list().await.unwrap();
    api.clear_calls();

    assert!(inbox.mark_all_unread_viewed().await.unwrap().is_ok());
    assert_eq!(api.count(|c| matches!(c, Call::SetViewed(..))), 2);
    assert_eq!(inbox.unread_count(), 0);
}

#[tokio::test]
async fn pushed_update_refreshes_inbox() {
    let (api, bus, inbox) = setup();
    let inbox = Arc::new(inbox);
    let watcher = {
        let inbox = Arc::clone(&inbox);
        tokio::spawn(async move { inbox.watch().await })
    };
    tokio::task::yield_now().await;

    api.seed_notification(NotificationKind::Mention, false);
    bus.inject(Signal::RoomListUpdate);
    bus.inject(Signal::NotificationListUpdate);

    for _ in 0..20 {
        if inbox.unread_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(inbox.unread_count(), 1);
    assert_eq!(api.count(|c| matches!(c, Call::ListNotifications)), 1);

    bus.inject(Signal::Ban);
    assert_eq!(watcher.await.unwrap(), SyncOutcome::ReloadAuth);
}
