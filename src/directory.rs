//! Room directory: the filtered, paginated room list and room mutations.
//!
//! Every fetch takes a ticket from a monotonically increasing generation
//! counter; its response is applied only while that ticket is still the
//! newest. Filter A followed by filter B therefore shows B whatever order the
//! responses arrive in. Mutations never take a ticket, so they are never
//! discarded, and each one publishes exactly one `room_list_update` so other
//! clients re-fetch.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::api::{RoomApi, RoomQuery, TagApi};
use crate::broadcast::{Delivery, InvalidationBus, Signal, Subscription};
use crate::config::DEFAULT_PAGE_SIZE;
use crate::error::{Result, SyncError};
use crate::model::{Choices, Room, RoomForm, RoomPage, RoomPatch, Topic};
use crate::tags::TagReconciler;

/// Consecutive watch failures after which logging escalates to `error!`.
const FAILURE_ESCALATION: u32 = 5;

/// Outcome of a list fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Applied(RoomPage),
    /// A newer fetch was started meanwhile; this response was dropped.
    Superseded,
}

impl FetchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, FetchOutcome::Applied(_))
    }
}

/// Result of a create or update.
#[derive(Debug)]
pub struct RoomChange {
    /// Authoritative room after the change, tags included.
    pub room: Room,
    /// Tag creates or deletes that failed; the rest were applied.
    pub tag_failures: Vec<SyncError>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    query: RoomQuery,
    page: Option<RoomPage>,
    applied: u64,
}

pub struct RoomDirectory<A, B> {
    api: Arc<A>,
    bus: Arc<B>,
    page_size: usize,
    state: Arc<Mutex<DirectoryState>>,
    generation: Arc<AtomicU64>,
    search_task: Mutex<Option<AbortHandle>>,
    choices: OnceCell<Choices>,
}

impl<A, B> RoomDirectory<A, B>
where
    A: RoomApi + TagApi + 'static,
    B: InvalidationBus,
{
    pub fn new(api: Arc<A>, bus: Arc<B>) -> Self {
        Self {
            api,
            bus,
            page_size: DEFAULT_PAGE_SIZE,
            state: Arc::new(Mutex::new(DirectoryState::default())),
            generation: Arc::new(AtomicU64::new(0)),
            search_task: Mutex::new(None),
            choices: OnceCell::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Last applied page, if any.
    pub fn page(&self) -> Option<RoomPage> {
        self.state.lock().ok()?.page.clone()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.page().map(|p| p.results).unwrap_or_default()
    }

    pub fn query(&self) -> RoomQuery {
        self.state.lock().map(|s| s.query.clone()).unwrap_or_default()
    }

    pub fn page_count(&self) -> usize {
        self.page().map_or(0, |p| p.page_count(self.page_size))
    }

    /// Empty-state text; `host` is set on a user's own room list.
    pub fn not_found_message(host: Option<&str>) -> &'static str {
        match host {
            Some(_) => "User hasn't created any room yet :(",
            None => "No rooms were found :(",
        }
    }

    /// Replace the active filters and fetch.
    pub async fn list(&self, query: RoomQuery) -> Result<FetchOutcome> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut st) = self.state.lock() {
            st.query = query.clone();
        }
        fetch(&*self.api, &self.state, &self.generation, ticket, query).await
    }

    /// Re-fetch with the active filters.
    pub async fn refresh(&self) -> Result<FetchOutcome> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let query = self.query();
        fetch(&*self.api, &self.state, &self.generation, ticket, query).await
    }

    /// Handler for a `room_list_update` signal. Keeps the filters.
    pub async fn on_invalidate(&self) -> Result<FetchOutcome> {
        self.refresh().await
    }

    /// Live search: like [`list`](Self::list) but runs as a task and aborts
    /// the previous search still in flight.
    pub fn search(&self, query: RoomQuery) -> JoinHandle<Result<FetchOutcome>> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut st) = self.state.lock() {
            st.query = query.clone();
        }
        let api = Arc::clone(&self.api);
        let state = Arc::clone(&self.state);
        let generation = Arc::clone(&self.generation);
        let handle = tokio::spawn(async move { fetch(&*api, &state, &generation, ticket, query).await });
        if let Ok(mut slot) = self.search_task.lock() {
            if let Some(previous) = slot.replace(handle.abort_handle()) {
                previous.abort();
            }
        }
        handle
    }

    /// Consume room-list signals until the bus closes. A lagged subscription
    /// is treated as an invalidation.
    pub async fn watch(&self) {
        let mut sub = Subscription::new(self.bus.subscribe());
        let mut consecutive_failures: u32 = 0;
        while let Some(delivery) = sub.next().await {
            match delivery {
                Delivery::Signal(Signal::RoomListUpdate) => {}
                Delivery::Lagged(n) => debug!(missed = n, "room list subscription lagged"),
                Delivery::Signal(_) => continue,
            }
            match self.on_invalidate().await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures >= FAILURE_ESCALATION {
                        error!(error = %e, consecutive_failures, "room list refresh failed repeatedly");
                    } else {
                        warn!(error = %e, "room list refresh failed");
                    }
                }
            }
        }
        info!("room list channel closed");
    }

    pub async fn options(&self) -> Result<Choices> {
        self.choices
            .get_or_try_init(|| self.api.room_options())
            .await
            .cloned()
    }

    pub async fn topics(&self) -> Result<Vec<Topic>> {
        self.api.list_topics().await
    }

    /// Distinct tag names across all rooms, for autocompletion.
    pub async fn tag_suggestions(&self) -> Result<Vec<String>> {
        let tags = self.api.list_tags(None, true).await?;
        let names: BTreeSet<String> = tags.into_iter().map(|t| t.name).collect();
        Ok(names.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn create(&self, form: &RoomForm) -> Result<RoomChange> {
        form.validate()?;
        let mut room = self.api.create_room(form).await?;
        info!(room = %room.title, "room created");

        let names: BTreeSet<String> = form.tags.iter().cloned().collect();
        let mut tag_failures = Vec::new();
        if !names.is_empty() {
            tag_failures = TagReconciler::new(&*self.api).add(room.id, &names).await;
            for e in &tag_failures {
                warn!(room = %room.title, error = %e, "tag create failed");
            }
        }
        self.announce().await;

        if !names.is_empty() {
            room.tags = self.api.list_tags(Some(room.id), false).await?;
        }
        Ok(RoomChange { room, tag_failures })
    }

    /// Apply `patch` to `room`. Tags, when present, are reconciled against
    /// the backend's current rows. The returned room is re-fetched.
    ///
    /// Once anything may have changed on the backend the update is
    /// announced, even when a later step fails. An empty patch sends nothing.
    pub async fn update(&self, room: &Room, patch: &RoomPatch) -> Result<RoomChange> {
        patch.validate()?;
        if patch.is_empty() {
            debug!(room = %room.title, "empty patch, nothing to update");
            return Ok(RoomChange { room: room.clone(), tag_failures: Vec::new() });
        }
        let patched = !patch.is_tags_only();
        let title = if patched {
            self.api.update_room(&room.title, patch).await?.title
        } else {
            room.title.clone()
        };

        let tags = match &patch.tags {
            Some(desired) => match self.api.list_tags(Some(room.id), false).await {
                Ok(current) => TagReconciler::new(&*self.api)
                    .apply(room.id, &current, desired)
                    .await
                    .map(|sync| sync.failures),
                // nothing was written yet
                Err(e) if !patched => return Err(e),
                Err(e) => Err(e),
            },
            None => Ok(Vec::new()),
        };
        self.announce().await;
        let tag_failures = tags?;

        let fresh = self.api.get_room(&title).await?;
        info!(room = %fresh.title, tag_failures = tag_failures.len(), "room updated");
        Ok(RoomChange { room: fresh, tag_failures })
    }

    pub async fn delete(&self, room: &Room) -> Result<()> {
        self.api.delete_room(&room.title).await?;
        info!(room = %room.title, "room deleted");
        self.announce().await;
        Ok(())
    }

    async fn announce(&self) {
        if let Err(e) = self.bus.publish(Signal::RoomListUpdate).await {
            warn!(error = %e, "could not publish room list update");
        }
    }
}

async fn fetch<A: RoomApi>(
    api: &A,
    state: &Mutex<DirectoryState>,
    generation: &AtomicU64,
    ticket: u64,
    query: RoomQuery,
) -> Result<FetchOutcome> {
    let result = api.list_rooms(&query).await;
    if generation.load(Ordering::SeqCst) != ticket {
        debug!(ticket, "discarding superseded room list response");
        return Ok(FetchOutcome::Superseded);
    }
    let page = result?;
    let Ok(mut st) = state.lock() else {
        return Ok(FetchOutcome::Superseded);
    };
    // a newer ticket may have been applied between the check and the lock
    if st.applied > ticket {
        return Ok(FetchOutcome::Superseded);
    }
    st.applied = ticket;
    st.page = Some(page.clone());
    Ok(FetchOutcome::Applied(page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBus;
    use crate::model::fixtures::user;
    use crate::model::Language;
    use crate::testing::{Call, FakeBackend};
    use std::time::Duration;

    fn setup() -> (Arc<FakeBackend>, Arc<LocalBus>, RoomDirectory<FakeBackend, LocalBus>) {
        let api = Arc::new(FakeBackend::new(user(1, "admin")));
        let bus = Arc::new(LocalBus::new());
        let dir = RoomDirectory::new(Arc::clone(&api), Arc::clone(&bus));
        (api, bus, dir)
    }

    fn form(title: &str, tags: &[&str]) -> RoomForm {
        RoomForm {
            title: title.into(),
            topic: 1,
            language: Language::English,
            number_of_participants: 4,
            key: String::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn list_applies_and_keeps_filters_on_refresh() {
        let (api, _bus, dir) = setup();
        api.seed_room("jazz club", user(1, "admin"), 4, "", &[]);
        api.seed_room("rock", user(1, "admin"), 4, "", &[]);

        let out = dir.list(RoomQuery::default().search("jazz")).await.unwrap();
        assert!(out.is_applied());
        assert_eq!(dir.rooms().len(), 1);

        api.seed_room("jazz bar", user(1, "admin"), 4, "", &[]);
        dir.on_invalidate().await.unwrap();
        assert_eq!(dir.rooms().len(), 2);
        assert_eq!(dir.query().search.as_deref(), Some("jazz"));
    }

    #[tokio::test]
    async fn slow_older_filter_is_discarded() {
        let (api, _bus, dir) = setup();
        api.seed_room("alpha", user(1, "admin"), 4, "", &[]);
        api.seed_room("beta", user(1, "admin"), 4, "", &[]);
        api.delay_search("alpha", Duration::from_millis(80));

        let (a, b) = tokio::join!(
            dir.list(RoomQuery::default().search("alpha")),
            dir.list(RoomQuery::default().search("beta")),
        );
        assert_eq!(a.unwrap(), FetchOutcome::Superseded);
        assert!(b.unwrap().is_applied());
        let titles: Vec<String> = dir.rooms().into_iter().map(|r| r.title).collect();
        assert_eq!(titles, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn search_aborts_previous_task() {
        let (api, _bus, dir) = setup();
        api.seed_room("alpha", user(1, "admin"), 4, "", &[]);
        api.seed_room("beta", user(1, "admin"), 4, "", &[]);
        api.delay_search("alpha", Duration::from_millis(200));

        let first = dir.search(RoomQuery::default().search("alpha"));
        let second = dir.search(RoomQuery::default().search("beta"));
        assert!(second.await.unwrap().unwrap().is_applied());
        assert!(first.await.unwrap_err().is_cancelled());
        assert_eq!(dir.rooms()[0].title, "beta");
    }

    #[tokio::test]
    async fn create_adds_tags_and_publishes_once() {
        let (api, bus, dir) = setup();
        let mut rx = bus.subscribe();
        let change = dir.create(&form("lobby", &["x", "y"])).await.unwrap();
        assert!(change.tag_failures.is_empty());
        assert_eq!(change.room.tag_names(), api.tag_names(change.room.id));
        assert_eq!(change.room.tags.len(), 2);
        assert_eq!(bus.published_count(), 1);
        assert_eq!(rx.recv().await.unwrap(), Signal::RoomListUpdate);
    }

    #[tokio::test]
    async fn create_invalid_form_sends_nothing() {
        let (api, bus, dir) = setup();
        let err = dir.create(&form("", &[])).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert!(api.calls().is_empty());
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn update_with_partial_tag_failure_still_publishes() {
        let (api, bus, dir) = setup();
        let room = api.seed_room("lobby", user(1, "admin"), 4, "", &["x"]);
        api.fail_tag("bad");
        let patch = RoomPatch {
            number_of_participants: Some(6),
            tags: Some(vec!["x".into(), "ok".into(), "bad".into()]),
            ..Default::default()
        };
        let change = dir.update(&room, &patch).await.unwrap();
        assert_eq!(change.tag_failures.len(), 1);
        assert_eq!(change.room.number_of_participants, 6);
        assert_eq!(
            change.room.tag_names(),
            ["ok", "x"].iter().map(|s| s.to_string()).collect::<BTreeSet<String>>()
        );
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn tags_only_update_skips_patch() {
        let (api, _bus, dir) = setup();
        let room = api.seed_room("lobby", user(1, "admin"), 4, "", &["x"]);
        let patch = RoomPatch { tags: Some(vec![]), ..Default::default() };
        dir.update(&room, &patch).await.unwrap();
        assert_eq!(api.count(|c| matches!(c, Call::UpdateRoom(_))), 0);
        assert!(api.tag_names(room.id).is_empty());
    }

    #[tokio::test]
    async fn update_announces_even_when_tag_listing_fails() {
        let (api, bus, dir) = setup();
        let room = api.seed_room("lobby", user(1, "admin"), 4, "", &["x"]);
        api.fail_tag_listing();
        let patch = RoomPatch {
            number_of_participants: Some(6),
            tags: Some(vec!["x".into(), "y".into()]),
            ..Default::default()
        };
        let err = dir.update(&room, &patch).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
        assert_eq!(api.room("lobby").unwrap().number_of_participants, 6);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn tags_only_update_with_unreadable_tags_stays_quiet() {
        let (api, bus, dir) = setup();
        let room = api.seed_room("lobby", user(1, "admin"), 4, "", &["x"]);
        api.fail_tag_listing();
        let patch = RoomPatch { tags: Some(vec!["y".into()]), ..Default::default() };
        assert!(dir.update(&room, &patch).await.is_err());
        assert_eq!(api.count(|c| matches!(c, Call::CreateTag { .. } | Call::DeleteTag(_))), 0);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn empty_patch_is_a_no_op() {
        let (api, bus, dir) = setup();
        let room = api.seed_room("lobby", user(1, "admin"), 4, "", &["x"]);
        api.clear_calls();
        let change = dir.update(&room, &RoomPatch::default()).await.unwrap();
        assert_eq!(change.room, room);
        assert!(api.calls().is_empty());
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn failed_delete_publishes_nothing() {
        let (api, bus, dir) = setup();
        let room = api.seed_room("theirs", user(9, "other"), 4, "", &[]);
        assert!(matches!(dir.delete(&room).await, Err(SyncError::Rejected { .. })));
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn watch_refreshes_on_room_list_signal_only() {
        let (api, bus, dir) = setup();
        let dir = Arc::new(dir);
        api.seed_room("lobby", user(1, "admin"), 4, "", &[]);
        let watcher = {
            let dir = Arc::clone(&dir);
            tokio::spawn(async move { dir.watch().await })
        };
        tokio::task::yield_now().await;

        bus.inject(Signal::NotificationListUpdate);
        bus.inject(Signal::RoomListUpdate);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.count(|c| matches!(c, Call::ListRooms(_))), 1);
        assert_eq!(dir.rooms().len(), 1);
        watcher.abort();
    }

    #[tokio::test]
    async fn options_are_cached() {
        let (api, _bus, dir) = setup();
        let first = dir.options().await.unwrap();
        let second = dir.options().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.language_choices().len(), 3);
        assert_eq!(api.count(|c| matches!(c, Call::RoomOptions)), 1);
    }

    #[tokio::test]
    async fn tag_suggestions_are_unique_and_sorted() {
        let (api, _bus, dir) = setup();
        api.seed_room("a", user(1, "admin"), 4, "", &["rust", "go"]);
        api.seed_room("b", user(1, "admin"), 4, "", &["rust"]);
        assert_eq!(dir.tag_suggestions().await.unwrap(), vec!["go", "rust"]);
    }

    #[test]
    fn not_found_messages() {
        assert_eq!(
            RoomDirectory::<FakeBackend, LocalBus>::not_found_message(None),
            "No rooms were found :("
        );
        assert_eq!(
            RoomDirectory::<FakeBackend, LocalBus>::not_found_message(Some("bob")),
            "User hasn't created any room yet :("
        );
    }
}
