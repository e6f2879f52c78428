//! Tag reconciliation.
//!
//! Tags are a per-room set of names kept as separate backend rows, so editing
//! a room's tags means diffing the current names against the desired ones and
//! issuing one create or delete per difference. There is no transaction: a
//! partially applied diff stays applied and the authoritative tag list is
//! re-fetched afterward.

use std::collections::BTreeSet;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::api::TagApi;
use crate::error::{Result, SyncError};
use crate::model::{NewTag, Tag};

pub const MAX_TAGS_PER_ROOM: usize = 5;
pub const MAX_TAG_CHARS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// `to_add = desired - current`, `to_remove = current - desired`.
///
/// Does not validate; callers run [`validate_tags`] first. The two sets are
/// disjoint, so they can be applied in any order or concurrently.
pub fn diff(current: &BTreeSet<String>, desired: &BTreeSet<String>) -> TagDiff {
    TagDiff {
        to_add: desired.difference(current).cloned().collect(),
        to_remove: current.difference(desired).cloned().collect(),
    }
}

/// At most five tags, 1..=16 characters each, no repeats.
pub fn validate_tags(names: &[String]) -> Result<()> {
    if names.len() > MAX_TAGS_PER_ROOM {
        return Err(SyncError::field(
            "tags",
            format!("Room cannot have more than {MAX_TAGS_PER_ROOM} tags."),
        ));
    }
    let mut seen = BTreeSet::new();
    for name in names {
        let len = name.chars().count();
        if len == 0 {
            return Err(SyncError::field("tags", "Tag may not be blank."));
        }
        if len > MAX_TAG_CHARS {
            return Err(SyncError::field(
                "tags",
                format!("Tag «{name}» is longer than {MAX_TAG_CHARS} characters."),
            ));
        }
        if !seen.insert(name.as_str()) {
            return Err(SyncError::field("tags", format!("Tag «{name}» is repeated.")));
        }
    }
    Ok(())
}

/// Result of applying a diff against the backend.
#[derive(Debug, Default)]
pub struct TagSync {
    /// Authoritative tags after the diff, re-fetched from the backend.
    pub tags: Vec<Tag>,
    pub diff: TagDiff,
    /// Individual create/delete failures; the rest of the diff was still
    /// applied.
    pub failures: Vec<SyncError>,
}

impl TagSync {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.tags.iter().map(|t| t.name.clone()).collect()
    }
}

pub struct TagReconciler<'a, A> {
    api: &'a A,
}

impl<'a, A: TagApi> TagReconciler<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self { api }
    }

    /// Bring `room`'s tags from `current` to `desired`.
    ///
    /// Deletes are addressed by tag id, so `current` must be the room's
    /// tag rows, not just names. The final tag list is always re-fetched;
    /// only that fetch failing makes this return `Err`.
    pub async fn apply(&self, room: u64, current: &[Tag], desired: &[String]) -> Result<TagSync> {
        let current_names: BTreeSet<String> = current.iter().map(|t| t.name.clone()).collect();
        let desired_names: BTreeSet<String> = desired.iter().cloned().collect();
        let diff = diff(&current_names, &desired_names);

        let mut failures = Vec::new();
        if !diff.is_empty() {
            debug!(room, add = diff.to_add.len(), remove = diff.to_remove.len(), "applying tag diff");
            failures.extend(self.remove(current, &diff.to_remove).await);
            failures.extend(self.add(room, &diff.to_add).await);
            for e in &failures {
                warn!(room, error = %e, "tag change failed, keeping partial result");
            }
        }

        let tags = self.api.list_tags(Some(room), false).await?;
        Ok(TagSync { tags, diff, failures })
    }

    /// Create every name in `names` on `room`, concurrently.
    pub async fn add(&self, room: u64, names: &BTreeSet<String>) -> Vec<SyncError> {
        let requests = names.iter().map(|name| {
            let body = NewTag { room, name: name.clone() };
            async move { self.api.create_tag(&body).await }
        });
        join_all(requests).await.into_iter().filter_map(|r| r.err()).collect()
    }

    async fn remove(&self, current: &[Tag], names: &BTreeSet<String>) -> Vec<SyncError> {
        let requests = current
            .iter()
            .filter(|t| names.contains(&t.name))
            .map(|t| self.api.delete_tag(t.id));
        join_all(requests).await.into_iter().filter_map(|r| r.err()).collect()
    }
}
