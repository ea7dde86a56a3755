use std::collections::HashSet;

use shared::domain::{Bookmark, BookmarkId};

/// The local projection of the shared bookmark table.
///
/// Two update sources feed it with no ordering relationship to each other:
/// the optimistic apply of a local mutation's success response, and the
/// remote change feed (which also echoes the local writer's own mutations,
/// possibly duplicated or delayed). The merge rules keep the projection
/// duplicate-free and deletion-respecting under any interleaving:
///
/// - an insert for an id that is already present, or whose deletion has
///   already been observed this session, is discarded;
/// - a delete removes the matching row if present and remembers the id so a
///   late insert echo cannot resurrect it. Absence is not an error.
///
/// Ordering is newest-first as a heuristic: fresh arrivals are prepended,
/// and whichever copy of an id lands first keeps its slot. The backend never
/// reuses ids, so deletion memory cannot block a legitimate new row.
#[derive(Debug, Default)]
pub struct BookmarkList {
    items: Vec<Bookmark>,
    deleted: HashSet<BookmarkId>,
}

impl BookmarkList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[Bookmark] {
        &self.items
    }

    pub fn snapshot(&self) -> Vec<Bookmark> {
        self.items.clone()
    }

    pub fn contains(&self, id: BookmarkId) -> bool {
        self.items.iter().any(|b| b.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Full refresh from an authoritative fetch. Replaces the projection
    /// wholesale (never merges) and clears the deletion memory: the fetched
    /// set is the truth as of now.
    pub fn replace_all(&mut self, items: Vec<Bookmark>) {
        self.items = items;
        self.deleted.clear();
    }

    /// Insert merge rule. Returns whether the projection changed.
    pub fn merge_insert(&mut self, bookmark: Bookmark) -> bool {
        if self.deleted.contains(&bookmark.id) {
            return false;
        }
        if self.contains(bookmark.id) {
            return false;
        }
        self.items.insert(0, bookmark);
        true
    }

    /// Delete merge rule. Returns whether a row was actually removed.
    pub fn merge_delete(&mut self, id: BookmarkId) -> bool {
        self.deleted.insert(id);
        let before = self.items.len();
        self.items.retain(|b| b.id != id);
        self.items.len() != before
    }
}
