use serde::{Deserialize, Serialize};

use crate::domain::{Bookmark, BookmarkId, Principal};

/// A single mutation observed by the backend, broadcast to every live feed
/// subscriber (including the session that caused it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    BookmarkInserted { bookmark: Bookmark },
    BookmarkDeleted { id: BookmarkId },
    BookmarkUpdated { bookmark: Bookmark },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::BookmarkInserted { .. } => ChangeKind::Insert,
            ChangeEvent::BookmarkDeleted { .. } => ChangeKind::Delete,
            ChangeEvent::BookmarkUpdated { .. } => ChangeKind::Update,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Delete,
    Update,
}

impl ChangeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Delete => "delete",
            ChangeKind::Update => "update",
        }
    }
}

/// Which event kinds a feed subscription wants delivered. Carried on the
/// `/ws` upgrade as a comma-separated `events=` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMask {
    pub inserts: bool,
    pub deletes: bool,
    pub updates: bool,
}

impl EventMask {
    pub const ALL: EventMask = EventMask {
        inserts: true,
        deletes: true,
        updates: true,
    };

    pub fn allows(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.inserts,
            ChangeKind::Delete => self.deletes,
            ChangeKind::Update => self.updates,
        }
    }

    pub fn as_param(&self) -> String {
        let mut names = Vec::new();
        if self.inserts {
            names.push(ChangeKind::Insert.name());
        }
        if self.deletes {
            names.push(ChangeKind::Delete.name());
        }
        if self.updates {
            names.push(ChangeKind::Update.name());
        }
        names.join(",")
    }

    /// Parses a comma-separated kind list. Unknown names are skipped; a
    /// missing or empty parameter means everything.
    pub fn from_param(raw: &str) -> EventMask {
        if raw.trim().is_empty() {
            return EventMask::ALL;
        }
        let mut mask = EventMask {
            inserts: false,
            deletes: false,
            updates: false,
        };
        for name in raw.split(',') {
            match name.trim() {
                "insert" => mask.inserts = true,
                "delete" => mask.deletes = true,
                "update" => mask.updates = true,
                _ => {}
            }
        }
        mask
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ALL
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub principal: Principal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookmarkRequest {
    pub title: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_events_carry_tagged_payloads() {
        let value = serde_json::to_value(ChangeEvent::BookmarkDeleted {
            id: BookmarkId(7),
        })
        .expect("serialize");
        assert_eq!(value["type"], "bookmark_deleted");
        assert_eq!(value["payload"]["id"], 7);
    }

    #[test]
    fn event_mask_parses_kind_lists() {
        let mask = EventMask::from_param("delete, update,bogus");
        assert!(!mask.inserts);
        assert!(mask.deletes);
        assert!(mask.updates);

        assert_eq!(EventMask::from_param(""), EventMask::ALL);
        assert_eq!(EventMask::ALL.as_param(), "insert,delete,update");
        assert_eq!(
            EventMask::from_param(EventMask::ALL.as_param().as_str()),
            EventMask::ALL
        );
    }
}
