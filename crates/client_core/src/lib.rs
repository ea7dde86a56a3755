use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{Bookmark, BookmarkId, Principal},
    protocol::{ChangeEvent, EventMask},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub mod reconcile;
pub mod remote;

use reconcile::BookmarkList;

/// How a store operation failed. One variant per user-visible failure class;
/// the full cause chain rides along for logging.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to load bookmarks")]
    Fetch {
        #[source]
        source: anyhow::Error,
    },
    #[error("bookmark write failed")]
    Write {
        #[source]
        source: anyhow::Error,
    },
    #[error("session operation failed")]
    Auth {
        #[source]
        source: anyhow::Error,
    },
    #[error("store has been shut down")]
    Closed,
}

/// Session establishment and teardown against the backend.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn current_session(&self) -> Result<Option<Principal>>;
    async fn sign_in(&self, email: &str) -> Result<Principal>;
    async fn sign_out(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
}

/// The structured store the mutations run against. The backend assigns ids
/// and attributes ownership from the caller's session.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn list_newest_first(&self) -> Result<Vec<Bookmark>>;
    async fn insert(&self, bookmark: NewBookmark) -> Result<Bookmark>;
    async fn delete(&self, id: BookmarkId) -> Result<()>;
}

/// The change feed boundary. A subscription delivers matching events into a
/// bounded channel until torn down; it promises nothing about ordering,
/// latency, or exactly-once delivery.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, mask: EventMask) -> Result<FeedSubscription>;
}

/// A live feed subscription: a bounded event channel plus the reader task
/// pumping it. Shutting down is idempotent and guarantees no further
/// delivery; dropping the subscription shuts it down.
pub struct FeedSubscription {
    events: mpsc::Receiver<ChangeEvent>,
    reader: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, reader: JoinHandle<()>) -> Self {
        Self {
            events,
            reader: Some(reader),
        }
    }

    /// Next event, or `None` once the feed has closed.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn shutdown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.events.close();
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Notifications emitted whenever the local projection changes, so any
/// number of observers can track the list without polling.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Inserted(Bookmark),
    Removed(BookmarkId),
    Reloaded { count: usize },
    FeedClosed,
}

/// The reconciling list store.
///
/// Owns the local projection, applies local mutation results optimistically,
/// and runs a single reconciliation task that drains the change feed. All
/// projection access is serialized through one mutex, so no handler ever
/// observes another mid-flight; the `closed` flag is checked under that same
/// lock so completions arriving after [`shutdown`](Self::shutdown) cannot
/// mutate state.
pub struct LiveBookmarkStore {
    sessions: Arc<dyn SessionService>,
    bookmarks: Arc<dyn BookmarkStore>,
    list: Mutex<BookmarkList>,
    closed: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl LiveBookmarkStore {
    /// Subscribes to the change feed and starts the reconciliation task.
    /// The subscription is exclusively owned by that task and torn down with
    /// it.
    pub async fn connect(
        sessions: Arc<dyn SessionService>,
        bookmarks: Arc<dyn BookmarkStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Arc<Self>, StoreError> {
        let subscription = feed
            .subscribe(EventMask::ALL)
            .await
            .map_err(|source| StoreError::Fetch { source })?;

        let (events, _) = broadcast::channel(256);
        let store = Arc::new(Self {
            sessions,
            bookmarks,
            list: Mutex::new(BookmarkList::new()),
            closed: AtomicBool::new(false),
            events,
            reconciler: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&store).run_reconciler(subscription));
        *store.reconciler.lock().await = Some(task);
        Ok(store)
    }

    async fn run_reconciler(self: Arc<Self>, mut subscription: FeedSubscription) {
        while let Some(event) = subscription.next_event().await {
            self.apply_remote(event).await;
        }
        if !self.closed.load(Ordering::SeqCst) {
            warn!("change feed closed while the store was still live");
            let _ = self.events.send(StoreEvent::FeedClosed);
        }
    }

    async fn apply_remote(&self, event: ChangeEvent) {
        let mut list = self.list.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            ChangeEvent::BookmarkInserted { bookmark } => {
                if list.merge_insert(bookmark.clone()) {
                    let _ = self.events.send(StoreEvent::Inserted(bookmark));
                }
            }
            ChangeEvent::BookmarkDeleted { id } => {
                if list.merge_delete(id) {
                    let _ = self.events.send(StoreEvent::Removed(id));
                }
            }
            ChangeEvent::BookmarkUpdated { bookmark } => {
                // Carried by the feed for completeness; the list contract
                // has nothing to do with updates.
                debug!(id = %bookmark.id, "ignoring bookmark update event");
            }
        }
    }

    /// Fetches the full current list and replaces the projection with it.
    /// A full refresh, never a merge; on failure the projection is left
    /// untouched.
    pub async fn load_all(&self) -> Result<Vec<Bookmark>, StoreError> {
        let items = self
            .bookmarks
            .list_newest_first()
            .await
            .map_err(|source| StoreError::Fetch { source })?;

        let mut list = self.list.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        list.replace_all(items.clone());
        let _ = self.events.send(StoreEvent::Reloaded { count: items.len() });
        Ok(items)
    }

    /// Submits a creation and applies the success response optimistically.
    /// The feed's echo of the same row is absorbed by the insert merge rule.
    pub async fn create(&self, title: &str, url: &str) -> Result<Bookmark, StoreError> {
        let title = title.trim();
        let url = url.trim();
        if title.is_empty() || url.is_empty() {
            return Err(StoreError::Write {
                source: anyhow::anyhow!("title and url must be non-empty"),
            });
        }

        let created = self
            .bookmarks
            .insert(NewBookmark {
                title: title.to_string(),
                url: url.to_string(),
            })
            .await
            .map_err(|source| StoreError::Write { source })?;

        let mut list = self.list.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            // The backend accepted the write, but this store is gone; the
            // row must not land in a torn-down projection.
            return Ok(created);
        }
        if list.merge_insert(created.clone()) {
            let _ = self.events.send(StoreEvent::Inserted(created.clone()));
        }
        Ok(created)
    }

    /// Submits a deletion. Fire-and-forget toward the projection: the local
    /// row leaves when the feed delivers the delete (or on the next reload),
    /// not as a direct effect of this call.
    pub async fn delete(&self, id: BookmarkId) -> Result<(), StoreError> {
        self.bookmarks
            .delete(id)
            .await
            .map_err(|source| StoreError::Write { source })
    }

    pub async fn principal(&self) -> Result<Option<Principal>, StoreError> {
        self.sessions
            .current_session()
            .await
            .map_err(|source| StoreError::Auth { source })
    }

    pub async fn snapshot(&self) -> Vec<Bookmark> {
        self.list.lock().await.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the store down: stops the reconciliation task (which drops the
    /// feed subscription), marks the store closed, and empties the
    /// projection. Safe to call multiple times; in-flight mutation
    /// completions landing afterwards are discarded.
    pub async fn shutdown(&self) {
        let mut list = self.list.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        list.replace_all(Vec::new());
        drop(list);

        if let Some(task) = self.reconciler.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
