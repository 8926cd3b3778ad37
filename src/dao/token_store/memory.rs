use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ACCESS_TOKEN_KEY, StorageChange, StorageEvent, TokenStore, change_feed};
use crate::dao::storage::StorageResult;

/// Process-local key/value store shared by every session cloned from it.
///
/// Several [`SessionManager`](crate::state::SessionManager)s built over clones of the same
/// store behave like browser tabs sharing one storage area.
#[derive(Clone)]
pub struct MemoryTokenStore {
    entries: Arc<DashMap<String, String>>,
    changes: broadcast::Sender<StorageEvent>,
}

impl MemoryTokenStore {
    /// Empty store; clones share entries and the change feed.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            changes: change_feed(),
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let value = self
            .entries
            .get(ACCESS_TOKEN_KEY)
            .map(|entry| entry.value().clone());
        Box::pin(async move { Ok(value) })
    }

    fn save(&self, token: String, origin: Uuid) -> BoxFuture<'static, StorageResult<()>> {
        self.entries.insert(ACCESS_TOKEN_KEY.into(), token);
        let _ = self.changes.send(StorageEvent {
            origin,
            change: StorageChange::Saved,
        });
        Box::pin(async { Ok(()) })
    }

    fn remove(&self, origin: Uuid) -> BoxFuture<'static, StorageResult<()>> {
        // Removing an absent key is silent, like the browser storage API.
        if self.entries.remove(ACCESS_TOKEN_KEY).is_some() {
            let _ = self.changes.send(StorageEvent {
                origin,
                change: StorageChange::Removed,
            });
        }
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.changes.subscribe()
    }
}
